//! Projects and the lifecycle contract they implement.
//!
//! A project is anything that can be downloaded, configured, built and run. Each lifecycle hook of the [`Project`]
//! trait returns the commands it needs executed rather than executing them itself; the pipeline runs them through
//! [`crate::exec`], attributes failures to the right phase and injects the experiment's compiler configuration. Any hook
//! may return no commands at all.
//!
//! The projects shipped with the harness are described by JSON manifests, see [`manifest`]. The primary entrypoint for
//! those is [`find_all`], which discovers every manifest under a directory.
//!
//! # Examples
//!
//! ```no_run
//! use std::path::PathBuf;
//!
//! use polly_bench::projects::find_all;
//!
//! let projects = find_all(&PathBuf::from("projects")).expect("could not search for projects");
//! ```

use std::{collections::BTreeMap, io, path::PathBuf};

use crate::{config::ToolchainConfig, exec::Command, experiments::Experiment};

pub mod manifest;

pub use manifest::{find_all, ManifestProject, ProjectManifest, Source, Step, FILE_PATTERN};

/// Errors raised by a hook while preparing its commands.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    /// The project description cannot be turned into commands.
    #[error("invalid project: {0}")]
    Invalid(String),
    /// The hook needed the filesystem and it failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Everything a hook may need to know about the build it is part of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildContext {
    /// Directory this project is built in; the default working directory of every command.
    pub build_dir: PathBuf,
    /// C compiler.
    pub cc: PathBuf,
    /// C++ compiler.
    pub cxx: PathBuf,
    /// Compiler flags of the experiment.
    pub cflags: Vec<String>,
    /// Linker flags of the experiment.
    pub ldflags: Vec<String>,
    /// Number of parallel jobs builds may use.
    pub jobs: usize,
}

impl BuildContext {
    /// Assembles the context for building under `experiment` in `build_dir`.
    #[must_use]
    pub fn new(toolchain: &ToolchainConfig, experiment: &Experiment, build_dir: PathBuf) -> Self {
        Self {
            build_dir,
            cc: toolchain.cc(),
            cxx: toolchain.cxx(),
            cflags: experiment.cflags.clone(),
            ldflags: experiment.ldflags.clone(),
            jobs: toolchain.parallel_job_count,
        }
    }

    /// The conventional build variables (`CC`, `CXX`, `CFLAGS`, `CXXFLAGS`, `LDFLAGS`) for this build.
    #[must_use]
    pub fn compiler_env(&self) -> BTreeMap<String, String> {
        let cflags = self.cflags.join(" ");
        BTreeMap::from([
            ("CC".to_string(), self.cc.to_string_lossy().into_owned()),
            ("CXX".to_string(), self.cxx.to_string_lossy().into_owned()),
            ("CFLAGS".to_string(), cflags.clone()),
            ("CXXFLAGS".to_string(), cflags),
            ("LDFLAGS".to_string(), self.ldflags.join(" ")),
        ])
    }

    /// Prepares a hook command for execution: the compiler variables are added underneath the command's own
    /// environment and commands without a working directory run in the build directory.
    #[must_use]
    pub fn prepare(&self, command: Command) -> Command {
        let mut env = self.compiler_env();
        env.extend(command.env);
        Command {
            env,
            cwd: Some(
                command
                    .cwd
                    .map_or_else(|| self.build_dir.clone(), |cwd| self.build_dir.join(cwd)),
            ),
            ..command
        }
    }
}

/// The lifecycle contract of a benchmarkable project.
///
/// The pipeline calls the hooks in a fixed order: [`download`](Project::download),
/// [`configure`](Project::configure), [`build`](Project::build), and then [`run_tests`](Project::run_tests) once per
/// trial. Every command returned is run with [`BuildContext::prepare`] applied. Hooks default to doing nothing.
pub trait Project: Send + Sync {
    /// Unique name of the project, used as its identity in the datastore.
    fn name(&self) -> &str;

    /// Domain tag, e.g. `scientific` or `database`.
    fn domain(&self) -> &str;

    /// Commands fetching the sources into the build directory. Re-running them must be harmless.
    ///
    /// # Errors
    ///
    /// Returns a [`ProjectError`] if the commands cannot be produced.
    fn download(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        Ok(Vec::new())
    }

    /// Commands configuring the sources with the experiment's compiler settings.
    ///
    /// # Errors
    ///
    /// Returns a [`ProjectError`] if the commands cannot be produced.
    fn configure(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        Ok(Vec::new())
    }

    /// Commands compiling the project.
    ///
    /// # Errors
    ///
    /// Returns a [`ProjectError`] if the commands cannot be produced.
    fn build(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        Ok(Vec::new())
    }

    /// The workloads to measure. Each one is wrapped by the experiment's timing wrapper and recorded as its own run.
    ///
    /// # Errors
    ///
    /// Returns a [`ProjectError`] if the workloads cannot be produced.
    fn run_tests(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        Ok(Vec::new())
    }
}
