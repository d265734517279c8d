//! Toolchain configuration.
//!
//! All paths to external tools are resolved once into a [`ToolchainConfig`] that is handed to the experiment, the
//! pipeline and every project hook. Settings come from, in increasing order of precedence: built-in defaults, an
//! optional JSON config file, and command line flags.
//!
//! A config file looks like this (every key is optional):
//!
//! ```json
//! {
//!     "llvm_install_dir": "/opt/llvm",
//!     "likwid_install_dir": "/opt/likwid",
//!     "parallel_job_count": 8,
//!     "build_root": "build",
//!     "database": "results/polly-bench.sqlite",
//!     "time_program": "/usr/bin/time"
//! }
//! ```

use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sysinfo::{System, SystemExt};

use crate::exec::{self, ExecError};

/// Default directory under which projects are built.
pub const DEFAULT_BUILD_ROOT: &str = "build";
/// Default location of the results database.
pub const DEFAULT_DATABASE: &str = "results/polly-bench.sqlite";
/// Default timing wrapper, GNU time.
pub const DEFAULT_TIME_PROGRAM: &str = "/usr/bin/time";

/// Errors raised while assembling the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("could not read config file {}: {source}", .path.display())]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The config file is not valid JSON or has unexpected keys.
    #[error("could not parse config file {}: {source}", .path.display())]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
    /// A required setting was not provided anywhere.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    /// A setting has an unusable value.
    #[error("invalid setting: {0}")]
    Invalid(String),
    /// A required tool could not be found.
    #[error("toolchain is incomplete: {0}")]
    Toolchain(#[from] ExecError),
}

/// Partially specified settings, as found in a config file or on the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Root of the LLVM installation providing `clang` and the Polly plugins.
    pub llvm_install_dir: Option<PathBuf>,
    /// Root of the likwid installation, if any.
    pub likwid_install_dir: Option<PathBuf>,
    /// Maximum number of parallel jobs for builds and OpenMP workloads.
    pub parallel_job_count: Option<usize>,
    /// Directory under which every project gets its build directory.
    pub build_root: Option<PathBuf>,
    /// Location of the results database.
    pub database: Option<PathBuf>,
    /// Timing wrapper used to measure workloads.
    pub time_program: Option<PathBuf>,
}

impl Settings {
    /// Reads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be opened and [`ConfigError::Parse`] if it is not valid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        log::debug!("reading config file {}...", path.display());
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Layers `overrides` on top of `self`; any setting present in `overrides` wins.
    #[must_use]
    pub fn merge(self, overrides: Settings) -> Settings {
        Settings {
            llvm_install_dir: overrides.llvm_install_dir.or(self.llvm_install_dir),
            likwid_install_dir: overrides.likwid_install_dir.or(self.likwid_install_dir),
            parallel_job_count: overrides.parallel_job_count.or(self.parallel_job_count),
            build_root: overrides.build_root.or(self.build_root),
            database: overrides.database.or(self.database),
            time_program: overrides.time_program.or(self.time_program),
        }
    }

    /// Fills in defaults and checks the result.
    ///
    /// The job count defaults to the number of CPUs on this machine.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if no LLVM installation was given and [`ConfigError::Invalid`] for a zero job
    /// count.
    pub fn resolve(self) -> Result<ToolchainConfig, ConfigError> {
        let llvm_install_dir = self
            .llvm_install_dir
            .ok_or(ConfigError::Missing("llvm_install_dir"))?;
        let parallel_job_count = self.parallel_job_count.unwrap_or_else(available_cpus);
        if parallel_job_count == 0 {
            return Err(ConfigError::Invalid(
                "parallel_job_count must be at least 1".to_string(),
            ));
        }

        Ok(ToolchainConfig {
            llvm_install_dir,
            likwid_install_dir: self.likwid_install_dir,
            parallel_job_count,
            build_root: self
                .build_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_ROOT)),
            database: self
                .database
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)),
            time_program: self
                .time_program
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TIME_PROGRAM)),
        })
    }
}

/// Number of logical CPUs, at least one.
#[must_use]
pub fn available_cpus() -> usize {
    let mut system = System::new();
    system.refresh_cpu();
    system.cpus().len().max(1)
}

/// Fully resolved, read-only toolchain configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Root of the LLVM installation.
    pub llvm_install_dir: PathBuf,
    /// Root of the likwid installation, if any.
    pub likwid_install_dir: Option<PathBuf>,
    /// Maximum number of parallel jobs.
    pub parallel_job_count: usize,
    /// Directory under which every project gets its build directory.
    pub build_root: PathBuf,
    /// Location of the results database.
    pub database: PathBuf,
    /// Timing wrapper used to measure workloads.
    pub time_program: PathBuf,
}

impl ToolchainConfig {
    /// The C compiler.
    #[must_use]
    pub fn cc(&self) -> PathBuf {
        self.llvm_install_dir.join("bin").join("clang")
    }

    /// The C++ compiler.
    #[must_use]
    pub fn cxx(&self) -> PathBuf {
        self.llvm_install_dir.join("bin").join("clang++")
    }

    /// LLVM's library directory, where the Polly plugins live.
    #[must_use]
    pub fn llvm_lib_dir(&self) -> PathBuf {
        self.llvm_install_dir.join("lib")
    }

    /// likwid's library directory, if likwid is configured.
    #[must_use]
    pub fn likwid_lib_dir(&self) -> Option<PathBuf> {
        self.likwid_install_dir.as_ref().map(|dir| dir.join("lib"))
    }

    /// Value for `LD_LIBRARY_PATH` so instrumented workloads find their runtime libraries.
    #[must_use]
    pub fn library_path(&self) -> String {
        std::iter::once(self.llvm_lib_dir())
            .chain(self.likwid_lib_dir())
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Build directory reserved for one project under one experiment.
    #[must_use]
    pub fn build_dir(&self, experiment: &str, project: &str) -> PathBuf {
        self.build_root.join(experiment).join(project)
    }

    /// Checks that the compilers and the timing wrapper can be executed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toolchain`] naming the first tool that is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        exec::validate_executable("clang", &self.cc())?;
        exec::validate_executable("clang++", &self.cxx())?;
        exec::validate_executable("time", &self.time_program)?;
        Ok(())
    }
}
