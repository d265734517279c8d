//! Projects described by JSON manifests.
//!
//! A manifest lives next to any files the project needs (patches, inputs) and is named `<name>.project.json`:
//!
//! ```json
//! {
//!     "name": "linpack",
//!     "domain": "scientific",
//!     "source": { "kind": "url", "url": "http://www.netlib.org/benchmark/linpackc.new", "file": "linpack.c" },
//!     "build": [
//!         { "command": ["{cc}", "{cflags}", "-o", "linpack", "linpack.c", "{ldflags}", "-lm"] }
//!     ],
//!     "run": [
//!         { "command": ["{builddir}/linpack"], "stdin": "{srcdir}/linpack.input" }
//!     ]
//! }
//! ```
//!
//! Words of every command, working directories, stdin files and environment values may use these placeholders:
//!
//! | placeholder  | expands to                                             |
//! |--------------|--------------------------------------------------------|
//! | `{cc}`       | the C compiler                                         |
//! | `{cxx}`      | the C++ compiler                                       |
//! | `{cflags}`   | the experiment's compiler flags, one word per flag     |
//! | `{ldflags}`  | the experiment's linker flags, one word per flag       |
//! | `{jobs}`     | the parallel job count                                 |
//! | `{builddir}` | the project's build directory                          |
//! | `{srcdir}`   | the directory containing the manifest                  |
//!
//! `{cflags}` and `{ldflags}` must stand alone as a word; inside a longer word (or an environment value) they expand to
//! the flags joined by spaces.

use std::{
    collections::BTreeMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::{BuildContext, Project, ProjectError};
use crate::exec::Command;

/// Glob pattern for project manifest files.
pub const FILE_PATTERN: &str = "**/*.project.json";

/// Where a project's sources come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// A single file fetched over HTTP(S) or FTP, optionally unpacked with `tar`.
    Url {
        /// Location of the file.
        url: String,
        /// Name to save the file under in the build directory.
        file: String,
        /// Whether the file is an archive to unpack after downloading.
        #[serde(default)]
        unpack: bool,
    },
    /// A git repository, cloned once.
    Git {
        /// Repository to clone.
        url: String,
        /// Directory in the build directory to clone into.
        dir: String,
    },
    /// Files shipped next to the manifest, copied into the build directory.
    Local {
        /// Path relative to the manifest.
        path: PathBuf,
    },
}

/// One command of a manifest hook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Working directory, relative to the build directory.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// File to redirect into stdin.
    #[serde(default)]
    pub stdin: Option<String>,
}

/// Contents of a `*.project.json` file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectManifest {
    /// Unique project name.
    pub name: String,
    /// Domain tag.
    pub domain: String,
    /// Where the sources come from, if anywhere.
    #[serde(default)]
    pub source: Option<Source>,
    /// Patches (relative to the manifest) applied with `patch -p0` after downloading.
    #[serde(default)]
    pub patches: Vec<PathBuf>,
    /// Configure commands.
    #[serde(default)]
    pub configure: Vec<Step>,
    /// Build commands.
    #[serde(default)]
    pub build: Vec<Step>,
    /// Workloads to measure.
    #[serde(default)]
    pub run: Vec<Step>,
}

/// A [`Project`] backed by a manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestProject {
    /// The parsed manifest.
    pub manifest: ProjectManifest,
    /// Directory containing the manifest; `{srcdir}` and relative patch paths resolve against it.
    pub source_dir: PathBuf,
}

impl ManifestProject {
    /// Wraps a manifest whose support files live in `source_dir`.
    pub fn new(manifest: ProjectManifest, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            source_dir: source_dir.into(),
        }
    }

    fn substitute(&self, word: &str, ctx: &BuildContext) -> String {
        word.replace("{cc}", &ctx.cc.to_string_lossy())
            .replace("{cxx}", &ctx.cxx.to_string_lossy())
            .replace("{cflags}", &ctx.cflags.join(" "))
            .replace("{ldflags}", &ctx.ldflags.join(" "))
            .replace("{jobs}", &ctx.jobs.to_string())
            .replace("{builddir}", &ctx.build_dir.to_string_lossy())
            .replace("{srcdir}", &self.source_dir.to_string_lossy())
    }

    fn expand_words(&self, words: &[String], ctx: &BuildContext) -> Vec<String> {
        words
            .iter()
            .flat_map(|word| match word.as_str() {
                "{cflags}" => ctx.cflags.clone(),
                "{ldflags}" => ctx.ldflags.clone(),
                _ => vec![self.substitute(word, ctx)],
            })
            .collect()
    }

    fn commands(
        &self,
        hook: &str,
        steps: &[Step],
        ctx: &BuildContext,
    ) -> Result<Vec<Command>, ProjectError> {
        steps
            .iter()
            .map(|step| {
                let mut words = self.expand_words(&step.command, ctx).into_iter();
                let program = words.next().ok_or_else(|| {
                    ProjectError::Invalid(format!("[{}] empty {hook} command", self.manifest.name))
                })?;

                let mut command = Command::new(program).args(words).envs(
                    step.env
                        .iter()
                        .map(|(key, value)| (key.clone(), self.substitute(value, ctx))),
                );
                if let Some(cwd) = &step.cwd {
                    command = command.current_dir(self.substitute(cwd, ctx));
                }
                if let Some(stdin) = &step.stdin {
                    command = command.stdin_file(self.substitute(stdin, ctx));
                }
                Ok(command)
            })
            .collect()
    }
}

impl Project for ManifestProject {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn domain(&self) -> &str {
        &self.manifest.domain
    }

    fn download(&self, ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        let mut commands = match &self.manifest.source {
            None => Vec::new(),
            Some(Source::Url { url, file, unpack }) => {
                let mut commands = vec![Command::new("curl").args([
                    "-fsSL",
                    "-o",
                    file.as_str(),
                    url.as_str(),
                ])];
                if *unpack {
                    commands.push(Command::new("tar").args(["xf", file.as_str()]));
                }
                commands
            }
            Some(Source::Git { url, dir }) => {
                if ctx.build_dir.join(dir).is_dir() {
                    log::debug!("[{}] {dir} already cloned, skipping clone", self.manifest.name);
                    Vec::new()
                } else {
                    vec![Command::new("git").args([
                        "clone",
                        "--depth",
                        "1",
                        url.as_str(),
                        dir.as_str(),
                    ])]
                }
            }
            Some(Source::Local { path }) => {
                vec![Command::new("cp")
                    .arg("-a")
                    .arg(self.source_dir.join(path).to_string_lossy())
                    .arg(".")]
            }
        };

        commands.extend(self.manifest.patches.iter().map(|patch| {
            Command::new("patch")
                .args(["-p0", "-N", "-i"])
                .arg(self.source_dir.join(patch).to_string_lossy())
        }));

        Ok(commands)
    }

    fn configure(&self, ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        self.commands("configure", &self.manifest.configure, ctx)
    }

    fn build(&self, ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        self.commands("build", &self.manifest.build, ctx)
    }

    fn run_tests(&self, ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        self.commands("run", &self.manifest.run, ctx)
    }
}

/// Finds and loads all project manifests under the given path.
///
/// Searches for all files matching the [`FILE_PATTERN`] pattern under the given path and attempts to deserialize them
/// into [`ManifestProject`]s, sorted by name.
///
/// # Errors
///
/// If the glob pattern cannot be constructed or the glob search fails, then the error is returned.
///
/// If any of the files matching the pattern cannot be opened or deserialized, or if it reuses the name of an earlier
/// project, then the error is logged and the file is skipped.
pub fn find_all(path: &Path) -> anyhow::Result<Vec<ManifestProject>> {
    log::info!("finding all project manifests under {}...", path.display());
    let mut projects: BTreeMap<String, ManifestProject> = BTreeMap::new();
    for entry in glob::glob(
        path.join(FILE_PATTERN)
            .to_str()
            .context("could not convert project manifest pattern to string")?,
    )
    .context("searching for all project manifests")?
    {
        let Some(project) = load(entry) else {
            continue;
        };
        if let Some(existing) = projects.get(project.name()) {
            log::warn!(
                "[{}] defined both in {} and {}, skipping the latter...",
                project.name(),
                existing.source_dir.display(),
                project.source_dir.display()
            );
            continue;
        }
        projects.insert(project.name().to_string(), project);
    }
    log::info!("found {} projects", projects.len());
    log::trace!("projects: {projects:#?}");

    Ok(projects.into_values().collect())
}

fn load(entry: Result<PathBuf, glob::GlobError>) -> Option<ManifestProject> {
    let path = entry
        .map_err(|err| {
            log::warn!("could not get globbed path: {err}, skipping...");
        })
        .ok()?;

    log::debug!("processing project manifest ({})...", path.display());

    let manifest: ProjectManifest = serde_json::from_reader(BufReader::new(
        File::open(&path)
            .map_err(|err| {
                log::warn!("could not open project manifest: {err}, skipping...");
            })
            .ok()?,
    ))
    .map_err(|err| {
        log::warn!(
            "could not deserialize project manifest {}: {err}, skipping...",
            path.display()
        );
    })
    .ok()?;

    let source_dir = path
        .parent()
        .or_else(|| {
            log::warn!("could not get parent of project manifest, skipping...");
            None
        })?
        .canonicalize()
        .map_err(|err| {
            log::warn!("could not canonicalize project directory: {err}, skipping...");
        })
        .ok()?;

    log::debug!("processed project manifest");
    Some(ManifestProject::new(manifest, source_dir))
}
