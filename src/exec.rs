//! Subprocess execution.
//!
//! Every external tool the harness touches (downloaders, `configure`, `make`, the timing wrapper and the workloads
//! themselves) goes through [`run`]. A child that exits nonzero is *not* an error here: the [`Output`] carries the exit
//! code and the caller decides whether it is fatal, usually through [`Output::check`].

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{self, Stdio},
};

/// Errors produced while launching a subprocess or judging its result.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The executable could not be located.
    #[error("{} not found", .program.display())]
    NotFound {
        /// Program that was attempted.
        program: PathBuf,
    },
    /// The working directory requested for the child does not exist.
    #[error("working directory {} does not exist", .path.display())]
    WorkingDirectory {
        /// Missing directory.
        path: PathBuf,
    },
    /// The file meant to be redirected into the child's stdin could not be opened.
    #[error("could not open {} as stdin: {source}", .path.display())]
    Stdin {
        /// File that was requested as stdin.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Any other failure to spawn or wait on the child.
    #[error("could not run {}: {source}", .program.display())]
    Spawn {
        /// Program that was attempted.
        program: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The child ran but did not exit successfully.
    #[error("`{command}` exited with {}", describe_code(.code))]
    Failed {
        /// Shell-like rendering of the command.
        command: String,
        /// Exit code, `None` if the child was killed by a signal.
        code: Option<i32>,
        /// Captured stderr of the child.
        stderr: String,
    },
}

fn describe_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |code| format!("code {code}"))
}

/// Description of a subprocess to launch.
///
/// # Examples
///
/// ```
/// use polly_bench::exec::Command;
///
/// let command = Command::new("make").arg("-j4").env("CC", "clang").current_dir("/tmp");
///
/// assert_eq!(command.to_string(), "CC=clang make -j4");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    /// Program to execute, either a path or a name resolved through `PATH`.
    pub program: PathBuf,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Environment variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Working directory, the current one if unset.
    pub cwd: Option<PathBuf>,
    /// File redirected into the child's stdin, `/dev/null` if unset.
    pub stdin: Option<PathBuf>,
}

impl Command {
    /// Creates a command for the given program with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets several environment overrides, later values win.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Redirects the given file into the child's stdin.
    #[must_use]
    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }
}

fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+%@".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={} ", quote(value))?;
        }
        write!(f, "{}", quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        if let Some(stdin) = &self.stdin {
            write!(f, " < {}", quote(&stdin.to_string_lossy()))?;
        }
        Ok(())
    }
}

/// Captured result of a finished subprocess.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    /// Exit code, `None` if the child was terminated by a signal.
    pub code: Option<i32>,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

impl Output {
    /// Whether the child exited with code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turns a nonzero exit into [`ExecError::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Failed`] carrying the rendered command, exit code and stderr if the child did not succeed.
    pub fn check(self, command: &Command) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::Failed {
                command: command.to_string(),
                code: self.code,
                stderr: self.stderr,
            })
        }
    }
}

/// Runs a command to completion and captures its output.
///
/// Blocks the calling task until the child exits; there is no timeout.
///
/// # Errors
///
/// Returns [`ExecError::NotFound`] if the program does not exist, [`ExecError::WorkingDirectory`] or
/// [`ExecError::Stdin`] if the requested redirections are unusable and [`ExecError::Spawn`] for any other launch
/// failure. A nonzero exit code is reported through [`Output::code`], not as an error.
pub async fn run(command: &Command) -> Result<Output, ExecError> {
    log::debug!("running `{command}`...");

    let mut process = tokio::process::Command::new(&command.program);
    process
        .args(&command.args)
        .envs(&command.env)
        .kill_on_drop(true);

    if let Some(cwd) = &command.cwd {
        if !cwd.is_dir() {
            return Err(ExecError::WorkingDirectory { path: cwd.clone() });
        }
        process.current_dir(cwd);
    }

    match &command.stdin {
        Some(path) => {
            let file = File::open(path).map_err(|source| ExecError::Stdin {
                path: path.clone(),
                source,
            })?;
            process.stdin(Stdio::from(file));
        }
        None => {
            process.stdin(Stdio::null());
        }
    }

    let output = process.output().await.map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => ExecError::NotFound {
            program: command.program.clone(),
        },
        _ => ExecError::Spawn {
            program: command.program.clone(),
            source: err,
        },
    })?;

    let output = Output {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    log::debug!("`{command}` exited with {}", describe_code(&output.code));
    log::trace!(
        "`{command}` output\nstdout:\n{}\nstderr:\n{}",
        output.stdout,
        output.stderr
    );

    Ok(output)
}

/// Checks that an executable exists by invoking it with `--version`.
///
/// # Errors
///
/// Returns [`ExecError::NotFound`] if the executable cannot be found, or [`ExecError::Spawn`] for any other error.
pub fn validate_executable(name: &str, executable: &Path) -> Result<PathBuf, ExecError> {
    log::trace!("validating executable {} ({name})", executable.display());
    match process::Command::new(executable)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
    {
        Ok(out) => {
            let version = String::from_utf8_lossy(if out.stdout.is_empty() {
                &out.stderr
            } else {
                &out.stdout
            })
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
            log::debug!("found {name} ({}): {version}", executable.display());
            Ok(executable.to_path_buf())
        }
        Err(err) => match err.kind() {
            io::ErrorKind::NotFound => Err(ExecError::NotFound {
                program: executable.to_path_buf(),
            }),
            _ => Err(ExecError::Spawn {
                program: executable.to_path_buf(),
                source: err,
            }),
        },
    }
}
