//! Orchestration of the download → configure → build → run → measure → submit lifecycle.
//!
//! A [`Pipeline`] binds one [`Experiment`] to a toolchain and a datastore and runs projects through it. Every
//! (project, experiment) pair goes through the same phases, strictly in order:
//!
//! ```text
//! Init -> Downloaded -> Configured -> Built -> Run -> Measured -> Submitted -> Done
//! ```
//!
//! `Run -> Measured -> Submitted` repeats for every workload of every trial; trials share the build output. Failures of
//! a project's hooks or workloads abandon only that pair: [`Pipeline::execute`] logs them and moves on to the next
//! project. Only datastore failures stop the sweep.
//!
//! # Examples
//!
//! ```no_run
//! use std::path::PathBuf;
//!
//! use polly_bench::{
//!     config::Settings,
//!     experiments::{Experiment, ExperimentKind},
//!     pipeline::Pipeline,
//!     projects::{self, Project},
//!     store::Store,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let toolchain = Settings {
//!     llvm_install_dir: Some(PathBuf::from("/opt/llvm")),
//!     ..Default::default()
//! }
//! .resolve()?;
//! let experiment = Experiment::from_kind(ExperimentKind::PollyOpenmp, &toolchain);
//! let store = Store::open(&toolchain.database)?;
//! let projects: Vec<Box<dyn Project>> = projects::find_all(&PathBuf::from("projects"))?
//!     .into_iter()
//!     .map(|project| Box::new(project) as Box<dyn Project>)
//!     .collect();
//!
//! let report = Pipeline::new(&toolchain, &experiment, &store).execute(&projects).await?;
//! #     Ok(())
//! # }
//! ```

use std::{
    fmt::{self, Display, Formatter},
    fs, io,
    path::PathBuf,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    config::ToolchainConfig,
    exec::{self, Command, ExecError},
    experiments::Experiment,
    projects::{BuildContext, Project, ProjectError},
    report::{EntryStatus, SweepEntry, SweepReport},
    stage::StageTracker,
    store::{self, metrics::Metric, NewRun, RunGroup, RunId, Store, StoreError},
};

/// Lifecycle phases of a (project, experiment) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing has happened yet.
    Init,
    /// Sources are in the build directory.
    Downloaded,
    /// The build is configured with the experiment's flags.
    Configured,
    /// The project is compiled.
    Built,
    /// A workload has executed.
    Run,
    /// The workload's output has been parsed.
    Measured,
    /// The measurements are in the datastore.
    Submitted,
    /// Every trial has finished.
    Done,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Downloaded => "downloaded",
            Self::Configured => "configured",
            Self::Built => "built",
            Self::Run => "run",
            Self::Measured => "measured",
            Self::Submitted => "submitted",
            Self::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// Why a (project, experiment) pair was abandoned.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The build directory could not be prepared.
    #[error("could not prepare build directory {}: {source}", .path.display())]
    Prepare {
        /// Build directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// A hook could not produce its commands.
    #[error("{hook} hook failed: {source}")]
    Project {
        /// Hook that failed.
        hook: &'static str,
        /// Error raised by the hook.
        source: ProjectError,
    },
    /// Fetching the sources failed.
    #[error("acquisition failed: {0}")]
    Acquisition(#[source] ExecError),
    /// Configuring or compiling failed.
    #[error("{hook} failed: {source}")]
    Build {
        /// `configure` or `build`.
        hook: &'static str,
        /// The failed command, including its exit code.
        source: ExecError,
    },
    /// A workload could not be executed at all.
    #[error("execution failed: {0}")]
    Execution(#[source] ExecError),
    /// The datastore rejected a write; fatal to the whole sweep.
    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),
}

impl PipelineError {
    /// Short machine readable classification of the failure.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prepare { .. } | Self::Project { .. } => "project_failure",
            Self::Acquisition(_) => "acquisition_failure",
            Self::Build { .. } => "build_failure",
            Self::Execution(_) => "execution_failure",
            Self::Storage(_) => "storage_unavailable",
        }
    }
}

/// Whether a workload's measurements made it to the datastore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run and its metrics were recorded.
    Submitted,
    /// The workload produced no measurements; nothing was recorded.
    Degraded,
}

/// One measured workload execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Identifier of the recorded run, absent if nothing was recorded.
    pub run_id: Option<RunId>,
    /// Group of the trial this execution belongs to.
    pub run_group: RunGroup,
    /// Job count of the trial.
    pub jobs: usize,
    /// The measured command.
    pub command: String,
    /// Exit code of the measured command.
    pub exit_code: Option<i32>,
    /// Measurements parsed from the output.
    pub metrics: Vec<Metric>,
    /// Whether the measurements were recorded.
    pub status: RunStatus,
}

/// Result of taking one project through every phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Name of the project.
    pub project: String,
    /// Name of the experiment.
    pub experiment: String,
    /// Every measured workload execution, in order.
    pub runs: Vec<RunRecord>,
}

impl RunOutcome {
    /// Whether any workload execution produced no measurements.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.runs
            .iter()
            .any(|run| run.status == RunStatus::Degraded)
    }
}

fn advance(project: &str, phase: &mut Phase, next: Phase) {
    log::debug!("[{project}] {phase} -> {next}");
    *phase = next;
}

/// Runs projects through one experiment.
#[derive(Debug)]
pub struct Pipeline<'a> {
    toolchain: &'a ToolchainConfig,
    experiment: &'a Experiment,
    store: &'a Store,
    tracker: StageTracker,
    clean: bool,
}

impl<'a> Pipeline<'a> {
    /// Creates a pipeline recording into `store`.
    #[must_use]
    pub fn new(
        toolchain: &'a ToolchainConfig,
        experiment: &'a Experiment,
        store: &'a Store,
    ) -> Self {
        Self {
            toolchain,
            experiment,
            store,
            tracker: StageTracker::new(),
            clean: false,
        }
    }

    /// Whether to wipe each project's build directory before starting.
    #[must_use]
    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    /// The stage tracker that every phase is logged through.
    #[must_use]
    pub fn tracker(&self) -> &StageTracker {
        &self.tracker
    }

    fn prepare(&self, project: &dyn Project) -> Result<PathBuf, PipelineError> {
        let path = self
            .toolchain
            .build_dir(&self.experiment.name, project.name());
        let prepare = |path: &PathBuf| -> io::Result<PathBuf> {
            if self.clean && path.exists() {
                log::debug!("[{}] removing {}...", project.name(), path.display());
                fs::remove_dir_all(path)?;
            }
            fs::create_dir_all(path)?;
            path.canonicalize()
        };
        prepare(&path).map_err(|source| PipelineError::Prepare { path, source })
    }

    async fn run_hook(
        &self,
        hook: &'static str,
        commands: Result<Vec<Command>, ProjectError>,
        ctx: &BuildContext,
        failure: fn(&'static str, ExecError) -> PipelineError,
    ) -> Result<(), PipelineError> {
        let stage = self.tracker.enter(hook);
        let result = async {
            let commands = commands.map_err(|source| PipelineError::Project { hook, source })?;
            for command in commands {
                let command = ctx.prepare(command);
                exec::run(&command)
                    .await
                    .and_then(|output| output.check(&command))
                    .map_err(|err| failure(hook, err))?;
            }
            Ok::<(), PipelineError>(())
        }
        .await;
        stage.finish(&result);
        result
    }

    async fn run_workload(
        &self,
        project: &dyn Project,
        workload: Command,
        jobs: usize,
        run_group: RunGroup,
        phase: &mut Phase,
    ) -> Result<RunRecord, PipelineError> {
        let label = workload
            .program
            .file_name()
            .map_or_else(|| workload.program.to_string_lossy(), |name| name.to_string_lossy())
            .into_owned();
        let command = self.experiment.wrap(workload, jobs);

        let stage = self.tracker.enter(format!("run {label}"));
        let output = match exec::run(&command).await {
            Ok(output) => output,
            Err(err) => {
                stage.fail(&err);
                return Err(PipelineError::Execution(err));
            }
        };
        advance(project.name(), phase, Phase::Run);
        if !output.success() {
            log::warn!(
                "[{}] execution failure: `{command}` exited with {:?}, keeping its measurements...",
                project.name(),
                output.code
            );
        }

        let metrics = self.experiment.measure(&output.stdout, &output.stderr);
        advance(project.name(), phase, Phase::Measured);

        let mut record = RunRecord {
            run_id: None,
            run_group,
            jobs,
            command: command.to_string(),
            exit_code: output.code,
            metrics,
            status: RunStatus::Degraded,
        };

        if record.metrics.is_empty() {
            log::warn!(
                "[{}] `{command}` produced no measurements, not submitting (degraded)",
                project.name()
            );
            log::debug!("[{}] stderr:\n{}", project.name(), output.stderr);
            stage.succeed();
            return Ok(record);
        }

        let recorded = store::record(
            self.store,
            NewRun::new(
                record.command.clone(),
                project.name(),
                self.experiment.name.clone(),
                run_group,
            ),
            record.metrics.clone(),
        )
        .await;
        stage.finish(&recorded);
        let run_id = recorded?;
        advance(project.name(), phase, Phase::Submitted);
        log::info!(
            "[{run_id}] recorded {} metrics for {} ({jobs} jobs)",
            record.metrics.len(),
            project.name()
        );

        record.run_id = Some(run_id);
        record.status = RunStatus::Submitted;
        Ok(record)
    }

    async fn run_trial(
        &self,
        project: &dyn Project,
        ctx: &BuildContext,
        jobs: usize,
        run_group: RunGroup,
        phase: &mut Phase,
        records: &mut Vec<RunRecord>,
    ) -> Result<(), PipelineError> {
        let workloads = project
            .run_tests(ctx)
            .map_err(|source| PipelineError::Project { hook: "run", source })?;
        if workloads.is_empty() {
            log::info!("[{}] has no workloads to run", project.name());
        }

        for workload in workloads {
            let workload = ctx.prepare(workload);
            records.push(
                self.run_workload(project, workload, jobs, run_group, phase)
                    .await?,
            );
        }
        Ok(())
    }

    /// Pushes every measured workload execution into `records` as it happens, so executions that were already
    /// recorded stay visible when a later phase fails.
    async fn run_phases(
        &self,
        project: &dyn Project,
        records: &mut Vec<RunRecord>,
    ) -> Result<(), PipelineError> {
        let mut phase = Phase::Init;
        let build_dir = self.prepare(project)?;
        let ctx = BuildContext::new(self.toolchain, self.experiment, build_dir);

        self.run_hook("download", project.download(&ctx), &ctx, |_, err| {
            PipelineError::Acquisition(err)
        })
        .await?;
        advance(project.name(), &mut phase, Phase::Downloaded);

        let build_failure: fn(&'static str, ExecError) -> PipelineError =
            |hook, source| PipelineError::Build { hook, source };
        self.run_hook("configure", project.configure(&ctx), &ctx, build_failure)
            .await?;
        advance(project.name(), &mut phase, Phase::Configured);
        self.run_hook("build", project.build(&ctx), &ctx, build_failure)
            .await?;
        advance(project.name(), &mut phase, Phase::Built);

        for jobs in self.experiment.job_counts() {
            let run_group = RunGroup::generate();
            let trial = self
                .tracker
                .enter(format!("trial: {jobs} jobs, group {run_group}"));
            let result = self
                .run_trial(project, &ctx, jobs, run_group, &mut phase, records)
                .await;
            trial.finish(&result);
            result?;
        }

        advance(project.name(), &mut phase, Phase::Done);
        Ok(())
    }

    async fn run_pair(&self, project: &dyn Project) -> (Vec<RunRecord>, Result<(), PipelineError>) {
        let step = self
            .tracker
            .enter(format!("{}: {}", self.experiment.name, project.name()));
        let mut runs = Vec::new();
        let result = self.run_phases(project, &mut runs).await;
        step.finish(&result);
        (runs, result)
    }

    /// Takes a single project through every phase of the experiment.
    ///
    /// # Errors
    ///
    /// Returns the [`PipelineError`] that made the pipeline abandon this project. Workloads that run but produce no
    /// measurements are not errors; they show up as [`RunStatus::Degraded`] records.
    pub async fn execute_single(&self, project: &dyn Project) -> Result<RunOutcome, PipelineError> {
        let (runs, result) = self.run_pair(project).await;
        result.map(|()| RunOutcome {
            project: project.name().to_string(),
            experiment: self.experiment.name.clone(),
            runs,
        })
    }

    /// Runs every project through the experiment, one after the other.
    ///
    /// A project whose hooks or workloads fail is logged and recorded as failed in the report, together with any runs
    /// it recorded before failing, and the sweep moves on.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] as soon as the datastore rejects a write, since no further results could be recorded.
    pub async fn execute(&self, projects: &[Box<dyn Project>]) -> Result<SweepReport, StoreError> {
        log::info!(
            "running {} projects under experiment {}...",
            projects.len(),
            self.experiment.name
        );
        let started_at = Utc::now();

        // Projects run strictly one after another: concurrent builds and workloads would
        // interfere with each other's timings.
        let mut entries = Vec::with_capacity(projects.len());
        for project in projects {
            let (runs, result) = self.run_pair(project.as_ref()).await;
            let stages = self.tracker.take_journal();

            let status = match result {
                Ok(()) => {
                    log::info!("[{}] finished with {} runs", project.name(), runs.len());
                    if runs.iter().any(|run| run.status == RunStatus::Degraded) {
                        EntryStatus::Degraded
                    } else {
                        EntryStatus::Completed
                    }
                }
                Err(PipelineError::Storage(err)) => {
                    log::error!(
                        "[{}] could not record results: {err}, aborting sweep",
                        project.name()
                    );
                    return Err(err);
                }
                Err(err) => {
                    log::error!(
                        "[{}] {}: {err} after {} runs, continuing...",
                        project.name(),
                        err.kind(),
                        runs.len()
                    );
                    EntryStatus::Failed {
                        kind: err.kind().to_string(),
                        error: err.to_string(),
                    }
                }
            };

            entries.push(SweepEntry {
                project: project.name().to_string(),
                domain: project.domain().to_string(),
                status,
                runs,
                stages,
            });
        }

        let report = SweepReport {
            experiment: self.experiment.name.clone(),
            started_at,
            finished_at: Utc::now(),
            host: None,
            entries,
        };
        let summary = report.summary();
        log::info!(
            "sweep finished: {} completed, {} degraded, {} failed",
            summary.completed,
            summary.degraded,
            summary.failed
        );

        Ok(report)
    }
}
