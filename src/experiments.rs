//! Measurement methodologies.
//!
//! An [`Experiment`] decides how every project is compiled (compiler and linker flags), how its workloads are wrapped
//! for measurement, which tagged lines are turned into metrics, and how many trials are run. Workloads always run
//! under the timing wrapper; experiments that read hardware counters additionally run them under a counter tool
//! (likwid-perfctr) and parse the counter lines printed by the instrumentation runtime. The built-in experiments
//! are selected through [`ExperimentKind`]; custom ones can be assembled with [`Experiment::new`].
//!
//! # Examples
//!
//! ```
//! use std::path::PathBuf;
//!
//! use polly_bench::{config::Settings, experiments::{Experiment, ExperimentKind}};
//!
//! let toolchain = Settings {
//!     llvm_install_dir: Some(PathBuf::from("/opt/llvm")),
//!     parallel_job_count: Some(4),
//!     ..Default::default()
//! }
//! .resolve()
//! .unwrap();
//!
//! let experiment = Experiment::from_kind(ExperimentKind::PollyOpenmpVect, &toolchain);
//!
//! assert_eq!(experiment.name, "polly-openmpvect");
//! assert_eq!(experiment.job_counts(), vec![1, 2, 3, 4]);
//! ```

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{config::ToolchainConfig, exec::Command, parse::TaggedFormat, store::metrics::Metric};

/// Tag printed by the timing wrapper.
pub const TIMING_TAG: &str = "PPROF-POLLY";

/// Metric names for the user, system and wall clock seconds reported by the timing wrapper.
pub const TIMING_METRICS: [&str; 3] = ["time.user_s", "time.system_s", "time.real_s"];

/// Tag printed by the `libpprof` instrumentation runtime when the workload exits.
pub const COUNTERS_TAG: &str = "PPROF-COUNTERS";

/// Metric names for the readings of a `PPROF-COUNTERS` line: nanoseconds spent in the whole program, nanoseconds
/// spent inside SCoPs, and the number of PAPI calls made to measure them.
pub const COUNTER_METRICS: [&str; 3] = ["papi.total_ns", "papi.scop_ns", "papi.calls"];

/// likwid-perfctr event group measured by default.
pub const DEFAULT_COUNTER_GROUP: &str = "CLOCK";

/// The built-in experiments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentKind {
    /// Plain `-O3`, the baseline for every other experiment.
    Raw,
    /// Polly's sequential polyhedral optimizations.
    Polly,
    /// Polly with OpenMP code generation.
    PollyOpenmp,
    /// Polly with OpenMP code generation and strip-mine vectorization, measured once per job count.
    #[serde(rename = "polly-openmpvect")]
    #[value(name = "polly-openmpvect")]
    PollyOpenmpVect,
    /// PolyJIT instrumentation without recompilation, reading PAPI counters and, with likwid configured, running
    /// under likwid-perfctr.
    Papi,
}

impl ExperimentKind {
    /// Name under which runs of this experiment are recorded.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Polly => "polly",
            Self::PollyOpenmp => "polly-openmp",
            Self::PollyOpenmpVect => "polly-openmpvect",
            Self::Papi => "papi",
        }
    }
}

impl Display for ExperimentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How many trials of run/measure/submit follow a single build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trials {
    /// One trial using the full job count.
    Once,
    /// One trial for every job count from 1 up to the configured maximum.
    PerJobCount,
}

/// Maps the fields of one tagged line format to metric names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Measurement {
    /// Format of the lines carrying the measurement.
    pub format: TaggedFormat,
    /// Metric name for each field, in order.
    pub names: Vec<String>,
}

impl Measurement {
    /// Creates a measurement whose arity is the number of names.
    pub fn new<I, S>(tag: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        Self {
            format: TaggedFormat::new(tag, names.len()),
            names,
        }
    }

    /// The timing wrapper's `PPROF-POLLY: user-system-real` line.
    #[must_use]
    pub fn timing() -> Self {
        Self::new(TIMING_TAG, TIMING_METRICS)
    }

    /// The instrumentation runtime's `PPROF-COUNTERS: total-scop-calls` line.
    #[must_use]
    pub fn counters() -> Self {
        Self::new(COUNTERS_TAG, COUNTER_METRICS)
    }

    fn extract<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> Vec<Metric> {
        self.format
            .parse_lines(lines)
            .into_iter()
            .flat_map(|tuple| {
                self.names
                    .iter()
                    .zip(tuple)
                    .map(|(name, value)| Metric::new(name.clone(), value))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// A hardware counter tool that workloads run under, inside the timing wrapper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterTool {
    /// The `likwid-perfctr` executable.
    pub program: PathBuf,
    /// Event group to measure.
    pub group: String,
}

impl CounterTool {
    /// likwid-perfctr from the given likwid installation, measuring the default group.
    #[must_use]
    pub fn likwid(install_dir: &Path) -> Self {
        Self {
            program: install_dir.join("bin").join("likwid-perfctr"),
            group: DEFAULT_COUNTER_GROUP.to_string(),
        }
    }

    /// Pins the workload to the first `jobs` cores and measures the event group.
    fn wrap(&self, workload: Command, jobs: usize) -> Command {
        Command {
            program: self.program.clone(),
            args: [
                "-C".to_string(),
                format!("0-{}", jobs.saturating_sub(1)),
                "-g".to_string(),
                self.group.clone(),
                workload.program.to_string_lossy().into_owned(),
            ]
            .into_iter()
            .chain(workload.args)
            .collect(),
            ..workload
        }
    }
}

/// A fully configured measurement methodology, immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Experiment {
    /// Name under which runs are recorded.
    pub name: String,
    /// Flags passed to the compiler for every project.
    pub cflags: Vec<String>,
    /// Flags passed to the linker for every project.
    pub ldflags: Vec<String>,
    /// Environment set for every workload.
    pub run_env: BTreeMap<String, String>,
    /// Timing wrapper that workloads are executed under, if any.
    pub time_program: Option<PathBuf>,
    /// Counter tool that workloads are executed under, inside the timing wrapper, if any.
    pub counter_tool: Option<CounterTool>,
    /// Tagged lines turned into metrics.
    pub measurements: Vec<Measurement>,
    /// Trial strategy.
    pub trials: Trials,
    /// Maximum job count.
    pub jobs: usize,
}

fn words(flags: &[&str]) -> Vec<String> {
    flags.iter().map(ToString::to_string).collect()
}

impl Experiment {
    /// Creates an experiment with no flags, no timing wrapper, a single trial and the standard timing measurement.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cflags: Vec::new(),
            ldflags: Vec::new(),
            run_env: BTreeMap::new(),
            time_program: None,
            counter_tool: None,
            measurements: vec![Measurement::timing()],
            trials: Trials::Once,
            jobs: 1,
        }
    }

    /// Builds one of the built-in experiments against the given toolchain.
    #[must_use]
    pub fn from_kind(kind: ExperimentKind, toolchain: &ToolchainConfig) -> Self {
        let plugin = |name: &str| {
            toolchain
                .llvm_lib_dir()
                .join(name)
                .to_string_lossy()
                .into_owned()
        };
        let polly = plugin("LLVMPolly.so");
        let polyjit = plugin("LLVMPolyJIT.so");
        let load_polly = ["-Xclang", "-load", "-Xclang", polly.as_str()];
        let load_polyjit = ["-Xclang", "-load", "-Xclang", polyjit.as_str()];

        let mut cflags = words(&["-O3"]);
        let mut ldflags = vec![format!("-L{}", toolchain.llvm_lib_dir().display())];
        if let Some(likwid) = toolchain.likwid_lib_dir() {
            ldflags.push(format!("-L{}", likwid.display()));
        }

        match kind {
            ExperimentKind::Raw => {}
            ExperimentKind::Polly => {
                cflags.extend(words(&load_polly));
                cflags.extend(words(&["-mllvm", "-polly"]));
            }
            ExperimentKind::PollyOpenmp => {
                cflags.extend(words(&load_polyjit));
                cflags.extend(words(&["-mllvm", "-polly", "-mllvm", "-polly-parallel"]));
                ldflags.push("-lgomp".to_string());
            }
            ExperimentKind::PollyOpenmpVect => {
                cflags.extend(words(&load_polly));
                cflags.extend(words(&["-mllvm", "-polly", "-mllvm", "-polly-parallel"]));
                cflags.extend(words(&["-mllvm", "-polly-vectorizer=stripmine"]));
                ldflags.push("-lgomp".to_string());
            }
            ExperimentKind::Papi => {
                cflags.extend(words(&load_polyjit));
                cflags.extend(words(&[
                    "-mllvm",
                    "-polli",
                    "-mllvm",
                    "-jitable",
                    "-mllvm",
                    "-instrument",
                    "-mllvm",
                    "-no-recompilation",
                    "-mllvm",
                    "-polly-detect-keep-going",
                ]));
                ldflags.extend(words(&["-lpjit", "-lpprof", "-lpapi"]));
            }
        }

        let (counter_tool, measurements) = if kind == ExperimentKind::Papi {
            (
                toolchain.likwid_install_dir.as_deref().map(CounterTool::likwid),
                vec![Measurement::timing(), Measurement::counters()],
            )
        } else {
            (None, vec![Measurement::timing()])
        };

        Self {
            cflags,
            ldflags,
            run_env: BTreeMap::from([("LD_LIBRARY_PATH".to_string(), toolchain.library_path())]),
            time_program: Some(toolchain.time_program.clone()),
            counter_tool,
            measurements,
            trials: if kind == ExperimentKind::PollyOpenmpVect {
                Trials::PerJobCount
            } else {
                Trials::Once
            },
            jobs: toolchain.parallel_job_count,
            ..Self::new(kind.name())
        }
    }

    /// Job counts of the trials this experiment runs, in order.
    #[must_use]
    pub fn job_counts(&self) -> Vec<usize> {
        match self.trials {
            Trials::Once => vec![self.jobs],
            Trials::PerJobCount => (1..=self.jobs).collect(),
        }
    }

    /// Wraps a workload for measurement at the given job count.
    ///
    /// The workload keeps its own arguments, working directory and stdin. The experiment's run environment and
    /// `OMP_NUM_THREADS` are added. The workload then runs under the counter tool and the timing wrapper, in that
    /// order from the inside out, for whichever of them are configured.
    #[must_use]
    pub fn wrap(&self, workload: Command, jobs: usize) -> Command {
        let mut env = self.run_env.clone();
        env.insert("OMP_NUM_THREADS".to_string(), jobs.to_string());
        env.extend(workload.env);
        let workload = Command { env, ..workload };
        let workload = match &self.counter_tool {
            Some(tool) => tool.wrap(workload, jobs),
            None => workload,
        };

        match &self.time_program {
            Some(time) => Command {
                program: time.clone(),
                args: [
                    "-f".to_string(),
                    format!("{TIMING_TAG}: %U-%S-%e"),
                    workload.program.to_string_lossy().into_owned(),
                ]
                .into_iter()
                .chain(workload.args)
                .collect(),
                ..workload
            },
            None => workload,
        }
    }

    /// Extracts every configured measurement from a workload's output, stderr first.
    #[must_use]
    pub fn measure(&self, stdout: &str, stderr: &str) -> Vec<Metric> {
        self.measurements
            .iter()
            .flat_map(|measurement| measurement.extract(stderr.lines().chain(stdout.lines())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn toolchain(jobs: usize) -> ToolchainConfig {
        Settings {
            llvm_install_dir: Some(PathBuf::from("/opt/llvm")),
            likwid_install_dir: Some(PathBuf::from("/opt/likwid")),
            parallel_job_count: Some(jobs),
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn raw_is_plain_optimization() {
        let experiment = Experiment::from_kind(ExperimentKind::Raw, &toolchain(2));

        assert_eq!(experiment.name, "raw");
        assert_eq!(experiment.cflags, vec!["-O3"]);
        assert_eq!(experiment.ldflags, vec!["-L/opt/llvm/lib", "-L/opt/likwid/lib"]);
        assert_eq!(experiment.job_counts(), vec![2]);
    }

    #[test]
    fn openmp_loads_polyjit_and_links_gomp() {
        let experiment = Experiment::from_kind(ExperimentKind::PollyOpenmp, &toolchain(2));

        assert!(experiment
            .cflags
            .windows(2)
            .any(|pair| pair == ["-Xclang", "/opt/llvm/lib/LLVMPolyJIT.so"]));
        assert!(experiment.cflags.contains(&"-polly-parallel".to_string()));
        assert!(!experiment
            .cflags
            .contains(&"-polly-vectorizer=stripmine".to_string()));
        assert_eq!(experiment.ldflags.last().map(String::as_str), Some("-lgomp"));
    }

    #[test]
    fn vectorizer_sweeps_every_job_count() {
        let experiment = Experiment::from_kind(ExperimentKind::PollyOpenmpVect, &toolchain(3));

        assert!(experiment
            .cflags
            .windows(2)
            .any(|pair| pair == ["-Xclang", "/opt/llvm/lib/LLVMPolly.so"]));
        assert!(experiment
            .cflags
            .contains(&"-polly-vectorizer=stripmine".to_string()));
        assert_eq!(experiment.job_counts(), vec![1, 2, 3]);
    }

    #[test]
    fn papi_instruments_and_links_the_runtime() {
        let experiment = Experiment::from_kind(ExperimentKind::Papi, &toolchain(2));

        assert!(experiment.cflags.contains(&"-instrument".to_string()));
        assert!(experiment.cflags.contains(&"-no-recompilation".to_string()));
        assert!(experiment
            .ldflags
            .ends_with(&words(&["-lpjit", "-lpprof", "-lpapi"])));
        assert_eq!(
            experiment.counter_tool,
            Some(CounterTool {
                program: PathBuf::from("/opt/likwid/bin/likwid-perfctr"),
                group: DEFAULT_COUNTER_GROUP.to_string(),
            })
        );
    }

    #[test]
    fn papi_without_likwid_has_no_counter_tool() {
        let toolchain = Settings {
            llvm_install_dir: Some(PathBuf::from("/opt/llvm")),
            parallel_job_count: Some(1),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        let experiment = Experiment::from_kind(ExperimentKind::Papi, &toolchain);

        assert_eq!(experiment.counter_tool, None);
        assert_eq!(experiment.measurements.len(), 2);
    }

    #[test]
    fn counter_tool_runs_inside_time() {
        let experiment = Experiment::from_kind(ExperimentKind::Papi, &toolchain(4));

        let wrapped = experiment.wrap(Command::new("./lulesh2.0").args(["-s", "30"]), 3);

        assert_eq!(wrapped.program, PathBuf::from("/usr/bin/time"));
        assert_eq!(
            wrapped.args,
            vec![
                "-f",
                "PPROF-POLLY: %U-%S-%e",
                "/opt/likwid/bin/likwid-perfctr",
                "-C",
                "0-2",
                "-g",
                "CLOCK",
                "./lulesh2.0",
                "-s",
                "30",
            ]
        );
        assert_eq!(wrapped.env.get("OMP_NUM_THREADS").map(String::as_str), Some("3"));
    }

    #[test]
    fn measure_reads_timing_and_counters_of_one_run() {
        let experiment = Experiment::from_kind(ExperimentKind::Papi, &toolchain(1));

        let metrics = experiment.measure(
            "PPROF-COUNTERS: 1200000000-800000000-4096\n",
            "Group 1: CLOCK\nPPROF-POLLY: 1.25-0.05-1.31\n",
        );

        assert_eq!(
            metrics,
            vec![
                Metric::new("time.user_s", 1.25),
                Metric::new("time.system_s", 0.05),
                Metric::new("time.real_s", 1.31),
                Metric::new("papi.total_ns", 1_200_000_000.0),
                Metric::new("papi.scop_ns", 800_000_000.0),
                Metric::new("papi.calls", 4096.0),
            ]
        );
    }

    #[test]
    fn wrap_runs_workload_under_time() {
        let experiment = Experiment::from_kind(ExperimentKind::Raw, &toolchain(1));
        let workload = Command::new("./linpack")
            .arg("200")
            .current_dir("/build")
            .stdin_file("input");

        let wrapped = experiment.wrap(workload, 4);

        assert_eq!(wrapped.program, PathBuf::from("/usr/bin/time"));
        assert_eq!(wrapped.args, vec!["-f", "PPROF-POLLY: %U-%S-%e", "./linpack", "200"]);
        assert_eq!(wrapped.cwd, Some(PathBuf::from("/build")));
        assert_eq!(wrapped.stdin, Some(PathBuf::from("input")));
        assert_eq!(wrapped.env.get("OMP_NUM_THREADS").map(String::as_str), Some("4"));
        assert_eq!(
            wrapped.env.get("LD_LIBRARY_PATH").map(String::as_str),
            Some("/opt/llvm/lib:/opt/likwid/lib")
        );
    }

    #[test]
    fn wrap_without_timer_keeps_workload() {
        let experiment = Experiment::new("bare");
        let wrapped = experiment.wrap(Command::new("true").env("OMP_NUM_THREADS", "7"), 2);

        assert_eq!(wrapped.program, PathBuf::from("true"));
        // The workload's own environment wins.
        assert_eq!(wrapped.env.get("OMP_NUM_THREADS").map(String::as_str), Some("7"));
    }

    #[test]
    fn measure_names_every_field() {
        let experiment = Experiment::new("bare");

        let metrics = experiment.measure(
            "PPROF-POLLY: 9-9-9\n",
            "noise\nPPROF-POLLY: 0.500000-0.010000-0.520000\n",
        );

        assert_eq!(
            metrics,
            vec![
                Metric::new("time.user_s", 0.5),
                Metric::new("time.system_s", 0.01),
                Metric::new("time.real_s", 0.52),
                Metric::new("time.user_s", 9.0),
                Metric::new("time.system_s", 9.0),
                Metric::new("time.real_s", 9.0),
            ]
        );
    }
}
