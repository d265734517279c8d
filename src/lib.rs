//! Benchmark harness for measuring the effect of Polly's polyhedral optimizations on real-world projects.
//!
//! polly-bench takes a set of open-source projects (scientific kernels, databases, cryptography libraries, ...) and,
//! for an experiment such as "Polly with OpenMP code generation", downloads each project, builds it with the
//! experiment's compiler flags, runs its workloads under a timing wrapper, and records the measured times in a SQLite
//! database for later analysis.
//!
//! # Suite
//! Projects are described by JSON manifests (`*.project.json`) that can be found in the `projects` directory of the
//! repository, but the harness works with any directory of manifests, or with custom implementations of the
//! [`Project`] trait when used as a library.
//!
//! # Usage
//! polly-bench is primarily designed to be used as an executable:
//! ```console
//! $ polly-bench --help
//! Benchmark harness measuring Polly's polyhedral optimizations on real-world projects.
//!
//! Usage: polly-bench [OPTIONS] --experiment <EXPERIMENT>
//!
//! Options:
//!   -e, --experiment <EXPERIMENT>  Experiment to run [possible values: raw, polly, polly-openmp, polly-openmpvect, papi]
//!   -p, --projects <PROJECTS>      Path to a directory containing project manifests [default: projects]
//!       --project <PROJECT>        Only run the named project; may be repeated
//!   -j, --jobs <JOBS>              Maximum number of parallel jobs [default: number of CPUs]
//!       --llvm-dir <LLVM_DIR>      Root of the LLVM installation providing clang and Polly
//!       --likwid-dir <LIKWID_DIR>  Root of the likwid installation
//!       --build-dir <BUILD_DIR>    Directory under which projects are built [default: build]
//!       --database <DATABASE>      Path of the results database [default: results/polly-bench.sqlite]
//!   -c, --config <CONFIG>          Path to a JSON config file
//!   -o, --output <OUTPUT>          Path to a directory to write the sweep report in [default: results]
//!       --clean                    Wipe build directories before building
//!       --collect-sysinfo          Include information about this machine in the sweep report
//!       --list                     List the discovered projects and exit
//!   -h, --help                     Print help
//!   -V, --version                  Print version
//! ```
//!
//! ## As a library
//! ```no_run
//! use std::path::PathBuf;
//!
//! use polly_bench::{config::Settings, Experiment, ExperimentKind, Pipeline, Project, Store};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let toolchain = Settings {
//!     llvm_install_dir: Some(PathBuf::from("/opt/llvm")),
//!     ..Default::default()
//! }
//! .resolve()?;
//! let store = Store::open(&toolchain.database)?;
//! let experiment = Experiment::from_kind(ExperimentKind::Polly, &toolchain);
//!
//! let projects: Vec<Box<dyn Project>> = polly_bench::projects::find_all(&PathBuf::from("projects"))?
//!     .into_iter()
//!     .map(|project| Box::new(project) as Box<dyn Project>)
//!     .collect();
//! let report = Pipeline::new(&toolchain, &experiment, &store)
//!     .execute(&projects)
//!     .await?;
//! #     Ok(())
//! # }
//! ```
//!
//! # Results
//! Every measured workload execution is a run in the `runs` table, grouped by the trial it belongs to, with its
//! measurements in the `metrics` table. Runs that produced no measurements are not recorded; they only show up in
//! the sweep report as degraded.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

pub mod config;
pub mod exec;
pub mod experiments;
pub mod parse;
pub mod pipeline;
pub mod projects;
pub mod report;
pub mod stage;
pub mod store;

pub use experiments::{Experiment, ExperimentKind};
pub use pipeline::{Pipeline, PipelineError, RunOutcome};
pub use projects::Project;
pub use report::SweepReport;
pub use store::Store;
