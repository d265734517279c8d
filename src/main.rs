use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use polly_bench::{
    config::Settings,
    projects::{self, Project},
    report::HostInfo,
    Experiment, ExperimentKind, Pipeline, Store,
};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Experiment to run
    #[arg(short, long, value_enum)]
    experiment: ExperimentKind,

    /// Path to a directory containing project manifests
    #[arg(short, long, default_value = "projects")]
    projects: PathBuf,

    /// Only run the named project; may be repeated
    #[arg(long = "project")]
    only: Vec<String>,

    /// Maximum number of parallel jobs [default: number of CPUs]
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Root of the LLVM installation providing clang and Polly
    #[arg(long, env = "POLLY_BENCH_LLVM_DIR")]
    llvm_dir: Option<PathBuf>,

    /// Root of the likwid installation
    #[arg(long, env = "POLLY_BENCH_LIKWID_DIR")]
    likwid_dir: Option<PathBuf>,

    /// Directory under which projects are built [default: build]
    #[arg(long)]
    build_dir: Option<PathBuf>,

    /// Path of the results database [default: results/polly-bench.sqlite]
    #[arg(long)]
    database: Option<PathBuf>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a directory to write the sweep report in
    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Wipe build directories before building
    #[arg(long)]
    clean: bool,

    /// Include information about this machine in the sweep report
    #[arg(long)]
    collect_sysinfo: bool,

    /// List the discovered projects and exit
    #[arg(long)]
    list: bool,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            llvm_install_dir: self.llvm_dir.clone(),
            likwid_install_dir: self.likwid_dir.clone(),
            parallel_job_count: self.jobs,
            build_root: self.build_dir.clone(),
            database: self.database.clone(),
            time_program: None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic::setup_panic!();
    env_logger::init();

    let args = Args::parse();

    let mut projects = projects::find_all(
        &args
            .projects
            .canonicalize()
            .context(format!("could not find projects directory {}", args.projects.display()))?,
    )?;
    if !args.only.is_empty() {
        for name in &args.only {
            if !projects.iter().any(|project| project.name() == name) {
                anyhow::bail!("no project named {name}");
            }
        }
        projects.retain(|project| args.only.iter().any(|name| name == project.name()));
    }

    if args.list {
        for project in &projects {
            println!("{}\t{}", project.name(), project.domain());
        }
        return Ok(());
    }

    let file_settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    let toolchain = file_settings
        .merge(args.settings())
        .resolve()
        .context("could not configure the toolchain")?;
    toolchain.validate()?;
    log::info!(
        "using LLVM from {} with up to {} jobs",
        toolchain.llvm_install_dir.display(),
        toolchain.parallel_job_count
    );

    let store = Store::open(&toolchain.database).context(format!(
        "could not open results database {}",
        toolchain.database.display()
    ))?;
    let experiment = Experiment::from_kind(args.experiment, &toolchain);
    let projects: Vec<Box<dyn Project>> = projects
        .into_iter()
        .map(|project| Box::new(project) as Box<dyn Project>)
        .collect();

    let mut report = Pipeline::new(&toolchain, &experiment, &store)
        .clean(args.clean)
        .execute(&projects)
        .await
        .map_err(|err| {
            log::error!("{err}");
            err
        })?;
    if args.collect_sysinfo {
        report.host = Some(HostInfo::collect());
    }

    report.write(&args.output).context(format!(
        "could not write sweep report to {}",
        args.output.display()
    ))?;

    Ok(())
}
