use std::path::{Path, PathBuf};

use polly_bench::{
    config::{Settings, ToolchainConfig},
    exec::Command,
    experiments::{Experiment, ExperimentKind, Trials, TIMING_METRICS},
    pipeline::{Pipeline, PipelineError, RunStatus},
    projects::{BuildContext, Project, ProjectError},
    report::EntryStatus,
    stage::StageEvent,
    store::{
        metrics::{self, Metric},
        runs, Store,
    },
};

fn sh(script: &str) -> Command {
    Command::new("sh").arg("-c").arg(script)
}

/// A project whose hooks run fixed shell scripts.
#[derive(Default)]
struct Scripted {
    name: &'static str,
    download: Vec<&'static str>,
    build: Vec<&'static str>,
    run: Vec<&'static str>,
}

impl Scripted {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    fn with_download(mut self, script: &'static str) -> Self {
        self.download.push(script);
        self
    }

    fn with_build(mut self, script: &'static str) -> Self {
        self.build.push(script);
        self
    }

    fn with_run(mut self, script: &'static str) -> Self {
        self.run.push(script);
        self
    }
}

fn commands(scripts: &[&str]) -> Result<Vec<Command>, ProjectError> {
    Ok(scripts.iter().map(|script| sh(script)).collect())
}

impl Project for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn domain(&self) -> &str {
        "test"
    }

    fn download(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        commands(&self.download)
    }

    fn build(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        commands(&self.build)
    }

    fn run_tests(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
        commands(&self.run)
    }
}

fn toolchain(build_root: &Path) -> ToolchainConfig {
    Settings {
        llvm_install_dir: Some(PathBuf::from("/nonexistent/llvm")),
        parallel_job_count: Some(3),
        build_root: Some(build_root.to_path_buf()),
        ..Default::default()
    }
    .resolve()
    .unwrap()
}

const TIMING_LINE: &str = "echo 'PPROF-POLLY: 0.500000-0.010000-0.520000' >&2";

#[tokio::test]
async fn tagged_timing_line_is_recorded_as_one_run() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("polly");
    let store = Store::open_in_memory().unwrap();
    let projects: Vec<Box<dyn Project>> =
        vec![Box::new(Scripted::new("linpack").with_run(TIMING_LINE))];

    let report = Pipeline::new(&toolchain, &experiment, &store)
        .execute(&projects)
        .await
        .unwrap();

    let entry = report.entry("linpack").unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);
    assert_eq!(entry.runs.len(), 1);
    assert_eq!(entry.runs[0].status, RunStatus::Submitted);

    let recorded = runs::list(&store).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].project, "linpack");
    assert_eq!(recorded[0].experiment, "polly");
    assert_eq!(Some(recorded[0].id), entry.runs[0].run_id);
    assert_eq!(
        metrics::for_run(&store, recorded[0].id).await.unwrap(),
        vec![
            Metric::new("time.user_s", 0.5),
            Metric::new("time.system_s", 0.01),
            Metric::new("time.real_s", 0.52),
        ]
    );
}

#[tokio::test]
async fn output_without_tagged_lines_is_degraded_not_failed() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("polly");
    let store = Store::open_in_memory().unwrap();
    let projects: Vec<Box<dyn Project>> = vec![Box::new(
        Scripted::new("leveldb").with_run("echo 'fillseq : 1.2 micros/op'"),
    )];

    let report = Pipeline::new(&toolchain, &experiment, &store)
        .execute(&projects)
        .await
        .unwrap();

    let entry = report.entry("leveldb").unwrap();
    assert_eq!(entry.status, EntryStatus::Degraded);
    assert_eq!(entry.runs[0].status, RunStatus::Degraded);
    assert_eq!(entry.runs[0].run_id, None);
    assert!(entry.runs[0].metrics.is_empty());
    assert!(runs::list(&store).await.unwrap().is_empty());
}

#[tokio::test]
async fn build_failure_only_abandons_its_project() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("polly");
    let store = Store::open_in_memory().unwrap();
    let projects: Vec<Box<dyn Project>> = vec![
        Box::new(
            Scripted::new("libressl")
                .with_build("echo 'error: unknown flag' >&2; exit 2")
                .with_run(TIMING_LINE),
        ),
        Box::new(Scripted::new("lulesh").with_run(TIMING_LINE)),
    ];

    let report = Pipeline::new(&toolchain, &experiment, &store)
        .execute(&projects)
        .await
        .unwrap();

    match &report.entry("libressl").unwrap().status {
        EntryStatus::Failed { kind, error } => {
            assert_eq!(kind, "build_failure");
            assert!(error.contains("exit 2"), "{error}");
            assert!(error.contains("code 2"), "{error}");
        }
        status => panic!("unexpected status {status:?}"),
    }
    assert_eq!(report.entry("lulesh").unwrap().status, EntryStatus::Completed);

    let recorded = runs::list(&store).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].project, "lulesh");
}

#[tokio::test]
async fn download_failure_is_an_acquisition_failure() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("raw");
    let store = Store::open_in_memory().unwrap();
    let project = Scripted::new("linpack")
        .with_download("exit 22")
        .with_run("touch ran; echo 'PPROF-POLLY: 1-1-1' >&2");

    let result = Pipeline::new(&toolchain, &experiment, &store)
        .execute_single(&project)
        .await;

    assert!(matches!(result, Err(PipelineError::Acquisition(_))));
    assert!(!dir.path().join("raw/linpack/ran").exists());
    assert!(runs::list(&store).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_workload_binary_is_an_execution_failure() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("raw");
    let store = Store::open_in_memory().unwrap();

    struct Missing;
    impl Project for Missing {
        fn name(&self) -> &str {
            "missing"
        }
        fn domain(&self) -> &str {
            "test"
        }
        fn run_tests(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
            Ok(vec![Command::new("polly-bench-no-such-binary")])
        }
    }

    let result = Pipeline::new(&toolchain, &experiment, &store)
        .execute_single(&Missing)
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), "execution_failure");
}

#[tokio::test]
async fn crashing_workload_keeps_its_timings() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("raw");
    let store = Store::open_in_memory().unwrap();
    let project =
        Scripted::new("lulesh").with_run("echo 'PPROF-POLLY: 2-0.5-2.6' >&2; exit 139");

    let outcome = Pipeline::new(&toolchain, &experiment, &store)
        .execute_single(&project)
        .await
        .unwrap();

    assert!(!outcome.is_degraded());
    assert_eq!(outcome.runs[0].exit_code, Some(139));
    assert_eq!(outcome.runs[0].status, RunStatus::Submitted);
    assert_eq!(runs::list(&store).await.unwrap().len(), 1);
}

#[tokio::test]
async fn every_job_count_gets_its_own_trial() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment {
        trials: Trials::PerJobCount,
        jobs: 3,
        ..Experiment::new("polly-openmpvect")
    };
    let store = Store::open_in_memory().unwrap();
    let project = Scripted::new("linpack")
        .with_build("touch built")
        .with_run("test -f built && echo \"PPROF-POLLY: $OMP_NUM_THREADS-0-0\" >&2");

    let outcome = Pipeline::new(&toolchain, &experiment, &store)
        .execute_single(&project)
        .await
        .unwrap();

    assert_eq!(outcome.runs.len(), 3);
    assert_eq!(
        outcome.runs.iter().map(|run| run.jobs).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    for run in &outcome.runs {
        let recorded = runs::in_group(&store, run.run_group).await.unwrap();
        assert_eq!(recorded.len(), 1);
        let metrics = metrics::for_run(&store, recorded[0].id).await.unwrap();
        assert_eq!(metrics[0], Metric::new("time.user_s", run.jobs as f64));
    }
    let mut groups: Vec<_> = outcome.runs.iter().map(|run| run.run_group).collect();
    groups.dedup();
    assert_eq!(groups.len(), 3);
}

#[tokio::test]
async fn projects_get_separate_build_directories() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("polly");
    let store = Store::open_in_memory().unwrap();
    let projects: Vec<Box<dyn Project>> = vec![
        Box::new(Scripted::new("a").with_build("pwd > where")),
        Box::new(Scripted::new("b").with_build("pwd > where")),
    ];

    Pipeline::new(&toolchain, &experiment, &store)
        .execute(&projects)
        .await
        .unwrap();

    assert!(dir.path().join("polly/a/where").exists());
    assert!(dir.path().join("polly/b/where").exists());
}

#[tokio::test]
async fn clean_wipes_previous_build_output() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("polly");
    let store = Store::open_in_memory().unwrap();
    let stale = dir.path().join("polly/linpack/stale.o");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "").unwrap();

    Pipeline::new(&toolchain, &experiment, &store)
        .clean(true)
        .execute_single(&Scripted::new("linpack"))
        .await
        .unwrap();

    assert!(!stale.exists());
    assert!(stale.parent().unwrap().exists());
}

#[tokio::test]
async fn stages_balance_for_every_project() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("polly");
    let store = Store::open_in_memory().unwrap();
    let projects: Vec<Box<dyn Project>> = vec![
        Box::new(Scripted::new("fails").with_download("exit 1")),
        Box::new(Scripted::new("degraded").with_run("true")),
        Box::new(Scripted::new("completes").with_run(TIMING_LINE).with_run(TIMING_LINE)),
    ];

    let pipeline = Pipeline::new(&toolchain, &experiment, &store);
    let report = pipeline.execute(&projects).await.unwrap();

    assert_eq!(pipeline.tracker().depth(), 0);
    for entry in &report.entries {
        let entered = entry
            .stages
            .iter()
            .filter(|event| matches!(event, StageEvent::Entered { .. }))
            .count();
        assert!(entered > 0);
        assert_eq!(entered * 2, entry.stages.len(), "{}", entry.project);
    }
    match &report.entries[2].stages[0] {
        StageEvent::Entered { path } => assert_eq!(path, "polly: completes"),
        event => panic!("unexpected event {event:?}"),
    }
}

#[tokio::test]
async fn storage_failure_aborts_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("polly");
    let database = dir.path().join("results.sqlite");
    let store = Store::open(&database).unwrap();
    rusqlite::Connection::open(&database)
        .unwrap()
        .execute_batch("DROP TABLE metrics; DROP TABLE runs;")
        .unwrap();
    let projects: Vec<Box<dyn Project>> = vec![
        Box::new(Scripted::new("first").with_run(TIMING_LINE)),
        Box::new(Scripted::new("second").with_build("touch built").with_run(TIMING_LINE)),
    ];

    let result = Pipeline::new(&toolchain, &experiment, &store)
        .execute(&projects)
        .await;

    assert!(result.is_err());
    assert!(!dir.path().join("polly/second/built").exists());
}

#[tokio::test]
async fn failed_project_reports_the_runs_it_already_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    let experiment = Experiment::new("polly");
    let store = Store::open_in_memory().unwrap();

    struct HalfMissing;
    impl Project for HalfMissing {
        fn name(&self) -> &str {
            "half-missing"
        }
        fn domain(&self) -> &str {
            "test"
        }
        fn run_tests(&self, _ctx: &BuildContext) -> Result<Vec<Command>, ProjectError> {
            Ok(vec![
                sh("echo 'PPROF-POLLY: 1-1-1' >&2"),
                Command::new("polly-bench-no-such-binary"),
            ])
        }
    }
    let projects: Vec<Box<dyn Project>> = vec![Box::new(HalfMissing)];

    let report = Pipeline::new(&toolchain, &experiment, &store)
        .execute(&projects)
        .await
        .unwrap();

    let entry = report.entry("half-missing").unwrap();
    assert!(matches!(
        &entry.status,
        EntryStatus::Failed { kind, .. } if kind == "execution_failure"
    ));
    let recorded = runs::list(&store).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(entry.runs.len(), recorded.len());
    assert_eq!(entry.runs[0].run_id, Some(recorded[0].id));
    assert_eq!(entry.runs[0].status, RunStatus::Submitted);
}

#[tokio::test]
async fn gnu_time_wrapper_is_measured_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = toolchain(dir.path());
    if !toolchain.time_program.exists() {
        eprintln!("{} not found, skipping", toolchain.time_program.display());
        return;
    }
    let experiment = Experiment::from_kind(ExperimentKind::Raw, &toolchain);
    let store = Store::open_in_memory().unwrap();
    // GNU time reports "Command exited with non-zero status 3" before the tagged line.
    let project = Scripted::new("timed")
        .with_run("exit 0")
        .with_run("exit 3");

    let outcome = Pipeline::new(&toolchain, &experiment, &store)
        .execute_single(&project)
        .await
        .unwrap();

    assert_eq!(outcome.runs.len(), 2);
    assert_eq!(outcome.runs[0].exit_code, Some(0));
    assert_eq!(outcome.runs[1].exit_code, Some(3));
    for run in &outcome.runs {
        assert_eq!(run.status, RunStatus::Submitted, "{}", run.command);
        assert!(run
            .command
            .contains(&*toolchain.time_program.to_string_lossy()));

        let metrics = metrics::for_run(&store, run.run_id.unwrap()).await.unwrap();
        assert_eq!(
            metrics
                .iter()
                .map(|metric| metric.name.as_str())
                .collect::<Vec<_>>(),
            TIMING_METRICS
        );
        assert!(metrics.iter().all(|metric| metric.value >= 0.0));
    }
}
