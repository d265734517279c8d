use std::path::{Path, PathBuf};

use polly_bench::projects::{find_all, BuildContext, Project};

#[test]
fn bundled_manifests_are_valid() {
    let projects = find_all(Path::new("projects")).unwrap();

    assert_eq!(
        projects
            .iter()
            .map(|project| project.name())
            .collect::<Vec<_>>(),
        vec!["leveldb", "libressl", "linpack", "lulesh"]
    );

    let ctx = BuildContext {
        build_dir: PathBuf::from("/build"),
        cc: PathBuf::from("/opt/llvm/bin/clang"),
        cxx: PathBuf::from("/opt/llvm/bin/clang++"),
        cflags: vec!["-O3".to_string()],
        ldflags: vec!["-lgomp".to_string()],
        jobs: 2,
    };
    for project in &projects {
        assert!(!project.download(&ctx).unwrap().is_empty(), "{}", project.name());
        assert!(!project.build(&ctx).unwrap().is_empty(), "{}", project.name());
        assert!(!project.run_tests(&ctx).unwrap().is_empty(), "{}", project.name());
    }
}

#[test]
fn linpack_reads_its_input_from_the_manifest_directory() {
    let projects = find_all(Path::new("projects")).unwrap();
    let linpack = projects
        .iter()
        .find(|project| project.name() == "linpack")
        .unwrap();

    let ctx = BuildContext {
        build_dir: PathBuf::from("/build"),
        cc: PathBuf::from("clang"),
        cxx: PathBuf::from("clang++"),
        cflags: Vec::new(),
        ldflags: Vec::new(),
        jobs: 1,
    };
    let workloads = linpack.run_tests(&ctx).unwrap();

    assert!(workloads[0].stdin.as_ref().unwrap().exists());
}
