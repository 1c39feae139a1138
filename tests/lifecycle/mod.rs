use crate::{test_depot, Captured};
use houdini::{Container, ContainerSpec, ProcessLauncher, ProcessSpec, ProcessState};
use std::sync::Arc;

fn launcher() -> Arc<ProcessLauncher> {
    Arc::new(ProcessLauncher::new().expect("Failed to create launcher"))
}

fn container(depot: &std::path::Path, env: &[&str]) -> Container {
    let spec = ContainerSpec {
        handle: String::new(),
        bind_mounts: Vec::new(),
        env: env.iter().map(|s| s.to_string()).collect(),
    };
    Container::create(depot, spec, launcher()).expect("Failed to create container")
}

#[test]
fn test_process_runs_in_work_dir() {
    let depot = test_depot();
    let container = container(depot.path(), &[]);

    let out = Captured::default();
    let (handle, _stdin) = container
        .run(
            ProcessSpec::new("/bin/sh").arg("-c").arg("pwd -P"),
            out.sink(),
            Captured::default().sink(),
        )
        .unwrap();
    handle.wait_with_output().unwrap();

    assert_eq!(
        out.contents().trim_end(),
        container.work_dir().canonicalize().unwrap().to_string_lossy()
    );
    container.destroy().unwrap();
}

#[test]
fn test_relative_dir_joins_work_dir() {
    let depot = test_depot();
    let container = container(depot.path(), &[]);
    std::fs::create_dir(container.work_dir().join("sub")).unwrap();

    let out = Captured::default();
    let (handle, _stdin) = container
        .run(
            ProcessSpec::new("/bin/sh").arg("-c").arg("pwd -P").dir("sub"),
            out.sink(),
            Captured::default().sink(),
        )
        .unwrap();
    handle.wait_with_output().unwrap();

    assert!(out.contents().trim_end().ends_with("/sub"));
    container.destroy().unwrap();
}

#[test]
fn test_process_env_overrides_container_env() {
    let depot = test_depot();
    let container = container(depot.path(), &["GREETING=hello", "TARGET=world"]);

    let out = Captured::default();
    let spec = ProcessSpec::new("/bin/sh")
        .arg("-c")
        .arg("printf '%s %s' \"$GREETING\" \"$TARGET\"")
        .env("TARGET", "houdini");
    let (handle, _stdin) = container.run(spec, out.sink(), Captured::default().sink()).unwrap();
    handle.wait_with_output().unwrap();

    assert_eq!(out.contents(), "hello houdini");
    container.destroy().unwrap();
}

#[test]
fn test_destroy_kills_running_processes() {
    let depot = test_depot();
    let container = container(depot.path(), &[]);
    let work_dir = container.work_dir().to_path_buf();

    let (handle, _stdin) = container
        .run(
            ProcessSpec::new("sleep").arg("1000"),
            Captured::default().sink(),
            Captured::default().sink(),
        )
        .unwrap();
    assert_eq!(container.process_count(), 1);

    let report = container.destroy().unwrap();
    assert!(report.is_clean());
    assert!(!work_dir.exists());

    match handle.state() {
        ProcessState::Exited(status) => assert_eq!(status.signal, Some(libc::SIGKILL)),
        other => panic!("Process should have been reaped, got {:?}", other),
    }
}

#[test]
fn test_reaped_processes_are_no_longer_tracked() {
    let depot = test_depot();
    let container = container(depot.path(), &[]);

    let (finished, _stdin) = container
        .run(ProcessSpec::new("true"), Captured::default().sink(), Captured::default().sink())
        .unwrap();
    assert!(finished.wait().unwrap().success());
    assert_eq!(container.process_count(), 0);

    let (running, _stdin) = container
        .run(
            ProcessSpec::new("sleep").arg("1000"),
            Captured::default().sink(),
            Captured::default().sink(),
        )
        .unwrap();
    assert_eq!(container.process_count(), 1);

    container.destroy().unwrap();

    // Only the live process was killed; the reaped one keeps its own outcome
    match finished.state() {
        ProcessState::Exited(status) => assert_eq!(status.code, 0),
        other => panic!("Unexpected state {:?}", other),
    }
    match running.state() {
        ProcessState::Exited(status) => assert_eq!(status.signal, Some(libc::SIGKILL)),
        other => panic!("Unexpected state {:?}", other),
    }
}

#[test]
fn test_keep_work_dir() {
    let depot = test_depot();
    let mut container = container(depot.path(), &[]);
    container.set_keep_work_dir(true);
    let work_dir = container.work_dir().to_path_buf();

    container.destroy().unwrap();
    assert!(work_dir.is_dir());
}
