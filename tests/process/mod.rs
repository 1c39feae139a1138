use crate::Captured;
use houdini::{HoudiniError, ProcessLauncher, ProcessSignal, ProcessSpec, ProcessState, TtySpec, WindowSize};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::new("/bin/sh").arg("-c").arg(script)
}

fn launcher() -> ProcessLauncher {
    ProcessLauncher::new().expect("Failed to create launcher")
}

#[test]
fn test_exact_output_bytes() {
    let out = Captured::default();
    let err = Captured::default();

    let (handle, _stdin) = launcher()
        .spawn(
            &sh("printf 'out1\\n'; printf 'err1' >&2; printf 'out2\\n'"),
            out.sink(),
            err.sink(),
        )
        .expect("Failed to spawn");

    let (status, totals) = handle.wait_with_output().expect("Failed to wait");
    assert!(status.success());
    assert_eq!(out.contents(), "out1\nout2\n");
    assert_eq!(err.contents(), "err1");
    assert_eq!(totals.stdout, 10);
    assert_eq!(totals.stderr, 4);
}

#[test]
fn test_exit_code_is_reported() {
    let (handle, _stdin) = launcher()
        .spawn(&sh("exit 42"), Captured::default().sink(), Captured::default().sink())
        .unwrap();

    let status = handle.wait().expect("Wait should succeed");
    assert_eq!(status.code, 42);
    assert_eq!(status.signal, None);

    // A second wait returns the cached outcome
    assert_eq!(handle.wait().unwrap().code, 42);
    assert!(matches!(handle.state(), ProcessState::Exited(_)));
}

#[test]
fn test_resource_usage_collected() {
    let (handle, _stdin) = launcher()
        .spawn(&sh("true"), Captured::default().sink(), Captured::default().sink())
        .unwrap();

    let usage = handle.wait().unwrap().usage.expect("Usage should be collected");
    assert!(usage.max_rss.is_some());
}

#[test]
fn test_signal_reaches_grandchild() {
    let out = Captured::default();
    let (handle, _stdin) = launcher()
        .spawn(
            &sh("sleep 1000 & echo ready; wait"),
            out.sink(),
            Captured::default().sink(),
        )
        .unwrap();

    assert!(out.wait_for("ready", Duration::from_secs(10)), "Shell never started its child");

    handle.signal(ProcessSignal::Terminate).expect("Signal should succeed");
    let status = handle.wait().unwrap();
    assert_eq!(status.signal, Some(libc::SIGTERM));
    assert_eq!(status.code, 128 + libc::SIGTERM);

    // The backgrounded sleep shares the stdout pipe; EOF means it is gone too
    handle.wait_for_output().expect("Relay should drain once the group is dead");
}

#[test]
fn test_signal_after_exit_is_harmless() {
    let (handle, _stdin) = launcher()
        .spawn(&sh("exit 0"), Captured::default().sink(), Captured::default().sink())
        .unwrap();
    handle.wait().unwrap();

    assert!(handle.signal(ProcessSignal::Kill).is_ok());
}

#[test]
fn test_killed_by_signal() {
    let (handle, _stdin) = launcher()
        .spawn(&sh("kill -KILL $$"), Captured::default().sink(), Captured::default().sink())
        .unwrap();

    let status = handle.wait().unwrap();
    assert_eq!(status.code, 137);
    assert_eq!(status.signal, Some(libc::SIGKILL));
    assert!(!status.success());
}

#[test]
fn test_concurrent_processes_keep_output_apart() {
    let launcher = Arc::new(launcher());
    let workers: Vec<_> = (1..=8)
        .map(|i| {
            let launcher = Arc::clone(&launcher);
            thread::spawn(move || {
                let out = Captured::default();
                let spec = sh("printf 'proc-%s' \"$1\"; exit \"$1\"").arg("sh").arg(i.to_string());
                let (handle, _stdin) = launcher
                    .spawn(&spec, out.sink(), Captured::default().sink())
                    .unwrap();
                let (status, _) = handle.wait_with_output().unwrap();
                (i, status.code, out.contents())
            })
        })
        .collect();

    for worker in workers {
        let (i, code, output) = worker.join().unwrap();
        assert_eq!(code, i);
        assert_eq!(output, format!("proc-{}", i));
    }
}

#[test]
fn test_stdin_is_forwarded() {
    let out = Captured::default();
    let (handle, mut stdin) = launcher()
        .spawn(&ProcessSpec::new("cat"), out.sink(), Captured::default().sink())
        .unwrap();

    stdin.write_all(b"hello through the pipe\n").unwrap();
    stdin.close();

    let (status, _) = handle.wait_with_output().unwrap();
    assert!(status.success());
    assert_eq!(out.contents(), "hello through the pipe\n");
}

#[test]
fn test_explicit_env_replaces_inherited() {
    let out = Captured::default();
    let spec = sh("printf '%s|%s' \"$GREETING\" \"$HOME\"")
        .env("GREETING", "hi")
        .env("PATH", "/usr/bin:/bin");

    let (handle, _stdin) = launcher().spawn(&spec, out.sink(), Captured::default().sink()).unwrap();
    handle.wait_with_output().unwrap();
    assert_eq!(out.contents(), "hi|");
}

#[test]
fn test_dir_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let out = Captured::default();
    let spec = sh("pwd -P").dir(dir.path());

    let (handle, _stdin) = launcher().spawn(&spec, out.sink(), Captured::default().sink()).unwrap();
    handle.wait_with_output().unwrap();

    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(out.contents().trim_end(), expected.to_string_lossy());
}

#[test]
fn test_relative_executable_resolves_against_dir() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("hello.sh");
    std::fs::write(&script, "#!/bin/sh\nprintf local\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let out = Captured::default();
    let spec = ProcessSpec::new("./hello.sh").dir(dir.path());
    let (handle, _stdin) = launcher().spawn(&spec, out.sink(), Captured::default().sink()).unwrap();
    handle.wait_with_output().unwrap();
    assert_eq!(out.contents(), "local");
}

#[test]
fn test_relative_dir_with_relative_executable() {
    use std::os::unix::fs::PermissionsExt;

    let cwd = std::env::current_dir().unwrap();
    let dir = tempfile::Builder::new().prefix("spawn-rel").tempdir_in(&cwd).unwrap();
    let script = dir.path().join("hello.sh");
    std::fs::write(&script, "#!/bin/sh\nprintf '%s' \"$(pwd -P)\"\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let relative_dir = std::path::Path::new(dir.path().file_name().unwrap());

    let out = Captured::default();
    let spec = ProcessSpec::new("./hello.sh").dir(relative_dir);
    let (handle, _stdin) = launcher().spawn(&spec, out.sink(), Captured::default().sink()).unwrap();
    let (status, _) = handle.wait_with_output().unwrap();

    assert!(status.success());
    assert_eq!(out.contents(), dir.path().canonicalize().unwrap().to_string_lossy());
}

#[test]
fn test_missing_executable() {
    let result = launcher().spawn(
        &ProcessSpec::new("houdini-no-such-binary"),
        Captured::default().sink(),
        Captured::default().sink(),
    );
    assert!(matches!(result, Err(HoudiniError::Lookup { .. })));
}

#[test]
fn test_tty_mode() {
    let out = Captured::default();
    let spec = sh("test -t 0 && test -t 1 && echo is-a-tty; stty size").tty(TtySpec {
        window_size: Some(WindowSize { columns: 100, rows: 30 }),
    });

    let (handle, _stdin) = launcher().spawn(&spec, out.sink(), Captured::default().sink()).unwrap();
    let (status, _) = handle.wait_with_output().unwrap();
    assert!(status.success());

    let output = out.contents();
    assert!(output.contains("is-a-tty"), "Output was: {:?}", output);
    assert!(output.contains("30 100"), "Output was: {:?}", output);
}

#[test]
fn test_tty_resize() {
    let out = Captured::default();
    let spec = sh("read _; stty size").tty(TtySpec::default());

    let (handle, mut stdin) = launcher().spawn(&spec, out.sink(), Captured::default().sink()).unwrap();
    handle
        .set_window_size(WindowSize { columns: 132, rows: 43 })
        .expect("Resize should succeed");
    stdin.write_all(b"go\n").unwrap();

    handle.wait_with_output().unwrap();
    assert!(out.contents().contains("43 132"), "Output was: {:?}", out.contents());
}

#[test]
fn test_tty_close_ends_input() {
    let out = Captured::default();
    let spec = ProcessSpec::new("cat").tty(TtySpec::default());

    let (handle, mut stdin) = launcher().spawn(&spec, out.sink(), Captured::default().sink()).unwrap();
    stdin.write_all(b"unterminated").unwrap();
    stdin.close();

    let (status, _) = handle.wait_with_output().unwrap();
    assert!(status.success());
    assert!(out.contents().contains("unterminated"), "Output was: {:?}", out.contents());
}
