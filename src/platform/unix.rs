/// POSIX process control: every child leads its own process group
use crate::process::{ProcessControl, Spawned};
use crate::types::{ExitStatus, HoudiniError, ProcessSignal, ProcessSpec, ResourceUsage, Result, WindowSize};
use nix::errno::Errno;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{tcgetattr, SpecialCharacterIndices, Termios};
use nix::unistd::Pid;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Process-group control; POSIX needs no per-process setup
#[derive(Debug, Default)]
pub(crate) struct Control;

impl Control {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self)
    }
}

/// A child that leads its own process group
pub struct GroupProcess {
    pid: Pid,
    /// Master side of the child's terminal, kept for resizing
    pty: Option<OwnedFd>,
}

impl ProcessControl for GroupProcess {
    fn id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn signal(&self, signal: ProcessSignal) -> Result<()> {
        // The group outlives its leader while descendants remain
        match killpg(self.pid, to_nix_signal(signal)) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                log::debug!("Process group {} already gone", self.pid);
                Ok(())
            }
            Err(e) => Err(HoudiniError::syscall("killpg", e)),
        }
    }

    fn reap(&self) -> Result<ExitStatus> {
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain old data; all-zero is a valid value
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

        loop {
            // SAFETY: both out-pointers reference live locals
            let rc = unsafe { libc::wait4(self.pid.as_raw(), &mut status, 0, &mut usage) };
            if rc == self.pid.as_raw() {
                break;
            }
            if rc == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(HoudiniError::syscall("wait4", err));
            }
            return Err(HoudiniError::Internal(format!(
                "wait4 for {} returned pid {}",
                self.pid, rc
            )));
        }

        let usage = Some(resource_usage(&usage));
        if libc::WIFEXITED(status) {
            Ok(ExitStatus {
                code: libc::WEXITSTATUS(status),
                signal: None,
                usage,
            })
        } else if libc::WIFSIGNALED(status) {
            let signo = libc::WTERMSIG(status);
            Ok(ExitStatus {
                code: 128 + signo,
                signal: Some(signo),
                usage,
            })
        } else {
            Err(HoudiniError::Internal(format!(
                "unexpected wait status {:#x} for {}",
                status, self.pid
            )))
        }
    }

    fn set_window_size(&self, size: WindowSize) -> Result<()> {
        let Some(pty) = &self.pty else {
            return Ok(());
        };
        let winsize = to_winsize(size);
        // SAFETY: TIOCSWINSZ reads a Winsize from the pointer
        let rc = unsafe { libc::ioctl(pty.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize as *const Winsize) };
        if rc == -1 {
            return Err(HoudiniError::last_os_error("ioctl(TIOCSWINSZ)"));
        }
        Ok(())
    }
}

fn to_nix_signal(signal: ProcessSignal) -> Signal {
    match signal {
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
        ProcessSignal::Interrupt => Signal::SIGINT,
        ProcessSignal::Hangup => Signal::SIGHUP,
        ProcessSignal::Quit => Signal::SIGQUIT,
    }
}

fn to_winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn timeval_to_duration(tv: &libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
}

fn resource_usage(usage: &libc::rusage) -> ResourceUsage {
    // Linux reports ru_maxrss in kilobytes, macOS in bytes
    let max_rss = if cfg!(target_os = "macos") {
        usage.ru_maxrss as u64
    } else {
        usage.ru_maxrss as u64 * 1024
    };
    ResourceUsage {
        user_time: timeval_to_duration(&usage.ru_utime),
        system_time: timeval_to_duration(&usage.ru_stime),
        max_rss: Some(max_rss),
        wall_time: None,
    }
}

/// Pipe with both ends close-on-exec so concurrent spawns never inherit them
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        use nix::fcntl::OFlag;
        nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| HoudiniError::syscall("pipe2", e))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let (read, write) = nix::unistd::pipe().map_err(|e| HoudiniError::syscall("pipe", e))?;
        set_cloexec(&read)?;
        set_cloexec(&write)?;
        Ok((read, write))
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(|_| ())
        .map_err(|e| HoudiniError::syscall("fcntl(FD_CLOEXEC)", e))
}

fn build_command(spec: &ProcessSpec, executable: &Path) -> Command {
    let mut cmd = Command::new(executable);
    cmd.arg0(&spec.path);
    cmd.args(&spec.args);

    if let Some(dir) = &spec.dir {
        cmd.current_dir(dir);
    }

    if let Some(env) = &spec.env {
        cmd.env_clear();
        for entry in env {
            match entry.split_once('=') {
                Some((key, value)) => cmd.env(key, value),
                None => cmd.env(entry, ""),
            };
        }
    }

    cmd
}

/// Create the child with its streams redirected and its own process group
pub(crate) fn spawn(_control: &Control, spec: &ProcessSpec, executable: &Path) -> Result<Spawned> {
    match spec.tty {
        Some(tty) => spawn_with_pty(spec, executable, tty.window_size),
        None => spawn_with_pipes(spec, executable),
    }
}

fn spawn_with_pipes(spec: &ProcessSpec, executable: &Path) -> Result<Spawned> {
    let (stdout_read, stdout_write) = cloexec_pipe()?;
    let (stderr_read, stderr_write) = cloexec_pipe()?;
    let (stdin_read, stdin_write) = cloexec_pipe()?;

    let mut cmd = build_command(spec, executable);
    cmd.stdin(Stdio::from(stdin_read))
        .stdout(Stdio::from(stdout_write))
        .stderr(Stdio::from(stderr_write))
        .process_group(0);

    let child = cmd.spawn().map_err(|source| HoudiniError::Spawn {
        path: spec.path.clone(),
        source,
    })?;
    // Release our copies of the child-side ends so EOF reaches the relays
    drop(cmd);

    let pid = Pid::from_raw(child.id() as i32);
    log::debug!("Started {} as pid {} in its own process group", spec.path, pid);

    Ok(Spawned {
        child: GroupProcess { pid, pty: None },
        stdin: File::from(stdin_write),
        stdout: File::from(stdout_read),
        stderr: Some(File::from(stderr_read)),
        eof: None,
    })
}

fn spawn_with_pty(spec: &ProcessSpec, executable: &Path, size: Option<WindowSize>) -> Result<Spawned> {
    let winsize = size.map(to_winsize);
    let OpenptyResult { master, slave } =
        openpty(winsize.as_ref(), None::<&Termios>).map_err(|e| HoudiniError::syscall("openpty", e))?;
    set_cloexec(&master)?;
    set_cloexec(&slave)?;
    let eof = tcgetattr(&slave)
        .map_err(|e| HoudiniError::syscall("tcgetattr", e))?
        .control_chars[SpecialCharacterIndices::VEOF as usize];

    let dup = |fd: &OwnedFd| fd.try_clone().map_err(|e| HoudiniError::syscall("dup", e));
    let stdin = File::from(dup(&master)?);
    let stdout = File::from(dup(&master)?);

    let mut cmd = build_command(spec, executable);
    cmd.stdin(Stdio::from(dup(&slave)?))
        .stdout(Stdio::from(dup(&slave)?))
        .stderr(Stdio::from(slave));

    // SAFETY: only async-signal-safe calls run between fork and exec
    unsafe {
        cmd.pre_exec(|| {
            // New session, which also makes the child a process group leader
            nix::unistd::setsid().map_err(io::Error::from)?;
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| HoudiniError::Spawn {
        path: spec.path.clone(),
        source,
    })?;
    drop(cmd);

    let pid = Pid::from_raw(child.id() as i32);
    log::debug!("Started {} as pid {} on a pseudo-terminal", spec.path, pid);

    Ok(Spawned {
        child: GroupProcess {
            pid,
            pty: Some(master),
        },
        stdin,
        stdout,
        stderr: None,
        eof: Some(eof),
    })
}
