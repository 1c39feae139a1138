/// Process launching and supervision
///
/// The launcher spawns a child with its standard streams wired through
/// anonymous pipes and places it in its own process group (POSIX) or job
/// object (Windows), so one signal reaches the child and every descendant.
/// The platform variant is picked at compile time.
use crate::io_handler::{OutputRelay, RelayTotals, Sink};
use crate::lookup::resolve_executable;
use crate::platform;
use crate::types::{ExitStatus, HoudiniError, ProcessSignal, ProcessSpec, Result, WindowSize};
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operations every platform's child process supports
pub trait ProcessControl: Send + Sync {
    /// OS process identifier
    fn id(&self) -> u32;

    /// Deliver `signal` to the whole process group or job
    fn signal(&self, signal: ProcessSignal) -> Result<()>;

    /// Block until the process exits and collect its status.
    ///
    /// Called at most once per process.
    fn reap(&self) -> Result<ExitStatus>;

    /// Resize the process's terminal, if it has one
    fn set_window_size(&self, size: WindowSize) -> Result<()>;
}

/// Lifecycle of a spawned process
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessState {
    Running,
    Exited(ExitStatus),
    Failed(String),
}

/// Handle to one live (or reaped) child process
pub struct ProcessHandle<P: ProcessControl = platform::Child> {
    child: P,
    state: Mutex<ProcessState>,
    relay: Mutex<OutputRelay>,
}

impl<P: ProcessControl> ProcessHandle<P> {
    pub(crate) fn new(child: P, relay: OutputRelay) -> Self {
        Self {
            child,
            state: Mutex::new(ProcessState::Running),
            relay: Mutex::new(relay),
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Current state without blocking on the process
    pub fn state(&self) -> ProcessState {
        match self.state.try_lock() {
            Ok(state) => state.clone(),
            // A wait is in progress, so the process has not been reaped yet
            Err(_) => ProcessState::Running,
        }
    }

    /// Send `signal` to the process and all of its descendants.
    ///
    /// Fire-and-forget: the caller still has to [`wait`](Self::wait).
    pub fn signal(&self, signal: ProcessSignal) -> Result<()> {
        log::debug!("Sending {} to process {}", signal, self.id());
        self.child.signal(signal)
    }

    /// Block until the process exits.
    ///
    /// Waits on one handle never block waits on another. Once the process has
    /// been reaped, later calls return the same outcome. The exit status may
    /// arrive before the output relay has drained; use
    /// [`wait_for_output`](Self::wait_for_output) when output completeness matters.
    pub fn wait(&self) -> Result<ExitStatus> {
        let mut state = lock(&self.state);
        match &*state {
            ProcessState::Exited(status) => return Ok(status.clone()),
            ProcessState::Failed(reason) => {
                return Err(HoudiniError::Internal(format!(
                    "earlier wait on process {} failed: {}",
                    self.id(),
                    reason
                )))
            }
            ProcessState::Running => {}
        }

        match self.child.reap() {
            Ok(status) => {
                log::debug!("Process {} exited with code {}", self.id(), status.code);
                *state = ProcessState::Exited(status.clone());
                Ok(status)
            }
            Err(e) => {
                *state = ProcessState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Block until both output relays reach end-of-stream
    pub fn wait_for_output(&self) -> Result<RelayTotals> {
        lock(&self.relay).join()
    }

    /// Wait for exit, then for the output relays to drain
    pub fn wait_with_output(&self) -> Result<(ExitStatus, RelayTotals)> {
        let status = self.wait()?;
        let totals = self.wait_for_output()?;
        Ok((status, totals))
    }

    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        self.child.set_window_size(size)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write end of a child's stdin.
///
/// Dropping or closing it signals end of input. On a pseudo-terminal the
/// master stays open for output, so end of input is the terminal's VEOF
/// character instead, preceded by a second one when the current line is
/// unfinished.
pub struct ProcessStdin {
    inner: File,
    eof: Option<u8>,
    at_line_start: bool,
}

impl ProcessStdin {
    pub(crate) fn new(inner: File, eof: Option<u8>) -> Self {
        Self {
            inner,
            eof,
            at_line_start: true,
        }
    }

    /// Signal end-of-file to the child
    pub fn close(self) {}
}

impl Write for ProcessStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        if let Some(&last) = buf[..written].last() {
            self.at_line_start = last == b'\n';
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Drop for ProcessStdin {
    fn drop(&mut self) {
        if let Some(eof) = self.eof {
            // A canonical-mode read returns the pending line on the first
            // VEOF and zero bytes on the next
            let count = if self.at_line_start { 1 } else { 2 };
            if let Err(e) = self.inner.write_all(&vec![eof; count]) {
                log::debug!("Could not send end-of-file to terminal: {}", e);
            }
        }
    }
}

/// Parent-side ends of a freshly created child
pub(crate) struct Spawned {
    pub child: platform::Child,
    pub stdin: File,
    pub stdout: File,
    /// `None` when stderr is merged into stdout (terminal mode)
    pub stderr: Option<File>,
    /// Byte that ends input on the child's terminal
    pub eof: Option<u8>,
}

/// Spawns host processes under a dedicated process group or job
pub struct ProcessLauncher {
    control: Arc<platform::Control>,
}

impl ProcessLauncher {
    /// Resolve the platform's process-control primitives once
    pub fn new() -> Result<Self> {
        Ok(Self {
            control: Arc::new(platform::Control::new()?),
        })
    }

    /// Start `spec`, relaying its output into `stdout` and `stderr`.
    ///
    /// With a terminal requested, stdout and stderr arrive combined on `stdout`.
    pub fn spawn(
        &self,
        spec: &ProcessSpec,
        stdout: Sink,
        stderr: Sink,
    ) -> Result<(ProcessHandle, ProcessStdin)> {
        let executable = resolve_executable(&spec.path, spec.dir.as_deref(), spec.env.as_deref())?;
        log::debug!("Spawning {} {:?}", executable.display(), spec.args);

        let Spawned {
            child,
            stdin,
            stdout: stdout_pipe,
            stderr: stderr_pipe,
            eof,
        } = platform::spawn(&self.control, spec, &executable)?;
        let label = format!("houdini-{}", child.id());

        let mut relay = OutputRelay::new();
        let mut started = relay.relay_stdout(&label, stdout_pipe, stdout);
        if started.is_ok() {
            if let Some(pipe) = stderr_pipe {
                started = relay.relay_stderr(&label, pipe, stderr);
            }
        }
        if let Err(e) = started {
            let _ = child.signal(ProcessSignal::Kill);
            let _ = child.reap();
            return Err(e);
        }

        Ok((ProcessHandle::new(child, relay), ProcessStdin::new(stdin, eof)))
    }
}
