/// Output relay for spawned processes
///
/// Each spawned process gets one copy thread per output pipe. The threads run
/// on their own until the pipe reaches end-of-stream; callers that need every
/// byte delivered before acting on the exit code can join them.
use crate::types::{HoudiniError, Result};
use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

/// Destination for a process's output
pub type Sink = Box<dyn Write + Send + 'static>;

const RELAY_BUFFER_SIZE: usize = 8192;

/// Bytes delivered per stream once the relay has drained
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayTotals {
    pub stdout: u64,
    pub stderr: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Background copy tasks for one process
#[derive(Default)]
pub struct OutputRelay {
    tasks: Vec<(Stream, JoinHandle<io::Result<u64>>)>,
    totals: Option<RelayTotals>,
}

impl OutputRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start relaying `reader` into the stdout sink
    pub fn relay_stdout<R>(&mut self, label: &str, reader: R, sink: Sink) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        self.relay(Stream::Stdout, label, reader, sink)
    }

    /// Start relaying `reader` into the stderr sink
    pub fn relay_stderr<R>(&mut self, label: &str, reader: R, sink: Sink) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        self.relay(Stream::Stderr, label, reader, sink)
    }

    fn relay<R>(&mut self, stream: Stream, label: &str, reader: R, sink: Sink) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        let name = match stream {
            Stream::Stdout => format!("{}-stdout", label),
            Stream::Stderr => format!("{}-stderr", label),
        };
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || copy_until_eof(reader, sink))
            .map_err(|e| HoudiniError::syscall("spawn relay thread", e))?;
        self.tasks.push((stream, handle));
        Ok(())
    }

    /// Block until every copy task finishes.
    ///
    /// Returns the byte counts per stream. A second call returns the same totals.
    pub fn join(&mut self) -> Result<RelayTotals> {
        if let Some(totals) = self.totals {
            if self.tasks.is_empty() {
                return Ok(totals);
            }
        }

        let mut totals = self.totals.unwrap_or_default();
        let mut first_error = None;

        for (stream, handle) in self.tasks.drain(..) {
            let copied = match handle.join() {
                Ok(Ok(copied)) => copied,
                Ok(Err(e)) => {
                    log::warn!("{:?} relay stopped early: {}", stream, e);
                    first_error.get_or_insert(HoudiniError::syscall("relay output", e));
                    continue;
                }
                Err(_) => {
                    first_error
                        .get_or_insert(HoudiniError::Internal(format!("{:?} relay panicked", stream)));
                    continue;
                }
            };
            match stream {
                Stream::Stdout => totals.stdout += copied,
                Stream::Stderr => totals.stderr += copied,
            }
        }

        self.totals = Some(totals);
        match first_error {
            Some(e) => Err(e),
            None => Ok(totals),
        }
    }
}

/// Copy until end-of-stream, flushing after every chunk so output is live
fn copy_until_eof<R: Read>(mut reader: R, mut sink: Sink) -> io::Result<u64> {
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // A pty master reports EIO once the last slave descriptor closes
            Err(e) if is_hangup(&e) => break,
            Err(e) => return Err(e),
        };
        sink.write_all(&buffer[..n])?;
        sink.flush()?;
        copied += n as u64;
    }

    sink.flush()?;
    Ok(copied)
}

#[cfg(unix)]
fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

#[cfg(windows)]
fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(winapi::shared::winerror::ERROR_BROKEN_PIPE as i32)
}
