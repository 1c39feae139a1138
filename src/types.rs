/// Core types and structures for the houdini backend
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Access mode of a bind mount
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BindMountMode {
    /// Writes through the destination are rejected
    ReadOnly,
    /// Destination is writable
    #[default]
    ReadWrite,
}

/// A host directory made visible inside a container's work dir
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host path to bind
    pub source: PathBuf,
    /// Destination, relative to the container work dir
    pub destination: PathBuf,
    /// Access mode
    #[serde(default)]
    pub mode: BindMountMode,
}

impl BindMount {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        mode: BindMountMode,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            mode,
        }
    }

    /// Parse a binding from the command-line form `source:destination[:ro|:rw]`
    pub fn parse(binding: &str) -> Result<Self> {
        let parts: Vec<&str> = binding.split(':').collect();
        let (source, destination, mode) = match parts.as_slice() {
            [source, destination] => (*source, *destination, BindMountMode::ReadWrite),
            [source, destination, mode] => {
                let mode = match mode.to_ascii_lowercase().as_str() {
                    "ro" => BindMountMode::ReadOnly,
                    "rw" => BindMountMode::ReadWrite,
                    other => {
                        return Err(HoudiniError::Config(format!(
                            "Unknown bind mount mode '{}' (expected ro or rw)",
                            other
                        )))
                    }
                };
                (*source, *destination, mode)
            }
            _ => {
                return Err(HoudiniError::Config(format!(
                    "Invalid bind mount '{}' (expected source:destination[:ro|:rw])",
                    binding
                )))
            }
        };

        if source.is_empty() || destination.is_empty() {
            return Err(HoudiniError::Config(format!(
                "Invalid bind mount '{}': source and destination must be non-empty",
                binding
            )));
        }

        Ok(Self::new(source, destination, mode))
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == BindMountMode::ReadOnly
    }
}

/// Declared shape of a container
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container handle; a fresh UUID is used when empty
    #[serde(default)]
    pub handle: String,
    /// Ordered bind mounts, applied first to last
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
    /// Environment shared by every process in the container (`KEY=VALUE`)
    #[serde(default)]
    pub env: Vec<String>,
}

impl ContainerSpec {
    /// Load a container spec from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            HoudiniError::Config(format!(
                "Failed to parse container spec {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Terminal dimensions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

impl FromStr for WindowSize {
    type Err = HoudiniError;

    /// Parses `COLUMNSxROWS`, e.g. `80x24`
    fn from_str(s: &str) -> Result<Self> {
        let (columns, rows) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| HoudiniError::Config(format!("Invalid window size '{}'", s)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|e| HoudiniError::Config(format!("Invalid window size '{}': {}", s, e)))
        };
        Ok(Self {
            columns: parse(columns)?,
            rows: parse(rows)?,
        })
    }
}

/// Request for a pseudo-terminal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    pub window_size: Option<WindowSize>,
}

/// A process to run inside a container
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Executable; bare names are searched on PATH
    pub path: String,
    /// Arguments, not including the executable
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; relative paths resolve against the container work dir
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Environment (`KEY=VALUE`). `None` inherits the backend's environment.
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub tty: Option<TtySpec>,
}

impl ProcessSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env
            .get_or_insert_with(Vec::new)
            .push(format!("{}={}", key, value));
        self
    }

    pub fn tty(mut self, tty: TtySpec) -> Self {
        self.tty = Some(tty);
        self
    }
}

/// Variable names compare case-insensitively on Windows
fn env_key(key: &str) -> Cow<'_, str> {
    if cfg!(windows) {
        Cow::Owned(key.to_ascii_uppercase())
    } else {
        Cow::Borrowed(key)
    }
}

/// Find `key` in a `KEY=VALUE` list; the last assignment wins
pub fn lookup_env<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    let key = env_key(key);
    env.iter().rev().find_map(|entry| {
        let (k, v) = entry.split_once('=')?;
        (env_key(k) == key).then_some(v)
    })
}

/// Merge two `KEY=VALUE` lists; entries in `overrides` replace those in `base`.
///
/// A replaced variable keeps its position and takes the spelling of its
/// latest assignment.
pub fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged: BTreeMap<String, (&str, &str)> = BTreeMap::new();
    let mut order = Vec::new();
    for entry in base.iter().chain(overrides) {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        let normalized = env_key(key).into_owned();
        if merged.insert(normalized.clone(), (key, value)).is_none() {
            order.push(normalized);
        }
    }
    order
        .iter()
        .filter_map(|normalized| merged.get(normalized))
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

/// Signal requested for a process group or job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessSignal {
    Terminate,
    Kill,
    Interrupt,
    Hangup,
    Quit,
}

impl FromStr for ProcessSignal {
    type Err = HoudiniError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" | "TERMINATE" => Ok(Self::Terminate),
            "KILL" => Ok(Self::Kill),
            "INT" | "INTERRUPT" => Ok(Self::Interrupt),
            "HUP" | "HANGUP" => Ok(Self::Hangup),
            "QUIT" => Ok(Self::Quit),
            _ => Err(HoudiniError::Config(format!("Unknown signal '{}'", s))),
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Interrupt => "SIGINT",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// Resource usage statistics collected when a process is reaped
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time spent in user mode
    pub user_time: Duration,
    /// CPU time spent in the kernel
    pub system_time: Duration,
    /// Peak resident set size in bytes (POSIX only)
    pub max_rss: Option<u64>,
    /// Creation to exit (Windows only)
    pub wall_time: Option<Duration>,
}

/// Outcome of a successful wait
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code; `128 + signo` when a POSIX process died from a signal
    pub code: i32,
    /// Terminating signal number, if any
    pub signal: Option<i32>,
    pub usage: Option<ResourceUsage>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

/// Custom error types for houdini
#[derive(Error, Debug)]
pub enum HoudiniError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Executable lookup failed for '{path}': {reason}")]
    Lookup { path: String, reason: String },

    #[error("Failed to start '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bind mount {} -> {} failed: {reason}", .host_path.display(), .destination.display())]
    Mount {
        host_path: PathBuf,
        destination: PathBuf,
        reason: String,
    },

    #[error("Bind mount destination {} escapes the work dir", .0.display())]
    EscapesWorkDir(PathBuf),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),
}

impl HoudiniError {
    /// Wrap the calling thread's last OS error, naming the primitive that failed
    pub fn last_os_error(call: &'static str) -> Self {
        Self::Syscall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }

    pub fn syscall(call: &'static str, source: impl Into<std::io::Error>) -> Self {
        Self::Syscall {
            call,
            source: source.into(),
        }
    }
}

/// Result type alias for houdini operations
pub type Result<T> = std::result::Result<T, HoudiniError>;
