//! houdini: a non-isolating container backend
//! Bind mounts emulate a container's filesystem view and every process runs
//! on the host inside its own process group (POSIX) or job object (Windows)

pub mod cli;
pub mod container;
pub mod io_handler;
pub mod lookup;
pub mod mount;
pub mod platform;
pub mod process;
pub mod types;

pub use container::Container;
pub use mount::{MountManager, UnmountReport};
pub use process::{ProcessControl, ProcessHandle, ProcessLauncher, ProcessState, ProcessStdin};
pub use types::*;
