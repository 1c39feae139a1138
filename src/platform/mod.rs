//! Host-specific process control, selected at compile time

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::GroupProcess as Child;
#[cfg(unix)]
pub(crate) use unix::{spawn, Control};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::JobProcess as Child;
#[cfg(windows)]
pub(crate) use windows::{spawn, JobControl as Control};
