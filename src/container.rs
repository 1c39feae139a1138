/// Container lifecycle: a private work dir with bind mounts, plus the
/// processes started inside it
use crate::io_handler::Sink;
use crate::mount::{HostMounts, MountManager, MountOps, UnmountReport};
use crate::process::{ProcessHandle, ProcessLauncher, ProcessState, ProcessStdin};
use crate::types::{merge_env, ContainerSpec, HoudiniError, ProcessSignal, ProcessSpec, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A live container rooted at `depot/<handle>`
pub struct Container<M: MountOps = HostMounts> {
    spec: ContainerSpec,
    work_dir: PathBuf,
    created_at: chrono::DateTime<chrono::Utc>,
    mounts: MountManager<M>,
    launcher: Arc<ProcessLauncher>,
    processes: Mutex<Vec<Arc<ProcessHandle>>>,
    keep_work_dir: bool,
}

impl Container<HostMounts> {
    /// Create the work dir and apply the spec's bind mounts against the host
    pub fn create(depot: &Path, spec: ContainerSpec, launcher: Arc<ProcessLauncher>) -> Result<Self> {
        Self::create_with_mounts(depot, spec, launcher, MountManager::new())
    }
}

impl<M: MountOps> Container<M> {
    /// Create the work dir and apply the spec's bind mounts.
    ///
    /// On a mount failure, mounts already applied are removed again and the
    /// work dir is deleted before the error is returned.
    pub fn create_with_mounts(
        depot: &Path,
        mut spec: ContainerSpec,
        launcher: Arc<ProcessLauncher>,
        mounts: MountManager<M>,
    ) -> Result<Self> {
        if spec.handle.is_empty() {
            spec.handle = uuid::Uuid::new_v4().to_string();
        }
        validate_handle(&spec.handle)?;

        fs::create_dir_all(depot)?;
        let work_dir = depot.canonicalize()?.join(&spec.handle);
        // Fails when the handle is already taken
        fs::create_dir(&work_dir).map_err(|e| {
            HoudiniError::Config(format!(
                "Cannot create work dir {}: {}",
                work_dir.display(),
                e
            ))
        })?;

        log::info!(
            "Creating container {} in {} with {} bind mount(s)",
            spec.handle,
            work_dir.display(),
            spec.bind_mounts.len()
        );

        let (applied, result) = mounts.setup_partial(&spec.bind_mounts, &work_dir);
        if let Err(e) = result {
            log::warn!("Setup of container {} failed: {}", spec.handle, e);
            let report = mounts.unsetup(&spec.bind_mounts[..applied], &work_dir);
            remove_work_dir(&work_dir, &report);
            return Err(e);
        }

        Ok(Self {
            spec,
            work_dir,
            created_at: chrono::Utc::now(),
            mounts,
            launcher,
            processes: Mutex::new(Vec::new()),
            keep_work_dir: false,
        })
    }

    pub fn handle(&self) -> &str {
        &self.spec.handle
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    /// Leave the (unmounted) work dir on disk when the container is destroyed
    pub fn set_keep_work_dir(&mut self, keep: bool) {
        self.keep_work_dir = keep;
    }

    /// Number of processes in this container that have not been reaped
    pub fn process_count(&self) -> usize {
        let mut processes = self.tracked();
        prune_reaped(&mut processes);
        processes.len()
    }

    fn tracked(&self) -> MutexGuard<'_, Vec<Arc<ProcessHandle>>> {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a process inside the container.
    ///
    /// A missing `dir` means the work dir, a relative one is joined onto it.
    /// The process inherits the host environment, overlaid first with the
    /// container's env and then with the process's own env.
    pub fn run(
        &self,
        mut spec: ProcessSpec,
        stdout: Sink,
        stderr: Sink,
    ) -> Result<(Arc<ProcessHandle>, ProcessStdin)> {
        spec.dir = Some(match spec.dir.take() {
            None => self.work_dir.clone(),
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => self.work_dir.join(dir),
        });
        spec.env = effective_env(&self.spec.env, spec.env.take());

        log::debug!("Running {} in container {}", spec.path, self.spec.handle);
        let (handle, stdin) = self.launcher.spawn(&spec, stdout, stderr)?;
        let handle = Arc::new(handle);
        let mut processes = self.tracked();
        prune_reaped(&mut processes);
        processes.push(Arc::clone(&handle));

        Ok((handle, stdin))
    }

    /// Kill and reap every process, remove the bind mounts and the work dir.
    ///
    /// Unmount failures do not fail the call; they are listed in the report.
    /// The work dir is only deleted once every unmount succeeded.
    pub fn destroy(self) -> Result<UnmountReport> {
        log::info!("Destroying container {}", self.spec.handle);

        let mut processes = std::mem::take(&mut *self.tracked());
        // A reaped leader's pid may already belong to an unrelated group
        prune_reaped(&mut processes);
        for process in processes {
            if let Err(e) = process.signal(ProcessSignal::Kill) {
                log::warn!("Failed to kill process {}: {}", process.id(), e);
            }
            if let Err(e) = process.wait() {
                log::warn!("Failed to reap process {}: {}", process.id(), e);
            }
        }

        let report = self.mounts.unsetup(&self.spec.bind_mounts, &self.work_dir);
        if !self.keep_work_dir {
            remove_work_dir(&self.work_dir, &report);
        }
        Ok(report)
    }
}

fn prune_reaped(processes: &mut Vec<Arc<ProcessHandle>>) {
    processes.retain(|process| process.state() == ProcessState::Running);
}

/// Handles name a single directory under the depot
fn validate_handle(handle: &str) -> Result<()> {
    let mut components = Path::new(handle).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(HoudiniError::Config(format!(
            "Invalid container handle '{}'",
            handle
        ))),
    }
}

fn effective_env(container_env: &[String], process_env: Option<Vec<String>>) -> Option<Vec<String>> {
    if container_env.is_empty() && process_env.is_none() {
        return None;
    }
    // Non-UTF-8 variables cannot be carried in a KEY=VALUE list
    let host: Vec<String> = std::env::vars_os()
        .filter_map(|(k, v)| Some(format!("{}={}", k.into_string().ok()?, v.into_string().ok()?)))
        .collect();
    let base = merge_env(&host, container_env);
    Some(merge_env(&base, &process_env.unwrap_or_default()))
}

/// Deleting a work dir that still has binds in it would delete host files
fn remove_work_dir(work_dir: &Path, report: &UnmountReport) {
    if !report.is_clean() {
        log::warn!(
            "Leaving {} in place: {} unmount(s) failed",
            work_dir.display(),
            report.warnings.len()
        );
        return;
    }
    if let Err(e) = fs::remove_dir_all(work_dir) {
        log::warn!("Failed to remove {}: {}", work_dir.display(), e);
    }
}
