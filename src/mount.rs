/// Bind-mount setup and teardown for container work dirs
use crate::types::{BindMount, HoudiniError, Result};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Host primitives needed to bind and unbind a directory
pub trait MountOps {
    /// Bind `source` onto `target`, read-only when requested
    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<()>;

    /// Forcibly unmount `target`
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Mount operations backed by the host kernel
#[derive(Clone, Copy, Debug, Default)]
pub struct HostMounts;

#[cfg(target_os = "linux")]
impl MountOps for HostMounts {
    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| HoudiniError::syscall("mount", e))?;

        // MS_RDONLY is ignored on the initial bind; it only sticks on a remount
        if read_only {
            let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
            if let Err(e) = mount(None::<&str>, target, None::<&str>, flags, None::<&str>) {
                if let Err(undo) = self.unmount(target) {
                    log::warn!(
                        "Failed to undo bind of {} after remount error: {}",
                        target.display(),
                        undo
                    );
                }
                return Err(HoudiniError::syscall("mount(MS_REMOUNT)", e));
            }
        }

        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        use nix::mount::{umount2, MntFlags};

        umount2(target, MntFlags::MNT_FORCE).map_err(|e| HoudiniError::syscall("umount2", e))
    }
}

#[cfg(not(target_os = "linux"))]
impl MountOps for HostMounts {
    fn bind(&self, _source: &Path, _target: &Path, _read_only: bool) -> Result<()> {
        Err(HoudiniError::Unsupported(
            "bind mounts are only supported on Linux".to_string(),
        ))
    }

    fn unmount(&self, _target: &Path) -> Result<()> {
        Err(HoudiniError::Unsupported(
            "bind mounts are only supported on Linux".to_string(),
        ))
    }
}

/// A failed unmount that did not stop teardown
#[derive(Clone, Debug, Serialize)]
pub struct UnmountWarning {
    pub destination: PathBuf,
    pub error: String,
}

/// What `unsetup` did
#[derive(Clone, Debug, Default, Serialize)]
pub struct UnmountReport {
    /// Destinations an unmount was attempted on, in attempt order
    pub attempted: Vec<PathBuf>,
    pub warnings: Vec<UnmountWarning>,
}

impl UnmountReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Applies a container's bind mounts under its work dir and removes them again
#[derive(Clone, Debug, Default)]
pub struct MountManager<M: MountOps = HostMounts> {
    ops: M,
}

impl MountManager<HostMounts> {
    /// Create a mount manager that talks to the host kernel
    pub fn new() -> Self {
        Self { ops: HostMounts }
    }
}

impl<M: MountOps> MountManager<M> {
    /// Create a mount manager over custom mount operations
    pub fn with_ops(ops: M) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &M {
        &self.ops
    }

    /// Bind every mount in declared order.
    ///
    /// Stops at the first failure. Mounts applied before the failure stay in
    /// place; use [`MountManager::setup_partial`] to learn how many there are.
    pub fn setup(&self, mounts: &[BindMount], work_dir: &Path) -> Result<()> {
        self.setup_partial(mounts, work_dir).1
    }

    /// Like [`MountManager::setup`], also returning how many leading entries
    /// of `mounts` were bound. Passing `&mounts[..applied]` to
    /// [`MountManager::unsetup`] removes exactly those.
    pub fn setup_partial(&self, mounts: &[BindMount], work_dir: &Path) -> (usize, Result<()>) {
        for (applied, bm) in mounts.iter().enumerate() {
            if let Err(e) = self.bind_one(bm, work_dir) {
                return (applied, Err(e));
            }
        }
        (mounts.len(), Ok(()))
    }

    fn bind_one(&self, bm: &BindMount, work_dir: &Path) -> Result<()> {
        let dest = resolve_destination(work_dir, &bm.destination)?;

        create_mount_point(&dest).map_err(|e| HoudiniError::Mount {
            host_path: bm.source.clone(),
            destination: dest.clone(),
            reason: format!("failed to create target for bind mount: {}", e),
        })?;

        log::debug!(
            "Binding {} -> {} ({:?})",
            bm.source.display(),
            dest.display(),
            bm.mode
        );
        self.ops
            .bind(&bm.source, &dest, bm.is_read_only())
            .map_err(|e| HoudiniError::Mount {
                host_path: bm.source.clone(),
                destination: dest.clone(),
                reason: e.to_string(),
            })
    }

    /// Unmount every mount in reverse declared order.
    ///
    /// Every entry gets an attempt. Failures are logged and collected in the
    /// report instead of being returned, so container teardown always proceeds.
    pub fn unsetup(&self, mounts: &[BindMount], work_dir: &Path) -> UnmountReport {
        let mut report = UnmountReport::default();

        for bm in mounts.iter().rev() {
            let dest = match resolve_destination(work_dir, &bm.destination) {
                Ok(dest) => dest,
                Err(e) => {
                    log::warn!("Skipping unmount of {}: {}", bm.destination.display(), e);
                    report.warnings.push(UnmountWarning {
                        destination: bm.destination.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            log::debug!("Unmounting {}", dest.display());
            report.attempted.push(dest.clone());
            if let Err(e) = self.ops.unmount(&dest) {
                log::warn!("Unmount of {} failed: {}", dest.display(), e);
                report.warnings.push(UnmountWarning {
                    destination: dest,
                    error: e.to_string(),
                });
            }
        }

        report
    }
}

/// Resolve a bind mount destination under `work_dir`.
///
/// Leading roots are ignored so `/data` and `data` land in the same place.
/// `..` components may not climb above the work dir. Symlinks are not followed.
pub fn resolve_destination(work_dir: &Path, destination: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in destination.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return Err(HoudiniError::EscapesWorkDir(destination.to_path_buf()));
                }
            }
            Component::Prefix(_) => {
                return Err(HoudiniError::EscapesWorkDir(destination.to_path_buf()))
            }
        }
    }
    Ok(work_dir.join(relative))
}

fn create_mount_point(dest: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o755).create(dest)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dest)
    }
}
