use houdini::mount::{MountManager, MountOps};
use houdini::{BindMount, BindMountMode, Result};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

/// Records mount calls instead of touching the kernel
#[derive(Default)]
struct Journal {
    calls: RefCell<Vec<(&'static str, PathBuf)>>,
}

impl MountOps for Journal {
    fn bind(&self, _source: &Path, target: &Path, _read_only: bool) -> Result<()> {
        self.calls.borrow_mut().push(("bind", target.to_path_buf()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.calls.borrow_mut().push(("unmount", target.to_path_buf()));
        Ok(())
    }
}

#[test]
fn test_nested_mounts_bind_parent_first_and_unbind_child_first() {
    let work_dir = tempfile::tempdir().unwrap();
    let mounts = vec![
        BindMount::new("/hostA", "data", BindMountMode::ReadWrite),
        BindMount::new("/hostB", "data/nested", BindMountMode::ReadOnly),
    ];
    let manager = MountManager::with_ops(Journal::default());

    manager.setup(&mounts, work_dir.path()).unwrap();
    let report = manager.unsetup(&mounts, work_dir.path());
    assert!(report.is_clean());

    let data = work_dir.path().join("data");
    let nested = work_dir.path().join("data/nested");
    assert_eq!(
        *manager.ops().calls.borrow(),
        vec![
            ("bind", data.clone()),
            ("bind", nested.clone()),
            ("unmount", nested),
            ("unmount", data),
        ]
    );
}

#[test]
fn test_unmount_order_is_reverse_of_mount_order() {
    let work_dir = tempfile::tempdir().unwrap();
    let mounts: Vec<BindMount> = (0..6)
        .map(|i| BindMount::new(format!("/src{}", i), format!("m{}", i), BindMountMode::ReadWrite))
        .collect();
    let manager = MountManager::with_ops(Journal::default());

    manager.setup(&mounts, work_dir.path()).unwrap();
    manager.unsetup(&mounts, work_dir.path());

    let calls = manager.ops().calls.borrow();
    let bound: Vec<&PathBuf> = calls.iter().filter(|(op, _)| *op == "bind").map(|(_, p)| p).collect();
    let mut unbound: Vec<&PathBuf> = calls.iter().filter(|(op, _)| *op == "unmount").map(|(_, p)| p).collect();
    unbound.reverse();
    assert_eq!(bound, unbound);
}

#[cfg(target_os = "linux")]
mod host {
    use crate::{is_root, test_depot};
    use houdini::mount::MountManager;
    use houdini::{BindMount, BindMountMode, Container, ContainerSpec, ProcessLauncher};
    use serial_test::serial;
    use std::sync::Arc;

    #[test]
    #[serial]
    fn test_read_only_mount_rejects_writes() {
        if !is_root() {
            println!("Skipping mount test - requires root");
            return;
        }

        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("existing.txt"), "from host").unwrap();

        let depot = test_depot();
        let spec = ContainerSpec {
            handle: "ro-test".to_string(),
            bind_mounts: vec![BindMount::new(source.path(), "data", BindMountMode::ReadOnly)],
            env: Vec::new(),
        };
        let launcher = Arc::new(ProcessLauncher::new().unwrap());
        let container = Container::create(depot.path(), spec, launcher).expect("Failed to create container");

        let data = container.work_dir().join("data");
        assert_eq!(std::fs::read_to_string(data.join("existing.txt")).unwrap(), "from host");
        assert!(
            std::fs::write(data.join("new.txt"), "nope").is_err(),
            "Write through a read-only mount should fail"
        );

        let report = container.destroy().unwrap();
        assert!(report.is_clean(), "Unexpected warnings: {:?}", report.warnings);
        assert!(source.path().join("existing.txt").exists());
        assert!(!source.path().join("new.txt").exists());
    }

    #[test]
    #[serial]
    fn test_setup_unsetup_round_trip() {
        if !is_root() {
            println!("Skipping mount test - requires root");
            return;
        }

        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("marker"), "x").unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let mounts = vec![BindMount::new(source.path(), "data", BindMountMode::ReadWrite)];
        let manager = MountManager::new();

        manager.setup(&mounts, work_dir.path()).unwrap();
        assert!(work_dir.path().join("data/marker").exists());

        let report = manager.unsetup(&mounts, work_dir.path());
        assert!(report.is_clean(), "Unexpected warnings: {:?}", report.warnings);
        assert!(!work_dir.path().join("data/marker").exists());
        assert!(source.path().join("marker").exists());
    }

    #[test]
    #[serial]
    fn test_unsetup_without_setup_warns() {
        if !is_root() {
            println!("Skipping mount test - requires root");
            return;
        }

        let work_dir = tempfile::tempdir().unwrap();
        let mounts = vec![
            BindMount::new("/tmp", "a", BindMountMode::ReadWrite),
            BindMount::new("/tmp", "b", BindMountMode::ReadWrite),
        ];
        let report = MountManager::new().unsetup(&mounts, work_dir.path());

        assert_eq!(report.attempted.len(), 2);
        assert_eq!(report.warnings.len(), 2);
    }
}
