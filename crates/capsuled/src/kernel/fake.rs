//! In-memory kernel backends for tests.
//!
//! One [`FakeKernel`] implements all three backend traits and records every
//! operation, so driver and engine tests can assert on attach/mount order
//! and verify that teardown really happened. Failure injection is
//! per-operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{KernelError, LoopBackend, MountBackend, VerityBackend, VerityTable};

/// What the fake kernel currently has attached/created/mounted.
#[derive(Debug, Default)]
pub struct FakeState {
    next_loop: u32,
    /// loop device → (image, offset).
    pub loops: BTreeMap<PathBuf, (PathBuf, u64)>,
    /// verity name → backing (loop) device.
    pub verity: BTreeMap<String, PathBuf>,
    /// mount point → mounted device.
    pub mounts: BTreeMap<PathBuf, PathBuf>,
    /// Chronological log of operations, e.g. `attach /dev/loop0`.
    pub log: Vec<String>,
}

/// Failure injection switches.
#[derive(Debug, Default)]
pub struct FakeFailures {
    /// Every `attach` reports an exhausted pool.
    pub fail_attach: bool,
    /// Every verity `create` fails.
    pub fail_verity: bool,
    /// Mounts of targets containing this substring fail.
    pub fail_mount_containing: Option<String>,
    /// Every `unmount` fails (for teardown-aggregation tests).
    pub fail_unmount: bool,
    /// Every `detach` fails.
    pub fail_detach: bool,
}

/// In-memory loop + verity + mount backend.
#[derive(Debug, Default)]
pub struct FakeKernel {
    /// Live state, behind a mutex so the backend traits can take `&self`.
    pub state: Mutex<FakeState>,
    /// Failure injection.
    pub failures: Mutex<FakeFailures>,
}

impl FakeKernel {
    /// A fake kernel with nothing attached and no failures armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn io_error(msg: &str) -> std::io::Error {
        std::io::Error::other(msg.to_string())
    }

    /// Convenience: number of live loop devices.
    pub fn loop_count(&self) -> usize {
        self.state.lock().unwrap().loops.len()
    }

    /// Convenience: number of live mounts.
    pub fn mount_count(&self) -> usize {
        self.state.lock().unwrap().mounts.len()
    }

    /// Convenience: number of live verity devices.
    pub fn verity_count(&self) -> usize {
        self.state.lock().unwrap().verity.len()
    }

    /// True when nothing is attached, created or mounted.
    pub fn is_quiescent(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.loops.is_empty() && state.verity.is_empty() && state.mounts.is_empty()
    }
}

impl LoopBackend for FakeKernel {
    fn attach(&self, image: &Path, offset: u64, _size_limit: u64) -> Result<PathBuf, KernelError> {
        if self.failures.lock().unwrap().fail_attach {
            return Err(KernelError::LoopExhausted {
                source: Self::io_error("injected: pool exhausted"),
            });
        }
        let mut state = self.state.lock().unwrap();
        let device = PathBuf::from(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state.loops.insert(device.clone(), (image.to_path_buf(), offset));
        state.log.push(format!("attach {}", device.display()));
        Ok(device)
    }

    fn detach(&self, device: &Path) -> Result<(), KernelError> {
        if self.failures.lock().unwrap().fail_detach {
            return Err(KernelError::Loop {
                image: device.to_path_buf(),
                context: "injected detach failure",
                source: Self::io_error("injected"),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("detach {}", device.display()));
        state.loops.remove(device).map(|_| ()).ok_or(KernelError::Loop {
            image: device.to_path_buf(),
            context: "detach of unattached device",
            source: Self::io_error("not attached"),
        })
    }
}

impl VerityBackend for FakeKernel {
    fn create(
        &self,
        name: &str,
        data_device: &Path,
        _table: &VerityTable,
    ) -> Result<PathBuf, KernelError> {
        if self.failures.lock().unwrap().fail_verity {
            return Err(KernelError::Verity {
                name: name.to_string(),
                context: "injected verity failure",
                source: Self::io_error("injected"),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.verity.insert(name.to_string(), data_device.to_path_buf());
        state.log.push(format!("verity-create {name}"));
        Ok(PathBuf::from(format!("/dev/mapper/{name}")))
    }

    fn remove(&self, name: &str) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("verity-remove {name}"));
        state.verity.remove(name).map(|_| ()).ok_or(KernelError::Verity {
            name: name.to_string(),
            context: "remove of unknown device",
            source: Self::io_error("no such device"),
        })
    }
}

impl MountBackend for FakeKernel {
    fn mount(&self, device: &Path, target: &Path, _fstype: &str) -> Result<(), KernelError> {
        let fail = self
            .failures
            .lock()
            .unwrap()
            .fail_mount_containing
            .as_ref()
            .is_some_and(|needle| target.to_string_lossy().contains(needle.as_str()));
        if fail {
            return Err(KernelError::Mount {
                target: target.to_path_buf(),
                context: "injected mount failure",
                source: Self::io_error("injected"),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.mounts.insert(target.to_path_buf(), device.to_path_buf());
        state.log.push(format!("mount {}", target.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), KernelError> {
        if self.failures.lock().unwrap().fail_unmount {
            return Err(KernelError::Mount {
                target: target.to_path_buf(),
                context: "injected unmount failure",
                source: Self::io_error("injected"),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("umount {}", target.display()));
        state.mounts.remove(target).map(|_| ()).ok_or(KernelError::Mount {
            target: target.to_path_buf(),
            context: "unmount of unmounted target",
            source: Self::io_error("not mounted"),
        })
    }
}
