//! Advisory locks on VM slot IDs.
//!
//! Each ID in the reserved range is backed by a lock file. A second vmshed
//! invocation over an overlapping range fails fast instead of fighting over
//! VMs.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use nix::fcntl::{Flock, FlockArg};

/// Holds one exclusive lock per VM ID for the lifetime of the process.
#[derive(Debug)]
pub struct VmLocks {
    locks: Vec<Flock<File>>,
}

impl VmLocks {
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

fn lock_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("vmshed.vm-{id}.lock"))
}

/// Take non-blocking exclusive locks on every ID in `[start_vm, start_vm + nr_vms)`.
pub fn lock_vm_ids(dir: &Path, start_vm: u32, nr_vms: u32) -> Result<VmLocks> {
    let mut locks = Vec::with_capacity(nr_vms as usize);
    for id in start_vm..start_vm + nr_vms {
        let path = lock_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            anyhow!(
                "cannot lock {} ({errno}); is another vmshed using VM {id}?",
                path.display()
            )
        })?;
        locks.push(lock);
    }
    Ok(VmLocks { locks })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_whole_range() {
        let temp = tempfile::tempdir().expect("tempdir");
        let locks = lock_vm_ids(temp.path(), 9500, 3).expect("lock");
        assert_eq!(locks.len(), 3);
        assert!(temp.path().join("vmshed.vm-9501.lock").exists());
    }

    #[test]
    fn overlapping_range_fails_fast() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _held = lock_vm_ids(temp.path(), 9600, 2).expect("first lock");
        let err = lock_vm_ids(temp.path(), 9601, 2).expect_err("overlap");
        assert!(err.to_string().contains("vm-9601"));
    }

    #[test]
    fn released_range_can_be_relocked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let held = lock_vm_ids(temp.path(), 9700, 1).expect("first lock");
        drop(held);
        lock_vm_ids(temp.path(), 9700, 1).expect("relock");
    }
}
