use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use ojsup_core::UpgradeError;

use crate::term::{cleanup_on_termination, CleanupGuard};

/// Exclusive advisory lock scoped to one instance. Claimed with an O_EXCL
/// create under the run directory; released on drop so every exit path,
/// including rollback, lets a later invocation proceed. The lock file is
/// also registered for removal on a termination signal.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    held: bool,
    _cleanup: CleanupGuard,
}

impl InstanceLock {
    pub fn acquire(run_dir: &Path, instance_name: &str) -> Result<Self, UpgradeError> {
        let path = run_dir.join(format!("ojsup-{instance_name}.lock"));

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(UpgradeError::LockContention { lock_path: path });
            }
            Err(err) => {
                return Err(UpgradeError::InsufficientPermissions {
                    violations: vec![format!(
                        "cannot create lock file {}: {err}",
                        path.display()
                    )],
                });
            }
        };

        if let Err(err) = file.write_all(format!("{}\n", std::process::id()).as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(UpgradeError::InsufficientPermissions {
                violations: vec![format!("cannot write lock file {}: {err}", path.display())],
            });
        }

        debug!("acquired lock {}", path.display());
        let cleanup = cleanup_on_termination(&path);
        Ok(Self {
            path,
            held: true,
            _cleanup: cleanup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("released lock {}", self.path.display()),
            Err(err) => warn!("failed to remove lock file {}: {err}", self.path.display()),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use ojsup_core::UpgradeError;

    use super::InstanceLock;

    #[test]
    fn second_acquisition_contends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = InstanceLock::acquire(dir.path(), "journal-a").expect("first must acquire");

        let err = InstanceLock::acquire(dir.path(), "journal-a")
            .expect_err("second acquisition must contend");
        assert!(matches!(err, UpgradeError::LockContention { .. }));

        // A different instance is unaffected.
        InstanceLock::acquire(dir.path(), "journal-b").expect("other instance must acquire");

        drop(first);
        InstanceLock::acquire(dir.path(), "journal-a").expect("lock must be free after drop");
    }

    #[test]
    fn explicit_release_frees_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = InstanceLock::acquire(dir.path(), "journal-a").expect("must acquire");
        let path = lock.path().to_path_buf();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
    }
}
