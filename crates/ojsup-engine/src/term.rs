use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::fs_ops::remove_path_if_exists;

/// Paths to delete if the process is terminated mid-operation. Keeps a
/// half-written backup set or a stale lock file from outliving the process
/// that was building it.
struct Registry {
    entries: Mutex<BTreeMap<u64, PathBuf>>,
    next_id: AtomicU64,
}

impl Registry {
    const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self, path: &Path) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, path.to_path_buf());
        }
        id
    }

    fn withdraw(&self, id: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&id);
        }
    }

    /// Best-effort removal of everything still registered. try_lock keeps
    /// the signal handler from blocking on a lock the interrupted thread
    /// already holds.
    fn remove_all(&self) {
        if let Ok(mut entries) = self.entries.try_lock() {
            for (_, path) in std::mem::take(&mut *entries) {
                let _ = remove_path_if_exists(&path);
            }
        }
    }
}

static GLOBAL: Registry = Registry::new();
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Marks a path for removal on termination. Dropping the guard withdraws the
/// path, so artifacts that reached a consistent state survive a later signal.
#[derive(Debug)]
pub struct CleanupGuard {
    id: u64,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        GLOBAL.withdraw(self.id);
    }
}

pub fn cleanup_on_termination(path: &Path) -> CleanupGuard {
    CleanupGuard {
        id: GLOBAL.register(path),
    }
}

/// Install the SIGTERM/SIGINT/SIGHUP handler that removes all registered
/// paths before exiting with the conventional 128+signal status. Installing
/// twice is a no-op.
pub fn install_termination_handler() {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_termination as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                warn!(
                    "failed to install termination handler for signal {signal}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

extern "C" fn handle_termination(signal: libc::c_int) {
    GLOBAL.remove_all();
    unsafe { libc::_exit(128 + signal) };
}
