//! Per-pool reconciliation lock
//!
//! Reconciliations of the same pool must never run concurrently, whether in
//! one process or across worker processes. The lock is an advisory file
//! named by pool id and holding the owner's PID. Acquisition never blocks:
//! a contended attempt returns `None` immediately and the caller drops the
//! tick rather than queueing. A lock file whose recorded process no longer
//! exists is stale (the holder crashed before releasing) and is removed.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use spotherd_core::{PoolId, Result, SpotherdError};
use tracing::warn;

/// Held for the duration of one reconciliation tick; released on drop,
/// including during unwinding.
pub struct PoolLock {
    path: PathBuf,
}

impl PoolLock {
    fn lock_path(dir: &Path, pool_id: PoolId) -> PathBuf {
        dir.join(format!("spotherd.pool{pool_id}.lck"))
    }

    /// Try to take the lock for `pool_id`. Returns `None` without waiting
    /// when another reconciliation holds it.
    pub fn try_acquire(dir: &Path, pool_id: PoolId) -> Result<Option<Self>> {
        let path = Self::lock_path(dir, pool_id);
        match Self::create(&path) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !holder_is_alive(&path) {
                    warn!("Removing stale lock {} (holder is gone)", path.display());
                    let _ = std::fs::remove_file(&path);
                    return match Self::create(&path) {
                        Ok(lock) => Ok(Some(lock)),
                        // Lost the re-acquisition race to another worker.
                        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
                        Err(e) => Err(lock_error(&path, e)),
                    };
                }
                Ok(None)
            }
            Err(e) => Err(lock_error(&path, e)),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::options()
            .write(true)
            .create_new(true)
            .open(path)?;
        if let Err(e) = write!(file, "{}", std::process::id()) {
            let _ = std::fs::remove_file(path);
            return Err(e);
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PoolLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_error(path: &Path, e: std::io::Error) -> SpotherdError {
    SpotherdError::Unclassified(format!("pool lock {}: {e}", path.display()))
}

/// Whether the process recorded in the lock file still exists. Unreadable
/// or garbled content counts as dead; a vanished file counts as alive so
/// the caller backs off and retries on the next tick.
fn holder_is_alive(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(pid) => Path::new(&format!("/proc/{pid}")).exists(),
            Err(_) => false,
        },
        Err(_) => true,
    }
}
