//! Advisory per-cwd mutual exclusion: a `flock`-held file guaranteeing at
//! most one running session per (namespace, working directory).

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nix::fcntl::{Flock, FlockArg};

/// A held advisory lock on a cwd lock file. Blocks on acquisition; releases
/// (and closes the underlying file) on drop.
pub struct CwdLock {
    guard: Flock<File>,
}

impl CwdLock {
    /// Opens (creating if needed) the lock file and blocks until an
    /// exclusive `flock` is acquired.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening cwd lock file {}", path.display()))?;
        #[allow(deprecated)]
        let guard = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_file, err)| anyhow!("acquiring flock on {}: {err}", path.display()))?;
        Ok(Self { guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn acquire_creates_parent_and_file() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("locks").join("abc.lock");
        let guard = CwdLock::acquire(&lock_path).unwrap();
        assert!(lock_path.is_file());
        drop(guard);
    }

    #[test]
    fn second_acquire_blocks_until_first_drops() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("abc.lock");
        let first = CwdLock::acquire(&lock_path).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let acquired_clone = Arc::clone(&acquired);
        let path_clone = lock_path.clone();
        let handle = std::thread::spawn(move || {
            let _second = CwdLock::acquire(&path_clone).unwrap();
            acquired_clone.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
