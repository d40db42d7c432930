//! Advisory whole-file locking using the `flock(2)` syscall directly.
//! Independent crate with no internal aexpect dependencies.
//!
//! Uses raw `libc::flock` instead of RAII lock wrappers to avoid the
//! self-referential struct problem: an RAII guard borrows the lock owner,
//! making it impossible to store both in the same struct without lifetime
//! gymnastics. By calling `flock(2)` directly we only need to own the
//! `File` (which owns the fd); `Drop` calls `flock(fd, LOCK_UN)` to release.
//!
//! A held lock doubles as a liveness signal: the session helper holds one
//! for its entire lifetime, and clients probe it with [`is_file_locked`] or
//! block on its release with [`wait_for_lock`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Diagnostic information written into lock files on acquisition.
/// Purely informational; the lock predicates never read it.
#[derive(Debug, Serialize, Deserialize)]
struct LockDiagnostic {
    pid: u32,
    purpose: String,
    acquired_at: DateTime<Utc>,
}

/// Exclusive advisory lock guard backed by `flock(2)`.
///
/// Holds the open `File` whose fd carries the lock. On `Drop` the lock is
/// explicitly released via `flock(fd, LOCK_UN)` for deterministic timing.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // SAFETY: `fd` is a valid file descriptor owned by `self.file`.
        // `LOCK_UN` releases the advisory lock; if the call fails the lock
        // is released anyway when the fd is closed moments later.
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
    }
}

impl FileLock {
    /// Path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire an exclusive lock, blocking until it is free.
    pub fn acquire(path: &Path, purpose: &str) -> Result<FileLock> {
        let file = open_lock_file(path)?;
        let fd = file.as_raw_fd();

        loop {
            // SAFETY: `fd` is a valid descriptor from the `File` above.
            // `LOCK_EX` blocks until the exclusive lock is granted.
            let ret = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if ret == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).with_context(|| format!("Failed to lock {}", path.display()));
        }

        Ok(finish_acquire(file, path, purpose))
    }

    /// Try to acquire an exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` when another process already holds the lock.
    pub fn try_acquire(path: &Path, purpose: &str) -> Result<Option<FileLock>> {
        let file = open_lock_file(path)?;
        let fd = file.as_raw_fd();

        // SAFETY: `fd` is a valid descriptor from the `File` above.
        // `LOCK_EX | LOCK_NB` requests an exclusive non-blocking lock.
        let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err).with_context(|| format!("Failed to lock {}", path.display()));
        }

        Ok(Some(finish_acquire(file, path, purpose)))
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))
}

/// Wrap an already-locked file in a guard, best-effort writing the
/// diagnostic record.
fn finish_acquire(file: File, path: &Path, purpose: &str) -> FileLock {
    let mut lock = FileLock {
        file,
        path: path.to_path_buf(),
    };

    let diagnostic = LockDiagnostic {
        pid: std::process::id(),
        purpose: purpose.to_string(),
        acquired_at: Utc::now(),
    };
    if let Ok(json) = serde_json::to_string(&diagnostic) {
        let _ = lock.file.set_len(0);
        let _ = lock.file.write_all(json.as_bytes());
        let _ = lock.file.flush();
    }

    lock
}

/// Probe whether some process currently holds an exclusive lock on `path`.
///
/// Missing or unopenable files count as unlocked.
pub fn is_file_locked(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    let fd = file.as_raw_fd();

    // SAFETY: `fd` is a valid descriptor from the `File` above. A failed
    // non-blocking request means somebody else holds the lock.
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        return true;
    }
    // SAFETY: we just acquired the lock on `fd`; release it before the probe
    // fd is closed.
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
    false
}

/// Block until the lock on `path` is free, then release it immediately.
///
/// This is the canonical way to wait for a lock-holding process to exit.
pub fn wait_for_lock(path: &Path) -> Result<()> {
    let _lock = FileLock::acquire(path, "wait")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    #[test]
    fn test_acquire_lock_succeeds() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("server.lock");

        let lock = FileLock::acquire(&path, "test").expect("Lock acquisition should succeed");
        assert_eq!(lock.path(), path);
        assert!(path.exists(), "Lock file should exist");
    }

    #[test]
    fn test_try_acquire_reports_contention() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("server.lock");

        let _held = FileLock::acquire(&path, "holder").expect("First lock should succeed");

        // flock conflicts between separate open file descriptions even
        // within one process, so a second open observes the contention.
        let second = FileLock::try_acquire(&path, "second").expect("try_acquire should not error");
        assert!(second.is_none(), "Second lock should be refused");
    }

    #[test]
    fn test_is_file_locked_tracks_guard_lifetime() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("server.lock");

        assert!(!is_file_locked(&path), "Missing file counts as unlocked");

        let lock = FileLock::acquire(&path, "test").expect("Lock should succeed");
        assert!(is_file_locked(&path), "Held lock should be observed");

        drop(lock);
        assert!(!is_file_locked(&path), "Dropped lock should be released");
    }

    #[test]
    fn test_wait_for_lock_blocks_until_release() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("server.lock");

        let lock = FileLock::acquire(&path, "holder").expect("Lock should succeed");
        let path_clone = path.clone();
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            drop(lock);
        });

        let started = Instant::now();
        wait_for_lock(&path_clone).expect("wait_for_lock should succeed");
        assert!(
            started.elapsed() >= Duration::from_millis(150),
            "wait_for_lock should have blocked on the holder"
        );
        holder.join().expect("holder thread should finish");
    }

    #[test]
    fn test_diagnostic_written_on_acquire() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("server.lock");

        let _lock = FileLock::acquire(&path, "unit test").expect("Lock should succeed");

        let contents = fs::read_to_string(&path).expect("Failed to read lock file");
        let diagnostic: LockDiagnostic =
            serde_json::from_str(&contents).expect("Failed to parse diagnostic JSON");
        assert_eq!(diagnostic.pid, std::process::id());
        assert_eq!(diagnostic.purpose, "unit test");
    }

    #[test]
    fn test_lock_debug_format() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("server.lock");

        let lock = FileLock::acquire(&path, "test").expect("Lock should succeed");
        let debug = format!("{lock:?}");
        assert!(debug.contains("FileLock"));
        assert!(debug.contains("path"));
    }

    #[test]
    fn test_acquire_invalid_path_fails() {
        let result = FileLock::acquire(Path::new("/dev/null/not-a-dir/x.lock"), "test");
        assert!(result.is_err(), "Should fail for an unreachable path");
    }
}
