//! Session directory layout and rendezvous file names.
//!
//! A session lives in `<root>/aexpect_<id>/` and is the sole communication
//! channel between a client and its helper process. Both sides address the
//! files inside it exclusively through [`SessionDir`], so the layout is
//! defined in one place.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable selecting the session-directory root.
pub const ROOT_ENV: &str = "TMPDIR";

/// Environment variable that, when present, preserves session directories
/// on close for post-mortem inspection.
pub const DEBUG_ENV: &str = "AEXPECT_DEBUG";

/// Number of characters in a generated session id.
pub const SESSION_ID_LEN: usize = 8;

/// Handle to a session directory; values are cheap to clone and share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDir {
    id: String,
    path: PathBuf,
}

impl SessionDir {
    /// Session directory for `id` under the default root (`$TMPDIR`, falling
    /// back to `/tmp`).
    pub fn new(id: &str) -> Self {
        Self::with_root(&default_root(), id)
    }

    /// Session directory for `id` under an explicit root.
    pub fn with_root(root: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            path: root.join(format!("aexpect_{id}")),
        }
    }

    /// The session id this directory belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The directory itself.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory (and missing parents). Idempotent.
    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path).with_context(|| {
            format!("Failed to create session directory: {}", self.path.display())
        })
    }

    /// Remove the directory and everything in it.
    pub fn remove(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.path).with_context(|| {
            format!("Failed to remove session directory: {}", self.path.display())
        })
    }

    /// Child PID, written by the helper as a decimal string.
    pub fn shell_pid_file(&self) -> PathBuf {
        self.path.join("shell-pid")
    }

    /// Child exit status, written by the helper on shutdown.
    pub fn status_file(&self) -> PathBuf {
        self.path.join("status")
    }

    /// Append-only combined stdout+stderr of the child.
    pub fn output_file(&self) -> PathBuf {
        self.path.join("output")
    }

    /// FIFO carrying client keystrokes to the child's stdin.
    pub fn inpipe(&self) -> PathBuf {
        self.path.join("inpipe")
    }

    /// FIFO carrying control frames to the helper.
    pub fn ctrlpipe(&self) -> PathBuf {
        self.path.join("ctrlpipe")
    }

    /// Per-consumer fan-out FIFO.
    pub fn consumer_pipe(&self, name: &str) -> PathBuf {
        self.path.join(format!("outpipe-{name}"))
    }

    /// Lock held exclusively by the helper for its entire lifetime; its
    /// release is the canonical "session terminated" signal.
    pub fn lock_server_running(&self) -> PathBuf {
        self.path.join("lock-server-running")
    }

    /// Lock held by a client while it attaches its consumer pipes.
    pub fn lock_client_starting(&self) -> PathBuf {
        self.path.join("lock-client-starting")
    }

    /// Helper diagnostic log.
    pub fn server_log(&self) -> PathBuf {
        self.path.join("server-log")
    }
}

/// Default session root: `$TMPDIR` when set and non-empty, `/tmp` otherwise.
pub fn default_root() -> PathBuf {
    match std::env::var_os(ROOT_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("/tmp"),
    }
}

/// Whether session directories should be preserved on close.
pub fn keep_for_debug() -> bool {
    std::env::var_os(DEBUG_ENV).is_some()
}

/// Generate a fresh session id: the random tail of a ULID, lowercased.
pub fn generate_session_id() -> String {
    let ulid = ulid::Ulid::new().to_string();
    ulid[ulid.len() - SESSION_ID_LEN..].to_ascii_lowercase()
}
