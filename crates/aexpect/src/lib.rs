//! Control long-running interactive processes through a supervised PTY.
//!
//! Each session pairs a client handle in this crate with a separate
//! `aexpect-helper` supervisor process that owns the child's pseudo
//! terminal, persists its combined stdout+stderr to disk, and fans the
//! stream out to any number of named FIFO consumers. Because the helper is
//! its own process, a session survives its client: any later process can
//! reattach with nothing but the session id.
//!
//! Handles are layered by capability:
//!
//! - [`Spawn`] — start or attach, send bytes, signal, query status/output.
//! - [`Tail`] — stream complete output lines to a callback in the
//!   background.
//! - [`Expect`] — synchronously wait for regex patterns in the output.
//! - [`ShellSession`] — run commands in an interactive shell and harvest
//!   their exit status.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use aexpect::ShellSession;
//!
//! let mut session = ShellSession::spawn("sh")?;
//! let (status, output) = session.cmd_status_output("uname -s")?;
//! assert_eq!(status, 0);
//! println!("kernel: {}", output.trim());
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod expect;
pub mod group;
mod matcher;
mod pipe;
mod process_tree;
mod run;
pub mod shell;
pub mod spawn;
pub mod tail;

pub use aexpect_core::{ControlFrame, ExpectError, ShellError, SpawnError};
pub use expect::Expect;
pub use group::SessionGroup;
pub use run::{run_bg, run_fg, run_tail};
pub use shell::{CmdOptions, ShellConfig, ShellSession};
pub use spawn::{Spawn, SpawnConfig};
pub use tail::{OutputFn, Tail, TailConfig, TerminationFn};

/// Signals accepted by [`Spawn::kill_with_signal`] and friends.
pub use nix::sys::signal::Signal;

/// Single-argument sink for lines observed while pattern matching.
pub type PrintFn = dyn FnMut(&str);
