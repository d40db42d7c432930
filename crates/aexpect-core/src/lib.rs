//! Shared types for the aexpect session protocol.
//!
//! Independent crate with no internal aexpect dependencies: the error
//! taxonomy surfaced by the client library and the control-pipe frame codec
//! spoken between client and helper.

pub mod error;
pub mod frame;

pub use error::{ExpectError, ShellError, SpawnError};
pub use frame::{ControlFrame, FRAME_LEN_DIGITS, MAX_FRAME_LEN};
