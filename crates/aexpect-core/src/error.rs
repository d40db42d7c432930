//! Error taxonomy of the expect and shell layers.
//!
//! `ExpectError` covers pattern searches against raw child output;
//! `ShellError` covers command execution on top of an interactive shell and
//! always carries the offending command. The shell layer translates expect
//! errors into shell errors at its boundary.

/// Format a pattern list the way error messages refer to it.
fn pattern_str(patterns: &[String]) -> String {
    if patterns.len() == 1 {
        format!("pattern {:?}", patterns[0])
    } else {
        format!("patterns {patterns:?}")
    }
}

/// Errors raised while searching child output for regex patterns.
#[derive(thiserror::Error, Debug)]
pub enum ExpectError {
    #[error("Timeout expired while looking for {} (output: {output:?})", pattern_str(.patterns))]
    Timeout { patterns: Vec<String>, output: String },

    #[error(
        "Process terminated while looking for {} (status: {status:?}, output: {output:?})",
        pattern_str(.patterns)
    )]
    ProcessTerminated {
        patterns: Vec<String>,
        /// Exit status of the child, when the helper managed to record one.
        status: Option<i32>,
        output: String,
    },

    #[error("Invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error(
        "Unknown error occurred while looking for {} (output: {output:?})",
        pattern_str(.patterns)
    )]
    Unknown { patterns: Vec<String>, output: String },
}

impl ExpectError {
    /// The output accumulated before the failure, if any was captured.
    pub fn output(&self) -> &str {
        match self {
            Self::Timeout { output, .. }
            | Self::ProcessTerminated { output, .. }
            | Self::Unknown { output, .. } => output,
            Self::InvalidPattern(_) => "",
        }
    }
}

/// Errors raised while running commands in an interactive shell session.
#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    #[error(
        "Timeout expired while waiting for shell command to complete: {cmd:?} (output: {output:?})"
    )]
    Timeout { cmd: String, output: String },

    /// The shell process itself (e.g. ssh or telnet) went away mid-command.
    #[error(
        "Shell process terminated while waiting for command to complete: {cmd:?} \
         (status: {status:?}, output: {output:?})"
    )]
    ProcessTerminated {
        cmd: String,
        status: Option<i32>,
        output: String,
    },

    /// The command completed with an exit status outside the accepted set.
    #[error("Shell command failed: {cmd:?} (status: {status}, output: {output:?})")]
    CmdFailed {
        cmd: String,
        status: i32,
        output: String,
    },

    /// The exit-status probe produced nothing parseable.
    #[error("Could not get exit status of command: {cmd:?} (output: {output:?})")]
    StatusUnavailable { cmd: String, output: String },

    #[error("Could not execute shell command {cmd:?} (output: {output:?})")]
    Failed { cmd: String, output: String },
}

impl ShellError {
    /// The command whose execution failed.
    pub fn cmd(&self) -> &str {
        match self {
            Self::Timeout { cmd, .. }
            | Self::ProcessTerminated { cmd, .. }
            | Self::CmdFailed { cmd, .. }
            | Self::StatusUnavailable { cmd, .. }
            | Self::Failed { cmd, .. } => cmd,
        }
    }
}

/// Errors raised while starting or attaching to a session.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("Command '{0}' could not be found on PATH")]
    CommandNotFound(String),

    #[error("Helper for session '{id}' exited before becoming ready")]
    HelperDied { id: String },
}
