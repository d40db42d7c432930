//! Command execution on top of an interactive shell: send a command line,
//! read up to the next prompt, and harvest the exit status with a probe
//! command.

use anyhow::Result;
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use tracing::debug;

use aexpect_core::{ControlFrame, ExpectError, ShellError};

use crate::PrintFn;
use crate::expect::Expect;
use crate::spawn::SpawnConfig;
use crate::tail::TailConfig;

/// Prompt pattern matching the idle line of common POSIX shells.
pub const DEFAULT_PROMPT: &str = r"[\#\$]\s*$";

/// Probe command that prints the previous command's exit status.
pub const DEFAULT_STATUS_TEST_COMMAND: &str = "echo $?";

/// Slice used by safe-mode prompt reads between empty-line nudges.
const SAFE_PROMPT_SLICE: Duration = Duration::from_millis(500);

/// Shell-session options.
pub struct ShellConfig {
    pub tail: TailConfig,
    /// Regex describing the shell's idle prompt line.
    pub prompt: String,
    /// Command whose next output line carries the previous exit status.
    pub status_test_command: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            tail: TailConfig::default(),
            prompt: DEFAULT_PROMPT.to_string(),
            status_test_command: DEFAULT_STATUS_TEST_COMMAND.to_string(),
        }
    }
}

/// Per-command options.
#[derive(Debug, Clone)]
pub struct CmdOptions {
    /// Overall deadline for the prompt to come back.
    pub timeout: Duration,
    /// Per-read slice handed down to the expect engine.
    pub internal_timeout: Option<Duration>,
    /// Serial-console mode: retry the prompt in short slices, nudging the
    /// shell with an empty line whenever a slice times out.
    pub safe: bool,
    /// Exit statuses [`ShellSession::cmd_with`] accepts without error.
    pub ok_status: Vec<i32>,
    /// Swallow every shell error and return empty output instead.
    pub ignore_all_errors: bool,
}

impl Default for CmdOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            internal_timeout: None,
            safe: false,
            ok_status: vec![0],
            ignore_all_errors: false,
        }
    }
}

/// An interactive shell under a supervised PTY.
pub struct ShellSession {
    expect: Expect,
    prompt: String,
    status_test_command: String,
}

impl ShellSession {
    /// Start a shell with default options. Shell sessions close (and kill
    /// their child) on drop by default.
    pub fn spawn(command: &str) -> Result<ShellSession> {
        let config = ShellConfig {
            tail: TailConfig {
                spawn: SpawnConfig {
                    auto_close: true,
                    ..SpawnConfig::default()
                },
                ..TailConfig::default()
            },
            ..ShellConfig::default()
        };
        Self::spawn_with_config(command, config)
    }

    /// Start a shell with explicit options.
    pub fn spawn_with_config(command: &str, config: ShellConfig) -> Result<ShellSession> {
        let ShellConfig {
            tail,
            prompt,
            status_test_command,
        } = config;
        Ok(ShellSession {
            expect: Expect::spawn_with_config(command, tail)?,
            prompt,
            status_test_command,
        })
    }

    /// Attach to the already-running session `id`.
    pub fn attach(id: &str) -> Result<ShellSession> {
        Self::attach_with_config(id, ShellConfig::default())
    }

    /// Attach to the already-running session `id` with explicit options.
    pub fn attach_with_config(id: &str, config: ShellConfig) -> Result<ShellSession> {
        let ShellConfig {
            tail,
            prompt,
            status_test_command,
        } = config;
        Ok(ShellSession {
            expect: Expect::attach_with_config(id, tail)?,
            prompt,
            status_test_command,
        })
    }

    /// The expect layer under this handle.
    pub fn expect(&self) -> &Expect {
        &self.expect
    }

    /// Mutable access to the expect layer.
    pub fn expect_mut(&mut self) -> &mut Expect {
        &mut self.expect
    }

    /// Change the prompt pattern used to detect end-of-output.
    pub fn set_prompt(&mut self, prompt: &str) {
        self.prompt = prompt.to_string();
    }

    /// Change the exit-status probe command.
    pub fn set_status_test_command(&mut self, command: &str) {
        self.status_test_command = command.to_string();
    }

    /// Drop the leading command echo from `text` when the shell echoed it.
    pub fn remove_command_echo(text: &str, cmd: &str) -> String {
        match text.split_once('\n') {
            Some((first, rest)) if first == cmd => rest.to_string(),
            None if text == cmd => String::new(),
            _ => text.to_string(),
        }
    }

    /// Drop the final non-empty line of `text` (the prompt), keeping the
    /// line terminators of everything before it.
    pub fn remove_last_nonempty_line(text: &str) -> String {
        let trimmed = text.trim_end();
        match trimmed.rfind('\n') {
            Some(index) => trimmed[..=index].to_string(),
            None => String::new(),
        }
    }

    /// Whether the shell reacts to an empty input line within `timeout`.
    pub fn is_responsive(&mut self, timeout: Duration) -> bool {
        // Drain pending output so whatever arrives next is a reaction to
        // the newline sent below.
        self.expect
            .read_nonblocking(Some(Duration::ZERO), Some(timeout));
        self.sendline("");
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(500));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self
                .expect
                .read_nonblocking(Some(Duration::ZERO), Some(remaining))
                .trim()
                .is_empty()
            {
                return true;
            }
        }
        false
    }

    /// Read until the last non-empty line matches the prompt; returns
    /// everything read.
    pub fn read_up_to_prompt(
        &mut self,
        timeout: Duration,
        internal_timeout: Option<Duration>,
        print_func: Option<&mut PrintFn>,
    ) -> Result<String, ExpectError> {
        let prompt = self.prompt.clone();
        self.expect
            .read_until_last_line_matches(
                &[prompt.as_str()],
                timeout,
                internal_timeout,
                print_func,
            )
            .map(|(_, output)| output)
    }

    /// Run `cmd` and return its output, with a 60 s deadline.
    pub fn cmd_output(&mut self, cmd: &str) -> Result<String, ShellError> {
        self.cmd_output_with(cmd, &CmdOptions::default(), None)
    }

    /// Run `cmd` and return its output: drain the backlog, send the
    /// command line, read up to the prompt, then strip the command echo
    /// and the prompt line.
    pub fn cmd_output_with(
        &mut self,
        cmd: &str,
        options: &CmdOptions,
        print_func: Option<&mut PrintFn>,
    ) -> Result<String, ShellError> {
        if options.safe {
            return self.cmd_output_safe(cmd, options.timeout);
        }
        debug!(command = cmd, "sending shell command");
        self.expect
            .read_nonblocking(Some(Duration::ZERO), Some(options.timeout));
        self.sendline(cmd);
        match self.read_up_to_prompt(options.timeout, options.internal_timeout, print_func) {
            Ok(output) => Ok(Self::remove_last_nonempty_line(&Self::remove_command_echo(
                &output, cmd,
            ))),
            Err(e) => Err(shell_error_from_expect(e, cmd)),
        }
    }

    /// Serial-console variant of [`ShellSession::cmd_output`]: kernel noise
    /// can break a single prompt match, so the prompt is retried in short
    /// slices with an empty-line nudge after each miss.
    pub fn cmd_output_safe(&mut self, cmd: &str, timeout: Duration) -> Result<String, ShellError> {
        debug!(command = cmd, "sending shell command (safe mode)");
        self.expect
            .read_nonblocking(Some(Duration::ZERO), Some(timeout));
        self.sendline(cmd);

        let mut output = String::new();
        let deadline = Instant::now() + timeout;
        let mut matched = false;
        while Instant::now() < deadline {
            match self.read_up_to_prompt(SAFE_PROMPT_SLICE, None, None) {
                Ok(chunk) => {
                    output.push_str(&chunk);
                    matched = true;
                    break;
                }
                Err(ExpectError::Timeout {
                    output: chunk, ..
                }) => {
                    output.push_str(&chunk);
                    self.sendline("");
                }
                Err(ExpectError::ProcessTerminated {
                    status,
                    output: chunk,
                    ..
                }) => {
                    output.push_str(&chunk);
                    return Err(ShellError::ProcessTerminated {
                        cmd: cmd.to_string(),
                        status,
                        output: Self::remove_command_echo(&output, cmd),
                    });
                }
                Err(e) => {
                    output.push_str(e.output());
                    return Err(ShellError::Failed {
                        cmd: cmd.to_string(),
                        output: Self::remove_command_echo(&output, cmd),
                    });
                }
            }
        }
        if !matched {
            return Err(ShellError::Timeout {
                cmd: cmd.to_string(),
                output: Self::remove_command_echo(&output, cmd),
            });
        }
        Ok(Self::remove_last_nonempty_line(&Self::remove_command_echo(
            &output, cmd,
        )))
    }

    /// Run `cmd` and return `(exit status, output)`.
    pub fn cmd_status_output(&mut self, cmd: &str) -> Result<(i32, String), ShellError> {
        self.cmd_status_output_with(cmd, &CmdOptions::default(), None)
    }

    /// Run `cmd`, then the status probe, and return `(exit status,
    /// output)`. The status is the first output line of the probe that
    /// consists of decimal digits only.
    pub fn cmd_status_output_with(
        &mut self,
        cmd: &str,
        options: &CmdOptions,
        mut print_func: Option<&mut PrintFn>,
    ) -> Result<(i32, String), ShellError> {
        let output = self.cmd_output_with(cmd, options, reborrow(&mut print_func))?;

        let probe = self.status_test_command.clone();
        let probe_options = CmdOptions {
            timeout: Duration::from_secs(10),
            internal_timeout: options.internal_timeout,
            safe: options.safe,
            ..CmdOptions::default()
        };
        match self.cmd_output_with(&probe, &probe_options, reborrow(&mut print_func)) {
            Ok(probe_output) => match first_digits_line(&probe_output) {
                Some(status) => Ok((status, output)),
                None => Err(ShellError::StatusUnavailable {
                    cmd: cmd.to_string(),
                    output,
                }),
            },
            Err(_) => Err(ShellError::StatusUnavailable {
                cmd: cmd.to_string(),
                output,
            }),
        }
    }

    /// Run `cmd` and return its exit status.
    pub fn cmd_status(&mut self, cmd: &str) -> Result<i32, ShellError> {
        self.cmd_status_with(cmd, &CmdOptions::default(), None)
    }

    /// Run `cmd` and return its exit status.
    pub fn cmd_status_with(
        &mut self,
        cmd: &str,
        options: &CmdOptions,
        print_func: Option<&mut PrintFn>,
    ) -> Result<i32, ShellError> {
        self.cmd_status_output_with(cmd, options, print_func)
            .map(|(status, _)| status)
    }

    /// Run `cmd` and return its output, treating any exit status outside
    /// `ok_status` (default `[0]`) as an error.
    pub fn cmd(&mut self, cmd: &str) -> Result<String, ShellError> {
        self.cmd_with(cmd, &CmdOptions::default(), None)
    }

    /// Run `cmd` with explicit options; see [`ShellSession::cmd`].
    pub fn cmd_with(
        &mut self,
        cmd: &str,
        options: &CmdOptions,
        print_func: Option<&mut PrintFn>,
    ) -> Result<String, ShellError> {
        let result = match self.cmd_status_output_with(cmd, options, print_func) {
            Ok((status, output)) if options.ok_status.contains(&status) => return Ok(output),
            Ok((status, output)) => Err(ShellError::CmdFailed {
                cmd: cmd.to_string(),
                status,
                output,
            }),
            Err(e) => Err(e),
        };
        if options.ignore_all_errors {
            Ok(String::new())
        } else {
            result
        }
    }

    /// Terminate the session with SIGKILL.
    pub fn close(&mut self) {
        self.expect.close();
    }

    /// Terminate the session.
    pub fn close_with_signal(&mut self, sig: Signal) {
        self.expect.close_with_signal(sig);
    }

    // Passthroughs for the raw-handle operations used most.

    pub fn id(&self) -> &str {
        self.expect.id()
    }

    pub fn send(&self, data: &[u8]) {
        self.expect.send(data);
    }

    pub fn sendline(&self, line: &str) {
        self.expect.sendline(line);
    }

    pub fn send_ctrl(&self, frame: &ControlFrame) {
        self.expect.send_ctrl(frame);
    }

    pub fn get_pid(&self) -> Option<i32> {
        self.expect.get_pid()
    }

    pub fn get_status(&self) -> Option<i32> {
        self.expect.get_status()
    }

    pub fn get_output(&self) -> Option<String> {
        self.expect.get_output()
    }

    pub fn is_alive(&self) -> bool {
        self.expect.is_alive()
    }

    pub fn kill(&self) {
        self.expect.kill();
    }
}

/// Map an expect-layer failure onto the shell error carrying the command,
/// with the command echo stripped from the partial output.
fn shell_error_from_expect(err: ExpectError, cmd: &str) -> ShellError {
    let output = ShellSession::remove_command_echo(err.output(), cmd);
    match err {
        ExpectError::Timeout { .. } => ShellError::Timeout {
            cmd: cmd.to_string(),
            output,
        },
        ExpectError::ProcessTerminated { status, .. } => ShellError::ProcessTerminated {
            cmd: cmd.to_string(),
            status,
            output,
        },
        _ => ShellError::Failed {
            cmd: cmd.to_string(),
            output,
        },
    }
}

/// First line consisting solely of decimal digits, parsed.
fn first_digits_line(text: &str) -> Option<i32> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
        .and_then(|line| line.parse().ok())
}

fn reborrow<'a>(print_func: &'a mut Option<&mut PrintFn>) -> Option<&'a mut PrintFn> {
    print_func.as_mut().map(|f| &mut **f)
}
