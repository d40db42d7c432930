//! Synchronous pattern matching over child output.
//!
//! An [`Expect`] session owns a dedicated `expect` consumer pipe, separate
//! from the tail worker's pipe, so blocking reads here never compete with
//! the background line streaming. The engine accumulates raw bytes and
//! decodes lossily at the API boundary.

use anyhow::Result;
use nix::sys::signal::Signal;
use regex::Regex;
use std::time::{Duration, Instant};

use aexpect_core::{ControlFrame, ExpectError};

use crate::PrintFn;
use crate::matcher::{
    compile_patterns, last_nonempty_line, last_word, match_patterns, match_patterns_multiline,
};
use crate::pipe::ConsumerPipe;
use crate::spawn::SpawnConfig;
use crate::tail::{TAIL_CONSUMER, Tail, TailConfig};

/// Consumer pipe name used by the expect engine.
pub(crate) const EXPECT_CONSUMER: &str = "expect";

/// Bytes read from the pipe per ready cycle.
const READ_CHUNK: usize = 1024;

/// Default per-poll slice of [`Expect::read_nonblocking`].
const DEFAULT_INTERNAL_TIMEOUT: Duration = Duration::from_millis(100);

/// How long to wait for the session to be confirmed dead after the pipe
/// reports EOF.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// A session with expect-style pattern matching on top of tailing.
pub struct Expect {
    tail: Tail,
    pipe: Option<ConsumerPipe>,
}

impl Expect {
    /// Start `command` in a fresh session. Expect sessions close (and kill
    /// their child) on drop by default.
    pub fn spawn(command: &str) -> Result<Expect> {
        let config = TailConfig {
            spawn: SpawnConfig {
                auto_close: true,
                ..SpawnConfig::default()
            },
            ..TailConfig::default()
        };
        Self::spawn_with_config(command, config)
    }

    /// Start `command` in a fresh session with explicit options.
    pub fn spawn_with_config(command: &str, config: TailConfig) -> Result<Expect> {
        Self::start(Some(command), config)
    }

    /// Attach to the already-running session `id`.
    pub fn attach(id: &str) -> Result<Expect> {
        Self::attach_with_config(id, TailConfig::default())
    }

    /// Attach to the already-running session `id` with explicit options.
    pub fn attach_with_config(id: &str, mut config: TailConfig) -> Result<Expect> {
        config.spawn.id = Some(id.to_string());
        Self::start(None, config)
    }

    fn start(command: Option<&str>, config: TailConfig) -> Result<Expect> {
        let mut tail = Tail::start(command, &[TAIL_CONSUMER, EXPECT_CONSUMER], config)?;
        let pipe = tail.session_mut().take_consumer(EXPECT_CONSUMER);
        Ok(Expect { tail, pipe })
    }

    /// The tail layer under this handle.
    pub fn tail(&self) -> &Tail {
        &self.tail
    }

    /// Mutable access to the tail layer.
    pub fn tail_mut(&mut self) -> &mut Tail {
        &mut self.tail
    }

    /// The raw session handle.
    pub fn session(&self) -> &crate::Spawn {
        self.tail.session()
    }

    /// Mutable access to the raw session handle.
    pub fn session_mut(&mut self) -> &mut crate::Spawn {
        self.tail.session_mut()
    }

    /// Read whatever the child has produced, waiting at most
    /// `internal_timeout` (default 100 ms) for each quiet stretch and
    /// `timeout` overall. Returns an empty string when nothing arrived.
    pub fn read_nonblocking(
        &mut self,
        internal_timeout: Option<Duration>,
        timeout: Option<Duration>,
    ) -> String {
        let bytes = self.read_nonblocking_bytes(internal_timeout, timeout);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn read_nonblocking_bytes(
        &mut self,
        internal_timeout: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Vec<u8> {
        let internal = internal_timeout.unwrap_or(DEFAULT_INTERNAL_TIMEOUT);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut data = Vec::new();
        let Some(pipe) = self.pipe.as_mut() else {
            return data;
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match pipe.poll_readable(internal) {
                Ok(true) => match pipe.read_chunk(&mut chunk) {
                    Ok(Some(0)) => return data,
                    Ok(Some(n)) => data.extend_from_slice(&chunk[..n]),
                    Ok(None) => {}
                    Err(_) => return data,
                },
                Ok(false) | Err(_) => return data,
            }
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return data;
                }
            }
        }
    }

    /// Read until `filter(accumulated output)` matches one of `patterns`.
    ///
    /// The single-string matcher scans patterns first to last and returns
    /// the index of the first one with a substring match; empty patterns
    /// are skipped but keep their index. On success the match index and
    /// everything read so far are returned.
    ///
    /// # Errors
    ///
    /// [`ExpectError::Timeout`] when the deadline passes,
    /// [`ExpectError::ProcessTerminated`] when the child died first, and
    /// [`ExpectError::Unknown`] when the pipe failed with the session still
    /// alive.
    pub fn read_until_output_matches<F>(
        &mut self,
        patterns: &[&str],
        filter: F,
        timeout: Duration,
        internal_timeout: Option<Duration>,
        print_func: Option<&mut PrintFn>,
    ) -> Result<(usize, String), ExpectError>
    where
        F: Fn(&str) -> String,
    {
        self.read_until_match(patterns, timeout, internal_timeout, print_func, |text, regexes| {
            match_patterns(&filter(text), regexes)
        })
    }

    /// Read until the last whitespace-delimited token of the output
    /// matches one of `patterns`.
    pub fn read_until_last_word_matches(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
        internal_timeout: Option<Duration>,
        print_func: Option<&mut PrintFn>,
    ) -> Result<(usize, String), ExpectError> {
        self.read_until_output_matches(
            patterns,
            |text| last_word(text).to_string(),
            timeout,
            internal_timeout,
            print_func,
        )
    }

    /// Read until the last non-empty line of the output matches one of
    /// `patterns`. This is the filter shell prompts are detected with: a
    /// prompt only counts when nothing follows it.
    pub fn read_until_last_line_matches(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
        internal_timeout: Option<Duration>,
        print_func: Option<&mut PrintFn>,
    ) -> Result<(usize, String), ExpectError> {
        self.read_until_output_matches(
            patterns,
            |text| last_nonempty_line(text).to_string(),
            timeout,
            internal_timeout,
            print_func,
        )
    }

    /// Read until any line of the output matches one of `patterns`.
    /// Pattern priority runs from the last entry to the first.
    pub fn read_until_any_line_matches(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
        internal_timeout: Option<Duration>,
        print_func: Option<&mut PrintFn>,
    ) -> Result<(usize, String), ExpectError> {
        self.read_until_match(patterns, timeout, internal_timeout, print_func, |text, regexes| {
            let lines: Vec<&str> = text.lines().collect();
            match_patterns_multiline(&lines, regexes)
        })
    }

    fn read_until_match(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
        internal_timeout: Option<Duration>,
        mut print_func: Option<&mut PrintFn>,
        matcher: impl Fn(&str, &[Option<Regex>]) -> Option<usize>,
    ) -> Result<(usize, String), ExpectError> {
        let regexes = compile_patterns(patterns)?;
        let owned_patterns = || patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        let deadline = Instant::now() + timeout;
        let mut accumulated: Vec<u8> = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ExpectError::Timeout {
                    patterns: owned_patterns(),
                    output: String::from_utf8_lossy(&accumulated).into_owned(),
                });
            }

            let readable = match self.pipe.as_ref() {
                // A missing pipe behaves like EOF: fall through to the
                // liveness check below.
                None => break,
                Some(pipe) => match pipe.poll_readable(remaining) {
                    Ok(readable) => readable,
                    Err(_) => break,
                },
            };
            if !readable {
                return Err(ExpectError::Timeout {
                    patterns: owned_patterns(),
                    output: String::from_utf8_lossy(&accumulated).into_owned(),
                });
            }

            let data = self.read_nonblocking_bytes(
                internal_timeout,
                Some(deadline.saturating_duration_since(Instant::now())),
            );
            if data.is_empty() {
                break;
            }
            if let Some(print) = print_func.as_mut() {
                for line in String::from_utf8_lossy(&data).lines() {
                    print(line);
                }
            }
            accumulated.extend_from_slice(&data);

            let text = String::from_utf8_lossy(&accumulated);
            if let Some(index) = matcher(&text, &regexes) {
                return Ok((index, text.into_owned()));
            }
        }

        // The pipe reported EOF; only a confirmed-dead session justifies a
        // termination error.
        let output = String::from_utf8_lossy(&accumulated).into_owned();
        if wait_until(
            || !self.is_alive(),
            TERMINATION_GRACE,
            Duration::from_millis(100),
        ) {
            Err(ExpectError::ProcessTerminated {
                patterns: owned_patterns(),
                status: self.get_status(),
                output,
            })
        } else {
            Err(ExpectError::Unknown {
                patterns: owned_patterns(),
                output,
            })
        }
    }

    /// Terminate the session with SIGKILL.
    pub fn close(&mut self) {
        self.close_with_signal(Signal::SIGKILL);
    }

    /// Terminate the session.
    pub fn close_with_signal(&mut self, sig: Signal) {
        self.pipe = None;
        self.tail.close_with_signal(sig);
    }

    // Passthroughs for the raw-handle operations used most.

    pub fn id(&self) -> &str {
        self.tail.id()
    }

    pub fn send(&self, data: &[u8]) {
        self.tail.send(data);
    }

    pub fn sendline(&self, line: &str) {
        self.tail.sendline(line);
    }

    pub fn send_ctrl(&self, frame: &ControlFrame) {
        self.tail.send_ctrl(frame);
    }

    pub fn get_pid(&self) -> Option<i32> {
        self.tail.get_pid()
    }

    pub fn get_status(&self) -> Option<i32> {
        self.tail.get_status()
    }

    pub fn get_output(&self) -> Option<String> {
        self.tail.get_output()
    }

    pub fn is_alive(&self) -> bool {
        self.tail.is_alive()
    }

    pub fn kill(&self) {
        self.tail.kill();
    }
}

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration, step: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_until_true_immediately() {
        let started = Instant::now();
        assert!(wait_until(
            || true,
            Duration::from_secs(5),
            Duration::from_millis(100)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_until_gives_up() {
        assert!(!wait_until(
            || false,
            Duration::from_millis(100),
            Duration::from_millis(10)
        ));
    }
}
