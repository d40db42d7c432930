//! One-call conveniences for running a command under a session.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::expect::Expect;
use crate::spawn::Spawn;
use crate::tail::{Tail, TailConfig};

/// Run `command` in the background with line callbacks, waiting up to
/// `wait` for it to finish before handing the session back.
pub fn run_tail(command: &str, config: TailConfig, wait: Duration) -> Result<Tail> {
    let tail = Tail::spawn_with_config(command, config)?;
    wait_while_alive(tail.session(), wait);
    Ok(tail)
}

/// Run `command` in the background with full expect services, waiting up
/// to `wait` for it to finish before handing the session back.
pub fn run_bg(command: &str, config: TailConfig, wait: Duration) -> Result<Expect> {
    let session = Expect::spawn_with_config(command, config)?;
    wait_while_alive(session.session(), wait);
    Ok(session)
}

/// Run `command` in the foreground: wait up to `timeout`, then return its
/// exit status (None when it was still running) and output, killing
/// whatever remains.
pub fn run_fg(
    command: &str,
    config: TailConfig,
    timeout: Duration,
) -> Result<(Option<i32>, Option<String>)> {
    let mut session = run_bg(command, config, timeout)?;
    let output = session.get_output();
    let status = if session.is_alive() {
        None
    } else {
        session.get_status()
    };
    session.close();
    Ok((status, output))
}

fn wait_while_alive(session: &Spawn, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline && session.is_alive() {
        std::thread::sleep(Duration::from_millis(100));
    }
}
