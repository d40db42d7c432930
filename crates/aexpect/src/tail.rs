//! Background line streaming: a worker thread reads the session's `tail`
//! consumer pipe and hands every complete output line to a callback.

use anyhow::Result;
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

use aexpect_core::ControlFrame;
use aexpect_lock::wait_for_lock;
use aexpect_session::SessionDir;

use crate::group::SessionGroup;
use crate::pipe::ConsumerPipe;
use crate::spawn::{Spawn, SpawnConfig};

/// Called with every complete line of child output (prefix applied,
/// trailing whitespace removed).
pub type OutputFn = Box<dyn FnMut(&str) + Send>;

/// Called exactly once with the child's exit status, after the final flush.
pub type TerminationFn = Box<dyn FnOnce(i32) + Send>;

/// Consumer pipe name used by the tail worker.
pub(crate) const TAIL_CONSUMER: &str = "tail";

/// Poll slice of the worker; also the quiet interval after which a partial
/// line is flushed so promptless output still surfaces.
const TAIL_POLL_SLICE: Duration = Duration::from_millis(50);

/// Tail-session options: spawn options plus the output callbacks.
#[derive(Default)]
pub struct TailConfig {
    pub spawn: SpawnConfig,
    /// Prepended to every line handed to `output_func`.
    pub output_prefix: String,
    pub output_func: Option<OutputFn>,
    pub termination_func: Option<TerminationFn>,
    /// Group coordinating shutdown of this tail's worker.
    pub group: Option<SessionGroup>,
}

struct Callbacks {
    output: Option<OutputFn>,
    termination: Option<TerminationFn>,
    prefix: String,
}

/// A session that streams its output lines to a callback in real time.
pub struct Tail {
    session: Spawn,
    callbacks: Arc<Mutex<Callbacks>>,
    group: Option<SessionGroup>,
    worker: Option<JoinHandle<()>>,
}

impl Tail {
    /// Start `command` in a fresh session with no callbacks configured.
    pub fn spawn(command: &str) -> Result<Tail> {
        Self::spawn_with_config(command, TailConfig::default())
    }

    /// Start `command` in a fresh session.
    pub fn spawn_with_config(command: &str, config: TailConfig) -> Result<Tail> {
        Self::start(Some(command), &[TAIL_CONSUMER], config)
    }

    /// Attach to the already-running session `id`.
    pub fn attach(id: &str) -> Result<Tail> {
        Self::attach_with_config(id, TailConfig::default())
    }

    /// Attach to the already-running session `id`.
    pub fn attach_with_config(id: &str, mut config: TailConfig) -> Result<Tail> {
        config.spawn.id = Some(id.to_string());
        Self::start(None, &[TAIL_CONSUMER], config)
    }

    pub(crate) fn start(
        command: Option<&str>,
        consumers: &[&str],
        config: TailConfig,
    ) -> Result<Tail> {
        let TailConfig {
            spawn,
            output_prefix,
            output_func,
            termination_func,
            group,
        } = config;

        let session = Spawn::start(command, consumers, &spawn)?;
        let has_callbacks = output_func.is_some() || termination_func.is_some();
        let callbacks = Arc::new(Mutex::new(Callbacks {
            output: output_func,
            termination: termination_func,
            prefix: output_prefix,
        }));

        let mut tail = Tail {
            session,
            callbacks,
            group,
            worker: None,
        };
        if has_callbacks {
            tail.start_worker();
        }
        Ok(tail)
    }

    /// The underlying raw handle.
    pub fn session(&self) -> &Spawn {
        &self.session
    }

    /// Mutable access to the underlying raw handle.
    pub fn session_mut(&mut self) -> &mut Spawn {
        &mut self.session
    }

    /// Replace the line callback; starts the worker if necessary.
    pub fn set_output_func(&mut self, output_func: impl FnMut(&str) + Send + 'static) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.output = Some(Box::new(output_func));
        }
        self.start_worker();
    }

    /// Replace the termination callback; starts the worker if necessary.
    pub fn set_termination_func(&mut self, termination_func: impl FnOnce(i32) + Send + 'static) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.termination = Some(Box::new(termination_func));
        }
        self.start_worker();
    }

    /// Change the prefix applied to every delivered line.
    pub fn set_output_prefix(&mut self, prefix: &str) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.prefix = prefix.to_string();
        }
    }

    fn start_worker(&mut self) {
        if self.worker.is_some() || self.session.is_closed() {
            return;
        }

        let pipe = self.session.take_consumer(TAIL_CONSUMER);
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        if let Some(group) = &self.group {
            group.register(stop.clone(), finished.clone());
        }

        let callbacks = self.callbacks.clone();
        let dir = self.session.session_dir().clone();
        let spawned = std::thread::Builder::new()
            .name(format!("aexpect-tail-{}", self.session.id()))
            .spawn(move || {
                let _guard = FinishedGuard(finished);
                tail_worker(pipe, &dir, &callbacks, &stop);
            });
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => warn!(error = %e, "failed to start tail worker"),
        }
    }

    /// Terminate the session with SIGKILL; the worker drains the remaining
    /// output and delivers the termination callback before this returns.
    pub fn close(&mut self) {
        self.close_with_signal(Signal::SIGKILL);
    }

    /// Terminate the session; see [`Tail::close`].
    pub fn close_with_signal(&mut self, sig: Signal) {
        if self.session.begin_close(sig) {
            self.join_worker();
            self.session.finish_close();
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("tail worker panicked");
            }
        }
    }

    // Passthroughs for the raw-handle operations used most.

    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn send(&self, data: &[u8]) {
        self.session.send(data);
    }

    pub fn sendline(&self, line: &str) {
        self.session.sendline(line);
    }

    pub fn send_ctrl(&self, frame: &ControlFrame) {
        self.session.send_ctrl(frame);
    }

    pub fn get_pid(&self) -> Option<i32> {
        self.session.get_pid()
    }

    pub fn get_status(&self) -> Option<i32> {
        self.session.get_status()
    }

    pub fn get_output(&self) -> Option<String> {
        self.session.get_output()
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }

    pub fn kill(&self) {
        self.session.kill();
    }
}

impl Drop for Tail {
    fn drop(&mut self) {
        if self.session.auto_close() && !self.session.is_closed() {
            self.close();
        }
    }
}

struct FinishedGuard(Arc<AtomicBool>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Worker loop. `pipe` is `None` when the session was already gone at
/// attach time; the exit-status report still runs.
fn tail_worker(
    pipe: Option<ConsumerPipe>,
    dir: &SessionDir,
    callbacks: &Mutex<Callbacks>,
    stop: &AtomicBool,
) {
    let mut buffer: Vec<u8> = Vec::new();

    if let Some(mut pipe) = pipe {
        let mut chunk = [0u8; 1024];
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            match pipe.poll_readable(TAIL_POLL_SLICE) {
                Ok(true) => match pipe.read_chunk(&mut chunk) {
                    Ok(Some(0)) => break,
                    Ok(Some(n)) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        emit_complete_lines(&mut buffer, callbacks);
                    }
                    Ok(None) => {}
                    Err(_) => break,
                },
                Ok(false) => {
                    // Quiet slice: surface a promptless partial line.
                    if !buffer.is_empty() {
                        let text = String::from_utf8_lossy(&buffer).into_owned();
                        buffer.clear();
                        emit_line(callbacks, &text);
                    }
                }
                Err(_) => break,
            }
        }
    }

    if !buffer.is_empty() {
        emit_line(callbacks, &String::from_utf8_lossy(&buffer));
    }

    let Some(status) = read_status(dir) else {
        return;
    };
    emit_line(callbacks, &format!("(Process terminated with status {status})"));
    let termination = callbacks
        .lock()
        .ok()
        .and_then(|mut callbacks| callbacks.termination.take());
    if let Some(termination) = termination {
        termination(status);
    }
}

/// Wait for the helper to exit, then read the recorded status.
fn read_status(dir: &SessionDir) -> Option<i32> {
    wait_for_lock(&dir.lock_server_running()).ok()?;
    std::fs::read_to_string(dir.status_file())
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn emit_complete_lines(buffer: &mut Vec<u8>, callbacks: &Mutex<Callbacks>) {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        emit_line(callbacks, &String::from_utf8_lossy(&line));
    }
}

fn emit_line(callbacks: &Mutex<Callbacks>, text: &str) {
    let Ok(mut callbacks) = callbacks.lock() else {
        return;
    };
    let line = format!("{}{}", callbacks.prefix, text.trim_end());
    if let Some(output) = callbacks.output.as_mut() {
        output(&line);
    }
}
