//! Raw session handle: start a command under a helper-supervised PTY, or
//! attach to a session some earlier process started.

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use aexpect_core::{ControlFrame, SpawnError};
use aexpect_lock::{FileLock, is_file_locked, wait_for_lock};
use aexpect_session::{SessionDir, generate_session_id};

use crate::pipe::ConsumerPipe;
use crate::process_tree;

/// Name of the supervisor binary looked up on `$PATH`.
const HELPER_NAME: &str = "aexpect-helper";

/// Environment variable overriding helper binary discovery.
const HELPER_ENV: &str = "AEXPECT_HELPER";

/// Spawn-time session options.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Session id to use; a fresh one is generated when absent. Attaching
    /// always names an existing id.
    pub id: Option<String>,
    /// Close the session (killing the child) when the handle is dropped.
    pub auto_close: bool,
    /// Initial terminal echo policy; only meaningful when starting a new
    /// session.
    pub echo: bool,
    /// Line terminator appended by `sendline`.
    pub linesep: String,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            id: None,
            auto_close: false,
            echo: false,
            linesep: "\n".to_string(),
        }
    }
}

/// Handle to a supervised child process.
///
/// The handle shares no state with the helper beyond the session directory,
/// so it can be reconstructed at any time from the session id alone via
/// [`Spawn::attach`].
pub struct Spawn {
    dir: SessionDir,
    command: Option<String>,
    linesep: String,
    auto_close: bool,
    closed: bool,
    consumer_pipes: BTreeMap<String, ConsumerPipe>,
}

impl Spawn {
    /// Start `command` in a fresh session with default options.
    pub fn spawn(command: &str) -> Result<Spawn> {
        Self::start(Some(command), &[], &SpawnConfig::default())
    }

    /// Start `command` in a fresh session.
    pub fn spawn_with_config(command: &str, config: &SpawnConfig) -> Result<Spawn> {
        Self::start(Some(command), &[], config)
    }

    /// Attach to the already-running session `id`.
    pub fn attach(id: &str) -> Result<Spawn> {
        let config = SpawnConfig {
            id: Some(id.to_string()),
            ..SpawnConfig::default()
        };
        Self::start(None, &[], &config)
    }

    /// Start or attach, opening one consumer pipe per entry in `consumers`.
    /// Layered handles request their pipes through this entry point.
    pub(crate) fn start(
        command: Option<&str>,
        consumers: &[&str],
        config: &SpawnConfig,
    ) -> Result<Spawn> {
        let id = config
            .id
            .clone()
            .unwrap_or_else(generate_session_id);
        let dir = SessionDir::new(&id);
        dir.create()?;

        // Held until every consumer pipe is open: the helper will not tear
        // down the session while this lock exists, so even a child that
        // exits instantly cannot outrun the attachment.
        let starting_lock = FileLock::acquire(&dir.lock_client_starting(), "client attach")?;

        if let Some(command) = command {
            launch_helper(&dir, command, consumers, config.echo)?;
        }

        let mut consumer_pipes = BTreeMap::new();
        if is_file_locked(&dir.lock_server_running()) {
            for name in consumers {
                match ConsumerPipe::open(&dir.consumer_pipe(name)) {
                    Ok(pipe) => {
                        consumer_pipes.insert((*name).to_string(), pipe);
                    }
                    Err(e) => {
                        debug!(consumer = %name, error = %e, "could not open consumer pipe");
                    }
                }
            }
        }

        drop(starting_lock);

        Ok(Spawn {
            dir,
            command: command.map(str::to_string),
            linesep: config.linesep.clone(),
            auto_close: config.auto_close,
            closed: false,
            consumer_pipes,
        })
    }

    /// The session id; enough to reattach later from any process.
    pub fn id(&self) -> &str {
        self.dir.id()
    }

    /// The session directory backing this handle.
    pub fn session_path(&self) -> &Path {
        self.dir.path()
    }

    /// The command this handle started, absent when attached.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// PID of the child process. This may be the PID of the shell running
    /// the requested command rather than the command itself.
    pub fn get_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.dir.shell_pid_file())
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Wait for the process to exit and return its exit status, or `None`
    /// when no status was recorded.
    pub fn get_status(&self) -> Option<i32> {
        wait_for_lock(&self.dir.lock_server_running()).ok()?;
        std::fs::read_to_string(self.dir.status_file())
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Combined stdout+stderr produced so far, decoded lossily.
    pub fn get_output(&self) -> Option<String> {
        let bytes = std::fs::read(self.dir.output_file()).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Output so far with terminal escape sequences removed.
    pub fn get_stripped_output(&self) -> Option<String> {
        let bytes = std::fs::read(self.dir.output_file()).ok()?;
        let stripped = strip_ansi_escapes::strip(&bytes);
        Some(String::from_utf8_lossy(&stripped).into_owned())
    }

    /// Whether the session is still running. True exactly while the helper
    /// holds its lifetime lock.
    pub fn is_alive(&self) -> bool {
        is_file_locked(&self.dir.lock_server_running())
    }

    /// Whether the child or one of its direct children is a zombie.
    pub fn is_defunct(&self) -> bool {
        self.get_pid()
            .is_some_and(process_tree::tree_has_defunct)
    }

    /// Kill the child process tree with SIGKILL, if it is still alive.
    pub fn kill(&self) {
        self.kill_with_signal(Signal::SIGKILL);
    }

    /// Kill the child process tree with `sig`, if it is still alive.
    pub fn kill_with_signal(&self, sig: Signal) {
        if self.is_alive() {
            if let Some(pid) = self.get_pid() {
                process_tree::kill_process_tree(pid, sig);
            }
        }
    }

    /// Send bytes to the child's stdin. Silently succeeds if the child is
    /// gone; by then there is nobody left to care.
    pub fn send(&self, data: &[u8]) {
        let result = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.dir.inpipe())
            .and_then(|mut pipe| pipe.write_all(data));
        if let Err(e) = result {
            debug!(error = %e, "send to session stdin failed");
        }
    }

    /// Send a string followed by the configured line separator.
    pub fn sendline(&self, line: &str) {
        let mut data = Vec::with_capacity(line.len() + self.linesep.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(self.linesep.as_bytes());
        self.send(&data);
    }

    /// Send a control frame to the helper.
    pub fn send_ctrl(&self, frame: &ControlFrame) {
        let result = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.dir.ctrlpipe())
            .and_then(|mut pipe| pipe.write_all(&frame.encode()));
        if let Err(e) = result {
            debug!(error = %e, "send to session control pipe failed");
        }
    }

    /// Change the line separator used by [`Spawn::sendline`].
    pub fn set_linesep(&mut self, linesep: &str) {
        self.linesep = linesep.to_string();
    }

    /// The current line separator.
    pub fn linesep(&self) -> &str {
        &self.linesep
    }

    /// Terminate the session with SIGKILL and remove its directory.
    pub fn close(&mut self) {
        self.close_with_signal(Signal::SIGKILL);
    }

    /// Terminate the session and remove its directory. Idempotent and
    /// infallible: a session that is already gone has nothing left to do.
    pub fn close_with_signal(&mut self, sig: Signal) {
        if self.begin_close(sig) {
            self.finish_close();
        }
    }

    /// First half of close: kill the child and wait for the helper to
    /// exit. Returns false when the handle was already closed.
    pub(crate) fn begin_close(&mut self, sig: Signal) -> bool {
        if self.closed {
            return false;
        }
        self.kill_with_signal(sig);
        if let Err(e) = wait_for_lock(&self.dir.lock_server_running()) {
            debug!(error = %e, "waiting for helper exit failed");
        }
        true
    }

    /// Second half of close: release descriptors and remove the session
    /// directory, unless a debug run asked to keep it.
    pub(crate) fn finish_close(&mut self) {
        self.consumer_pipes.clear();
        if !aexpect_session::keep_for_debug() {
            if let Err(e) = self.dir.remove() {
                debug!(error = %e, "session directory removal failed");
            }
        }
        self.closed = true;
    }

    pub(crate) fn take_consumer(&mut self, name: &str) -> Option<ConsumerPipe> {
        self.consumer_pipes.remove(name)
    }

    pub(crate) fn session_dir(&self) -> &SessionDir {
        &self.dir
    }

    pub(crate) fn auto_close(&self) -> bool {
        self.auto_close
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Spawn {
    fn drop(&mut self) {
        if self.auto_close && !self.closed {
            self.close();
        }
    }
}

impl std::fmt::Debug for Spawn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawn")
            .field("id", &self.id())
            .field("command", &self.command)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Start the helper process and block until it reports readiness.
fn launch_helper(dir: &SessionDir, command: &str, consumers: &[&str], echo: bool) -> Result<()> {
    let helper = find_helper()?;
    debug!(helper = %helper.display(), id = dir.id(), command, "starting session helper");

    let mut child = Command::new(&helper)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to start {}", helper.display()))?;

    {
        let mut stdin = child.stdin.take().context("helper stdin unavailable")?;
        write!(
            stdin,
            "{}\n{}\n{}\n{}\n",
            dir.id(),
            echo,
            consumers.join(","),
            command
        )
        .context("failed to hand bootstrap to helper")?;
    }

    let stdout = child.stdout.take().context("helper stdout unavailable")?;
    let mut reader = BufReader::new(stdout);
    let sentinel = format!("Server {} ready", dir.id());
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .context("failed reading helper stdout")?;
        if n == 0 {
            return Err(SpawnError::HelperDied {
                id: dir.id().to_string(),
            })
            .with_context(|| format!("see {}", dir.server_log().display()));
        }
        if line.contains(&sentinel) {
            break;
        }
    }

    // The helper outlives this handle by design; reap it from a detached
    // thread so it never lingers as a zombie of a long-lived client.
    std::thread::Builder::new()
        .name("aexpect-reaper".to_string())
        .spawn(move || {
            let _ = child.wait();
        })
        .ok();

    Ok(())
}

/// Locate the helper binary: explicit override, `$PATH`, then next to the
/// current executable (the layout of a development build).
fn find_helper() -> Result<PathBuf, SpawnError> {
    if let Some(path) = std::env::var_os(HELPER_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }
    if let Ok(path) = which::which(HELPER_NAME) {
        return Ok(path);
    }
    if let Ok(exe) = std::env::current_exe() {
        for dir in exe.ancestors().skip(1).take(3) {
            let candidate = dir.join(HELPER_NAME);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(SpawnError::CommandNotFound(HELPER_NAME.to_string()))
}
