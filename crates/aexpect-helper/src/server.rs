//! The session supervisor: owns the child's PTY master and multiplexes its
//! output to the session's output file and every consumer FIFO, while
//! feeding stdin bytes and control frames back in.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use aexpect_core::frame::{ControlFrame, FRAME_LEN_DIGITS, decode_length};
use aexpect_session::SessionDir;

use crate::bootstrap::Bootstrap;
use crate::pty::{self, PtyChild};

/// Bytes read from the PTY master per readiness cycle.
const PTY_CHUNK: usize = 4096;

/// Main-loop poll slice; bounds the latency of child-reap detection.
const POLL_SLICE_MS: u8 = 100;

/// How long a consumer FIFO may refuse data before it is dropped.
const CONSUMER_STALL_LIMIT: Duration = Duration::from_millis(250);

/// One fan-out target. The write side is opened read+write so the open
/// never blocks and a vanished reader shows up as a persistent would-block
/// instead of EPIPE.
struct Consumer {
    name: String,
    file: File,
}

impl Consumer {
    /// Forward one chunk. Returns false when the consumer should be
    /// dropped: write error, or stalled past [`CONSUMER_STALL_LIMIT`].
    fn forward(&mut self, data: &[u8]) -> bool {
        let deadline = Instant::now() + CONSUMER_STALL_LIMIT;
        let mut offset = 0;
        while offset < data.len() {
            match (&self.file).write(&data[offset..]) {
                Ok(n) => offset += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        debug!(consumer = %self.name, "dropping stalled consumer");
                        return false;
                    }
                    let _ = wait_fd(&self.file, PollFlags::POLLOUT, Duration::from_millis(10));
                }
                Err(e) => {
                    debug!(consumer = %self.name, error = %e, "dropping consumer");
                    return false;
                }
            }
        }
        true
    }
}

pub struct Server {
    dir: SessionDir,
    echo: bool,
    master: File,
    child: Child,
    output: File,
    inpipe: File,
    ctrlpipe: File,
    consumers: Vec<Consumer>,
}

impl Server {
    /// Populate the session directory and fork the child: create the FIFOs,
    /// open every descriptor the main loop needs, spawn the command under a
    /// fresh PTY, and record its pid.
    pub fn initialise(dir: SessionDir, bootstrap: &Bootstrap) -> Result<Server> {
        make_fifo(&dir.inpipe())?;
        make_fifo(&dir.ctrlpipe())?;

        let mut consumers = Vec::with_capacity(bootstrap.consumers.len());
        for name in &bootstrap.consumers {
            let path = dir.consumer_pipe(name);
            make_fifo(&path)?;
            let file = open_rw_nonblock(&path)?;
            debug!(consumer = %name, "consumer pipe ready");
            consumers.push(Consumer {
                name: name.clone(),
                file,
            });
        }

        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.output_file())
            .with_context(|| format!("failed to open {}", dir.output_file().display()))?;
        let inpipe = open_rw_nonblock(&dir.inpipe())?;
        let ctrlpipe = open_rw_nonblock(&dir.ctrlpipe())?;

        let PtyChild { master, child } = pty::spawn_shell(&bootstrap.command, bootstrap.echo)?;
        std::fs::write(dir.shell_pid_file(), format!("{}\n", child.id()))
            .context("failed to record child pid")?;
        info!(pid = child.id(), command = %bootstrap.command, "child forked under pty");

        Ok(Server {
            dir,
            echo: bootstrap.echo,
            master,
            child,
            output,
            inpipe,
            ctrlpipe,
            consumers,
        })
    }

    /// Run the forwarding loop until the child goes away, then reap it,
    /// record its exit status, and return it.
    pub fn run(&mut self) -> Result<i32> {
        let mut buf = [0u8; PTY_CHUNK];
        let mut reaped: Option<ExitStatus> = None;

        loop {
            let mut fds = [
                PollFd::new(self.master.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.inpipe.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.ctrlpipe.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(POLL_SLICE_MS)) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("poll on session descriptors failed"),
            }
            let master_ready = readable(&fds[0]);
            let inpipe_ready = readable(&fds[1]);
            let ctrl_ready = readable(&fds[2]);

            if inpipe_ready {
                self.pump_stdin(&mut buf);
            }
            if ctrl_ready {
                self.pump_control();
            }
            if master_ready && self.pump_master(&mut buf)? {
                break;
            }

            if reaped.is_none() {
                reaped = self
                    .child
                    .try_wait()
                    .context("failed checking child status")?;
            }
            if reaped.is_some() {
                // Child is gone; forward whatever the PTY still buffers.
                self.drain_master(&mut buf)?;
                break;
            }
        }

        let status = match reaped {
            Some(status) => status,
            None => self.child.wait().context("failed to reap child")?,
        };
        let code = exit_code(status);
        std::fs::write(self.dir.status_file(), format!("{code}\n"))
            .context("failed to record exit status")?;
        info!(status = code, "child exited");
        Ok(code)
    }

    /// Read one chunk from the master and fan it out. Returns true on EOF.
    fn pump_master(&mut self, buf: &mut [u8]) -> Result<bool> {
        match (&self.master).read(buf) {
            Ok(0) => Ok(true),
            Ok(n) => {
                self.forward(n, buf)?;
                Ok(false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            // EIO is how a Linux PTY master reports that the slave side is
            // fully closed.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(true),
            Err(e) => Err(e).context("read from pty master failed"),
        }
    }

    fn forward(&mut self, n: usize, buf: &[u8]) -> Result<()> {
        let data = &buf[..n];
        self.output
            .write_all(data)
            .context("write to output file failed")?;
        self.consumers.retain_mut(|consumer| consumer.forward(data));
        Ok(())
    }

    /// Read the master dry after the child has been reaped.
    fn drain_master(&mut self, buf: &mut [u8]) -> Result<()> {
        loop {
            match (&self.master).read(buf) {
                Ok(0) => return Ok(()),
                Ok(n) => self.forward(n, buf)?,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(()),
                Err(e) => return Err(e).context("draining pty master failed"),
            }
        }
    }

    /// Splice pending stdin bytes to the child's terminal.
    fn pump_stdin(&mut self, buf: &mut [u8]) {
        loop {
            match (&self.inpipe).read(buf) {
                Ok(0) => return,
                Ok(n) => {
                    if let Err(e) = write_all_pty(&self.master, &buf[..n]) {
                        warn!(error = %e, "write to pty master failed");
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "read from inpipe failed");
                    return;
                }
            }
        }
    }

    /// Consume pending control frames.
    fn pump_control(&mut self) {
        loop {
            let mut header = [0u8; FRAME_LEN_DIGITS];
            match read_exact_deadline(&self.ctrlpipe, &mut header) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(error = %e, "read from ctrlpipe failed");
                    return;
                }
            }

            let Some(len) = decode_length(&header) else {
                warn!("rejecting control frame with malformed length header");
                self.discard_control_backlog();
                return;
            };

            let mut payload = vec![0u8; len];
            match read_exact_deadline(&self.ctrlpipe, &mut payload) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(len, "control frame payload truncated");
                    return;
                }
            }

            match ControlFrame::parse(&payload) {
                Some(frame) => self.apply_frame(frame),
                None => {
                    debug!(
                        payload = %String::from_utf8_lossy(&payload),
                        "dropping unknown control frame"
                    );
                }
            }
        }
    }

    fn apply_frame(&mut self, frame: ControlFrame) {
        debug!(?frame, "applying control frame");
        let result = match frame {
            ControlFrame::Raw => pty::make_raw(&self.master),
            ControlFrame::Cooked => pty::make_standard(&self.master, self.echo),
            ControlFrame::Winch { rows, cols } => pty::set_winsize(&self.master, rows, cols),
        };
        if let Err(e) = result {
            warn!(?frame, error = %e, "control frame failed");
        }
    }

    /// After a framing error the stream position is unknown; drop whatever
    /// is pending so the next frame starts clean.
    fn discard_control_backlog(&mut self) {
        let mut sink = [0u8; 256];
        while matches!((&self.ctrlpipe).read(&mut sink), Ok(n) if n > 0) {}
    }
}

/// Map a wait status to the decimal status recorded for clients: the exit
/// code, or 128 plus the signal number for signal-killed children.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .unwrap_or(PollFlags::empty())
        .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
}

fn make_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("mkfifo {} failed", path.display())),
    }
}

fn open_rw_nonblock(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

/// Block (via short poll slices) until the whole chunk reaches the child's
/// terminal; the master is non-blocking but stdin traffic must not be lost.
fn write_all_pty(master: &File, data: &[u8]) -> std::io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        match (&*master).write(&data[offset..]) {
            Ok(n) => offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let _ = wait_fd(master, PollFlags::POLLOUT, Duration::from_millis(100));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fill `buf` from a non-blocking fd, waiting in short slices for the rest
/// of a partially-arrived frame. `Ok(false)` means no data at all.
fn read_exact_deadline(fd: &File, buf: &mut [u8]) -> std::io::Result<bool> {
    let deadline = Instant::now() + Duration::from_millis(200);
    let mut offset = 0;
    while offset < buf.len() {
        match (&*fd).read(&mut buf[offset..]) {
            Ok(0) => return Ok(offset > 0 && offset == buf.len()),
            Ok(n) => offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if offset == 0 {
                    return Ok(false);
                }
                if Instant::now() >= deadline {
                    return Err(std::io::Error::from(std::io::ErrorKind::TimedOut));
                }
                let _ = wait_fd(fd, PollFlags::POLLIN, Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn wait_fd(fd: &File, flags: PollFlags, timeout: Duration) -> nix::Result<i32> {
    let mut fds = [PollFd::new(fd.as_fd(), flags)];
    let millis = u8::try_from(timeout.as_millis()).unwrap_or(u8::MAX);
    poll(&mut fds, PollTimeout::from(millis))
}
