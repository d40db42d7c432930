//! PTY allocation, terminal modes, and child process setup.

use anyhow::{Context, Result};
use nix::pty::{Winsize, openpty};
use nix::sys::termios::{
    InputFlags, LocalFlags, OutputFlags, SetArg, cfmakeraw, tcgetattr, tcsetattr,
};
use nix::unistd::{dup, setsid};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

/// A command forked as the controlling process of a fresh pseudo terminal.
pub struct PtyChild {
    /// Master side of the pty; non-blocking.
    pub master: File,
    pub child: Child,
}

/// Allocate a PTY and run `command` through `/bin/sh -c` as the slave's
/// controlling process. The returned master is non-blocking and already in
/// the standard terminal mode for the given echo policy.
pub fn spawn_shell(command: &str, echo: bool) -> Result<PtyChild> {
    let pty = openpty(
        Some(&Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }),
        None,
    )
    .context("failed to allocate PTY")?;

    let slave_fd_raw = pty.slave.as_raw_fd();
    let stdin_fd = dup(slave_fd_raw).context("failed to dup PTY slave for stdin")?;
    let stdout_fd = dup(slave_fd_raw).context("failed to dup PTY slave for stdout")?;
    let stderr_fd = dup(slave_fd_raw).context("failed to dup PTY slave for stderr")?;

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::from(File::from(raw_fd_to_owned_fd(stdin_fd))))
        .stdout(Stdio::from(File::from(raw_fd_to_owned_fd(stdout_fd))))
        .stderr(Stdio::from(File::from(raw_fd_to_owned_fd(stderr_fd))));

    // SAFETY: `pre_exec` runs in the child process before `exec`. We only
    // call async-signal-safe operations (`setsid`, `ioctl(TIOCSCTTY)`) and
    // return an `io::Result` without touching shared Rust state.
    unsafe {
        cmd.pre_exec(move || {
            setsid().map_err(nix_errno_to_io_error)?;
            // SAFETY: ioctl with TIOCSCTTY establishes the PTY slave as the
            // controlling terminal for this freshly-created session.
            let rc = libc::ioctl(slave_fd_raw, libc::TIOCSCTTY as _, 0);
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn '/bin/sh -c {command}'"))?;

    // Parent no longer needs the slave side.
    drop(pty.slave);

    let master = File::from(pty.master);
    set_nonblocking(&master)?;
    make_standard(&master, echo)?;

    Ok(PtyChild { master, child })
}

/// Apply the standard terminal mode: no CR/NL translation on input, no
/// output post-processing, echo per policy.
pub fn make_standard(fd: &File, echo: bool) -> Result<()> {
    let mut attrs = tcgetattr(fd).context("tcgetattr on pty master failed")?;
    attrs
        .input_flags
        .remove(InputFlags::INLCR | InputFlags::ICRNL | InputFlags::IGNCR);
    attrs.output_flags.remove(OutputFlags::OPOST);
    if echo {
        attrs.local_flags.insert(LocalFlags::ECHO);
    } else {
        attrs.local_flags.remove(LocalFlags::ECHO);
    }
    tcsetattr(fd, SetArg::TCSANOW, &attrs).context("tcsetattr on pty master failed")
}

/// Put the terminal into raw mode.
pub fn make_raw(fd: &File) -> Result<()> {
    let mut attrs = tcgetattr(fd).context("tcgetattr on pty master failed")?;
    cfmakeraw(&mut attrs);
    tcsetattr(fd, SetArg::TCSANOW, &attrs).context("tcsetattr on pty master failed")
}

/// Resize the terminal window.
pub fn set_winsize(fd: &File, rows: u16, cols: u16) -> Result<()> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ reads a valid Winsize from the pointer and applies
    // it to the terminal behind `fd`.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) };
    if rc == -1 {
        return Err(io::Error::last_os_error()).context("TIOCSWINSZ on pty master failed");
    }
    Ok(())
}

fn set_nonblocking(fd: &File) -> Result<()> {
    // SAFETY: F_GETFL/F_SETFL on a valid descriptor owned by `fd`.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags == -1 {
            return Err(io::Error::last_os_error()).context("F_GETFL on pty master failed");
        }
        if libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error()).context("F_SETFL on pty master failed");
        }
    }
    Ok(())
}

fn nix_errno_to_io_error(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

fn raw_fd_to_owned_fd(raw_fd: i32) -> OwnedFd {
    // SAFETY: `raw_fd` comes from successful `dup(2)` calls and is uniquely
    // owned by this function, so converting to `OwnedFd` is valid.
    unsafe { OwnedFd::from_raw_fd(raw_fd) }
}
