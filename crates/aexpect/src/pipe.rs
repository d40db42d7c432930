//! Non-blocking reader over a consumer FIFO, shared by the tail worker and
//! the expect engine.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::File;
use std::io::Read;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

pub(crate) struct ConsumerPipe {
    file: File,
}

impl ConsumerPipe {
    /// Open the FIFO read-only and non-blocking. The non-blocking open
    /// cannot hang on a missing writer, which matters when attaching to a
    /// session whose helper is already gone.
    pub(crate) fn open(path: &Path) -> std::io::Result<ConsumerPipe> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(ConsumerPipe { file })
    }

    /// Wait up to `timeout` for the pipe to become readable. Hang-up and
    /// error conditions count as readable so the caller observes EOF
    /// through `read`.
    pub(crate) fn poll_readable(&self, timeout: Duration) -> std::io::Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, to_poll_timeout(timeout)) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(false),
            Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
        }
        Ok(fds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
    }

    /// Read one chunk. `Ok(Some(0))` is EOF (every writer closed);
    /// `Ok(None)` means nothing was available.
    pub(crate) fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        match self.file.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn to_poll_timeout(timeout: Duration) -> PollTimeout {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use std::io::Write;
    use std::time::Instant;
    use tempfile::tempdir;

    fn fifo_pair(dir: &Path) -> (File, ConsumerPipe) {
        let path = dir.join("pipe");
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).expect("mkfifo should succeed");
        let reader = ConsumerPipe::open(&path).expect("reader open should not block");
        let writer = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("writer open should succeed once a reader exists");
        (writer, reader)
    }

    #[test]
    fn test_poll_times_out_on_quiet_pipe() {
        let dir = tempdir().expect("tempdir");
        let (_writer, reader) = fifo_pair(dir.path());

        let started = Instant::now();
        let readable = reader
            .poll_readable(Duration::from_millis(50))
            .expect("poll should succeed");
        assert!(!readable, "quiet pipe must not be readable");
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_data_then_eof() {
        let dir = tempdir().expect("tempdir");
        let (mut writer, mut reader) = fifo_pair(dir.path());

        writer.write_all(b"chunk").expect("write should succeed");
        assert!(reader.poll_readable(Duration::from_secs(1)).unwrap());
        let mut buf = [0u8; 16];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), Some(5));
        assert_eq!(&buf[..5], b"chunk");

        drop(writer);
        assert!(reader.poll_readable(Duration::from_secs(1)).unwrap());
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), Some(0), "EOF expected");
    }

    #[test]
    fn test_read_chunk_reports_empty_pipe() {
        let dir = tempdir().expect("tempdir");
        let (_writer, mut reader) = fifo_pair(dir.path());

        let mut buf = [0u8; 16];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_poll_timeout_conversion_saturates() {
        assert_eq!(to_poll_timeout(Duration::ZERO), PollTimeout::ZERO);
        assert_eq!(
            to_poll_timeout(Duration::from_secs(u64::MAX)),
            PollTimeout::MAX
        );
    }
}
