//! Character-device access with per-read deadlines.
//!
//! The modem is a character-special file opened read/write with no
//! terminal-mode mutation; all signalling is in-band AT. Deadlines are
//! implemented with `poll(2)` ahead of each read, in lieu of non-blocking
//! mode.

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// During Connected the raw reader keeps polling in steps this long and
/// re-checks the shutdown flag between steps, so closing the modem unblocks
/// it within one step.
const SHUTDOWN_POLL_STEP: Duration = Duration::from_millis(500);

pub struct CharDevice {
    file: File,
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl CharDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::from_file(file, path.to_path_buf()))
    }

    pub(crate) fn from_file(file: File, path: PathBuf) -> Self {
        Self {
            file,
            path,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read with a deadline. `ErrorKind::TimedOut` means the deadline
    /// elapsed with nothing to read; `Ok(0)` is end-of-stream.
    pub fn read_deadline(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if !poll_readable(&self.file, timeout)? {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline elapsed"));
        }
        self.file.read(buf)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.file.flush()
    }

    /// Independent read/write paths on the same descriptor, for the
    /// Connected pass-through. The reader observes the device's shutdown
    /// flag; deadlines apply per read call.
    pub fn split(&self) -> io::Result<(DeviceReader, File)> {
        let reader = DeviceReader {
            file: self.file.try_clone()?,
            shutdown: Arc::clone(&self.shutdown),
        };
        let writer = self.file.try_clone()?;
        Ok((reader, writer))
    }

    /// Mark the device as shutting down. Raw readers return end-of-stream
    /// within one poll step.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn poll_readable(file: &File, timeout: Duration) -> io::Result<bool> {
    use std::os::fd::AsFd;
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    loop {
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

/// Read half of a Connected modem. Blocking `Read`, bounded internally so a
/// shutdown is noticed within [`SHUTDOWN_POLL_STEP`].
pub struct DeviceReader {
    file: File,
    shutdown: Arc<AtomicBool>,
}

impl Read for DeviceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(0);
            }
            if poll_readable(&self.file, SHUTDOWN_POLL_STEP)? {
                return self.file.read(buf);
            }
        }
    }
}

