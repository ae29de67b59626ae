//! Operator session plumbing: the transcript log, the pumped input byte
//! stream, and the terminal pass-through.

mod terminal;
mod transcript;

pub use terminal::{SessionEnd, TerminalSession};
pub use transcript::{TeeReader, TranscriptLog};

use std::io::Read;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// The operator's input as a stream of bytes, pumped off the underlying
/// connection by a dedicated thread. Consumers take bytes with a timeout, so
/// handing the stream from the menu to a terminal session and back never
/// leaves a reader blocked on the raw connection, and unconsumed bytes stay
/// queued for the next consumer.
pub struct InputBytes {
    rx: mpsc::Receiver<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InputError {
    /// Nothing arrived within the timeout.
    Timeout,
    /// The connection is gone.
    Closed,
}

impl InputBytes {
    /// Spawn the pump thread over `reader`. The thread exits on EOF or read
    /// error, closing the channel.
    pub fn spawn(mut reader: impl Read + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            if tx.send(byte).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Self { rx }
    }

    /// A closed stream preloaded with `bytes`.
    pub fn preloaded(bytes: &[u8]) -> Self {
        let (tx, rx) = mpsc::channel();
        for &byte in bytes {
            tx.send(byte).expect("unbounded channel");
        }
        Self { rx }
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<u8, InputError> {
        match self.rx.recv_timeout(timeout) {
            Ok(byte) => Ok(byte),
            Err(RecvTimeoutError::Timeout) => Err(InputError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(InputError::Closed),
        }
    }

    /// Block until a byte arrives or the stream closes.
    pub fn recv(&mut self) -> Result<u8, InputError> {
        self.rx.recv().map_err(|_| InputError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preloaded_yields_bytes_then_closes() {
        let mut input = InputBytes::preloaded(b"ab");
        assert_eq!(input.recv_timeout(Duration::from_millis(10)), Ok(b'a'));
        assert_eq!(input.recv_timeout(Duration::from_millis(10)), Ok(b'b'));
        assert_eq!(
            input.recv_timeout(Duration::from_millis(10)),
            Err(InputError::Closed)
        );
    }

    #[test]
    fn spawned_pump_forwards_reader_bytes() {
        let mut input = InputBytes::spawn(&b"xy"[..]);
        assert_eq!(input.recv(), Ok(b'x'));
        assert_eq!(input.recv(), Ok(b'y'));
        assert_eq!(input.recv(), Err(InputError::Closed));
    }
}
