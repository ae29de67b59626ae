//! The AT dialogue engine.
//!
//! A half-duplex command/response conversation over the modem character
//! device, hardened against stale state left behind by a crashed call: init
//! forces the modem out of online mode (`+++`, `ATH`) before resetting it.
//! Protocol-level dial failures are data, not errors; only transport-level
//! faults surface as [`ModemError`].

use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::device::CharDevice;

/// Minimum silence around the `+++` escape for the modem to honor it.
const GUARD_SILENCE: Duration = Duration::from_millis(1100);
/// Per-read step while waiting for a response token.
const READ_STEP: Duration = Duration::from_millis(500);
/// Per-read step while draining stale bytes.
const DRAIN_STEP: Duration = Duration::from_millis(200);
/// How long init listens for the ATH outcome.
const ATH_TIMEOUT: Duration = Duration::from_secs(2);
/// How long hangup listens before giving up.
const HANGUP_TIMEOUT: Duration = Duration::from_secs(3);

const DIAL_TOKENS: [&str; 5] = ["CONNECT", "BUSY", "NO CARRIER", "NO DIALTONE", "ERROR"];

/// Terminal result codes of a dial attempt, plus the local TIMEOUT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialResult {
    Connect,
    Busy,
    NoCarrier,
    NoDialtone,
    Error,
    Timeout,
}

impl DialResult {
    pub fn as_str(self) -> &'static str {
        match self {
            DialResult::Connect => "CONNECT",
            DialResult::Busy => "BUSY",
            DialResult::NoCarrier => "NO CARRIER",
            DialResult::NoDialtone => "NO DIALTONE",
            DialResult::Error => "ERROR",
            DialResult::Timeout => "TIMEOUT",
        }
    }

    /// Results plausibly caused by transient line conditions, worth a
    /// redial.
    pub fn retryable(self) -> bool {
        matches!(self, DialResult::NoCarrier | DialResult::Timeout)
    }
}

impl fmt::Display for DialResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a dial attempt with the full AT transcript at the point of
/// decision.
#[derive(Clone, Debug)]
pub struct DialResponse {
    pub result: DialResult,
    pub transcript: String,
}

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("modem device {path} unavailable: {source}")]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("modem reset failed: {response:?}")]
    ResetFailed { response: String },
    #[error("modem init command {command} failed: {response:?}")]
    InitFailed { command: String, response: String },
    #[error("modem configure command {command} failed: {response:?}")]
    ConfigureFailed { command: String, response: String },
    #[error("modem write failed: {0}")]
    WriteFailed(#[source] io::Error),
    #[error("{op} is not valid while the modem is {state}")]
    InvalidState { op: &'static str, state: DriverState },
    #[error("modem is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Driver lifecycle. Operations move the state forward on success; failures
/// during init/configure drop back to `Open`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Closed,
    Open,
    Initialized,
    Configured,
    Dialing,
    Connected,
    HangingUp,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Closed => "closed",
            DriverState::Open => "open",
            DriverState::Initialized => "initialized",
            DriverState::Configured => "configured",
            DriverState::Dialing => "dialing",
            DriverState::Connected => "connected",
            DriverState::HangingUp => "hanging up",
        };
        f.write_str(name)
    }
}

/// Byte-level pass-through handles, valid only while Connected. The writer
/// clones so the wake pulse and the line writer can share it.
pub struct RawIo {
    pub reader: Box<dyn Read + Send>,
    pub writer: SharedWriter,
}

impl std::fmt::Debug for RawIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawIo").finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().unwrap();
        writer.write_all(buf)?;
        writer.flush()
    }
}

/// The modem surface the orchestrator and the terminal session program
/// against. [`Modem`] is the character-device implementation; tests use
/// scripted stubs.
pub trait ModemLink: Send {
    fn init(&mut self, timeout: Duration) -> Result<(), ModemError>;
    fn configure(&mut self, commands: &[String], timeout: Duration) -> Result<(), ModemError>;
    fn dial(&mut self, number: &str, timeout: Duration) -> Result<DialResponse, ModemError>;
    fn raw_io(&mut self) -> Result<RawIo, ModemError>;
    fn hangup(&mut self);
    fn transcript(&self) -> String;
    fn close(&mut self);
}

/// Factory for [`ModemLink`]s; the arbiter hands out paths, this opens them.
pub trait ModemOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ModemLink>, ModemError>;
}

/// Opens real character devices.
pub struct DeviceOpener {
    pub dial_prefix: String,
}

impl Default for DeviceOpener {
    fn default() -> Self {
        Self {
            dial_prefix: "ATDT".to_string(),
        }
    }
}

impl ModemOpener for DeviceOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ModemLink>, ModemError> {
        let modem = Modem::open(path)?.with_dial_prefix(&self.dial_prefix);
        Ok(Box::new(modem))
    }
}

enum ReadStatus {
    Matched,
    TimedOut,
    Failed(io::Error),
}

struct ReadOutcome {
    buffer: String,
    status: ReadStatus,
}

pub struct Modem {
    device: Option<CharDevice>,
    path: PathBuf,
    dial_prefix: String,
    transcript: String,
    state: DriverState,
}

impl Modem {
    /// Open the modem device read/write. No terminal-mode mutation.
    pub fn open(path: &Path) -> Result<Self, ModemError> {
        let device = CharDevice::open(path).map_err(|source| ModemError::DeviceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        info!(device = %path.display(), "modem opened");
        Ok(Self::from_device(device))
    }

    fn from_device(device: CharDevice) -> Self {
        let path = device.path().to_path_buf();
        Self {
            device: Some(device),
            path,
            dial_prefix: "ATDT".to_string(),
            transcript: String::new(),
            state: DriverState::Open,
        }
    }

    pub fn with_dial_prefix(mut self, prefix: &str) -> Self {
        self.dial_prefix = prefix.to_string();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    fn device_mut(&mut self) -> Result<&mut CharDevice, ModemError> {
        self.device.as_mut().ok_or(ModemError::Closed)
    }

    /// Discard whatever is buffered until a short deadline passes with no
    /// data.
    fn drain(&mut self) {
        let Ok(device) = self.device_mut() else {
            return;
        };
        let mut discarded = 0usize;
        let mut buf = [0u8; 256];
        loop {
            match device.read_deadline(&mut buf, DRAIN_STEP) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(_) => break,
            }
        }
        if discarded > 0 {
            debug!(device = %self.path.display(), bytes = discarded, "drained stale modem output");
        }
    }

    fn log_cmd(&mut self, cmd: &str) {
        self.transcript.push_str(">>> ");
        self.transcript.push_str(cmd);
        self.transcript.push('\n');
        debug!(device = %self.path.display(), command = %cmd, "modem send");
    }

    fn log_resp(&mut self, resp: &str) {
        let cleaned = clean_response(resp);
        if !cleaned.is_empty() {
            self.transcript.push_str("<<< ");
            self.transcript.push_str(&cleaned);
            self.transcript.push('\n');
            debug!(device = %self.path.display(), response = %cleaned, "modem recv");
        }
    }

    /// Send `cmd` followed by CR, recording it in the transcript.
    fn send(&mut self, cmd: &str) -> Result<(), ModemError> {
        self.log_cmd(cmd);
        let line = format!("{cmd}\r");
        self.device_mut()?
            .write_all(line.as_bytes())
            .map_err(ModemError::WriteFailed)
    }

    /// Read in bounded chunks until one of `tokens` appears in the
    /// accumulated buffer (case-insensitive substring), the deadline passes,
    /// or a non-timeout read error occurs. The partial buffer is returned in
    /// every case.
    fn read_until(&mut self, timeout: Duration, tokens: &[&str]) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        let mut buffer = String::new();
        let mut chunk = [0u8; 256];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return ReadOutcome {
                    buffer,
                    status: ReadStatus::TimedOut,
                };
            }
            let step = READ_STEP.min(deadline - now);
            let device = match self.device_mut() {
                Ok(device) => device,
                Err(_) => {
                    return ReadOutcome {
                        buffer,
                        status: ReadStatus::Failed(io::Error::new(
                            io::ErrorKind::NotConnected,
                            "modem closed",
                        )),
                    }
                }
            };
            match device.read_deadline(&mut chunk, step) {
                Ok(0) => {
                    return ReadOutcome {
                        buffer,
                        status: ReadStatus::Failed(io::ErrorKind::UnexpectedEof.into()),
                    }
                }
                Ok(n) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    let lowered = buffer.to_ascii_lowercase();
                    if tokens
                        .iter()
                        .any(|token| lowered.contains(&token.to_ascii_lowercase()))
                    {
                        return ReadOutcome {
                            buffer,
                            status: ReadStatus::Matched,
                        };
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
                Err(err) => {
                    return ReadOutcome {
                        buffer,
                        status: ReadStatus::Failed(err),
                    }
                }
            }
        }
    }

    /// Send a command and wait for one of `tokens`, logging the response.
    /// Returns the accumulated buffer and whether a token matched.
    fn exchange(
        &mut self,
        cmd: &str,
        timeout: Duration,
        tokens: &[&str],
    ) -> Result<(String, bool), ModemError> {
        self.send(cmd)?;
        let outcome = self.read_until(timeout, tokens);
        self.log_resp(&outcome.buffer);
        match outcome.status {
            ReadStatus::Matched => Ok((outcome.buffer, true)),
            ReadStatus::TimedOut => Ok((outcome.buffer, false)),
            ReadStatus::Failed(err) => Err(err.into()),
        }
    }

    /// Write raw bytes with a transcript entry, without awaiting a response.
    /// Used for the `+++` escape, which must be followed by silence.
    fn send_escape(&mut self) -> Result<(), ModemError> {
        self.log_cmd("+++");
        self.device_mut()?
            .write_all(b"+++")
            .map_err(ModemError::WriteFailed)
    }
}

impl ModemLink for Modem {
    /// Forced-quiescence init for a modem that may have been left in online
    /// mode: drain, escape to command mode, hang up any stale call, then
    /// reset and set echo/dial-tone behavior.
    fn init(&mut self, timeout: Duration) -> Result<(), ModemError> {
        if self.state != DriverState::Open {
            return Err(ModemError::InvalidState {
                op: "init",
                state: self.state,
            });
        }

        self.drain();

        // Escape a possible data-mode session. The guard silence on both
        // sides is mandatory for the modem to recognize the sequence.
        thread::sleep(GUARD_SILENCE);
        self.send_escape()?;
        thread::sleep(GUARD_SILENCE);
        self.drain();

        // Hang up a stale call. The outcome is irrelevant; an idle modem
        // answers OK, one without a call may say NO CARRIER.
        let _ = self.exchange("ATH", ATH_TIMEOUT, &["OK", "ERROR", "NO CARRIER"])?;
        self.drain();

        let (response, matched) = self.exchange("ATZ", timeout, &["OK", "ERROR"])?;
        if !matched || contains_token(&response, "ERROR") {
            return Err(ModemError::ResetFailed {
                response: clean_response(&response),
            });
        }
        self.drain();

        for cmd in ["ATE0", "ATX3"] {
            let (response, matched) = self.exchange(cmd, timeout, &["OK", "ERROR"])?;
            if !matched || contains_token(&response, "ERROR") {
                return Err(ModemError::InitFailed {
                    command: cmd.to_string(),
                    response: clean_response(&response),
                });
            }
        }
        self.drain();

        info!(device = %self.path.display(), "modem initialized");
        self.state = DriverState::Initialized;
        Ok(())
    }

    /// Run the site's tuning commands in order. Any ERROR or timeout aborts
    /// the rest of the sequence.
    fn configure(&mut self, commands: &[String], timeout: Duration) -> Result<(), ModemError> {
        if !matches!(self.state, DriverState::Initialized | DriverState::Configured) {
            return Err(ModemError::InvalidState {
                op: "configure",
                state: self.state,
            });
        }

        for cmd in commands {
            self.drain();
            let (response, matched) = self.exchange(cmd, timeout, &["OK", "ERROR"])?;
            if !matched || contains_token(&response, "ERROR") {
                return Err(ModemError::ConfigureFailed {
                    command: cmd.clone(),
                    response: clean_response(&response),
                });
            }
        }

        self.state = DriverState::Configured;
        Ok(())
    }

    fn dial(&mut self, number: &str, timeout: Duration) -> Result<DialResponse, ModemError> {
        if !matches!(self.state, DriverState::Initialized | DriverState::Configured) {
            return Err(ModemError::InvalidState {
                op: "dial",
                state: self.state,
            });
        }
        self.state = DriverState::Dialing;

        self.drain();
        let cmd = format!("{}{}", self.dial_prefix, number);
        if let Err(err) = self.send(&cmd) {
            self.state = DriverState::Open;
            return Err(err);
        }

        let outcome = self.read_until(timeout, &DIAL_TOKENS);
        self.log_resp(&outcome.buffer);
        if let ReadStatus::Failed(err) = &outcome.status {
            debug!(device = %self.path.display(), error = %err, "dial read ended early");
        }

        let result = classify_dial(&outcome.buffer).unwrap_or(DialResult::Timeout);
        let transcript = self.transcript.clone();
        info!(device = %self.path.display(), result = %result, "dial result");

        self.state = if result == DialResult::Connect {
            DriverState::Connected
        } else {
            DriverState::Open
        };

        Ok(DialResponse { result, transcript })
    }

    fn raw_io(&mut self) -> Result<RawIo, ModemError> {
        if self.state != DriverState::Connected {
            return Err(ModemError::InvalidState {
                op: "raw_io",
                state: self.state,
            });
        }
        let (reader, writer) = self.device_mut()?.split()?;
        Ok(RawIo {
            reader: Box::new(reader),
            writer: SharedWriter::new(Box::new(writer)),
        })
    }

    /// Best-effort return to on-hook. Never fails; problems are logged and
    /// swallowed.
    fn hangup(&mut self) {
        if self.device.is_none() {
            return;
        }
        self.state = DriverState::HangingUp;
        info!(device = %self.path.display(), "modem hangup");

        thread::sleep(GUARD_SILENCE);
        if let Err(err) = self.send_escape() {
            warn!(device = %self.path.display(), error = %err, "hangup escape failed");
            return;
        }
        thread::sleep(GUARD_SILENCE);
        match self.exchange("ATH", HANGUP_TIMEOUT, &["OK", "ERROR"]) {
            Ok(_) => {}
            Err(err) => warn!(device = %self.path.display(), error = %err, "hangup ATH failed"),
        }
        self.drain();
    }

    /// The accumulated AT transcript, by value. Not meaningful while
    /// Connected (nothing appends to it then, and nothing guards it).
    fn transcript(&self) -> String {
        self.transcript.clone()
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            device.shutdown();
            info!(device = %self.path.display(), "modem closed");
        }
        self.state = DriverState::Closed;
    }
}

impl Drop for Modem {
    fn drop(&mut self) {
        self.close();
    }
}

fn contains_token(haystack: &str, token: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&token.to_ascii_lowercase())
}

/// Decide a dial result by the first terminal token appearing in the
/// buffer, in byte-position order rather than any fixed priority.
fn classify_dial(buffer: &str) -> Option<DialResult> {
    let lowered = buffer.to_ascii_lowercase();
    let mut best: Option<(usize, DialResult)> = None;
    for token in DIAL_TOKENS {
        if let Some(pos) = lowered.find(&token.to_ascii_lowercase()) {
            let result = match token {
                "CONNECT" => DialResult::Connect,
                "BUSY" => DialResult::Busy,
                "NO CARRIER" => DialResult::NoCarrier,
                "NO DIALTONE" => DialResult::NoDialtone,
                _ => DialResult::Error,
            };
            if best.map_or(true, |(bp, _)| pos < bp) {
                best = Some((pos, result));
            }
        }
    }
    best.map(|(_, result)| result)
}

/// Strip control characters and collapse whitespace for transcript display.
/// The raw session log bytes are never passed through this.
pub fn clean_response(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for ch in s.chars() {
        let ch = match ch {
            '\r' | '\n' | '\t' => ' ',
            other => other,
        };
        if ch == ' ' {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else if !ch.is_control() {
            out.push(ch);
            last_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}
