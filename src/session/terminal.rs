//! The terminal pass-through session.
//!
//! Runs after CONNECT: a concurrent, line-disciplined byte pump between the
//! operator and the modem. Three activities run at once (modem-to-user teed
//! into the transcript, line-buffered user-to-modem with the `~.` escape,
//! and the wake pulse) and the first to finish ends the session.
//! Teardown always runs all four steps in order: close the log, hang up
//! unless carrier was lost, close the modem, release the line.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::modem::{Arbiter, ModemLink, SharedWriter};
use crate::session::{InputBytes, InputError, TranscriptLog};

const INPUT_POLL_STEP: Duration = Duration::from_millis(200);
const DEFAULT_WAKE_INTERVAL: Duration = Duration::from_secs(2);

/// Why the session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Operator typed `~.` on a new line.
    UserDisconnect,
    /// Operator hit Ctrl+C.
    UserAbort,
    /// The operator connection itself went away.
    UserGone,
    /// The modem read side ended or failed; the remote hung up.
    CarrierLost,
    /// A write toward the modem failed while carrier looked alive.
    LinkFailed,
    /// The session could not be set up (transcript or raw I/O).
    SetupFailed,
}

impl SessionEnd {
    pub fn describe(&self) -> &'static str {
        match self {
            SessionEnd::UserDisconnect => "disconnected",
            SessionEnd::UserAbort => "aborted",
            SessionEnd::UserGone => "connection closed",
            SessionEnd::CarrierLost => "carrier lost",
            SessionEnd::LinkFailed => "modem link failed",
            SessionEnd::SetupFailed => "session setup failed",
        }
    }
}

enum PumpEnd {
    CarrierLost,
    UserGone,
}

pub struct TerminalSession {
    modem: Box<dyn ModemLink>,
    device: PathBuf,
    site_name: String,
    log_dir: PathBuf,
    arbiter: Arc<dyn Arbiter>,
    wake_interval: Duration,
}

impl TerminalSession {
    pub fn new(
        modem: Box<dyn ModemLink>,
        device: PathBuf,
        site_name: impl Into<String>,
        log_dir: PathBuf,
        arbiter: Arc<dyn Arbiter>,
    ) -> Self {
        Self {
            modem,
            device,
            site_name: site_name.into(),
            log_dir,
            arbiter,
            wake_interval: DEFAULT_WAKE_INTERVAL,
        }
    }

    pub fn with_wake_interval(mut self, interval: Duration) -> Self {
        self.wake_interval = interval;
        self
    }

    /// Run the pass-through until either side ends, then tear down. Always
    /// releases the modem line.
    pub fn run(mut self, input: &mut InputBytes, user_out: SharedWriter) -> SessionEnd {
        let carrier_lost = Arc::new(AtomicBool::new(false));

        let log = match TranscriptLog::create(&self.log_dir, &self.site_name, &self.device) {
            Ok(log) => log,
            Err(err) => {
                warn!(site = %self.site_name, error = %err, "transcript log creation failed");
                return self.teardown(None, &carrier_lost, SessionEnd::SetupFailed);
            }
        };

        let raw = match self.modem.raw_io() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(site = %self.site_name, error = %err, "raw modem I/O unavailable");
                return self.teardown(Some(log), &carrier_lost, SessionEnd::SetupFailed);
            }
        };

        let banner = format!(
            "\r\n*** CONNECTED to {} — Enter sends the typed line; '~.' alone on a new line disconnects; Ctrl+C aborts ***\r\n\r\n",
            self.site_name,
        );
        if user_out.write_all(banner.as_bytes()).is_err() {
            return self.teardown(Some(log), &carrier_lost, SessionEnd::UserGone);
        }

        info!(site = %self.site_name, device = %self.device.display(), log = %log.path().display(), "terminal session started");

        let got_data = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<PumpEnd>();

        // Modem → user, teed into the transcript.
        {
            let mut tee = log.tee(raw.reader);
            let out = user_out.clone();
            let got_data = Arc::clone(&got_data);
            let carrier_lost = Arc::clone(&carrier_lost);
            let done = done_tx.clone();
            thread::spawn(move || {
                use std::io::Read;
                let mut buf = [0u8; 1024];
                loop {
                    match tee.read(&mut buf) {
                        Ok(0) => {
                            carrier_lost.store(true, Ordering::SeqCst);
                            let _ = done.send(PumpEnd::CarrierLost);
                            return;
                        }
                        Ok(n) => {
                            got_data.store(true, Ordering::SeqCst);
                            if out.write_all(&buf[..n]).is_err() {
                                let _ = done.send(PumpEnd::UserGone);
                                return;
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "modem read ended");
                            carrier_lost.store(true, Ordering::SeqCst);
                            let _ = done.send(PumpEnd::CarrierLost);
                            return;
                        }
                    }
                }
            });
        }

        // Wake pulse: the far-end console is usually waiting for a keystroke
        // before it prints its prompt.
        {
            let writer = raw.writer.clone();
            let got_data = Arc::clone(&got_data);
            let interval = self.wake_interval;
            thread::spawn(move || {
                if writer.write_all(b"\r").is_err() {
                    return;
                }
                loop {
                    thread::sleep(interval);
                    if got_data.load(Ordering::SeqCst) {
                        return;
                    }
                    if writer.write_all(b"\r").is_err() {
                        return;
                    }
                }
            });
        }

        let end = self.user_to_modem(input, &user_out, &raw.writer, &done_rx);
        self.teardown(Some(log), &carrier_lost, end)
    }

    /// Line-disciplined user input loop. Runs on the calling thread so the
    /// operator's unconsumed bytes stay queued for the menu afterwards.
    fn user_to_modem(
        &mut self,
        input: &mut InputBytes,
        echo: &SharedWriter,
        modem_out: &SharedWriter,
        done: &mpsc::Receiver<PumpEnd>,
    ) -> SessionEnd {
        let mut line_buf: Vec<u8> = Vec::new();
        let mut after_eol = false;

        loop {
            match done.try_recv() {
                Ok(PumpEnd::CarrierLost) => return SessionEnd::CarrierLost,
                Ok(PumpEnd::UserGone) => return SessionEnd::UserGone,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            let byte = match input.recv_timeout(INPUT_POLL_STEP) {
                Ok(byte) => byte,
                Err(InputError::Timeout) => continue,
                Err(InputError::Closed) => return SessionEnd::UserGone,
            };

            match byte {
                // Ctrl+C: immediate abort, nothing further is sent.
                0x03 => return SessionEnd::UserAbort,

                // DEL/BS: drop the last buffered byte and wipe it on screen.
                0x7f | 0x08 => {
                    if line_buf.pop().is_some()
                        && echo.write_all(&[0x08, b' ', 0x08]).is_err()
                    {
                        return SessionEnd::UserGone;
                    }
                }

                b'\r' | b'\n' => {
                    if echo.write_all(b"\r\n").is_err() {
                        return SessionEnd::UserGone;
                    }
                    line_buf.push(b'\r');
                    if modem_out.write_all(&line_buf).is_err() {
                        return SessionEnd::LinkFailed;
                    }
                    line_buf.clear();
                    after_eol = true;
                }

                other => {
                    line_buf.push(other);
                    if echo.write_all(&[other]).is_err() {
                        return SessionEnd::UserGone;
                    }
                    // In-band escape: `~.` as the whole of a fresh line.
                    if after_eol && line_buf == b"~." {
                        return SessionEnd::UserDisconnect;
                    }
                }
            }
        }
    }

    /// The four teardown steps, each tolerating earlier failures:
    /// close the log, hang up unless carrier is gone, close the modem,
    /// release the line.
    fn teardown(
        mut self,
        log: Option<TranscriptLog>,
        carrier_lost: &AtomicBool,
        end: SessionEnd,
    ) -> SessionEnd {
        if let Some(log) = log {
            if let Err(err) = log.close() {
                warn!(error = %err, "closing transcript log failed");
            }
        }

        if carrier_lost.load(Ordering::SeqCst) {
            info!(site = %self.site_name, "carrier already lost, skipping hangup");
        } else {
            self.modem.hangup();
        }

        self.modem.close();
        self.arbiter.release(&self.device);
        info!(site = %self.site_name, end = %end.describe(), "terminal session ended");
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::{
        ArbiterError, DialResponse, ModemError, RawIo,
    };
    use std::collections::BTreeSet;
    use std::io;
    use std::io::{Read, Write};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }

        fn count(&self, byte: u8) -> usize {
            self.0.lock().unwrap().iter().filter(|b| **b == byte).count()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Blocks until the test feeds bytes; EOF when the sender drops.
    struct ChannelReader(mpsc::Receiver<Vec<u8>>);

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<&'static str>>);

    impl EventLog {
        fn push(&self, event: &'static str) {
            self.0.lock().unwrap().push(event);
        }

        fn all(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    struct StubModem {
        reader: Option<Box<dyn Read + Send>>,
        sink: SharedBuf,
        events: Arc<EventLog>,
    }

    impl ModemLink for StubModem {
        fn init(&mut self, _timeout: Duration) -> Result<(), ModemError> {
            Ok(())
        }

        fn configure(&mut self, _commands: &[String], _timeout: Duration) -> Result<(), ModemError> {
            Ok(())
        }

        fn dial(&mut self, _number: &str, _timeout: Duration) -> Result<DialResponse, ModemError> {
            unreachable!("terminal tests never dial")
        }

        fn raw_io(&mut self) -> Result<RawIo, ModemError> {
            Ok(RawIo {
                reader: self.reader.take().expect("raw_io once"),
                writer: SharedWriter::new(Box::new(self.sink.clone())),
            })
        }

        fn hangup(&mut self) {
            self.events.push("hangup");
        }

        fn transcript(&self) -> String {
            String::new()
        }

        fn close(&mut self) {
            self.events.push("close");
        }
    }

    struct StubArbiter {
        events: Arc<EventLog>,
        held: Mutex<bool>,
    }

    impl Arbiter for StubArbiter {
        fn acquire(&self, _site: &str) -> Result<PathBuf, ArbiterError> {
            *self.held.lock().unwrap() = true;
            Ok(PathBuf::from("/dev/stub"))
        }

        fn release(&self, _path: &Path) {
            self.events.push("release");
            *self.held.lock().unwrap() = false;
        }

        fn active_sites(&self) -> BTreeSet<String> {
            BTreeSet::new()
        }

        fn available(&self) -> (usize, usize) {
            if *self.held.lock().unwrap() {
                (0, 1)
            } else {
                (1, 1)
            }
        }
    }

    struct Rig {
        session: TerminalSession,
        modem_sink: SharedBuf,
        user_out: SharedBuf,
        feed: mpsc::Sender<Vec<u8>>,
        events: Arc<EventLog>,
        log_dir: TempDir,
    }

    fn rig() -> Rig {
        let (feed, rx) = mpsc::channel();
        let events = Arc::new(EventLog::default());
        let modem_sink = SharedBuf::default();
        let arbiter = Arc::new(StubArbiter {
            events: Arc::clone(&events),
            held: Mutex::new(true),
        });
        let modem = StubModem {
            reader: Some(Box::new(ChannelReader(rx))),
            sink: modem_sink.clone(),
            events: Arc::clone(&events),
        };
        let log_dir = TempDir::new().unwrap();
        let session = TerminalSession::new(
            Box::new(modem),
            PathBuf::from("/dev/stub"),
            "testsite",
            log_dir.path().to_path_buf(),
            arbiter as Arc<dyn Arbiter>,
        )
        .with_wake_interval(Duration::from_secs(60));
        Rig {
            session,
            modem_sink,
            user_out: SharedBuf::default(),
            feed,
            events,
            log_dir,
        }
    }

    /// Run a session over preloaded user input; returns the pieces the
    /// assertions need.
    fn run_session(
        input_bytes: &[u8],
    ) -> (
        SessionEnd,
        SharedBuf,
        SharedBuf,
        Vec<&'static str>,
        TempDir,
        mpsc::Sender<Vec<u8>>,
    ) {
        let r = rig();
        let mut input = InputBytes::preloaded(input_bytes);
        let out = SharedWriter::new(Box::new(r.user_out.clone()));
        let end = r.session.run(&mut input, out);
        (
            end,
            r.modem_sink,
            r.user_out,
            r.events.all(),
            r.log_dir,
            r.feed,
        )
    }

    #[test]
    fn plain_line_is_sent_and_echoed() {
        let (end, modem_sink, user_out, _events, _logs, _feed) = run_session(b"hello\r\x03");
        assert_eq!(end, SessionEnd::UserAbort);

        let sent = modem_sink.contents();
        let sent_text = String::from_utf8_lossy(&sent);
        assert!(sent_text.contains("hello\r"), "modem got: {sent_text:?}");

        let echoed = String::from_utf8_lossy(&user_out.contents()).into_owned();
        assert!(echoed.contains("hello\r\n"), "echo was: {echoed:?}");
    }

    #[test]
    fn backspace_edits_the_line() {
        let (end, modem_sink, user_out, _events, _logs, _feed) = run_session(b"abc\x08d\r\x03");
        assert_eq!(end, SessionEnd::UserAbort);

        let sent_text = String::from_utf8_lossy(&modem_sink.contents()).into_owned();
        assert!(sent_text.contains("abd\r"), "modem got: {sent_text:?}");
        assert!(!sent_text.contains("abc"), "modem got: {sent_text:?}");

        let echoed = user_out.contents();
        let echoed_text = String::from_utf8_lossy(&echoed).into_owned();
        assert!(
            echoed_text.contains("abc\x08 \x08d\r\n"),
            "echo was: {echoed_text:?}"
        );
    }

    #[test]
    fn backspace_on_empty_line_is_a_no_op() {
        let (end, _modem_sink, user_out, _events, _logs, _feed) = run_session(b"\x08\x7f\x03");
        assert_eq!(end, SessionEnd::UserAbort);
        let echoed = user_out.contents();
        assert!(!echoed.contains(&0x08), "echo was: {echoed:?}");
    }

    #[test]
    fn tilde_dot_on_fresh_line_disconnects() {
        let (end, modem_sink, _user_out, events, _logs, _feed) = run_session(b"\r~.");
        assert_eq!(end, SessionEnd::UserDisconnect);

        let sent_text = String::from_utf8_lossy(&modem_sink.contents()).into_owned();
        assert!(!sent_text.contains('~'), "modem got: {sent_text:?}");
        assert!(!sent_text.contains('.'), "modem got: {sent_text:?}");

        // User-initiated disconnect hangs up before closing, then releases.
        assert_eq!(events, vec!["hangup", "close", "release"]);
    }

    #[test]
    fn tilde_dot_mid_line_is_forwarded() {
        let (end, modem_sink, _user_out, _events, _logs, _feed) = run_session(b"\ra~.\r\x03");
        assert_eq!(end, SessionEnd::UserAbort);
        let sent_text = String::from_utf8_lossy(&modem_sink.contents()).into_owned();
        assert!(sent_text.contains("a~.\r"), "modem got: {sent_text:?}");
    }

    #[test]
    fn ctrl_c_aborts_without_sending() {
        let (end, modem_sink, _user_out, events, _logs, _feed) = run_session(b"\x03");
        assert_eq!(end, SessionEnd::UserAbort);

        // Only the wake pulse reaches the modem.
        let sent = modem_sink.contents();
        assert!(sent.iter().all(|b| *b == b'\r'), "modem got: {sent:?}");
        assert_eq!(events, vec!["hangup", "close", "release"]);
    }

    #[test]
    fn carrier_loss_skips_hangup() {
        let (feed, rx) = mpsc::channel::<Vec<u8>>();
        drop(feed); // modem reader sees EOF immediately
        let events = Arc::new(EventLog::default());
        let arbiter = Arc::new(StubArbiter {
            events: Arc::clone(&events),
            held: Mutex::new(true),
        });
        let modem = StubModem {
            reader: Some(Box::new(ChannelReader(rx))),
            sink: SharedBuf::default(),
            events: Arc::clone(&events),
        };
        let log_dir = TempDir::new().unwrap();
        let session = TerminalSession::new(
            Box::new(modem),
            PathBuf::from("/dev/stub"),
            "testsite",
            log_dir.path().to_path_buf(),
            Arc::clone(&arbiter) as Arc<dyn Arbiter>,
        )
        .with_wake_interval(Duration::from_secs(60));

        // No user input at all; the carrier loss must end the session.
        let (tx, rx_input) = mpsc::channel();
        let mut input = InputBytes { rx: rx_input };
        let out = SharedWriter::new(Box::new(SharedBuf::default()));
        let end = session.run(&mut input, out);
        drop(tx);

        assert_eq!(end, SessionEnd::CarrierLost);
        assert_eq!(events.all(), vec!["close", "release"]);
        assert_eq!(arbiter.available(), (1, 1));
    }

    #[test]
    fn modem_output_is_echoed_and_logged() {
        let (feed, rx) = mpsc::channel::<Vec<u8>>();
        let events = Arc::new(EventLog::default());
        let arbiter = Arc::new(StubArbiter {
            events: Arc::clone(&events),
            held: Mutex::new(true),
        });
        let modem = StubModem {
            reader: Some(Box::new(ChannelReader(rx))),
            sink: SharedBuf::default(),
            events: Arc::clone(&events),
        };
        let log_dir = TempDir::new().unwrap();
        let session = TerminalSession::new(
            Box::new(modem),
            PathBuf::from("/dev/stub"),
            "testsite",
            log_dir.path().to_path_buf(),
            Arc::clone(&arbiter) as Arc<dyn Arbiter>,
        )
        .with_wake_interval(Duration::from_secs(60));

        let user_out = SharedBuf::default();
        let out = SharedWriter::new(Box::new(user_out.clone()));

        feed.send(b"login: ".to_vec()).unwrap();
        // Give the pump a moment, then disconnect.
        let (tx, rx_input) = mpsc::channel();
        let feeder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            for &b in b"\r~." {
                tx.send(b).unwrap();
            }
        });
        let mut input = InputBytes { rx: rx_input };
        let end = session.run(&mut input, out);
        feeder.join().unwrap();

        assert_eq!(end, SessionEnd::UserDisconnect);
        let echoed = String::from_utf8_lossy(&user_out.contents()).into_owned();
        assert!(echoed.contains("login: "), "user saw: {echoed:?}");

        // Transcript captured the modem bytes between header and footer.
        let entries: Vec<_> = std::fs::read_dir(log_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let contents = std::fs::read_to_string(&entries[0]).unwrap();
        assert!(contents.contains("login: "), "log was: {contents:?}");
        assert!(contents.contains("=== Session ended: "));
        drop(feed);
    }

    #[test]
    fn wake_pulse_stops_after_first_modem_byte() {
        let (feed, rx) = mpsc::channel::<Vec<u8>>();
        let events = Arc::new(EventLog::default());
        let arbiter = Arc::new(StubArbiter {
            events: Arc::clone(&events),
            held: Mutex::new(true),
        });
        let modem_sink = SharedBuf::default();
        let modem = StubModem {
            reader: Some(Box::new(ChannelReader(rx))),
            sink: modem_sink.clone(),
            events: Arc::clone(&events),
        };
        let log_dir = TempDir::new().unwrap();
        let session = TerminalSession::new(
            Box::new(modem),
            PathBuf::from("/dev/stub"),
            "testsite",
            log_dir.path().to_path_buf(),
            Arc::clone(&arbiter) as Arc<dyn Arbiter>,
        )
        .with_wake_interval(Duration::from_millis(50));

        let (tx, rx_input) = mpsc::channel();
        let modem_feed = feed.clone();
        let driver = thread::spawn(move || {
            // Let a few wake pulses land, then answer.
            thread::sleep(Duration::from_millis(140));
            modem_feed.send(b"ok".to_vec()).unwrap();
            // Wait out several more intervals, then end the session.
            thread::sleep(Duration::from_millis(300));
            tx.send(0x03).unwrap();
            tx
        });

        let mut input = InputBytes { rx: rx_input };
        let out = SharedWriter::new(Box::new(SharedBuf::default()));
        let end = session.run(&mut input, out);
        let _tx = driver.join().unwrap();

        assert_eq!(end, SessionEnd::UserAbort);
        let pulses = modem_sink.count(b'\r');
        // Initial pulse plus a couple before the reply; none afterwards.
        assert!(pulses >= 1, "no wake pulse sent");
        assert!(pulses <= 4, "wake kept pulsing after data: {pulses}");
        drop(feed);
    }
}
