//! Per-operator session supervisor.
//!
//! A state machine over the operator byte stream: an optional forced
//! password change, then the site menu, the dialing screen, and the
//! connected terminal, returning to a freshly built menu after every call so
//! the in-use markers stay current.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::UserStore;
use crate::dial::{DialError, DialOutcome, DialPolicy, Orchestrator};
use crate::modem::{clean_response, Arbiter, ModemOpener, SharedWriter};
use crate::session::{InputBytes, InputError, TerminalSession};
use crate::sites::Site;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    PasswordChange,
    Menu,
    Dialing,
    Connected,
}

/// What the operator picked off the menu prompt.
#[derive(Debug, PartialEq, Eq)]
enum MenuChoice {
    Quit,
    Dial(usize),
    Empty,
    Invalid,
}

fn parse_menu_choice(line: &str, site_count: usize) -> MenuChoice {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return MenuChoice::Empty;
    }
    if trimmed.eq_ignore_ascii_case("q") {
        return MenuChoice::Quit;
    }
    match trimmed.parse::<usize>() {
        Ok(n) if n >= 1 && n <= site_count => MenuChoice::Dial(n - 1),
        _ => MenuChoice::Invalid,
    }
}

/// A read line, or the reason there isn't one.
pub(crate) enum LineInput {
    Line(String),
    Interrupted,
    Closed,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Echo {
    Plain,
    Masked,
}

/// Read one line off the operator stream, echoing as it goes. Handles
/// backspace editing and Ctrl+C. Also used by the server's login prompt.
pub(crate) fn read_line(input: &mut InputBytes, out: &SharedWriter, echo: Echo) -> LineInput {
    let mut line = Vec::new();
    loop {
        let byte = match input.recv() {
            Ok(byte) => byte,
            Err(InputError::Closed) => return LineInput::Closed,
            Err(InputError::Timeout) => continue,
        };
        match byte {
            0x03 => return LineInput::Interrupted,
            b'\r' | b'\n' => {
                let _ = out.write_all(b"\r\n");
                return LineInput::Line(String::from_utf8_lossy(&line).into_owned());
            }
            0x7f | 0x08 => {
                if line.pop().is_some() {
                    let _ = out.write_all(&[0x08, b' ', 0x08]);
                }
            }
            other => {
                line.push(other);
                let shown = if echo == Echo::Masked { b'*' } else { other };
                let _ = out.write_all(&[shown]);
            }
        }
    }
}

pub struct Supervisor {
    username: String,
    sites: Arc<Vec<Site>>,
    arbiter: Arc<dyn Arbiter>,
    store: Arc<dyn UserStore>,
    orchestrator: Orchestrator,
    log_dir: PathBuf,
    wake_interval: Duration,
}

impl Supervisor {
    pub fn new(
        username: impl Into<String>,
        sites: Arc<Vec<Site>>,
        arbiter: Arc<dyn Arbiter>,
        opener: Arc<dyn ModemOpener>,
        store: Arc<dyn UserStore>,
        log_dir: PathBuf,
    ) -> Self {
        let orchestrator = Orchestrator::new(Arc::clone(&arbiter), opener);
        Self {
            username: username.into(),
            sites,
            arbiter,
            store,
            orchestrator,
            log_dir,
            wake_interval: Duration::from_secs(2),
        }
    }

    pub fn with_dial_policy(mut self, policy: DialPolicy) -> Self {
        self.orchestrator = self.orchestrator.with_policy(policy);
        self
    }

    pub fn with_wake_interval(mut self, interval: Duration) -> Self {
        self.wake_interval = interval;
        self
    }

    /// Drive the operator session to completion. Returns when the operator
    /// quits or their connection closes.
    pub fn run(&self, input: &mut InputBytes, out: SharedWriter) {
        let mut state = if self.needs_password_change() {
            State::PasswordChange
        } else {
            State::Menu
        };

        if state == State::PasswordChange {
            debug!(user = %self.username, "forcing password change");
            if !self.password_change(input, &out) {
                return;
            }
            state = State::Menu;
        }

        loop {
            debug_assert_eq!(state, State::Menu);
            self.render_menu(&out);
            let line = match read_line(input, &out, Echo::Plain) {
                LineInput::Line(line) => line,
                LineInput::Interrupted | LineInput::Closed => return,
            };

            match parse_menu_choice(&line, self.sites.len()) {
                MenuChoice::Quit => {
                    let _ = out.write_all(b"Goodbye.\r\n");
                    return;
                }
                MenuChoice::Empty => continue,
                MenuChoice::Invalid => {
                    let _ = out.write_all(b"No such site.\r\n");
                    continue;
                }
                MenuChoice::Dial(index) => {
                    let site = self.sites[index].clone();
                    state = State::Dialing;
                    info!(user = %self.username, site = %site.name, "dial requested");
                    if !self.dial_and_connect(&site, &mut state, input, &out) {
                        return;
                    }
                    state = State::Menu;
                }
            }
        }
    }

    fn needs_password_change(&self) -> bool {
        match self.store.must_change_password(&self.username) {
            Ok(force) => force,
            Err(err) => {
                warn!(user = %self.username, error = %err, "could not check password-change flag");
                false
            }
        }
    }

    /// Dial the site and, on CONNECT, hand the live modem to the terminal
    /// session. Returns false when the operator connection is gone.
    fn dial_and_connect(
        &self,
        site: &Site,
        state: &mut State,
        input: &mut InputBytes,
        out: &SharedWriter,
    ) -> bool {
        let progress = format!(
            "\r\nDialing {} ({}) at {} baud...\r\n",
            site.name, site.phone, site.baud_rate
        );
        if out.write_all(progress.as_bytes()).is_err() {
            return false;
        }

        match self.orchestrator.run(site) {
            Ok(DialOutcome::Connected(call)) => {
                *state = State::Connected;
                let session = TerminalSession::new(
                    call.modem,
                    call.device,
                    site.name.clone(),
                    self.log_dir.clone(),
                    Arc::clone(&self.arbiter),
                )
                .with_wake_interval(self.wake_interval);
                let end = session.run(input, out.clone());
                let notice = format!("\r\n*** Session ended: {} ***\r\n", end.describe());
                out.write_all(notice.as_bytes()).is_ok()
            }
            Ok(DialOutcome::Failed(resp)) => {
                let mut screen = format!("\r\nDial failed: {}\r\n", resp.result);
                let transcript = clean_transcript_block(&resp.transcript);
                if !transcript.is_empty() {
                    screen.push_str("AT log:\r\n");
                    screen.push_str(&transcript);
                }
                if out.write_all(screen.as_bytes()).is_err() {
                    return false;
                }
                self.wait_for_enter(input, out)
            }
            Err(err) => {
                warn!(site = %site.name, error = %err, "dial error");
                let message = match &err {
                    DialError::Arbiter(inner) => format!("\r\nCannot dial: {inner}\r\n"),
                    DialError::Modem(inner) => format!("\r\nModem error: {inner}\r\n"),
                };
                if out.write_all(message.as_bytes()).is_err() {
                    return false;
                }
                self.wait_for_enter(input, out)
            }
        }
    }

    /// Failed-dial screen: Enter (or Ctrl+C) returns to the menu.
    fn wait_for_enter(&self, input: &mut InputBytes, out: &SharedWriter) -> bool {
        if out
            .write_all(b"Press Enter to return to the menu.\r\n")
            .is_err()
        {
            return false;
        }
        loop {
            match input.recv() {
                Ok(b'\r') | Ok(b'\n') | Ok(0x03) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    }

    fn render_menu(&self, out: &SharedWriter) {
        let active = self.arbiter.active_sites();
        let (free, total) = self.arbiter.available();

        let mut screen = String::new();
        screen.push_str("\r\n=== OOB Console Hub ===\r\n");
        screen.push_str(&format!(
            "lines free: {free}/{total} | user: {}\r\n\r\n",
            self.username
        ));
        for (idx, site) in self.sites.iter().enumerate() {
            let marker = if active.contains(&site.name) { '*' } else { ' ' };
            screen.push_str(&format!(
                " {marker} {}. {} — {} ({} baud)\r\n",
                idx + 1,
                site.name,
                site.description,
                site.baud_rate
            ));
        }
        screen.push_str(&format!(
            "\r\nSelect site (1-{}), or q to quit: ",
            self.sites.len()
        ));
        let _ = out.write_all(screen.as_bytes());
    }

    /// First-login password change. Returns false when the operator
    /// disconnected instead of finishing.
    fn password_change(&self, input: &mut InputBytes, out: &SharedWriter) -> bool {
        let intro = "\r\n=== Password change required ===\r\nYou must set a new password before continuing.\r\n";
        if out.write_all(intro.as_bytes()).is_err() {
            return false;
        }

        loop {
            let _ = out.write_all(b"\r\nNew password: ");
            let first = match read_line(input, out, Echo::Masked) {
                LineInput::Line(line) => line,
                LineInput::Interrupted | LineInput::Closed => return false,
            };
            let _ = out.write_all(b"Confirm password: ");
            let second = match read_line(input, out, Echo::Masked) {
                LineInput::Line(line) => line,
                LineInput::Interrupted | LineInput::Closed => return false,
            };

            if first.len() < MIN_PASSWORD_LEN {
                let message =
                    format!("Password must be at least {MIN_PASSWORD_LEN} characters.\r\n");
                let _ = out.write_all(message.as_bytes());
                continue;
            }
            if first != second {
                let _ = out.write_all(b"Passwords do not match.\r\n");
                continue;
            }
            match self.store.set_password(&self.username, &first) {
                Ok(()) => {
                    info!(user = %self.username, "password changed");
                    let _ = out.write_all(b"Password updated.\r\n");
                    return true;
                }
                Err(err) => {
                    warn!(user = %self.username, error = %err, "password change failed");
                    let message = format!("Could not set password: {err}\r\n");
                    let _ = out.write_all(message.as_bytes());
                }
            }
        }
    }
}

/// Indent the cleaned per-line transcript for the failed-dial screen.
fn clean_transcript_block(transcript: &str) -> String {
    let mut block = String::new();
    for line in transcript.lines() {
        let cleaned = clean_response(line);
        if !cleaned.is_empty() {
            block.push_str("  ");
            block.push_str(&cleaned);
            block.push_str("\r\n");
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn menu_choice_parsing() {
        assert_eq!(parse_menu_choice("q", 3), MenuChoice::Quit);
        assert_eq!(parse_menu_choice("Q", 3), MenuChoice::Quit);
        assert_eq!(parse_menu_choice("1", 3), MenuChoice::Dial(0));
        assert_eq!(parse_menu_choice(" 3 ", 3), MenuChoice::Dial(2));
        assert_eq!(parse_menu_choice("4", 3), MenuChoice::Invalid);
        assert_eq!(parse_menu_choice("0", 3), MenuChoice::Invalid);
        assert_eq!(parse_menu_choice("x", 3), MenuChoice::Invalid);
        assert_eq!(parse_menu_choice("", 3), MenuChoice::Empty);
        assert_eq!(parse_menu_choice("  ", 3), MenuChoice::Empty);
    }

    #[test]
    fn transcript_block_is_cleaned_and_indented() {
        let block = clean_transcript_block(">>> ATDT123\n<<< BUSY\n\n");
        assert_eq!(block, "  >>> ATDT123\r\n  <<< BUSY\r\n");
    }
}
