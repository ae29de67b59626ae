//! The dial orchestrator: acquire a line, bring the modem up, and dial,
//! with a bounded retry policy for transient line conditions.
//!
//! On CONNECT, ownership of the acquired line transfers to the caller (the
//! terminal session releases it); on every other outcome the line is
//! released here.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::modem::{Arbiter, ArbiterError, DialResponse, DialResult, ModemError, ModemLink, ModemOpener};
use crate::sites::Site;

/// Keep the dial timeout above the upstream voice gateway's own call-setup
/// timeout (~120 s) so final result codes like NO CARRIER arrive instead of
/// being shadowed by a local TIMEOUT.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(125);
pub const RESET_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
pub struct DialPolicy {
    pub dial_timeout: Duration,
    pub reset_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            dial_timeout: DIAL_TIMEOUT,
            reset_timeout: RESET_TIMEOUT,
            max_attempts: MAX_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }
}

/// A live call: the modem in Connected state, the device it runs on, and the
/// AT transcript up to CONNECT. Whoever holds this owns the line release.
pub struct ConnectedCall {
    pub modem: Box<dyn ModemLink>,
    pub device: PathBuf,
    pub transcript: String,
}

/// How a dial run concluded when nothing went operationally wrong.
pub enum DialOutcome {
    Connected(ConnectedCall),
    /// A terminal (or retries-exhausted) modem result; the line has been
    /// released.
    Failed(DialResponse),
}

impl std::fmt::Debug for DialOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialOutcome::Connected(_) => f.debug_tuple("Connected").finish(),
            DialOutcome::Failed(resp) => f.debug_tuple("Failed").field(resp).finish(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
    #[error(transparent)]
    Modem(#[from] ModemError),
}

pub struct Orchestrator {
    arbiter: Arc<dyn Arbiter>,
    opener: Arc<dyn ModemOpener>,
    policy: DialPolicy,
}

impl Orchestrator {
    pub fn new(arbiter: Arc<dyn Arbiter>, opener: Arc<dyn ModemOpener>) -> Self {
        Self {
            arbiter,
            opener,
            policy: DialPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DialPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Acquire → open → init → configure → dial, retrying up to three times
    /// when the result is plausibly transient (NO CARRIER, TIMEOUT). Blocks
    /// for up to `dial_timeout` per attempt.
    pub fn run(&self, site: &Site) -> Result<DialOutcome, DialError> {
        let device = self.arbiter.acquire(&site.name)?;
        info!(site = %site.name, device = %device.display(), "dialing");

        let mut last: Option<DialResponse> = None;
        for attempt in 1..=self.policy.max_attempts.max(1) {
            if attempt > 1 {
                thread::sleep(self.policy.retry_delay);
                info!(site = %site.name, attempt, "retrying dial");
            }

            let mut modem = match self.opener.open(&device) {
                Ok(modem) => modem,
                Err(err) => {
                    self.arbiter.release(&device);
                    return Err(err.into());
                }
            };

            if let Err(err) = modem.init(self.policy.reset_timeout) {
                modem.close();
                self.arbiter.release(&device);
                return Err(err.into());
            }

            if !site.modem_init.is_empty() {
                if let Err(err) = modem.configure(&site.modem_init, self.policy.reset_timeout) {
                    modem.close();
                    self.arbiter.release(&device);
                    return Err(err.into());
                }
            }

            let response = match modem.dial(&site.phone, self.policy.dial_timeout) {
                Ok(response) => response,
                Err(err) => {
                    modem.hangup();
                    modem.close();
                    self.arbiter.release(&device);
                    return Err(err.into());
                }
            };

            if response.result == DialResult::Connect {
                return Ok(DialOutcome::Connected(ConnectedCall {
                    modem,
                    device,
                    transcript: response.transcript,
                }));
            }

            warn!(
                site = %site.name,
                result = %response.result,
                attempt,
                max = self.policy.max_attempts,
                "dial attempt failed"
            );

            // The line stays acquired between attempts; only the driver is
            // cycled.
            modem.hangup();
            modem.close();

            if !response.result.retryable() {
                self.arbiter.release(&device);
                return Ok(DialOutcome::Failed(response));
            }
            last = Some(response);
        }

        self.arbiter.release(&device);
        let response = last.expect("at least one attempt ran");
        Ok(DialOutcome::Failed(response))
    }
}
