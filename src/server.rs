//! The operator-facing listener.
//!
//! Binds `SSH_ADDRESS:SSH_PORT` and serves each connection a login prompt
//! followed by the supervisor. This is the seam where the deployment's SSH
//! terminator sits; the hub side of that seam is a plain byte stream, and
//! credentials flow through the same narrow authenticator either way.

use anyhow::{Context, Result};
use std::fs::DirBuilder;
use std::net::TcpStream;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::auth::UserStore;
use crate::config::AppConfig;
use crate::modem::{Arbiter, ModemOpener, SharedWriter};
use crate::session::InputBytes;
use crate::sites::Site;
use crate::supervisor::{read_line, Echo, LineInput, Supervisor};

const MAX_LOGIN_ATTEMPTS: u32 = 3;

pub struct Server {
    config: AppConfig,
    store: Arc<dyn UserStore>,
    arbiter: Arc<dyn Arbiter>,
    opener: Arc<dyn ModemOpener>,
    sites: Arc<Vec<Site>>,
}

impl Server {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn UserStore>,
        arbiter: Arc<dyn Arbiter>,
        opener: Arc<dyn ModemOpener>,
        sites: Vec<Site>,
    ) -> Self {
        Self {
            config,
            store,
            arbiter,
            opener,
            sites: Arc::new(sites),
        }
    }

    /// Accept operator connections until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        // The SSH terminator in front of us reads its keys from here.
        if !self.config.host_key_dir.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&self.config.host_key_dir)
                .context("creating host key dir")?;
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding {bind_addr}"))?;
        info!(addr = %bind_addr, sites = self.sites.len(), "hub listening");

        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    info!(peer = %peer, "operator connected");

                    let std_stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!(error = %err, "could not detach stream");
                            continue;
                        }
                    };

                    let store = Arc::clone(&self.store);
                    let arbiter = Arc::clone(&self.arbiter);
                    let opener = Arc::clone(&self.opener);
                    let sites = Arc::clone(&self.sites);
                    let log_dir = self.config.log_dir.clone();
                    tokio::task::spawn_blocking(move || {
                        if let Err(err) = serve_connection(
                            std_stream, store, arbiter, opener, sites, log_dir,
                        ) {
                            warn!(peer = %peer, error = %err, "session ended with error");
                        }
                        info!(peer = %peer, "operator disconnected");
                    });
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// One operator connection, start to finish, on a blocking worker.
fn serve_connection(
    stream: TcpStream,
    store: Arc<dyn UserStore>,
    arbiter: Arc<dyn Arbiter>,
    opener: Arc<dyn ModemOpener>,
    sites: Arc<Vec<Site>>,
    log_dir: PathBuf,
) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("restoring blocking mode")?;
    let write_half = stream.try_clone().context("cloning stream")?;

    let mut input = InputBytes::spawn(stream);
    let out = SharedWriter::new(Box::new(write_half));

    let Some(username) = login(&mut input, &out, store.as_ref()) else {
        let _ = out.write_all(b"Too many failures.\r\n");
        return Ok(());
    };

    if let Err(err) = store.update_last_login(&username) {
        warn!(user = %username, error = %err, "could not record login time");
    }
    info!(user = %username, "operator authenticated");

    Supervisor::new(username, sites, arbiter, opener, store, log_dir).run(&mut input, out);
    Ok(())
}

/// Prompt for credentials up to [`MAX_LOGIN_ATTEMPTS`] times.
fn login(input: &mut InputBytes, out: &SharedWriter, store: &dyn UserStore) -> Option<String> {
    for _ in 0..MAX_LOGIN_ATTEMPTS {
        let _ = out.write_all(b"login: ");
        let username = match read_line(input, out, Echo::Plain) {
            LineInput::Line(line) => line.trim().to_string(),
            LineInput::Interrupted => continue,
            LineInput::Closed => return None,
        };
        let _ = out.write_all(b"Password: ");
        let password = match read_line(input, out, Echo::Masked) {
            LineInput::Line(line) => line,
            LineInput::Interrupted => continue,
            LineInput::Closed => return None,
        };

        match store.authenticate(&username, &password) {
            Ok(true) => return Some(username),
            Ok(false) => {
                info!(user = %username, "authentication failed");
                let _ = out.write_all(b"Login incorrect.\r\n\r\n");
            }
            Err(err) => {
                warn!(user = %username, error = %err, "authenticator error");
                let _ = out.write_all(b"Login unavailable.\r\n\r\n");
            }
        }
    }
    None
}
