use anyhow::{bail, Context, Result};
use chrono::SecondsFormat;
use clap::{Args, Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use dialhub::auth::{generate_temporary_password, FileStore, UserStore};
use dialhub::config::{AppConfig, DeviceConfig};
use dialhub::dial::{DIAL_TIMEOUT, RESET_TIMEOUT};
use dialhub::modem::{Arbiter, DeviceLock, DeviceOpener, DevicePool, DialResult, Modem, ModemLink, ModemOpener};
use dialhub::server::Server;
use dialhub::session::TranscriptLog;
use dialhub::sites::parse_sites_file;
use dialhub::telemetry::{self, LogConfig, LogLevel};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("initializing logging")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Probe(args) => {
            let interrupted = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&interrupted);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                flag.store(true, Ordering::SeqCst);
            });
            tokio::task::spawn_blocking(move || probe(args, interrupted))
                .await
                .context("probe worker panicked")?
        }
        Command::User { data_dir, action } => {
            tokio::task::spawn_blocking(move || manage_users(data_dir, action))
                .await
                .context("user admin worker panicked")?
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "dialhub",
    about = "PSTN out-of-band console hub: dial remote serial consoles through a voice-band modem",
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "DIALHUB_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "DIALHUB_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the hub (default when no subcommand is given)
    Serve,
    /// Exercise the modem path directly: init, optional configure and dial
    Probe(ProbeArgs),
    /// Administer operator accounts
    User {
        #[arg(
            long = "data-dir",
            env = "USER_DATA_DIR",
            default_value = "/data/users",
            help = "Directory holding users.json"
        )]
        data_dir: PathBuf,

        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Args, Debug)]
struct ProbeArgs {
    #[arg(long, env = "DEVICE_PATH", default_value = "/dev/ttySL0")]
    device: PathBuf,

    #[arg(long, help = "Phone number to dial (omit to test init only)")]
    dial: Option<String>,

    #[arg(
        long,
        help = "Semicolon-separated AT commands to send after init (e.g. AT+MS=132,0,4800,9600)"
    )]
    init: Option<String>,

    #[arg(long, env = "LOG_DIR", default_value = "./logs")]
    logdir: PathBuf,

    #[arg(
        long,
        default_value_t = 60,
        help = "Seconds to stay connected after CONNECT (0 = until Ctrl+C)"
    )]
    timeout: u64,

    #[arg(long, default_value_t = 2, help = "Seconds between wake pulses after CONNECT")]
    wake_interval: u64,

    #[arg(long, env = "MODEM_DIAL_PREFIX", default_value = "ATDT")]
    dial_prefix: String,
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Create a user with a temporary password
    Add { username: String },
    /// Remove a user
    Remove { username: String },
    /// List all users
    List,
    /// Lock a user account
    Lock { username: String },
    /// Unlock a user account
    Unlock { username: String },
    /// Reset a user's password
    Reset { username: String },
}

async fn serve() -> Result<()> {
    let config = AppConfig::from_env();

    let store = FileStore::open(&config.user_data_dir).context("initializing user store")?;

    let sites = parse_sites_file(&config.sites_path)
        .with_context(|| format!("loading sites from {}", config.sites_path.display()))?;
    if sites.is_empty() {
        bail!("no sites defined in {}", config.sites_path.display());
    }
    info!(count = sites.len(), path = %config.sites_path.display(), "sites loaded");

    let arbiter: Arc<dyn Arbiter> = match &config.device {
        DeviceConfig::Single(path) => Arc::new(DeviceLock::new(path.clone())),
        DeviceConfig::Pool { prefix, count } => Arc::new(DevicePool::probe(prefix, *count)),
    };
    let (free, total) = arbiter.available();
    info!(free, total, "modem lines");

    let opener: Arc<dyn ModemOpener> = Arc::new(DeviceOpener {
        dial_prefix: config.dial_prefix.clone(),
    });

    Server::new(config, Arc::new(store), arbiter, opener, sites)
        .run()
        .await
}

/// Diagnostic path: everything the orchestrator would do, by hand, against a
/// real device, with output on the terminal.
fn probe(args: ProbeArgs, interrupted: Arc<AtomicBool>) -> Result<()> {
    eprintln!("--- Opening {} ---", args.device.display());
    let mut modem = Modem::open(&args.device)?.with_dial_prefix(&args.dial_prefix);

    modem.init(RESET_TIMEOUT).context("modem init")?;
    eprintln!("--- Modem initialized ---");

    if let Some(init) = &args.init {
        let commands: Vec<String> = init
            .split(';')
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
            .map(str::to_string)
            .collect();
        modem
            .configure(&commands, RESET_TIMEOUT)
            .context("modem configure")?;
        eprintln!("--- Modem configured ---");
    }

    let transcript = modem.transcript();
    if !transcript.is_empty() {
        eprintln!("--- AT transcript ---\n{transcript}--- end transcript ---");
    }

    let Some(number) = &args.dial else {
        eprintln!("--- No dial number given, stopping after init ---");
        return Ok(());
    };

    let response = modem.dial(number, DIAL_TIMEOUT).context("dial")?;
    eprintln!("--- Dial result: {} ---", response.result);
    if response.result != DialResult::Connect {
        eprintln!("{}", response.transcript);
        bail!("dial failed: {}", response.result);
    }

    watch_connected(modem, &args, number, interrupted)
}

fn watch_connected(
    mut modem: Modem,
    args: &ProbeArgs,
    number: &str,
    interrupted: Arc<AtomicBool>,
) -> Result<()> {
    let log = TranscriptLog::create(&args.logdir, &format!("probe-{number}"), &args.device)
        .context("creating transcript log")?;
    eprintln!("--- CONNECTED; transcript: {} ---", log.path().display());

    let raw = modem.raw_io()?;
    let mut tee = log.tee(raw.reader);
    let (done_tx, done_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        let mut stdout = io::stdout();
        let mut buf = [0u8; 1024];
        loop {
            match tee.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = stdout.flush();
                }
            }
        }
        let _ = done_tx.send(());
    });

    let deadline = (args.timeout > 0).then(|| Instant::now() + Duration::from_secs(args.timeout));
    let wake_interval = Duration::from_secs(args.wake_interval.max(1));
    let mut next_wake = Instant::now();

    loop {
        if interrupted.load(Ordering::SeqCst) {
            eprintln!("\n--- Interrupted, hanging up ---");
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            eprintln!("\n--- Timeout reached, hanging up ---");
            break;
        }
        match done_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => {
                eprintln!("\n--- Connection closed by far end ---");
                modem.close();
                let _ = log.close();
                return Ok(());
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if Instant::now() >= next_wake {
            if raw.writer.write_all(b"\r").is_err() {
                break;
            }
            next_wake = Instant::now() + wake_interval;
        }
    }

    modem.hangup();
    modem.close();
    let _ = log.close();
    Ok(())
}

fn manage_users(data_dir: PathBuf, action: UserAction) -> Result<()> {
    let store = FileStore::open(&data_dir).context("initializing user store")?;

    match action {
        UserAction::Add { username } => {
            if !valid_username(&username) {
                bail!(
                    "invalid username {username:?}: must be 2-32 lowercase alphanumeric chars, dots, or hyphens"
                );
            }
            let temp = generate_temporary_password();
            store.add(&username, &temp)?;
            println!("User {username:?} created.");
            println!("Temporary password: {temp}");
            println!("User must change password on first login.");
        }
        UserAction::Remove { username } => {
            store.remove(&username)?;
            println!("User {username:?} removed.");
        }
        UserAction::List => {
            let users = store.list()?;
            if users.is_empty() {
                println!("No users.");
                return Ok(());
            }
            println!("{:<20} {:<8} {:<26} {}", "USERNAME", "STATUS", "LAST LOGIN", "PASSWORD CHANGE");
            for user in users {
                let status = if user.locked { "locked" } else { "active" };
                let last_login = user
                    .last_login
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_else(|| "never".to_string());
                let change = if user.force_change { "required" } else { "" };
                println!("{:<20} {:<8} {:<26} {}", user.username, status, last_login, change);
            }
        }
        UserAction::Lock { username } => {
            store.lock(&username)?;
            println!("User {username:?} locked.");
        }
        UserAction::Unlock { username } => {
            store.unlock(&username)?;
            println!("User {username:?} unlocked.");
        }
        UserAction::Reset { username } => {
            let temp = generate_temporary_password();
            store.reset(&username, &temp)?;
            println!("Password reset for {username:?}.");
            println!("Temporary password: {temp}");
            println!("User must change password on next login.");
        }
    }
    Ok(())
}

fn valid_username(name: &str) -> bool {
    (2..=32).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
}
