mod host_config;
mod probe;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use linkroom_core::config::ConfigError;
use linkroom_core::serial::ChannelSerialEndpoint;
use linkroom_core::{LinkFailure, LinkSession, MatchmakingError, RoomStatus, SessionError};
use log::{debug, info};
use thiserror::Error;

use host_config::HostConfig;
use probe::ProbeEngine;

// Long enough for the HTTP client's own timeout to fire first.
const REQUEST_WAIT: Duration = Duration::from_secs(45);
const CONNECT_WAIT: Duration = Duration::from_secs(10);
const CLOSE_WAIT: Duration = Duration::from_secs(5);
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up relay client: {0}")]
    Client(#[from] MatchmakingError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no device id configured; set device_id in {0} or pass --device-id")]
    MissingDeviceId(String),
    #[error("{0}")]
    Failed(LinkFailure),
    #[error("no room to connect to ({0})")]
    NoRoom(String),
    #[error("relay dropped the link before accepting it ({0})")]
    ConnectFailed(String),
    #[error("timed out waiting for the relay ({0})")]
    Timeout(String),
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Parser)]
#[command(name = "linkroom", about = "Link cable sessions through a network relay")]
struct Args {
    /// Path to the host config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Temporary relay host such as 10.0.0.2:8080, reached over plain http
    #[arg(long, global = true)]
    host: Option<String>,

    /// Device id to use instead of the configured one
    #[arg(long, global = true)]
    device_id: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the relay whether this device is in a room
    Check,
    /// Create a room owned by this device
    Create,
    /// Join another device's room
    Join {
        /// Six-character room code
        code: String,
    },
    /// Close this device's room
    Close,
    /// Connect to this device's room and exchange probe bytes
    Connect {
        /// Seconds to stay connected
        #[arg(long, default_value_t = 30)]
        seconds: u64,

        /// Push every received byte back to the peer
        #[arg(long)]
        loopback: bool,
    },
    /// Write the effective config to the config path
    InitConfig,
}

fn wait_until(
    session: &mut LinkSession,
    timeout: Duration,
    mut done: impl FnMut(&LinkSession) -> bool,
) -> Result<(), HostError> {
    let deadline = Instant::now() + timeout;
    while !done(session) {
        let now = Instant::now();
        if now >= deadline {
            return Err(HostError::Timeout(session.status().to_string()));
        }
        session.wait_for_event((deadline - now).min(Duration::from_millis(100)));
    }
    Ok(())
}

/// Waits for the running operation, then turns an error status into an error.
fn finish(session: &mut LinkSession) -> Result<(), HostError> {
    wait_until(session, REQUEST_WAIT, |s| !s.is_working())?;
    match session.status() {
        RoomStatus::Error(failure) => Err(HostError::Failed(failure.clone())),
        _ => Ok(()),
    }
}

fn check(session: &mut LinkSession) -> Result<(), HostError> {
    session.check_for_rooms()?;
    finish(session)
}

/// Outcome of a connect attempt once the link is up or gone.
fn link_result(session: &LinkSession) -> Result<(), HostError> {
    if session.is_link_established() {
        return Ok(());
    }
    match session.status() {
        RoomStatus::Error(failure) => Err(HostError::Failed(failure.clone())),
        status => Err(HostError::ConnectFailed(status.to_string())),
    }
}

fn run_connect(
    session: &mut LinkSession,
    seconds: u64,
    loopback: bool,
    probe: &mut ProbeEngine,
) -> Result<(), HostError> {
    check(session)?;
    if !matches!(session.status(), RoomStatus::RoomAvailable(_)) {
        return Err(HostError::NoRoom(session.status().to_string()));
    }

    session.connect_to_room()?;
    wait_until(session, CONNECT_WAIT, |s| {
        s.is_link_established() || !s.has_connection()
    })?;
    link_result(session)?;

    info!(
        "Link: probing for {seconds}s{}",
        if loopback { " in loopback mode" } else { "" }
    );
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while session.is_link_established() && Instant::now() < deadline {
        session.wait_for_event(Duration::from_millis(5));
        probe.step(session, Instant::now());
    }
    info!("Link: probe received {} byte(s)", probe.received());

    if session.is_link_established() {
        session.disconnect()?;
    }
    wait_until(session, CLOSE_WAIT, |s| !s.has_connection())
}

fn run_session(
    command: Command,
    config: &HostConfig,
    config_path: &Path,
    host_override: Option<&str>,
) -> Result<(), HostError> {
    let relay = config.relay_for(host_override)?;
    let registration = config.registration();
    if !registration.is_verified() {
        return Err(HostError::MissingDeviceId(config_path.display().to_string()));
    }

    let (endpoint, deliveries) = ChannelSerialEndpoint::new();
    let mut session = LinkSession::with_relay(relay, Box::new(endpoint))?;
    session.subscribe(|update| {
        debug!(
            "Link: status {} (working: {})",
            update.status, update.is_working
        );
    });
    session.set_registration(registration);

    match command {
        Command::Check => check(&mut session)?,
        Command::Create => {
            check(&mut session)?;
            session.create_room()?;
            finish(&mut session)?;
        }
        Command::Join { code } => {
            check(&mut session)?;
            session.join_room(&code)?;
            finish(&mut session)?;
        }
        Command::Close => {
            check(&mut session)?;
            session.close_room()?;
            finish(&mut session)?;
        }
        Command::Connect { seconds, loopback } => {
            let mut probe = ProbeEngine::new(deliveries, loopback, PROBE_INTERVAL);
            run_connect(&mut session, seconds, loopback, &mut probe)?;
        }
        Command::InitConfig => {}
    }

    println!("{}", session.status());
    if let Some(room) = session.status().room() {
        let role = if room.room_key.is_owner() { "owner" } else { "participant" };
        println!("room {} as {role}, link port {}", room.room_code, room.link_port);
    }
    Ok(())
}

fn init_config(config: &HostConfig, path: &Path) -> Result<(), HostError> {
    host_config::save_to_file(path, config).map_err(|source| HostError::Write {
        path: path.display().to_string(),
        source,
    })?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn run(args: Args) -> Result<(), HostError> {
    let config_path = args
        .config
        .unwrap_or_else(host_config::default_host_config_path);
    let mut config = host_config::load_from_file(&config_path);
    if let Some(device_id) = args.device_id {
        config.device_id = Some(device_id);
    }

    match args.command {
        Command::InitConfig => init_config(&config, &config_path),
        command => run_session(command, &config, &config_path, args.host.as_deref()),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("linkroom: {e}");
            ExitCode::FAILURE
        }
    }
}
