//! SensorLink Node - telemetry producer for the SensorLink collector
//!
//! Console front-end over a single session:
//! - `connect`, `disconnect`, `pause`, `resume`, `status`, `quit`
//! - Ctrl-C disconnects cleanly and exits
//! - Session events are logged as they happen

use anyhow::{Context, Result};
use sensorlink_node::{ClientSession, NodeConfig, SensorSimulator, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, PartialEq)]
enum Command {
    Connect,
    Disconnect,
    Pause,
    Resume,
    Status,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "status" => Some(Self::Status),
            "quit" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NodeConfig::load().await.context("Failed to load node configuration")?;
    info!("SensorLink node v{} - collector {}", env!("CARGO_PKG_VERSION"), config.server);

    let (mut session, events) = ClientSession::new(config.session.to_session_config(), SensorSimulator::new());
    tokio::spawn(log_events(events));

    if config.auto_connect {
        connect(&mut session, &config).await;
    }

    println!("commands: connect | disconnect | pause | resume | status | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        // stdin fermé
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Some(Command::Connect) => connect(&mut session, &config).await,
            Some(Command::Disconnect) => session.disconnect().await,
            Some(Command::Pause) => session.pause(),
            Some(Command::Resume) => session.resume(),
            Some(Command::Status) => println!(
                "state={:?} identity={:?} paused={}",
                session.state(),
                session.identity(),
                session.is_paused()
            ),
            Some(Command::Quit) => break,
            None => warn!("unknown command: {}", line.trim()),
        }
    }

    session.disconnect().await;
    Ok(())
}

async fn connect(session: &mut ClientSession<SensorSimulator>, config: &NodeConfig) {
    if let Err(e) = session.connect(&config.server, &config.identity).await {
        error!("Connection failed: {}", e);
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected { identity } => info!("connected as {identity}"),
            SessionEvent::Rejected { message } => warn!("rejected: {message}"),
            SessionEvent::ReadingSent { identity, reading } => info!(
                "[{identity}] temperature={:.1} humidity={:.1}",
                reading.temperature, reading.humidity
            ),
            SessionEvent::ServerMessage(msg) => info!("collector sent {}", msg.kind()),
            SessionEvent::ConnectionLost { reason } => warn!("connection lost: {reason} (type `connect` to retry)"),
            SessionEvent::Disconnected => info!("disconnected"),
            SessionEvent::Paused => info!("data paused, heartbeats continue"),
            SessionEvent::Resumed => info!("data resumed"),
        }
    }
}
