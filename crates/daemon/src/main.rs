//! ScreenRelay Daemon
//!
//! Streams captured frames to WebSocket clients and exchanges session
//! descriptions over UDP signaling.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::signaling::{SignalingConfig, UdpSignaling};
use protocol::SignalKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// ScreenRelay Daemon - frame streaming and UDP signaling.
#[derive(Parser, Debug)]
#[command(name = "screenrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept clients and stream frames until interrupted
    Serve,

    /// Send an offer and print the answer
    Offer {
        /// Peer to send the offer to (defaults to signaling.remote_addr)
        #[arg(long, short)]
        remote: Option<SocketAddr>,

        /// File holding the offer (reads stdin when omitted)
        #[arg(long, short, value_name = "FILE")]
        payload: Option<PathBuf>,
    },

    /// Wait for an offer and reply with an answer
    Answer {
        /// File holding the answer (reads stdin when omitted)
        #[arg(long, short, value_name = "FILE")]
        answer: Option<PathBuf>,

        /// Write the received offer here instead of stdout
        #[arg(long, short, value_name = "FILE")]
        offer_out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let level = if cli.verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let _log_guard = init_logging(level, config.daemon.log_dir.as_deref())?;

    tracing::info!("ScreenRelay daemon starting...");
    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    // Handle commands
    match cli.command {
        Commands::Serve => {
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Offer { remote, payload } => {
            run_offer(&config, remote, payload.as_deref()).await?;
        }
        Commands::Answer { answer, offer_out } => {
            run_answer(&config, answer.as_deref(), offer_out.as_deref()).await?;
        }
    }

    Ok(())
}

/// Installs the tracing subscriber.
///
/// Logs go to stderr, and additionally to a daily rolling file when a log
/// directory is configured. The returned guard must be held until exit.
fn init_logging(level: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "screenrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

/// Run the daemon until SIGINT or SIGTERM.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    // Start the orchestrator
    orchestrator.start().await?;

    if let Some(addr) = orchestrator.local_addr() {
        tracing::info!("Accepting clients on ws://{}{}", addr, daemon::network::WS_PATH);
    }

    // Subscribe to orchestrator events for logging
    let mut events = orchestrator.subscribe();

    // Spawn event logging task
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ClientConnected { client_id, role } => {
                    tracing::debug!("Client connected: {} ({})", client_id, role);
                }
                OrchestratorEvent::ClientDisconnected { client_id, role } => {
                    tracing::debug!("Client disconnected: {} ({})", client_id, role);
                }
            }
        }
    });

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    // Stop the orchestrator
    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

/// Send an offer and print the decoded answer to stdout.
async fn run_offer(
    config: &Config,
    remote: Option<SocketAddr>,
    payload: Option<&Path>,
) -> anyhow::Result<()> {
    let remote = match remote {
        Some(addr) => addr,
        None => config.signaling.remote_socket_addr()?,
    };
    let offer = read_input(payload).await?;
    let timeout = config.signaling.answer_timeout();

    let mut signaling = UdpSignaling::bind(SignalingConfig::from_settings(&config.signaling)?)
        .await
        .context("Failed to bind signaling socket")?;

    tracing::info!("Sending offer ({} bytes) to {}", offer.len(), remote);
    let (answer, from) = signaling
        .offer(remote, &offer, timeout)
        .await
        .with_context(|| format!("No answer from {} (timeout {:?})", remote, timeout))?;
    tracing::info!("Received answer ({} bytes) from {}", answer.len(), from);

    write_output(None, &answer).await
}

/// Wait for an offer, emit it, then send back the answer.
async fn run_answer(
    config: &Config,
    answer_path: Option<&Path>,
    offer_out: Option<&Path>,
) -> anyhow::Result<()> {
    let timeout = config.signaling.offer_timeout();
    let mut signaling = UdpSignaling::bind(SignalingConfig::from_settings(&config.signaling)?)
        .await
        .context("Failed to bind signaling socket")?;
    let local = signaling.local_addr()?;

    tracing::info!("Waiting for offer on {}", local);
    let (offer, from) = signaling
        .wait_for_signal(SignalKind::Offer, timeout)
        .await
        .with_context(|| format!("No offer received on {} (timeout {:?})", local, timeout))?;
    tracing::info!("Received offer ({} bytes) from {}", offer.len(), from);

    write_output(offer_out, &offer).await?;

    let answer = read_input(answer_path).await?;
    signaling
        .send_signal(from, SignalKind::Answer, &answer)
        .await
        .with_context(|| format!("Failed to send answer to {}", from))?;
    tracing::info!("Sent answer ({} bytes) to {}", answer.len(), from);

    Ok(())
}

/// Reads a session description from `path`, or stdin when `None`.
async fn read_input(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

/// Writes a session description to `path`, or stdout when `None`.
async fn write_output(path: Option<&Path>, data: &[u8]) -> anyhow::Result<()> {
    match path {
        Some(path) => tokio::fs::write(path, data)
            .await
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(data).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}
