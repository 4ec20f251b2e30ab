//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that initializes and coordinates
//! the client registry, the WebSocket accept server, and the frame dispatch
//! loop. All of them observe one shared cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::capture::{CursorPosition, SnapshotFileSource};
use crate::config::Config;
use crate::dispatch::{DispatchConfig, DispatchLoop, FrameSource};
use crate::input::{InputHandler, LoggingInputHandler};
use crate::network::server::{ServerConfig, ServerEvent, StreamServer};
use crate::network::ConnectionRole;
use crate::session::ClientRegistry;

/// How long `stop` waits for background tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client connection was registered.
    ClientConnected {
        client_id: String,
        role: ConnectionRole,
    },
    /// A client connection was deregistered.
    ClientDisconnected {
        client_id: String,
        role: ConnectionRole,
    },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator<S: FrameSource = SnapshotFileSource> {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Client registry shared by the server and the dispatch loop.
    registry: Arc<ClientRegistry>,
    /// Frame producer.
    source: Arc<S>,
    /// Consumer of control-connection input.
    input: Arc<dyn InputHandler>,
    /// Address the WebSocket server is bound to, once started.
    local_addr: Option<SocketAddr>,
    /// Background tasks.
    tasks: TaskTracker,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator<SnapshotFileSource> {
    /// Creates an orchestrator that streams the configured snapshot file.
    ///
    /// Cursor positions reported by control clients are attached to each
    /// captured frame.
    pub fn new(config: Config) -> Result<Self> {
        let snapshot_path = config.snapshot_path();
        info!("Streaming snapshots from {:?}", snapshot_path);

        let cursor = CursorPosition::new();
        let source = SnapshotFileSource::new(snapshot_path).with_cursor(cursor.clone());
        let input = LoggingInputHandler::new().with_cursor(cursor);

        Ok(Self::with_source(config, source, Arc::new(input)))
    }
}

impl<S: FrameSource> DaemonOrchestrator<S> {
    /// Creates an orchestrator with a custom frame source and input handler.
    pub fn with_source(config: Config, source: S, input: Arc<dyn InputHandler>) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry: Arc::new(ClientRegistry::new()),
            source: Arc::new(source),
            input,
            local_addr: None,
            tasks: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the accept server and the dispatch loop.
    pub async fn start(&mut self) -> Result<()> {
        // Check current state
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        if let Err(e) = self.start_components().await {
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        // Update state to running
        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn start_components(&mut self) -> Result<()> {
        self.shutdown_token = CancellationToken::new();
        self.tasks.reopen();

        let listen_addr = self.config.stream.listen_socket_addr()?;
        let (server_tx, server_rx) = mpsc::channel(256);
        let server = StreamServer::bind(
            listen_addr,
            Arc::clone(&self.registry),
            Arc::clone(&self.input),
            ServerConfig::from(&self.config.stream),
        )
        .await
        .with_context(|| format!("Failed to bind WebSocket server on {}", listen_addr))?
        .with_events(server_tx);
        self.local_addr = Some(server.local_addr()?);

        self.tasks.spawn(server.run(self.shutdown_token.clone()));
        debug!("Started WebSocket server");

        let dispatch = DispatchLoop::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.source),
            DispatchConfig::from(&self.config.stream),
        );
        self.tasks.spawn(dispatch.run(self.shutdown_token.clone()));
        debug!("Started dispatch loop");

        self.tasks
            .spawn(Self::handle_server_events(server_rx, self.event_tx.clone()));

        Ok(())
    }

    /// Forwards server events until the server and all its connections are gone.
    async fn handle_server_events(
        mut server_rx: mpsc::Receiver<ServerEvent>,
        event_tx: broadcast::Sender<OrchestratorEvent>,
    ) {
        while let Some(event) = server_rx.recv().await {
            let event = match event {
                ServerEvent::Connected {
                    client_id, role, ..
                } => OrchestratorEvent::ClientConnected { client_id, role },
                ServerEvent::Disconnected {
                    client_id, role, ..
                } => OrchestratorEvent::ClientDisconnected { client_id, role },
            };
            let _ = event_tx.send(event);
        }
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&self) -> Result<()> {
        // Check current state
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        // Close all connections together; each close is itself bounded
        let connections = self.registry.drain();
        debug!("Closing {} connections", connections.len());
        let closes = join_all(connections.iter().map(|connection| async move {
            if let Err(e) = connection.close().await {
                warn!("Error closing connection {}: {}", connection.id(), e);
            }
        }));
        if tokio::time::timeout(SHUTDOWN_GRACE, closes).await.is_err() {
            warn!("Connections still closing after {:?}, dropping them", SHUTDOWN_GRACE);
        }

        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "Background tasks still running after {:?}, continuing shutdown",
                SHUTDOWN_GRACE
            );
        }

        // Update state
        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the WebSocket server address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the number of registered clients.
    pub fn client_count(&self) -> usize {
        self.registry.client_count()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;
    use futures_util::StreamExt;
    use protocol::{FrameUnit, ScreenUpdate};
    use tempfile::TempDir;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct TestSource;

    impl FrameSource for TestSource {
        async fn capture(&self) -> std::result::Result<FrameUnit, CaptureError> {
            Ok(FrameUnit::new(&b"frame"[..], 1, 2))
        }
    }

    /// Frames large enough to fill socket buffers within a few ticks.
    struct LargeSource;

    impl FrameSource for LargeSource {
        async fn capture(&self) -> std::result::Result<FrameUnit, CaptureError> {
            Ok(FrameUnit::new(vec![0x5a; 2 << 20], 1, 1))
        }
    }

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.stream.listen_addr = "127.0.0.1:0".to_string();
        config.stream.fps = 50;
        config
    }

    fn test_orchestrator(temp_dir: &TempDir) -> DaemonOrchestrator<TestSource> {
        DaemonOrchestrator::with_source(
            create_test_config(temp_dir),
            TestSource,
            Arc::new(LoggingInputHandler::new()),
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> OrchestratorEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();

        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(orchestrator.client_count(), 0);
        assert!(orchestrator.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_orchestrator_state_transitions() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&temp_dir);
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.local_addr().is_some());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.shutdown_token().is_cancelled());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&temp_dir);

        orchestrator.start().await.unwrap();
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = test_orchestrator(&temp_dir);
        assert!(orchestrator.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = create_test_config(&temp_dir);
        config.stream.listen_addr = blocker.local_addr().unwrap().to_string();

        let mut orchestrator = DaemonOrchestrator::with_source(
            config,
            TestSource,
            Arc::new(LoggingInputHandler::new()),
        );
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&temp_dir);

        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(!orchestrator.shutdown_token().is_cancelled());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_bounded_when_stream_client_never_reads() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.stream.write_timeout_ms = 100;
        let mut orchestrator = DaemonOrchestrator::with_source(
            config,
            LargeSource,
            Arc::new(LoggingInputHandler::new()),
        );
        orchestrator.start().await.unwrap();

        let url = format!(
            "ws://{}/ws?role=stream&clientId=viewer",
            orchestrator.local_addr().unwrap()
        );
        let (_ws, _) = connect_async(&url).await.unwrap();

        // Never read, so the kernel buffers fill up and writes stall.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(10), orchestrator.stop())
            .await
            .expect("stop hung on an unread connection")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(orchestrator.client_count(), 0);
    }

    #[tokio::test]
    async fn test_client_events_and_frames() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&temp_dir);
        orchestrator.start().await.unwrap();
        let mut events = orchestrator.subscribe();

        let url = format!(
            "ws://{}/ws?role=stream&clientId=viewer",
            orchestrator.local_addr().unwrap()
        );
        let (mut ws, _) = connect_async(&url).await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            OrchestratorEvent::ClientConnected {
                client_id: "viewer".to_string(),
                role: ConnectionRole::Stream,
            }
        );

        let frame = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                    break text;
                }
            }
        })
        .await
        .unwrap();
        let update: ScreenUpdate = serde_json::from_str(&frame).unwrap();
        assert_eq!((update.mouse_x, update.mouse_y), (1, 2));

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.client_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_client_connections() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&temp_dir);
        orchestrator.start().await.unwrap();
        let mut events = orchestrator.subscribe();

        let url = format!("ws://{}/ws", orchestrator.local_addr().unwrap());
        let (mut ws, _) = connect_async(&url).await.unwrap();
        next_event(&mut events).await;

        orchestrator.stop().await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok());
    }
}
