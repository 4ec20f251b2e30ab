//! WebSocket accept server.
//!
//! Clients connect to `ws://<listen_addr>/ws?role=control|stream&clientId=<id>`.
//! Each accepted connection is registered with the [`ClientRegistry`] under
//! its role and client id, then served by its own reader task until the
//! remote end goes away, the read deadline passes, or shutdown is requested.
//!
//! - Stream connections only receive frames; anything they send is drained.
//! - Control connections carry [`InputEvent`]s. A new control connection for
//!   the same client supersedes and closes the previous one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use protocol::error::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::websocket::{WebSocketConnection, WsReader, DEFAULT_CLOSE_TIMEOUT};
use super::{Connection, ConnectionHandle, ConnectionId, ConnectionRole};
use crate::config::{StreamConfig, DEFAULT_CLIENT_ID};
use crate::input::{InputEvent, InputHandler};
use crate::session::ClientRegistry;

/// Path WebSocket clients connect to.
pub const WS_PATH: &str = "/ws";

/// Deadline for completing the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound message or frame a client may send.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 << 20;

/// Role and client id requested by a connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub role: ConnectionRole,
    pub client_id: String,
}

impl ConnectRequest {
    /// Parses the handshake query string. A missing or empty `clientId`
    /// falls back to `default_client_id`.
    pub fn parse(query: Option<&str>, default_client_id: &str) -> Self {
        let mut role = None;
        let mut client_id = None;

        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "role" => role = Some(value.into_owned()),
                "clientId" => client_id = Some(value.into_owned()),
                _ => {}
            }
        }

        Self {
            role: ConnectionRole::from_query(role.as_deref()),
            client_id: client_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| default_client_id.to_string()),
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected {
        client_id: String,
        role: ConnectionRole,
        connection_id: ConnectionId,
    },
    Disconnected {
        client_id: String,
        role: ConnectionRole,
        connection_id: ConnectionId,
    },
}

/// Accept server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Idle read deadline per connection. `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Client id for connections that do not name one.
    pub default_client_id: String,
    /// Deadline for closing a connection whose peer may have stopped reading.
    pub close_timeout: Duration,
    /// Inbound messages larger than this end the connection.
    pub max_message_size: usize,
}

impl ServerConfig {
    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(60)),
            default_client_id: DEFAULT_CLIENT_ID.to_string(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl From<&StreamConfig> for ServerConfig {
    fn from(config: &StreamConfig) -> Self {
        let read_timeout = config.read_timeout();
        Self {
            read_timeout: (!read_timeout.is_zero()).then_some(read_timeout),
            default_client_id: config.default_client_id.clone(),
            close_timeout: config.write_timeout(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// State shared by every connection task.
struct ServerContext {
    registry: Arc<ClientRegistry>,
    input: Arc<dyn InputHandler>,
    config: ServerConfig,
    event_tx: Option<mpsc::Sender<ServerEvent>>,
    /// Connection tasks and background closes.
    tasks: TaskTracker,
}

impl ServerContext {
    fn emit(&self, event: ServerEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                tracing::debug!(error = %e, "Dropping server event - receiver busy or gone");
            }
        }
    }
}

/// Why a connection reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    RemoteClosed,
    LocalClosed,
    TimedOut,
    Error,
    Shutdown,
}

/// WebSocket server feeding the client registry.
pub struct StreamServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl StreamServer {
    /// Binds the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ClientRegistry>,
        input: Arc<dyn InputHandler>,
        config: ServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(
            local_addr = ?listener.local_addr().ok(),
            path = WS_PATH,
            "WebSocket server listening"
        );

        Ok(Self {
            listener,
            context: Arc::new(ServerContext {
                registry,
                input,
                config,
                event_tx: None,
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// Sends connection lifecycle events to `tx`.
    ///
    /// Must be called before [`run`](Self::run).
    pub fn with_events(mut self, tx: mpsc::Sender<ServerEvent>) -> Self {
        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.event_tx = Some(tx);
        }
        self
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for all
    /// connection tasks to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = self.context.tasks.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&self.context);
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            serve_connection(context, stream, peer, shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("WebSocket server stopped");
    }
}

async fn serve_connection(
    context: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let default_client_id = context.config.default_client_id.clone();
    let mut request = None;
    let callback = |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        if req.uri().path() != WS_PATH {
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        request = Some(ConnectRequest::parse(req.uri().query(), &default_client_id));
        Ok(response)
    };

    let handshake =
        accept_hdr_async_with_config(stream, callback, Some(context.config.websocket_config()));
    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            tracing::debug!(peer = %peer, "WebSocket handshake timed out");
            return;
        }
    };
    let Some(ConnectRequest { role, client_id }) = request else {
        return;
    };

    let (connection, reader) =
        WebSocketConnection::new(ws, Some(peer), context.config.close_timeout);
    let handle: ConnectionHandle = connection.clone();
    let connection_id = connection.id();

    match role {
        ConnectionRole::Stream => {
            context.registry.add_stream(&client_id, handle);
        }
        ConnectionRole::Control => {
            if let Some(superseded) = context.registry.set_control(&client_id, handle) {
                tracing::info!(
                    client_id = %client_id,
                    connection_id = %superseded.id(),
                    "Closing superseded control connection"
                );
                // The old link may be dead; the new one must not wait on it.
                context.tasks.spawn(async move {
                    if let Err(e) = superseded.close().await {
                        tracing::debug!(error = %e, "Failed to close superseded connection");
                    }
                });
            }
        }
    }

    tracing::info!(
        client_id = %client_id,
        connection_id = %connection_id,
        role = %role,
        peer = %peer,
        "Client connected"
    );
    context.emit(ServerEvent::Connected {
        client_id: client_id.clone(),
        role,
        connection_id,
    });

    let end = read_loop(&context, &connection, reader, &client_id, role, &shutdown).await;

    match role {
        ConnectionRole::Stream => {
            context.registry.remove_stream(&client_id, connection_id);
        }
        ConnectionRole::Control => {
            context.registry.remove_control(&client_id, connection_id);
        }
    }
    if let Err(e) = connection.close().await {
        tracing::debug!(connection_id = %connection_id, error = %e, "Close failed");
    }

    tracing::info!(
        client_id = %client_id,
        connection_id = %connection_id,
        role = %role,
        reason = ?end,
        "Client disconnected"
    );
    context.emit(ServerEvent::Disconnected {
        client_id,
        role,
        connection_id,
    });
}

async fn read_loop(
    context: &ServerContext,
    connection: &WebSocketConnection,
    mut reader: WsReader,
    client_id: &str,
    role: ConnectionRole,
    shutdown: &CancellationToken,
) -> ReadEnd {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return ReadEnd::Shutdown,
            _ = connection.closed().cancelled() => return ReadEnd::LocalClosed,
            next = next_message(&mut reader, context.config.read_timeout) => next,
        };

        let message = match next {
            None => return ReadEnd::TimedOut,
            Some(None) => return ReadEnd::RemoteClosed,
            Some(Some(Err(e))) => {
                tracing::debug!(client_id = %client_id, error = %e, "Read failed");
                return ReadEnd::Error;
            }
            Some(Some(Ok(message))) => message,
        };

        match message {
            WsMessage::Close(_) => return ReadEnd::RemoteClosed,
            WsMessage::Text(text) if role == ConnectionRole::Control => {
                handle_input(context, client_id, &text);
            }
            WsMessage::Binary(data) if role == ConnectionRole::Control => {
                match std::str::from_utf8(&data) {
                    Ok(text) => handle_input(context, client_id, text),
                    Err(_) => tracing::debug!(client_id = %client_id, "Ignoring non-UTF-8 control message"),
                }
            }
            // Stream payloads and ping/pong only refresh the read deadline.
            _ => {}
        }
    }
}

/// Next inbound message. `None` when the read deadline passed.
async fn next_message(
    reader: &mut WsReader,
    read_timeout: Option<Duration>,
) -> Option<Option<std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>> {
    match read_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.next()).await.ok(),
        None => Some(reader.next().await),
    }
}

fn handle_input(context: &ServerContext, client_id: &str, text: &str) {
    match InputEvent::from_json(text) {
        Ok(event) => context.input.handle(client_id, event),
        Err(e) => {
            tracing::debug!(client_id = %client_id, error = %e, "Ignoring malformed input event");
        }
    }
}
