//! WebSocket client connections.
//!
//! The write half of an accepted WebSocket is wrapped in a [`Connection`] so
//! the registry and dispatch loop can share it. The read half stays with the
//! accept server's reader task, which stops as soon as the connection is
//! closed from either side.
//!
//! Closing is bounded by a deadline. A peer that stopped reading cannot hold
//! up shutdown: once the deadline passes the close handshake is abandoned
//! and the socket goes away with the last handle.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::{Connection, ConnectionId};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Default deadline for the close handshake.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Read half of an accepted WebSocket.
pub type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Outbound side of one accepted WebSocket.
pub struct WebSocketConnection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    sink: Mutex<WsSink>,
    closed: CancellationToken,
    close_timeout: Duration,
}

impl WebSocketConnection {
    /// Splits an accepted WebSocket into a shared connection and its reader.
    ///
    /// `close_timeout` bounds [`Connection::close`], including the wait for
    /// a write that is still in progress.
    pub fn new(
        ws: WebSocketStream<TcpStream>,
        peer_addr: Option<SocketAddr>,
        close_timeout: Duration,
    ) -> (Arc<Self>, WsReader) {
        let (sink, reader) = ws.split();
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            peer_addr,
            sink: Mutex::new(sink),
            closed: CancellationToken::new(),
            close_timeout,
        });
        (connection, reader)
    }

    /// Token cancelled when the connection is closed.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_text<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(ProtocolError::ConnectionClosed(
                    "connection already closed".to_string(),
                ));
            }

            let mut sink = self.sink.lock().await;
            sink.send(WsMessage::Text(text.to_string()))
                .await
                .map_err(|e| {
                    self.closed.cancel();
                    map_ws_error(e)
                })
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Ok(());
            }
            self.closed.cancel();

            let handshake = async {
                let mut sink = self.sink.lock().await;
                if let Err(e) = sink.send(WsMessage::Close(None)).await {
                    tracing::trace!(connection_id = %self.id, error = %e, "Close frame not sent");
                }
                if let Err(e) = sink.close().await {
                    tracing::trace!(connection_id = %self.id, error = %e, "Sink close failed");
                }
            };
            if tokio::time::timeout(self.close_timeout, handshake).await.is_err() {
                tracing::debug!(
                    connection_id = %self.id,
                    timeout = ?self.close_timeout,
                    "Close handshake abandoned, peer not reading"
                );
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Maps a WebSocket error onto the protocol error taxonomy.
pub(crate) fn map_ws_error(err: WsError) -> ProtocolError {
    match err {
        WsError::Io(io_err) => ProtocolError::from(io_err),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ProtocolError::ConnectionClosed("WebSocket closed".to_string())
        }
        other => ProtocolError::TransferFailed(format!("WebSocket error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream};

    type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Accepted server side plus a client that the test controls.
    async fn ws_pair(close_timeout: Duration) -> (Arc<WebSocketConnection>, WsReader, ClientStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            connect_async(format!("ws://{}/ws", addr)).await.unwrap().0
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        let (connection, reader) = WebSocketConnection::new(ws, Some(peer), close_timeout);
        (connection, reader, client.await.unwrap())
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let (connection, _reader, mut client) = ws_pair(DEFAULT_CLOSE_TIMEOUT).await;

        connection.send_text("hello").await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            WsMessage::Text("hello".to_string())
        );

        connection.close().await.unwrap();
        assert!(!connection.is_connected());
        assert!(matches!(
            client.next().await,
            Some(Ok(WsMessage::Close(_))) | None
        ));
        assert!(matches!(
            connection.send_text("late").await,
            Err(ProtocolError::ConnectionClosed(_))
        ));
        // Closing twice is fine.
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_bounded_when_peer_stops_reading() {
        let close_timeout = Duration::from_millis(200);
        let (connection, _reader, _client) = ws_pair(close_timeout).await;

        // Fill the socket buffers until a write cannot complete.
        let frame = "x".repeat(1 << 20);
        let mut stalled = false;
        for _ in 0..256 {
            let write = tokio::time::timeout(Duration::from_millis(200), connection.send_text(&frame));
            if write.await.is_err() {
                stalled = true;
                break;
            }
        }
        assert!(stalled, "peer never applied backpressure");

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), connection.close())
            .await
            .expect("close hung on an unread peer")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!connection.is_connected());
        assert!(connection.closed().is_cancelled());
    }

    #[test]
    fn test_map_ws_error_closed() {
        assert!(matches!(
            map_ws_error(WsError::ConnectionClosed),
            ProtocolError::ConnectionClosed(_)
        ));
        assert!(matches!(
            map_ws_error(WsError::AlreadyClosed),
            ProtocolError::ConnectionClosed(_)
        ));
    }

    #[test]
    fn test_map_ws_error_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(
            map_ws_error(WsError::Io(io)),
            ProtocolError::ConnectionClosed(_)
        ));
    }

    #[test]
    fn test_map_ws_error_other() {
        assert!(matches!(
            map_ws_error(WsError::AttackAttempt),
            ProtocolError::TransferFailed(_)
        ));
    }
}
