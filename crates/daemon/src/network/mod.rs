//! Network module for client transport connections.
//!
//! This module provides:
//! - The [`Connection`] abstraction the session registry and dispatch loop
//!   write through
//! - A WebSocket implementation of it
//! - The accept server that tags each connection with a role and client id

pub mod server;
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use protocol::error::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one accepted transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role a connection plays for its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    /// Carries input events from the client; receives frames only as a fallback.
    Control,
    /// One of possibly several connections frames are spread across.
    Stream,
}

impl ConnectionRole {
    /// Parses the `role` query parameter. Anything other than `stream`
    /// (including a missing value) is a control connection.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("stream") => ConnectionRole::Stream,
            _ => ConnectionRole::Control,
        }
    }

    /// Returns the query parameter value for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Control => "control",
            ConnectionRole::Stream => "stream",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trait representing an outbound client connection.
///
/// Handles are shared between the accept layer, which owns the connection
/// lifecycle, and the registry, which only selects targets. All methods take
/// `&self`; implementations synchronize writes internally.
pub trait Connection: Send + Sync {
    /// Returns the identity used to match this connection on removal.
    fn id(&self) -> ConnectionId;

    /// Sends one text message.
    fn send_text<'a>(&'a self, text: &'a str)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Closes the connection. Closing twice is not an error.
    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Returns whether the connection is currently open.
    fn is_connected(&self) -> bool;

    /// Returns the remote address, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Shared handle to a connection.
pub type ConnectionHandle = Arc<dyn Connection>;

// Re-export key types
pub use server::{StreamServer, WS_PATH};
pub use websocket::WebSocketConnection;
