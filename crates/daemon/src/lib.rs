//! # ScreenRelay Daemon Library
//!
//! This crate provides the host side of ScreenRelay: it exchanges session
//! descriptions with a controller over UDP and streams captured frames to
//! the controller's WebSocket connections.
//!
//! ## Overview
//!
//! - **UDP Signaling**: fragmented `OFFER:`/`ANSWER:` exchange with
//!   prefix-filtered, timeout-bounded waits
//! - **Client Registry**: one control connection and any number of stream
//!   connections per logical client, with round-robin target selection
//! - **Frame Dispatch**: a fixed-rate loop that captures one frame per tick
//!   and writes it to one connection per client under a write deadline
//! - **Input Forwarding**: JSON input events from control connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │ Frame Source │─▶│   Dispatch   │─▶│   Client Registry    │   │
//! │  │  (capture)   │  │     Loop     │  │  control + streams   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                                 ▲               │
//! │  ┌──────────────────────────────────────────────┴─────────────┐ │
//! │  │              WebSocket Accept Server (/ws)                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!
//!  UDP Signaling (standalone): OFFER ──▶ peer ──▶ ANSWER
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load or create configuration
//!     let config = Config::load_default()?;
//!
//!     // Create and start the orchestrator
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Clients connect to ws://<listen_addr>/ws?clientId=...&type=stream
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, environment overrides, validation
//! - [`signaling`]: UDP offer/answer exchange
//! - [`session`]: Client registry and target selection
//! - [`network`]: Connection abstraction and the WebSocket accept server
//! - [`dispatch`]: Frame dispatch loop
//! - [`capture`]: Frame sources and cursor tracking
//! - [`input`]: Input events from control connections
//! - [`orchestrator`]: Main daemon coordinator

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod input;
pub mod network;
pub mod orchestrator;
pub mod session;
pub mod signaling;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{ClientRegistry, ClientSession};

// Re-export network types for convenience
pub use network::{
    Connection, ConnectionHandle, ConnectionId, ConnectionRole, StreamServer,
    WebSocketConnection, WS_PATH,
};

// Re-export signaling types for convenience
pub use signaling::{SignalingConfig, UdpSignaling};

// Re-export dispatch and capture types for convenience
pub use capture::{CaptureError, CursorPosition, SnapshotFileSource};
pub use dispatch::{DispatchConfig, DispatchLoop, FrameSource, TickOutcome};
pub use input::{InputEvent, InputHandler, InputKind, LoggingInputHandler};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
