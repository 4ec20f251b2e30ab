//! # ScreenRelay Protocol Library
//!
//! This crate provides the wire formats shared by the ScreenRelay host and
//! controller. It performs no I/O.
//!
//! ## Overview
//!
//! - **Signaling Messages**: `OFFER:`/`ANSWER:` prefixed, base64-encoded
//!   session descriptions
//! - **Fragmentation**: splitting signaling messages into datagram-sized
//!   `FRAG:` chunks for an unordered, unacknowledged transport
//! - **Reassembly**: collecting chunks by message id and restoring the
//!   original message in chunk order
//! - **Frame Messages**: JSON frame payloads for stream clients, whole or
//!   chunked
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Session description (opaque)      │
//! ├─────────────────────────────────────────┤
//! │     Signal framing: PREFIX + base64     │
//! ├─────────────────────────────────────────┤
//! │    Fragmentation: FRAG:id:total:idx:    │
//! ├─────────────────────────────────────────┤
//! │               UDP datagrams             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::time::Instant;
//! use protocol::{encode_signal, Fragmenter, Inbound, MessageId, Reassembler, SignalKind};
//!
//! let message = encode_signal(SignalKind::Answer, &[0u8; 4096]);
//! let fragments = Fragmenter::default().split(&MessageId::random(), &message);
//!
//! let mut reassembler = Reassembler::default();
//! let mut restored = None;
//! for fragment in fragments.iter().rev() {
//!     if let Inbound::Fragment(f) = Inbound::classify(&fragment.encode()).unwrap() {
//!         restored = reassembler.add(f, Instant::now()).unwrap().or(restored);
//!     }
//! }
//! assert_eq!(restored.as_deref(), Some(&message[..]));
//! ```
//!
//! ## Modules
//!
//! - [`signal`]: Signaling prefixes and payload encoding
//! - [`fragment`]: Fragment header codec and splitting
//! - [`reassembly`]: Fragment collection with expiry
//! - [`frame`]: Frame messages for stream clients
//! - [`error`]: Error types

pub mod error;
pub mod fragment;
pub mod frame;
pub mod reassembly;
pub mod signal;

pub use error::{ProtocolError, Result};
pub use fragment::{Fragment, Fragmenter, MessageId, FRAGMENT_TAG, MAX_CHUNK_SIZE};
pub use frame::{FrameAssembler, FrameMessage, FrameUnit, ScreenUpdate};
pub use reassembly::{
    Inbound, PendingMessage, Reassembler, DEFAULT_MAX_PENDING, DEFAULT_PENDING_TTL,
};
pub use signal::{decode_signal_payload, encode_signal, SignalKind};
