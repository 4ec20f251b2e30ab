//! Signaling message framing.
//!
//! Session descriptions are opaque to this crate. They are base64-encoded
//! and prefixed with a type tag so the receiver can tell an offer from an
//! answer:
//!
//! ```text
//! OFFER:<base64-payload>
//! ANSWER:<base64-payload>
//! ```

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::Result;

/// Signaling message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Session offer from the initiating side.
    Offer,
    /// Session answer from the responding side.
    Answer,
}

impl SignalKind {
    /// Returns the wire prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            SignalKind::Offer => "OFFER:",
            SignalKind::Answer => "ANSWER:",
        }
    }

    /// Identifies the kind of a complete signaling message by its prefix.
    pub fn of_message(message: &[u8]) -> Option<Self> {
        [SignalKind::Offer, SignalKind::Answer]
            .into_iter()
            .find(|kind| message.starts_with(kind.prefix().as_bytes()))
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => f.write_str("offer"),
            SignalKind::Answer => f.write_str("answer"),
        }
    }
}

/// Builds `<PREFIX><base64(payload)>`.
pub fn encode_signal(kind: SignalKind, payload: &[u8]) -> Vec<u8> {
    let mut message = kind.prefix().as_bytes().to_vec();
    message.extend_from_slice(STANDARD.encode(payload).as_bytes());
    message
}

/// Decodes the base64 body of a signaling message whose prefix has already
/// been stripped. Surrounding whitespace is ignored.
pub fn decode_signal_payload(body: &[u8]) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(body.trim_ascii())?)
}
