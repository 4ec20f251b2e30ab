//! Input events received on control connections.
//!
//! Events are decoded here and handed to an [`InputHandler`]. Injecting them
//! into the host's input system is left to the handler implementation.

use serde::{Deserialize, Serialize};

use crate::capture::CursorPosition;

/// An input event sent by a client over its control connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputEvent {
    /// Event type, e.g. `mousemove`, `keydown`, `paste`.
    #[serde(rename = "type")]
    pub kind: String,
    pub x: i32,
    pub y: i32,
    pub button: String,
    pub key: String,
    pub key_code: i32,
    pub modifiers: Vec<String>,
    pub delta_y: i32,
    pub clipboard_text: String,
}

/// Known input event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    MouseMove,
    MouseDown,
    MouseUp,
    KeyDown,
    KeyUp,
    Wheel,
    Paste,
    Unknown,
}

impl InputEvent {
    /// Parses one control message.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Classifies the event type.
    pub fn kind(&self) -> InputKind {
        match self.kind.as_str() {
            "mousemove" => InputKind::MouseMove,
            "mousedown" => InputKind::MouseDown,
            "mouseup" => InputKind::MouseUp,
            "keydown" => InputKind::KeyDown,
            "keyup" => InputKind::KeyUp,
            "wheel" => InputKind::Wheel,
            "paste" => InputKind::Paste,
            _ => InputKind::Unknown,
        }
    }
}

/// Consumer of decoded input events.
pub trait InputHandler: Send + Sync {
    /// Handles one event from `client_id`.
    fn handle(&self, client_id: &str, event: InputEvent);
}

/// Handler that records cursor movement and logs everything else.
#[derive(Debug, Clone, Default)]
pub struct LoggingInputHandler {
    cursor: Option<CursorPosition>,
}

impl LoggingInputHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `mousemove` events in `cursor`.
    pub fn with_cursor(mut self, cursor: CursorPosition) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

impl InputHandler for LoggingInputHandler {
    fn handle(&self, client_id: &str, event: InputEvent) {
        match event.kind() {
            InputKind::MouseMove => {
                if let Some(cursor) = &self.cursor {
                    cursor.set(event.x, event.y);
                }
                tracing::trace!(client_id = %client_id, x = event.x, y = event.y, "mousemove");
            }
            InputKind::Paste => {
                tracing::debug!(
                    client_id = %client_id,
                    chars = event.clipboard_text.chars().count(),
                    "paste"
                );
            }
            InputKind::Unknown => {
                tracing::debug!(client_id = %client_id, kind = %event.kind, "Ignoring unknown input event");
            }
            kind => {
                tracing::debug!(client_id = %client_id, kind = ?kind, event = ?event, "Input event");
            }
        }
    }
}
