//! Frame messages emitted to stream clients.
//!
//! A frame is an opaque encoded image plus the cursor position at capture
//! time. It is sent either as one JSON message:
//!
//! ```json
//! {"image": "<base64>", "mouseX": 10, "mouseY": 20}
//! ```
//!
//! or, for transports with a small message ceiling, as a `meta` record
//! followed by `chunk` records carrying consecutive slices of the base64
//! image text:
//!
//! ```json
//! {"type": "meta", "id": 7, "chunks": 3, "mouseX": 10, "mouseY": 20}
//! {"type": "chunk", "id": 7, "index": 0, "data": "..."}
//! ```

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Maximum number of partially received chunked frames kept by a [`FrameAssembler`].
const MAX_PARTIAL_FRAMES: usize = 4;

/// One captured frame: opaque encoded image bytes and cursor position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameUnit {
    /// Encoded image (JPEG or similar; never inspected here).
    pub image: Bytes,
    /// Cursor X position in screen coordinates.
    pub mouse_x: i32,
    /// Cursor Y position in screen coordinates.
    pub mouse_y: i32,
}

/// Single-message frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenUpdate {
    /// Base64-encoded image.
    pub image: String,
    /// Cursor X position.
    pub mouse_x: i32,
    /// Cursor Y position.
    pub mouse_y: i32,
}

/// Records of the chunked frame variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameMessage {
    /// Announces a frame and how many chunks follow.
    Meta {
        id: u64,
        chunks: usize,
        #[serde(rename = "mouseX")]
        mouse_x: i32,
        #[serde(rename = "mouseY")]
        mouse_y: i32,
    },
    /// One slice of the base64 image text.
    Chunk { id: u64, index: usize, data: String },
}

impl FrameUnit {
    /// Creates a frame unit.
    pub fn new(image: impl Into<Bytes>, mouse_x: i32, mouse_y: i32) -> Self {
        Self {
            image: image.into(),
            mouse_x,
            mouse_y,
        }
    }

    /// Converts to the single-message payload.
    pub fn to_update(&self) -> ScreenUpdate {
        ScreenUpdate {
            image: STANDARD.encode(&self.image),
            mouse_x: self.mouse_x,
            mouse_y: self.mouse_y,
        }
    }

    /// Serializes the frame as one self-contained JSON message.
    pub fn to_message(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_update())?)
    }

    /// Serializes the frame as a `meta` record followed by `chunk` records of
    /// at most `chunk_size` base64 characters each.
    pub fn to_chunked_messages(&self, frame_id: u64, chunk_size: usize) -> Result<Vec<String>> {
        if chunk_size == 0 {
            return Err(ProtocolError::InvalidChunkSize(chunk_size));
        }

        let encoded = STANDARD.encode(&self.image);
        // Base64 output is ASCII, so byte offsets are char boundaries.
        let pieces: Vec<&str> = if encoded.is_empty() {
            vec![""]
        } else {
            encoded
                .as_bytes()
                .chunks(chunk_size)
                .map(|c| std::str::from_utf8(c).unwrap_or_default())
                .collect()
        };

        let mut messages = Vec::with_capacity(pieces.len() + 1);
        messages.push(serde_json::to_string(&FrameMessage::Meta {
            id: frame_id,
            chunks: pieces.len(),
            mouse_x: self.mouse_x,
            mouse_y: self.mouse_y,
        })?);
        for (index, data) in pieces.into_iter().enumerate() {
            messages.push(serde_json::to_string(&FrameMessage::Chunk {
                id: frame_id,
                index,
                data: data.to_string(),
            })?);
        }
        Ok(messages)
    }
}

#[derive(Debug, Default)]
struct PartialFrame {
    expected: Option<usize>,
    mouse: (i32, i32),
    chunks: BTreeMap<usize, String>,
}

impl PartialFrame {
    fn is_complete(&self) -> bool {
        self.expected == Some(self.chunks.len())
    }
}

/// Receiver-side reassembly of chunked frames.
///
/// Chunks may arrive before their `meta` record. Only the most recent few
/// frames are kept; older partial frames are evicted.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    frames: HashMap<u64, PartialFrame>,
}

impl FrameAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and adds one record. Returns the frame once complete.
    pub fn add_message(&mut self, text: &str) -> Result<Option<ScreenUpdate>> {
        let message: FrameMessage = serde_json::from_str(text)?;
        Ok(self.add(message))
    }

    /// Adds one record. Returns the frame once complete.
    pub fn add(&mut self, message: FrameMessage) -> Option<ScreenUpdate> {
        let id = match &message {
            FrameMessage::Meta { id, .. } | FrameMessage::Chunk { id, .. } => *id,
        };

        if !self.frames.contains_key(&id) && self.frames.len() >= MAX_PARTIAL_FRAMES {
            if let Some(oldest) = self.frames.keys().min().copied() {
                self.frames.remove(&oldest);
            }
        }

        let frame = self.frames.entry(id).or_default();
        match message {
            FrameMessage::Meta {
                chunks,
                mouse_x,
                mouse_y,
                ..
            } => {
                frame.expected = Some(chunks);
                frame.mouse = (mouse_x, mouse_y);
            }
            FrameMessage::Chunk { index, data, .. } => {
                frame.chunks.entry(index).or_insert(data);
            }
        }

        if !frame.is_complete() {
            return None;
        }

        let frame = self.frames.remove(&id)?;
        let image = frame.chunks.into_values().collect::<String>();
        Some(ScreenUpdate {
            image,
            mouse_x: frame.mouse.0,
            mouse_y: frame.mouse.1,
        })
    }

    /// Returns the number of frames still being assembled.
    pub fn partial_count(&self) -> usize {
        self.frames.len()
    }
}
