//! Fragmentation of signaling messages into datagram-sized chunks.
//!
//! # Wire Format
//!
//! Each chunk is sent as one datagram:
//!
//! ```text
//! FRAG:<messageID>:<totalChunks>:<chunkIndex>:<chunkData>
//! ```
//!
//! `<chunkData>` is a raw slice of the original message (which already
//! carries its own `OFFER:`/`ANSWER:` prefix) and may itself contain `:`,
//! so parsing only splits on the first four separators.

use std::fmt;

use bytes::Bytes;
use rand::Rng;

use crate::error::{ProtocolError, Result};

/// Tag marking a datagram as a fragment of a larger message.
pub const FRAGMENT_TAG: &[u8] = b"FRAG:";

/// Default maximum chunk data size, chosen to stay under common MTUs after
/// the fragment header is added.
pub const MAX_CHUNK_SIZE: usize = 1200;

/// Separator between fragment header fields.
const FIELD_SEPARATOR: u8 = b':';

/// Identifier shared by all fragments of one message.
///
/// Generated per message as a random decimal integer; only needs to be
/// unique among messages concurrently in flight from the same sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an existing identifier. Only decimal ids survive
    /// [`Fragment::parse`] on the receiving side.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Draws a fresh random decimal identifier.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen::<u32>().to_string())
    }

    /// Returns the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One bounded-size piece of a larger message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Message this fragment belongs to.
    pub message_id: MessageId,
    /// Number of fragments the message was split into (at least 1).
    pub total_chunks: usize,
    /// Position of this fragment, in `0..total_chunks`.
    pub chunk_index: usize,
    /// Slice of the original message.
    pub data: Bytes,
}

impl Fragment {
    /// Returns true if the datagram carries the fragment tag.
    pub fn is_fragment(datagram: &[u8]) -> bool {
        datagram.starts_with(FRAGMENT_TAG)
    }

    /// Encodes the fragment as a datagram payload.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!(
            "{}:{}:{}:",
            self.message_id, self.total_chunks, self.chunk_index
        );
        let mut buf = Vec::with_capacity(FRAGMENT_TAG.len() + header.len() + self.data.len());
        buf.extend_from_slice(FRAGMENT_TAG);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parses a fragment datagram.
    ///
    /// Fails with [`ProtocolError::MalformedFragment`] if the tag is missing,
    /// a header field is absent, the id, count or index is not a decimal
    /// integer, or the index is out of range.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let rest = datagram
            .strip_prefix(FRAGMENT_TAG)
            .ok_or_else(|| ProtocolError::MalformedFragment("missing FRAG tag".to_string()))?;

        let mut fields = rest.splitn(4, |b| *b == FIELD_SEPARATOR);
        let (Some(id), Some(total), Some(index), Some(data)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(ProtocolError::MalformedFragment(
                "expected 4 header fields".to_string(),
            ));
        };

        if id.is_empty() || !id.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::MalformedFragment(
                "message id is not a decimal integer".to_string(),
            ));
        }
        // ASCII digits are valid UTF-8.
        let id = String::from_utf8_lossy(id);
        let total_chunks = parse_decimal(total, "total chunk count")?;
        let chunk_index = parse_decimal(index, "chunk index")?;

        if total_chunks == 0 {
            return Err(ProtocolError::MalformedFragment(
                "total chunk count must be at least 1".to_string(),
            ));
        }
        if chunk_index >= total_chunks {
            return Err(ProtocolError::MalformedFragment(format!(
                "chunk index {} out of range for {} chunks",
                chunk_index, total_chunks
            )));
        }

        Ok(Self {
            message_id: MessageId::new(id),
            total_chunks,
            chunk_index,
            data: Bytes::copy_from_slice(data),
        })
    }
}

fn parse_decimal(field: &[u8], what: &str) -> Result<usize> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::MalformedFragment(format!(
            "{} is not a decimal integer",
            what
        )));
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::MalformedFragment(format!("{} out of range", what)))
}

/// Splits messages into fragments no larger than a fixed chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragmenter {
    max_chunk_size: usize,
}

impl Fragmenter {
    /// Creates a fragmenter with the given maximum chunk data size.
    pub fn new(max_chunk_size: usize) -> Result<Self> {
        if max_chunk_size == 0 {
            return Err(ProtocolError::InvalidChunkSize(max_chunk_size));
        }
        Ok(Self { max_chunk_size })
    }

    /// Returns the maximum chunk data size.
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Number of chunks a message of `len` bytes is split into.
    ///
    /// An empty message still produces a single (empty) chunk.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.max_chunk_size).max(1)
    }

    /// Splits `message` into consecutive fragments tagged with `message_id`.
    pub fn split(&self, message_id: &MessageId, message: &[u8]) -> Vec<Fragment> {
        let message = Bytes::copy_from_slice(message);
        let total_chunks = self.chunk_count(message.len());

        (0..total_chunks)
            .map(|chunk_index| {
                let start = chunk_index * self.max_chunk_size;
                let end = (start + self.max_chunk_size).min(message.len());
                Fragment {
                    message_id: message_id.clone(),
                    total_chunks,
                    chunk_index,
                    data: message.slice(start..end),
                }
            })
            .collect()
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'A' + (i % 26) as u8).collect()
    }

    #[test]
    fn test_split_3000_bytes_into_three_chunks() {
        let fragmenter = Fragmenter::new(1200).unwrap();
        let id = MessageId::new("42");
        let fragments = fragmenter.split(&id, &message(3000));

        assert_eq!(fragments.len(), 3);
        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.chunk_index, i);
            assert_eq!(fragment.total_chunks, 3);
            assert_eq!(fragment.message_id, id);
        }
        assert_eq!(fragments[0].data.len(), 1200);
        assert_eq!(fragments[1].data.len(), 1200);
        assert_eq!(fragments[2].data.len(), 600);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_chunk() {
        let fragmenter = Fragmenter::new(1200).unwrap();
        let fragments = fragmenter.split(&MessageId::new("1"), &message(2400));

        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|f| f.data.len() == 1200));
    }

    #[test]
    fn test_empty_message_is_single_empty_chunk() {
        let fragmenter = Fragmenter::default();
        let fragments = fragmenter.split(&MessageId::new("7"), b"");

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].total_chunks, 1);
        assert!(fragments[0].data.is_empty());
    }

    #[test]
    fn test_chunk_size_one() {
        let fragmenter = Fragmenter::new(1).unwrap();
        let fragments = fragmenter.split(&MessageId::new("9"), b"OFFER:abc");
        assert_eq!(fragments.len(), 9);
        assert_eq!(&fragments[5].data[..], b":");
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            Fragmenter::new(0),
            Err(ProtocolError::InvalidChunkSize(0))
        ));
    }

    #[test]
    fn test_concatenated_chunks_equal_message() {
        let fragmenter = Fragmenter::new(7).unwrap();
        let original = message(100);
        let fragments = fragmenter.split(&MessageId::new("3"), &original);
        let joined: Vec<u8> = fragments.iter().flat_map(|f| f.data.to_vec()).collect();
        assert_eq!(joined, original);
    }

    #[test]
    fn test_encode_format() {
        let fragment = Fragment {
            message_id: MessageId::new("12345"),
            total_chunks: 3,
            chunk_index: 1,
            data: Bytes::from_static(b"hello"),
        };
        assert_eq!(fragment.encode(), b"FRAG:12345:3:1:hello".to_vec());
    }

    #[test]
    fn test_parse_keeps_colons_in_data() {
        let fragment = Fragment::parse(b"FRAG:77:2:0:ANSWER:eyJ0eXBlIjoi").unwrap();
        assert_eq!(fragment.message_id.as_str(), "77");
        assert_eq!(fragment.total_chunks, 2);
        assert_eq!(fragment.chunk_index, 0);
        assert_eq!(&fragment.data[..], b"ANSWER:eyJ0eXBlIjoi");
    }

    #[test]
    fn test_parse_encode_consistency() {
        let fragmenter = Fragmenter::new(5).unwrap();
        for fragment in fragmenter.split(&MessageId::new("5"), b"OFFER:a:b:c:d") {
            assert_eq!(Fragment::parse(&fragment.encode()).unwrap(), fragment);
        }
    }

    #[test]
    fn test_parse_empty_data() {
        let fragment = Fragment::parse(b"FRAG:1:1:0:").unwrap();
        assert!(fragment.data.is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(matches!(
            Fragment::parse(b"FRAG:1:2"),
            Err(ProtocolError::MalformedFragment(_))
        ));
        assert!(Fragment::parse(b"FRAG:1:2:0").is_err());
    }

    #[test]
    fn test_parse_rejects_non_numeric_fields() {
        assert!(Fragment::parse(b"FRAG:1:x:0:data").is_err());
        assert!(Fragment::parse(b"FRAG:1:2:y:data").is_err());
        assert!(Fragment::parse(b"FRAG:1:-2:0:data").is_err());
        assert!(Fragment::parse(b"FRAG:1::0:data").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_index() {
        assert!(Fragment::parse(b"FRAG:1:2:2:data").is_err());
        assert!(Fragment::parse(b"FRAG:1:0:0:data").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_id_and_missing_tag() {
        assert!(Fragment::parse(b"FRAG::2:0:data").is_err());
        assert!(Fragment::parse(b"OFFER:abc").is_err());
    }

    #[test]
    fn test_parse_rejects_non_decimal_id() {
        assert!(matches!(
            Fragment::parse(b"FRAG:a:2:0:data"),
            Err(ProtocolError::MalformedFragment(_))
        ));
        assert!(Fragment::parse(b"FRAG:12ab:2:0:data").is_err());
        assert!(Fragment::parse(b"FRAG: 12:2:0:data").is_err());

        let fragment = Fragment::parse(b"FRAG:007:2:0:data").unwrap();
        assert_eq!(fragment.message_id.as_str(), "007");
    }

    #[test]
    fn test_is_fragment() {
        assert!(Fragment::is_fragment(b"FRAG:1:1:0:x"));
        assert!(!Fragment::is_fragment(b"OFFER:abc"));
    }

    #[test]
    fn test_random_message_id_is_decimal() {
        let id = MessageId::random();
        assert!(!id.as_str().is_empty());
        assert!(id.as_str().bytes().all(|b| b.is_ascii_digit()));
    }
}
