//! Reassembly of fragmented signaling messages.
//!
//! Fragments may arrive in any order, duplicated, or not at all. The
//! [`Reassembler`] collects them per message id and emits the original
//! message once every chunk is present, concatenated by chunk index.
//!
//! Incomplete messages are pruned after a TTL and the number of
//! concurrently pending ids is capped, so a sender that never finishes a
//! message cannot grow the table without bound.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::fragment::{Fragment, MessageId};

/// Default time an incomplete message may sit untouched before it is dropped.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(60);

/// Default cap on concurrently pending message ids.
pub const DEFAULT_MAX_PENDING: usize = 64;

/// How many completed message ids are remembered to discard late duplicates.
const COMPLETED_HISTORY: usize = 256;

/// A classified inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A datagram that is not a fragment, carried as-is.
    Whole(Bytes),
    /// One fragment of a larger message.
    Fragment(Fragment),
}

impl Inbound {
    /// Classifies a datagram, parsing the fragment header if present.
    pub fn classify(datagram: &[u8]) -> Result<Self> {
        if Fragment::is_fragment(datagram) {
            Fragment::parse(datagram).map(Inbound::Fragment)
        } else {
            Ok(Inbound::Whole(Bytes::copy_from_slice(datagram)))
        }
    }
}

/// A message whose fragments are still being collected.
#[derive(Debug)]
pub struct PendingMessage {
    message_id: MessageId,
    total_chunks: usize,
    received_chunks: BTreeMap<usize, Bytes>,
    last_update: Instant,
}

impl PendingMessage {
    fn new(fragment: &Fragment, now: Instant) -> Self {
        Self {
            message_id: fragment.message_id.clone(),
            total_chunks: fragment.total_chunks,
            received_chunks: BTreeMap::new(),
            last_update: now,
        }
    }

    /// Returns the message id.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Returns the number of chunks the message was split into.
    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Returns the number of distinct chunks received so far.
    pub fn received(&self) -> usize {
        self.received_chunks.len()
    }

    fn is_complete(&self) -> bool {
        self.received_chunks.len() == self.total_chunks
    }

    /// Concatenates chunks in ascending index order.
    fn assemble(self) -> Bytes {
        let len = self.received_chunks.values().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(len);
        for chunk in self.received_chunks.into_values() {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

/// Collects fragments by message id until each message is complete.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<MessageId, PendingMessage>,
    completed: VecDeque<MessageId>,
    completed_set: HashSet<MessageId>,
    ttl: Duration,
    max_pending: usize,
}

impl Reassembler {
    /// Creates a reassembler with the given pending TTL and concurrency cap.
    ///
    /// A zero TTL falls back to [`DEFAULT_PENDING_TTL`] and a zero cap to
    /// [`DEFAULT_MAX_PENDING`].
    pub fn new(ttl: Duration, max_pending: usize) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_PENDING_TTL } else { ttl };
        let max_pending = if max_pending == 0 {
            DEFAULT_MAX_PENDING
        } else {
            max_pending
        };
        Self {
            pending: HashMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_HISTORY),
            completed_set: HashSet::with_capacity(COMPLETED_HISTORY),
            ttl,
            max_pending,
        }
    }

    /// Adds a fragment. Returns the reassembled message once the last
    /// missing chunk arrives.
    ///
    /// The entry is removed the moment it completes; fragments that arrive
    /// later for the same id are ignored.
    pub fn add(&mut self, fragment: Fragment, now: Instant) -> Result<Option<Bytes>> {
        if self.completed_set.contains(&fragment.message_id) {
            tracing::trace!(
                message_id = %fragment.message_id,
                index = fragment.chunk_index,
                "ignoring fragment for completed message"
            );
            return Ok(None);
        }

        self.prune(now);

        if !self.pending.contains_key(&fragment.message_id) && self.pending.len() >= self.max_pending
        {
            return Err(ProtocolError::ReassemblyFull {
                limit: self.max_pending,
            });
        }

        let entry = self
            .pending
            .entry(fragment.message_id.clone())
            .or_insert_with(|| PendingMessage::new(&fragment, now));

        if entry.total_chunks != fragment.total_chunks {
            return Err(ProtocolError::MalformedFragment(format!(
                "message {} announced {} chunks, fragment says {}",
                fragment.message_id, entry.total_chunks, fragment.total_chunks
            )));
        }
        if fragment.chunk_index >= entry.total_chunks {
            return Err(ProtocolError::MalformedFragment(format!(
                "chunk index {} out of range for {} chunks",
                fragment.chunk_index, entry.total_chunks
            )));
        }

        entry.last_update = now;
        if entry.received_chunks.contains_key(&fragment.chunk_index) {
            tracing::trace!(
                message_id = %fragment.message_id,
                index = fragment.chunk_index,
                "duplicate fragment"
            );
            return Ok(None);
        }
        entry
            .received_chunks
            .insert(fragment.chunk_index, fragment.data);

        if !entry.is_complete() {
            return Ok(None);
        }

        let Some(message) = self.pending.remove(&fragment.message_id) else {
            return Ok(None);
        };
        self.remember_completed(fragment.message_id);
        Ok(Some(message.assemble()))
    }

    /// Drops pending messages untouched for longer than the TTL.
    ///
    /// Returns the number of messages dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.pending.len();
        self.pending.retain(|id, message| {
            let keep = now.saturating_duration_since(message.last_update) <= ttl;
            if !keep {
                tracing::debug!(
                    message_id = %id,
                    received = message.received(),
                    total = message.total_chunks,
                    "dropping stale partial message"
                );
            }
            keep
        });
        before - self.pending.len()
    }

    /// Returns the number of partially reassembled messages.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns the pending entry for a message id, if any.
    pub fn pending(&self, message_id: &MessageId) -> Option<&PendingMessage> {
        self.pending.get(message_id)
    }

    fn remember_completed(&mut self, message_id: MessageId) {
        if self.completed.len() == COMPLETED_HISTORY {
            if let Some(oldest) = self.completed.pop_front() {
                self.completed_set.remove(&oldest);
            }
        }
        self.completed_set.insert(message_id.clone());
        self.completed.push_back(message_id);
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TTL, DEFAULT_MAX_PENDING)
    }
}
