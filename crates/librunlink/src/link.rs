//! Envelope framing for links limited to small records, such as a BLE
//! characteristic.

use std::collections::{HashMap, VecDeque};

use runlink_protocol::{Chunk, ChunkedMessage, ProtocolError};
use tracing::debug;

/// Largest message accepted by default, in chunks (about 1 MiB).
pub const DEFAULT_MAX_CHUNKS: u32 = 2048;
/// Reassemblies kept in flight by default; the oldest is dropped beyond this.
pub const DEFAULT_MAX_PENDING: usize = 8;
/// Completed message ids remembered so late duplicates are not reassembled
/// again.
const RECENTLY_COMPLETED: usize = 32;

/// Rebuilds messages from chunk records that may arrive in any order and
/// interleaved with other messages.
#[derive(Debug)]
pub struct ChunkAssembler {
    pending: HashMap<u16, ChunkedMessage>,
    /// Pending ids, oldest first.
    arrival: VecDeque<u16>,
    completed: VecDeque<u16>,
    max_chunks: u32,
    max_pending: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_CHUNKS, DEFAULT_MAX_PENDING)
    }

    pub fn with_max_chunks(max_chunks: u32) -> Self {
        Self::with_limits(max_chunks, DEFAULT_MAX_PENDING)
    }

    pub fn with_limits(max_chunks: u32, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            arrival: VecDeque::new(),
            completed: VecDeque::new(),
            max_chunks: max_chunks.max(1),
            max_pending: max_pending.max(1),
        }
    }

    /// Feed one record. Returns the message text once its last missing chunk
    /// arrives. On error the affected reassembly is discarded.
    pub fn push(&mut self, record: &[u8]) -> Result<Option<String>, ProtocolError> {
        let chunk = Chunk::decode(record)?;
        let id = chunk.message_id;
        if chunk.total_chunks() > self.max_chunks {
            self.discard(id);
            return Err(ProtocolError::BadMessage(format!(
                "message {id} announces {} chunks, limit is {}",
                chunk.total_chunks(),
                self.max_chunks
            )));
        }

        if !self.pending.contains_key(&id) {
            if self.completed.contains(&id) {
                debug!(message_id = id, "ignoring chunk of a completed message");
                return Ok(None);
            }
            while self.pending.len() >= self.max_pending {
                let Some(oldest) = self.arrival.pop_front() else {
                    break;
                };
                debug!(message_id = oldest, "abandoning stale reassembly");
                self.pending.remove(&oldest);
            }
            self.pending.insert(id, ChunkedMessage::empty(id));
            self.arrival.push_back(id);
        }

        let Some(message) = self.pending.get_mut(&id) else {
            return Ok(None);
        };
        if let Err(e) = message.append(chunk) {
            debug!(message_id = id, "discarding reassembly: {e}");
            self.discard(id);
            return Err(e);
        }
        if !message.is_complete() {
            return Ok(None);
        }

        let Some(done) = self.pending.remove(&id) else {
            return Ok(None);
        };
        self.arrival.retain(|pending| *pending != id);
        self.completed.push_back(id);
        if self.completed.len() > RECENTLY_COMPLETED {
            self.completed.pop_front();
        }
        String::from_utf8(done.into_message())
            .map(Some)
            .map_err(|e| ProtocolError::BadMessage(format!("message {id} is not UTF-8: {e}")))
    }

    /// Messages with some but not all chunks received.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn discard(&mut self, id: u16) {
        if self.pending.remove(&id).is_some() {
            self.arrival.retain(|pending| *pending != id);
        }
    }
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits outgoing messages into chunk records, numbering messages with a
/// wrapping counter.
#[derive(Debug, Default)]
pub struct ChunkSplitter {
    next_id: u16,
}

impl ChunkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split(&mut self, message: &[u8]) -> Vec<Vec<u8>> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        ChunkedMessage::from_message(id, message)
            .chunks()
            .map(|chunk| chunk.encode())
            .collect()
    }
}
