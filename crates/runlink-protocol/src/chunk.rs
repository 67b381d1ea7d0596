//! Fixed-size addressed records for links with a small maximum payload.
//!
//! Record layout, all integers little-endian:
//!
//! ```text
//! message_id: u16 | end_index: u24 | current_index: u24 | payload: <= DATA_SIZE bytes
//! ```
//!
//! Widths and byte order are shared with existing client SDKs and must not
//! change.

use crate::ProtocolError;

pub const HEADER_SIZE: usize = 8;
pub const DATA_SIZE: usize = 504;
pub const MAX_CHUNK_SIZE: usize = HEADER_SIZE + DATA_SIZE;

const MAX_U24: u32 = 0x00ff_ffff;

/// One record of a chunked message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub message_id: u16,
    pub end_index: u32,
    pub current_index: u32,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&self.end_index.to_le_bytes()[..3]);
        out.extend_from_slice(&self.current_index.to_le_bytes()[..3]);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(record: &[u8]) -> Result<Self, ProtocolError> {
        if record.len() < HEADER_SIZE {
            return Err(ProtocolError::ChunkTooShort(record.len()));
        }
        let message_id = u16::from_le_bytes([record[0], record[1]]);
        let end_index = u24_from_le(&record[2..5]);
        let current_index = u24_from_le(&record[5..8]);
        let payload = record[HEADER_SIZE..].to_vec();
        if payload.len() > DATA_SIZE {
            return Err(ProtocolError::ChunkSize {
                index: current_index,
                size: payload.len(),
            });
        }
        Ok(Self {
            message_id,
            end_index,
            current_index,
            payload,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.end_index + 1
    }
}

fn u24_from_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}

/// Reassembly (or replay) buffer for one message id.
///
/// The total chunk count is learned from whichever chunk arrives first, so
/// chunks may be appended in any order.
#[derive(Debug, Clone)]
pub struct ChunkedMessage {
    id: u16,
    total_chunks: Option<u32>,
    buffer: Vec<u8>,
    received: Vec<bool>,
    received_chunks: u32,
    tail_len: usize,
}

impl ChunkedMessage {
    /// An empty receiver-side buffer waiting for chunks of message `id`.
    pub fn empty(id: u16) -> Self {
        Self {
            id,
            total_chunks: None,
            buffer: Vec::new(),
            received: Vec::new(),
            received_chunks: 0,
            tail_len: 0,
        }
    }

    /// Split `message` into `ceil(len / DATA_SIZE)` chunks (at least one).
    ///
    /// Payloads needing more than 2^24 chunks cannot be addressed; the count
    /// saturates at the u24 limit.
    pub fn from_message(id: u16, message: &[u8]) -> Self {
        let needed = message.len().div_ceil(DATA_SIZE).max(1);
        let total = u32::try_from(needed).unwrap_or(MAX_U24).min(MAX_U24 + 1);
        let total_len = total as usize * DATA_SIZE;
        let kept = message.len().min(total_len);

        let mut buffer = vec![0u8; total_len];
        buffer[..kept].copy_from_slice(&message[..kept]);

        Self {
            id,
            total_chunks: Some(total),
            buffer,
            received: vec![true; total as usize],
            received_chunks: total,
            tail_len: kept - (total as usize - 1) * DATA_SIZE,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.total_chunks
    }

    pub fn received_chunks(&self) -> u32 {
        self.received_chunks
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks == Some(self.received_chunks)
    }

    /// Regenerate chunk `index`, e.g. when a reader asks for it again.
    pub fn get_chunk(&self, index: u32) -> Option<Chunk> {
        let total = self.total_chunks?;
        if index >= total || !self.received[index as usize] {
            return None;
        }
        let start = index as usize * DATA_SIZE;
        let len = if index == total - 1 {
            self.tail_len
        } else {
            DATA_SIZE
        };
        Some(Chunk {
            message_id: self.id,
            end_index: total - 1,
            current_index: index,
            payload: self.buffer[start..start + len].to_vec(),
        })
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.total_chunks.unwrap_or(0)).filter_map(|i| self.get_chunk(i))
    }

    /// Add a received chunk. Duplicates of an already received index are
    /// ignored.
    pub fn append(&mut self, chunk: Chunk) -> Result<(), ProtocolError> {
        if chunk.message_id != self.id {
            return Err(ProtocolError::ChunkMismatch {
                expected: self.id,
                got: chunk.message_id,
            });
        }

        let total = chunk.total_chunks();
        if let Some(known) = self.total_chunks {
            if known != total {
                return Err(ProtocolError::ChunkOutOfRange {
                    index: chunk.end_index,
                    total: known,
                });
            }
        }
        if chunk.current_index >= total {
            return Err(ProtocolError::ChunkOutOfRange {
                index: chunk.current_index,
                total,
            });
        }

        let is_last = chunk.current_index == total - 1;
        let size_ok = if is_last {
            chunk.payload.len() <= DATA_SIZE
        } else {
            chunk.payload.len() == DATA_SIZE
        };
        if !size_ok {
            return Err(ProtocolError::ChunkSize {
                index: chunk.current_index,
                size: chunk.payload.len(),
            });
        }

        if self.total_chunks.is_none() {
            self.total_chunks = Some(total);
            self.buffer = vec![0u8; total as usize * DATA_SIZE];
            self.received = vec![false; total as usize];
        }

        let index = chunk.current_index as usize;
        if self.received[index] {
            return Ok(());
        }

        let start = index * DATA_SIZE;
        self.buffer[start..start + chunk.payload.len()].copy_from_slice(&chunk.payload);
        self.received[index] = true;
        self.received_chunks += 1;
        if is_last {
            self.tail_len = chunk.payload.len();
        }
        Ok(())
    }

    /// The reconstructed payload. Only meaningful once complete.
    pub fn message(&self) -> &[u8] {
        match self.total_chunks {
            Some(total) => &self.buffer[..(total as usize - 1) * DATA_SIZE + self.tail_len],
            None => &[],
        }
    }

    pub fn into_message(mut self) -> Vec<u8> {
        let len = self.message().len();
        self.buffer.truncate(len);
        self.buffer
    }
}
