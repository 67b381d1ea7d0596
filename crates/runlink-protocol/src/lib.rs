pub mod chunk;
pub mod envelope;
pub mod paths;

use thiserror::Error;

pub use chunk::{Chunk, ChunkedMessage, DATA_SIZE, HEADER_SIZE, MAX_CHUNK_SIZE};
pub use envelope::Envelope;

/// Commands a client may send to a run manager.
pub mod command {
    pub const PING: &str = "ping";
    pub const START: &str = "start";
    pub const STDIN: &str = "stdin";
    pub const RESIZE: &str = "resize";
    pub const STOP: &str = "stop";
    pub const KEYEVENT: &str = "keyevent";
}

/// Events a run manager emits back to its client.
pub mod event {
    pub const PONG: &str = "pong";
    pub const STARTED: &str = "started";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const VIDEO: &str = "video";
    pub const KEYLISTEN: &str = "keylisten";
    pub const NOVNC: &str = "novnc";
    pub const STOPPED: &str = "stopped";
    pub const ERROR: &str = "error";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("chunk for message {got} appended to message {expected}")]
    ChunkMismatch { expected: u16, got: u16 },

    #[error("chunk index {index} outside 0..{total}")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("chunk record of {0} bytes is shorter than its header")]
    ChunkTooShort(usize),

    #[error("chunk payload size {size} invalid for index {index}")]
    ChunkSize { index: u32, size: usize },
}
