pub mod display;
pub mod error;
pub mod ids;
pub mod ipc;
pub mod link;
pub mod output;
pub mod privilege;
pub mod process;
pub mod pty;
pub mod run_manager;
pub mod watchdog;

pub use display::{DisplayInfo, DisplayProvider, LocalDisplays};
pub use error::RunError;
pub use ids::IdAllocator;
pub use ipc::{IpcClients, IpcServer, MessageSplitter};
pub use link::{ChunkAssembler, ChunkSplitter};
pub use output::{PumpConfig, RingBuffer};
pub use process::{ProcessCallbacks, ProcessContext, ProcessHandler, Runner, StartOptions};
pub use run_manager::{RunManager, RunSettings, TransportKind};
pub use watchdog::Watchdog;
