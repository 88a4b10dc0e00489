//! Transport adapters implementing the frame ports.

pub mod codec;
pub mod memory;
pub mod ws;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
pub use memory::{MemoryFrameSink, MemoryFrameSource, MemoryPeer};
pub use ws::{WsFrameSink, WsFrameSource};
