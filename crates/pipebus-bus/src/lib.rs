//! Framed, chunked message transport for cooperating processes.
//!
//! This is the core value-add layer of pipebus. Messages of any length move
//! over stream or datagram sockets as frames of a fixed header plus a bounded
//! payload slice; messages larger than one frame are chunked by the writer
//! and reassembled by the reader in per-`msg_id` buffers, so consumers only
//! ever observe whole messages. A per-invocation chunk budget keeps one busy
//! pipe from starving the rest of the event loop, and the writer adapts its
//! chunk size downward when the kernel rejects a frame as too large.

pub mod bus;
pub mod error;
pub mod header;
pub mod pool;

pub use bus::{
    BusConfig, EventHook, MessageBus, ReadStatus, SendData, DEFAULT_BUFFER_SIZE,
    DEFAULT_MAX_RECV_CHUNK_COUNT, DEFAULT_MIN_CHUNK_BYTES,
};
pub use error::{BusError, Result};
pub use header::{flag, FrameHeader, HEADER_SIZE};
pub use pool::{PacketBuffer, ReassemblyPool};
