use std::os::fd::RawFd;

/// Errors that terminate a bus operation.
///
/// Would-block conditions are not errors; the reader reports them as
/// [`ReadStatus::Pending`](crate::bus::ReadStatus::Pending). Anything here
/// means the operation failed and, for socket errors, that the caller should
/// tear the socket down.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Configured buffer cannot hold a header plus one payload byte.
    #[error("buffer size {size} below minimum {min}")]
    BufferTooSmall { size: usize, min: usize },

    /// The peer closed the socket.
    #[error("peer on socket#{fd} closed the connection")]
    PeerClosed { fd: RawFd },

    /// A chunk arrived on a datagram socket for a message that never began.
    #[error("chunk for unknown message {msg_id} on datagram socket#{fd}")]
    OrphanChunk { msg_id: u64, fd: RawFd },

    /// A non-chunked frame announced more payload than the scratch buffer holds.
    #[error("frame of {len} bytes exceeds receive buffer ({max})")]
    OversizeFrame { len: usize, max: usize },

    /// Reassembly or scratch storage could not be allocated.
    #[error("buffer allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    /// A send wrote fewer bytes than the frame required.
    #[error("write on socket#{fd} sent {written} of {expected} bytes")]
    ShortWrite {
        fd: RawFd,
        written: usize,
        expected: usize,
    },

    /// An I/O error on the underlying socket.
    #[error("message bus I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
