use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified socket path.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified socket path.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on a socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// What the reader should do with a failed receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadVerdict {
    /// Transient; yield and retry when the socket is readable again.
    Wait,
    /// The socket is unusable; the caller should tear it down.
    Fatal,
}

/// What the writer should do with a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVerdict {
    /// The kernel rejected the frame size; retry with smaller frames.
    ReduceSize,
    /// Transient; retry when the socket is writable again.
    Wait,
    /// The socket is unusable; the caller should tear it down.
    Fatal,
}

/// Classify a receive error by errno.
pub fn read_verdict(err: &std::io::Error) -> ReadVerdict {
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => ReadVerdict::Wait,
        #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on Linux
        Some(libc::EWOULDBLOCK) => ReadVerdict::Wait,
        _ => ReadVerdict::Fatal,
    }
}

/// Classify a send error by errno.
///
/// `EMSGSIZE` and `ENOBUFS` mean the datagram or pipe write was too large for
/// the kernel to take whole; the sender should fall back to smaller frames.
pub fn write_verdict(err: &std::io::Error) -> WriteVerdict {
    match err.raw_os_error() {
        Some(libc::EMSGSIZE) | Some(libc::ENOBUFS) => WriteVerdict::ReduceSize,
        Some(libc::EAGAIN) | Some(libc::EINTR) => WriteVerdict::Wait,
        #[allow(unreachable_patterns)]
        Some(libc::EWOULDBLOCK) => WriteVerdict::Wait,
        _ => WriteVerdict::Fatal,
    }
}
