//! Non-blocking local transport for pipebus.
//!
//! Provides the socket wrapper the message bus reads from and writes to:
//! - [`PipeSocket`] — a Unix socket descriptor with peek, vectored and
//!   synchronous-vectored I/O, usable over socketpairs and UDS connections
//! - [`BusSocket`] — the capability trait the bus is generic over, so tests
//!   can substitute in-memory fakes
//! - [`UdsListener`] — filesystem-path Unix domain socket bind/accept/connect
//!
//! Everything here is readiness-based: operations never sleep except
//! [`PipeSocket::writev_sync`], which polls for writability the way a
//! synchronous sender must.

pub mod error;
pub mod socket;

#[cfg(unix)]
pub mod uds;

pub use error::{read_verdict, write_verdict, ReadVerdict, Result, TransportError, WriteVerdict};
pub use socket::{datagram_pair, stream_pair, BusSocket, PipeSocket};

#[cfg(unix)]
pub use uds::UdsListener;
