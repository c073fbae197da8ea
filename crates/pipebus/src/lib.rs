//! Framed, chunked IPC messaging over pipes and Unix domain sockets.
//!
//! pipebus moves variable-length, typed messages between cooperating
//! processes. Messages larger than one frame are chunked on the wire and
//! reassembled per message id on the receiving side, so consumers always
//! observe whole messages regardless of kernel buffer sizes.
//!
//! # Crate Structure
//!
//! - [`transport`] — Non-blocking sockets: socketpairs, UDS, error verdicts
//! - [`bus`] — The message bus: framing, reassembly, fairness, adaptive writes

/// Re-export transport types.
pub mod transport {
    pub use pipebus_transport::*;
}

/// Re-export message-bus types.
pub mod bus {
    pub use pipebus_bus::*;
}
