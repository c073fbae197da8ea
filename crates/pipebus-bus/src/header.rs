//! Wire-format frame header and flag model.
//!
//! Every frame starts with a fixed [`HEADER_SIZE`]-byte header encoded in
//! host byte order (frames never leave the machine). The `len` field always
//! carries the *total* payload length of the message, not the length of the
//! chunk it travels with; receivers size their reassembly buffer from the
//! first chunk and know completion from the [`flag::END`] bit, never from
//! byte arithmetic.

use bytes::{Buf, BufMut};

/// Fixed wire size of [`FrameHeader`].
pub const HEADER_SIZE: usize = 36;

/// Frame flag bits.
pub mod flag {
    /// Payload bytes carry a `(pointer, length)` pair into caller-owned
    /// memory. Only meaningful inside one process; never produced by the
    /// send path.
    pub const PTR: u8 = 1 << 1;
    /// The frame is one chunk of a larger message and must be reassembled.
    pub const CHUNK: u8 = 1 << 2;
    /// First chunk of a message.
    pub const BEGIN: u8 = 1 << 3;
    /// Final chunk of a message.
    pub const END: u8 = 1 << 4;
    /// Local marker: the reassembled payload now lives in the pool entry for
    /// this header's `msg_id`. Set by the reader, never written to the wire.
    pub const OBJ_PTR: u8 = 1 << 5;
}

/// Fixed-layout descriptor prefixing every frame on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameHeader {
    /// Logical source/destination descriptor; opaque to the bus.
    pub fd: i64,
    /// Unique per sent message; the reassembly key.
    pub msg_id: u64,
    /// Total payload length in bytes across all chunks of the message.
    pub len: u32,
    /// Routing hint; opaque to the bus.
    pub reactor_id: i16,
    /// Routing hint; opaque to the bus.
    pub server_fd: u16,
    /// Caller-defined message type.
    pub kind: u8,
    /// Bitset of [`flag`] values.
    pub flags: u8,
    /// Carried through untouched.
    pub ext_flags: u16,
    /// Timestamp in seconds; carried through, never stamped or validated.
    pub time: f64,
}

impl FrameHeader {
    /// Whether this frame participates in reassembly.
    pub fn is_chunked(&self) -> bool {
        self.flags & flag::CHUNK != 0
    }

    /// Whether this frame opens a chunked message.
    pub fn is_begin(&self) -> bool {
        self.flags & flag::BEGIN != 0
    }

    /// Whether this frame closes a chunked message.
    pub fn is_end(&self) -> bool {
        self.flags & flag::END != 0
    }

    /// Encode into the fixed wire layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        let mut buf = &mut raw[..];
        buf.put_i64_ne(self.fd);
        buf.put_u64_ne(self.msg_id);
        buf.put_u32_ne(self.len);
        buf.put_i16_ne(self.reactor_id);
        buf.put_u16_ne(self.server_fd);
        buf.put_u8(self.kind);
        buf.put_u8(self.flags);
        buf.put_u16_ne(self.ext_flags);
        buf.put_f64_ne(self.time);
        raw
    }

    /// Decode from the fixed wire layout.
    ///
    /// `raw` must hold at least [`HEADER_SIZE`] bytes.
    pub fn decode(raw: &[u8]) -> FrameHeader {
        let mut buf = &raw[..HEADER_SIZE];
        FrameHeader {
            fd: buf.get_i64_ne(),
            msg_id: buf.get_u64_ne(),
            len: buf.get_u32_ne(),
            reactor_id: buf.get_i16_ne(),
            server_fd: buf.get_u16_ne(),
            kind: buf.get_u8(),
            flags: buf.get_u8(),
            ext_flags: buf.get_u16_ne(),
            time: buf.get_f64_ne(),
        }
    }
}
