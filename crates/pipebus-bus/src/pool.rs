//! Per-message reassembly buffers keyed by `msg_id`.
//!
//! Storage for a message is allocated once, sized from the first chunk's
//! `len`, and never reallocated — interleaved messages can each be appended
//! to without invalidating the others. The pool is unbounded by design: a
//! sender that never finishes a message leaks its entry, and completeness is
//! the sender's responsibility.

use std::collections::HashMap;

use tracing::trace;

use crate::error::{BusError, Result};
use crate::header::FrameHeader;

/// Accumulation buffer for one in-flight chunked message.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Box<[u8]>,
    filled: usize,
}

impl PacketBuffer {
    fn with_total_len(len: usize) -> Result<Self> {
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(len)
            .map_err(|_| BusError::AllocationFailed { size: len })?;
        storage.resize(len, 0);
        Ok(Self {
            data: storage.into_boxed_slice(),
            filled: 0,
        })
    }

    /// Total capacity, fixed at creation from the header's `len`.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes received so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Bytes still missing.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.filled
    }

    /// The received prefix.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Writable tail for a scatter read; commit with [`PacketBuffer::advance`].
    pub(crate) fn tail(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Record `n` bytes written into the tail.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.filled += n.min(self.remaining());
    }

    /// Copy `bytes` onto the tail (datagram path).
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.remaining());
        self.data[self.filled..self.filled + n].copy_from_slice(&bytes[..n]);
        self.filled += n;
    }

    fn into_storage(self) -> Box<[u8]> {
        self.data
    }
}

/// Mapping from `msg_id` to in-flight reassembly buffers.
#[derive(Debug, Default)]
pub struct ReassemblyPool {
    entries: HashMap<u64, PacketBuffer>,
}

impl ReassemblyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the buffer for `header.msg_id`, creating it on a BEGIN chunk.
    ///
    /// Returns `Ok(None)` for a continuation whose first chunk never arrived
    /// (the orphan condition); the caller decides whether that is
    /// recoverable. Allocation failure surfaces as
    /// [`BusError::AllocationFailed`].
    pub fn get_or_create(&mut self, header: &FrameHeader) -> Result<Option<&mut PacketBuffer>> {
        if !self.entries.contains_key(&header.msg_id) {
            if !header.is_begin() {
                return Ok(None);
            }
            let buffer = PacketBuffer::with_total_len(header.len as usize)?;
            trace!(
                msg_id = header.msg_id,
                len = header.len,
                "opened reassembly buffer"
            );
            self.entries.insert(header.msg_id, buffer);
        }
        Ok(self.entries.get_mut(&header.msg_id))
    }

    /// Remove the entry for `msg_id` and hand its storage to the caller.
    pub fn move_out(&mut self, msg_id: u64) -> Option<Box<[u8]>> {
        self.entries.remove(&msg_id).map(PacketBuffer::into_storage)
    }

    /// Borrow the buffer for `msg_id`, if still pooled.
    pub fn get(&self, msg_id: u64) -> Option<&PacketBuffer> {
        self.entries.get(&msg_id)
    }

    /// Whether `msg_id` has an in-flight buffer.
    pub fn contains(&self, msg_id: u64) -> bool {
        self.entries.contains_key(&msg_id)
    }

    /// Number of in-flight messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the capacities of all in-flight buffers.
    pub fn memory_size(&self) -> usize {
        self.entries.values().map(PacketBuffer::capacity).sum()
    }
}
