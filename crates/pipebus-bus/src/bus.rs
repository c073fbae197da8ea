//! The message bus: framed, chunked transport over non-blocking sockets.
//!
//! One [`MessageBus`] instance serves one endpoint and is single-threaded;
//! concurrency across processes comes from giving each endpoint its own bus.
//! The reader never blocks: it returns [`ReadStatus::Pending`] on would-block
//! and relies on the caller's event loop for re-invocation. The writer sends
//! synchronously unless an [`EventHook`] reports an active event loop to take
//! the write asynchronously.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::RawFd;

use bytes::{Buf, BufMut};
use tracing::{debug, trace, warn};

use pipebus_transport::{BusSocket, PipeSocket, ReadVerdict, WriteVerdict};

use crate::error::{BusError, Result};
use crate::header::{flag, FrameHeader, HEADER_SIZE};
use crate::pool::{PacketBuffer, ReassemblyPool};

/// Default scratch/frame buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// Default fairness cap: chunks consumed per read invocation before yielding.
pub const DEFAULT_MAX_RECV_CHUNK_COUNT: u16 = 1024;
/// Default floor the writer falls back to when the kernel rejects frame sizes.
pub const DEFAULT_MIN_CHUNK_BYTES: usize = 8 * 1024;

/// Byte length of the `(length, pointer)` record a PTR frame carries.
const PTR_RECORD_LEN: usize = 16;

/// Tuning knobs for a [`MessageBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Scratch buffer size; one frame (header + chunk payload) must fit.
    pub buffer_size: usize,
    /// Disable the single-frame fast path and always emit chunked frames.
    pub always_chunked: bool,
    /// Fairness cap: chunks consumed per read invocation before yielding.
    pub max_recv_chunk_count: u16,
    /// Smallest chunk payload the adaptive writer will fall back to.
    pub min_chunk_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            always_chunked: false,
            max_recv_chunk_count: DEFAULT_MAX_RECV_CHUNK_COUNT,
            min_chunk_bytes: DEFAULT_MIN_CHUNK_BYTES,
        }
    }
}

/// Outcome of one reader invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Nothing consumable right now; re-invoke when the socket is readable.
    Pending,
    /// A complete message is ready; [`MessageBus::header`] describes it and
    /// the byte count covers the final consuming read.
    Ready(usize),
}

impl ReadStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadStatus::Ready(_))
    }
}

/// An outgoing message: header template plus payload.
///
/// The writer assigns `info.msg_id` and owns `info.flags` and `info.len`;
/// everything else in the header passes through to the peer untouched.
#[derive(Debug)]
pub struct SendData<'a> {
    pub info: FrameHeader,
    pub data: &'a [u8],
}

impl<'a> SendData<'a> {
    pub fn new(kind: u8, data: &'a [u8]) -> Self {
        Self {
            info: FrameHeader {
                kind,
                ..FrameHeader::default()
            },
            data,
        }
    }
}

/// Probe into an external event loop that can take asynchronous writes.
///
/// When [`EventHook::is_available`] reports true the bus routes every send
/// through [`EventHook::writev`]; the hook must either transfer (or queue)
/// the whole vector and return its total length, or report an error.
pub trait EventHook {
    fn is_available(&self) -> bool;
    fn writev(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
}

/// Receive scratch area: one decoded header plus one frame's payload.
struct Scratch {
    info: FrameHeader,
    data: Box<[u8]>,
}

/// Framed, chunked message transport over one set of non-blocking sockets.
///
/// The scratch buffer is not reentrant: consume the previous frame (via
/// [`MessageBus::get_packet`] or [`MessageBus::move_packet`]) before issuing
/// the next read.
pub struct MessageBus {
    config: BusConfig,
    scratch: Scratch,
    pool: ReassemblyPool,
    pipe_sockets: HashMap<RawFd, PipeSocket>,
    next_msg_id: Box<dyn FnMut() -> u64 + Send>,
    event_hook: Option<Box<dyn EventHook + Send>>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.config)
            .field("pipe_sockets", &self.pipe_sockets)
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    /// Create a bus with the given configuration.
    ///
    /// Fails if the buffer cannot hold a header plus one payload byte, or if
    /// the scratch buffer cannot be allocated.
    pub fn new(config: BusConfig) -> Result<Self> {
        let min = HEADER_SIZE + 1;
        if config.buffer_size < min {
            return Err(BusError::BufferTooSmall {
                size: config.buffer_size,
                min,
            });
        }
        let data_len = config.buffer_size - HEADER_SIZE;
        let mut data = Vec::new();
        data.try_reserve_exact(data_len)
            .map_err(|_| BusError::AllocationFailed { size: data_len })?;
        data.resize(data_len, 0);

        let mut counter = 0u64;
        Ok(Self {
            config,
            scratch: Scratch {
                info: FrameHeader::default(),
                data: data.into_boxed_slice(),
            },
            pool: ReassemblyPool::new(),
            pipe_sockets: HashMap::new(),
            next_msg_id: Box::new(move || {
                counter += 1;
                counter
            }),
            event_hook: None,
        })
    }

    /// Replace the message-id generator.
    ///
    /// The default counts up from 1 per bus instance; inject a shared
    /// generator when ids must be unique across several buses.
    pub fn with_id_generator(mut self, generator: impl FnMut() -> u64 + Send + 'static) -> Self {
        self.next_msg_id = Box::new(generator);
        self
    }

    /// Attach an event-loop probe for asynchronous writes.
    pub fn with_event_hook(mut self, hook: impl EventHook + Send + 'static) -> Self {
        self.event_hook = Some(Box::new(hook));
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Header of the most recently received (or passed) message.
    ///
    /// Valid between a [`ReadStatus::Ready`] return and the next read call.
    pub fn header(&self) -> &FrameHeader {
        &self.scratch.info
    }

    /// The reassembly pool, for introspection.
    pub fn pool(&self) -> &ReassemblyPool {
        &self.pool
    }

    /// Largest chunk payload that fits in one frame.
    pub fn max_chunk_bytes(&self) -> usize {
        self.config.buffer_size - HEADER_SIZE
    }

    /// Bytes held by this bus: scratch plus all in-flight reassembly buffers.
    pub fn memory_size(&self) -> usize {
        self.config.buffer_size + self.pool.memory_size()
    }

    /// Register a caller-owned pipe descriptor, forcing it non-blocking.
    ///
    /// The bus never closes registered descriptors; dropping the bus merely
    /// releases the wrappers.
    pub fn init_pipe_socket(&mut self, fd: RawFd) -> Result<()> {
        let sock = PipeSocket::from_raw_fd(fd);
        sock.set_nonblock()?;
        self.pipe_sockets.insert(fd, sock);
        Ok(())
    }

    /// Look up a registered pipe socket.
    pub fn pipe_socket(&self, fd: RawFd) -> Option<&PipeSocket> {
        self.pipe_sockets.get(&fd)
    }

    /// Read from a stream socket.
    ///
    /// Peeks the header to classify the next frame, then consumes exactly one
    /// frame per iteration. Loops over successive chunks of a message until
    /// it completes, the socket would block, or the fairness cap is reached.
    pub fn read<S: BusSocket>(&mut self, sock: &S) -> Result<ReadStatus> {
        let mut chunk_count: u16 = 0;
        loop {
            let mut raw = [0u8; HEADER_SIZE];
            match sock.peek(&mut raw) {
                Ok(0) => {
                    warn!(fd = sock.fd(), "peer closed the pipe");
                    return Err(BusError::PeerClosed { fd: sock.fd() });
                }
                Ok(n) if n < HEADER_SIZE => return Ok(ReadStatus::Pending),
                Ok(_) => {}
                Err(err) => {
                    return match sock.read_verdict(&err) {
                        ReadVerdict::Wait => Ok(ReadStatus::Pending),
                        ReadVerdict::Fatal => Err(BusError::Io(err)),
                    }
                }
            }
            let info = FrameHeader::decode(&raw);
            self.scratch.info = info;

            if !info.is_chunked() {
                return self.consume_single(sock, info.len as usize);
            }

            let max_payload = self.scratch.data.len();
            let Some(buffer) = self.pool.get_or_create(&info)? else {
                warn!(
                    msg_id = info.msg_id,
                    pipe_fd = sock.fd(),
                    reactor_id = info.reactor_id,
                    "chunk for a message that never began, discarding one header to resync"
                );
                // Drop one header's worth and hope the stream realigns on the
                // next frame boundary.
                let _ = sock.recv(&mut raw);
                return Ok(ReadStatus::Pending);
            };

            let want = max_payload.min(buffer.remaining());
            let tail = &mut buffer.tail()[..want];
            let mut iov = [IoSliceMut::new(&mut raw), IoSliceMut::new(tail)];
            let n = match sock.recv_vectored(&mut iov) {
                Ok(0) => {
                    warn!(fd = sock.fd(), "pipe closed mid-message");
                    return Err(BusError::PeerClosed { fd: sock.fd() });
                }
                Ok(n) => n,
                Err(err) => {
                    return match sock.read_verdict(&err) {
                        ReadVerdict::Wait => Ok(ReadStatus::Pending),
                        ReadVerdict::Fatal => Err(BusError::Io(err)),
                    }
                }
            };
            buffer.advance(n.saturating_sub(HEADER_SIZE));
            trace!(
                msg_id = info.msg_id,
                n,
                filled = buffer.filled(),
                "appended chunk"
            );

            self.scratch.info = FrameHeader::decode(&raw);
            chunk_count += 1;
            if !self.scratch.info.is_end() {
                if chunk_count >= self.config.max_recv_chunk_count {
                    trace!(
                        chunk_count,
                        "chunk budget for this wake-up exhausted, yielding"
                    );
                    return Ok(ReadStatus::Pending);
                }
                continue;
            }

            self.scratch.info.flags |= flag::OBJ_PTR;
            return Ok(ReadStatus::Ready(n));
        }
    }

    /// Read from a datagram socket.
    ///
    /// Datagrams arrive whole, so there is no peek step; each datagram is one
    /// frame. An orphan continuation is fatal here — discarding cannot
    /// resynchronize a datagram socket.
    pub fn read_with_buffer<S: BusSocket>(&mut self, sock: &S) -> Result<ReadStatus> {
        let mut chunk_count: u16 = 0;
        loop {
            let mut raw = [0u8; HEADER_SIZE];
            let n = {
                let mut iov = [
                    IoSliceMut::new(&mut raw),
                    IoSliceMut::new(&mut self.scratch.data),
                ];
                match sock.recv_vectored(&mut iov) {
                    Ok(0) => {
                        warn!(fd = sock.fd(), "peer closed the pipe");
                        return Err(BusError::PeerClosed { fd: sock.fd() });
                    }
                    Ok(n) => n,
                    Err(err) => {
                        return match sock.read_verdict(&err) {
                            ReadVerdict::Wait => Ok(ReadStatus::Pending),
                            ReadVerdict::Fatal => Err(BusError::Io(err)),
                        }
                    }
                }
            };
            if n < HEADER_SIZE {
                return Err(BusError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "datagram shorter than a frame header",
                )));
            }
            self.scratch.info = FrameHeader::decode(&raw);
            let info = self.scratch.info;

            if !info.is_chunked() {
                return Ok(ReadStatus::Ready(n));
            }

            let Some(buffer) = self.pool.get_or_create(&info)? else {
                warn!(
                    msg_id = info.msg_id,
                    pipe_fd = sock.fd(),
                    reactor_id = info.reactor_id,
                    "chunk for a message that never began on a datagram socket"
                );
                return Err(BusError::OrphanChunk {
                    msg_id: info.msg_id,
                    fd: sock.fd(),
                });
            };
            buffer.append(&self.scratch.data[..n - HEADER_SIZE]);
            trace!(
                msg_id = info.msg_id,
                n,
                filled = buffer.filled(),
                "appended chunk"
            );

            chunk_count += 1;
            if !info.is_end() {
                if chunk_count >= self.config.max_recv_chunk_count {
                    trace!(
                        chunk_count,
                        "chunk budget for this wake-up exhausted, yielding"
                    );
                    return Ok(ReadStatus::Pending);
                }
                continue;
            }

            self.scratch.info.flags |= flag::OBJ_PTR;
            return Ok(ReadStatus::Ready(n));
        }
    }

    /// Consume one non-chunked frame (header plus exactly `len` payload
    /// bytes) into scratch with a single scatter read.
    fn consume_single<S: BusSocket>(&mut self, sock: &S, len: usize) -> Result<ReadStatus> {
        if len > self.scratch.data.len() {
            return Err(BusError::OversizeFrame {
                len,
                max: self.scratch.data.len(),
            });
        }
        let mut raw = [0u8; HEADER_SIZE];
        let (payload, _) = self.scratch.data.split_at_mut(len);
        let mut iov = [IoSliceMut::new(&mut raw), IoSliceMut::new(payload)];
        let n = match sock.recv_vectored(&mut iov) {
            Ok(0) => {
                warn!(fd = sock.fd(), "peer closed the pipe");
                return Err(BusError::PeerClosed { fd: sock.fd() });
            }
            Ok(n) => n,
            Err(err) => {
                return match sock.read_verdict(&err) {
                    ReadVerdict::Wait => Ok(ReadStatus::Pending),
                    ReadVerdict::Fatal => Err(BusError::Io(err)),
                }
            }
        };
        self.scratch.info = FrameHeader::decode(&raw);
        Ok(ReadStatus::Ready(n))
    }

    /// Send a message, chunking as needed.
    ///
    /// Assigns a fresh `msg_id` into `resp.info`. Messages larger than
    /// [`MessageBus::max_chunk_bytes`] (or all messages, when
    /// `always_chunked` is set) go out as a chunked series; when the kernel
    /// reports the frame was too large, the chunk size drops once to the
    /// configured floor and the send resumes from the current offset.
    pub fn write<S: BusSocket>(&mut self, sock: &S, resp: &mut SendData<'_>) -> Result<()> {
        resp.info.msg_id = (self.next_msg_id)();
        let total = resp.data.len();
        let mut max_chunk = self.max_chunk_bytes();

        if total == 0 {
            resp.info.flags = 0;
            resp.info.len = 0;
            let raw = resp.info.encode();
            let n = self.send(sock, &[IoSlice::new(&raw)])?;
            return if n == HEADER_SIZE {
                Ok(())
            } else {
                Err(BusError::ShortWrite {
                    fd: sock.fd(),
                    written: n,
                    expected: HEADER_SIZE,
                })
            };
        }

        if !self.config.always_chunked && total <= max_chunk {
            resp.info.flags = 0;
            resp.info.len = total as u32;
            let raw = resp.info.encode();
            match self.send(sock, &[IoSlice::new(&raw), IoSlice::new(resp.data)]) {
                Ok(n) if n == HEADER_SIZE + total => return Ok(()),
                Ok(n) => {
                    return Err(BusError::ShortWrite {
                        fd: sock.fd(),
                        written: n,
                        expected: HEADER_SIZE + total,
                    })
                }
                Err(err) => {
                    if sock.write_verdict(&err) == WriteVerdict::ReduceSize
                        && max_chunk > self.config.min_chunk_bytes
                    {
                        debug!(
                            fd = sock.fd(),
                            floor = self.config.min_chunk_bytes,
                            "kernel rejected frame size, switching to floor-sized chunks"
                        );
                        max_chunk = self.config.min_chunk_bytes;
                    } else {
                        return Err(BusError::Io(err));
                    }
                }
            }
        }

        resp.info.flags = flag::CHUNK | flag::BEGIN;
        resp.info.len = total as u32;
        let mut offset = 0usize;
        while offset < total {
            let remaining = total - offset;
            let chunk = if remaining > max_chunk {
                max_chunk
            } else {
                resp.info.flags |= flag::END;
                remaining
            };

            let raw = resp.info.encode();
            trace!(kind = resp.info.kind, len = chunk, "sending chunk");
            match self.send(
                sock,
                &[
                    IoSlice::new(&raw),
                    IoSlice::new(&resp.data[offset..offset + chunk]),
                ],
            ) {
                Ok(_) => {
                    resp.info.flags &= !flag::BEGIN;
                    offset += chunk;
                }
                Err(err) => {
                    if sock.write_verdict(&err) == WriteVerdict::ReduceSize
                        && max_chunk > self.config.min_chunk_bytes
                    {
                        max_chunk = self.config.min_chunk_bytes;
                        resp.info.flags &= !flag::END;
                        continue;
                    }
                    return Err(BusError::Io(err));
                }
            }
        }

        Ok(())
    }

    /// Deliver a message locally without touching any socket.
    ///
    /// Copies the header into scratch and records the payload as a
    /// `(length, pointer)` pair behind [`flag::PTR`]. The referenced bytes
    /// must stay alive and unmoved until the packet has been consumed via
    /// [`MessageBus::get_packet`].
    pub fn pass(&mut self, task: &SendData<'_>) {
        self.scratch.info = task.info;
        if task.data.is_empty() {
            self.scratch.info.len = 0;
            return;
        }
        debug_assert!(self.scratch.data.len() >= PTR_RECORD_LEN);
        self.scratch.info.flags = flag::PTR;
        self.scratch.info.len = PTR_RECORD_LEN as u32;
        let mut buf = &mut self.scratch.data[..PTR_RECORD_LEN];
        buf.put_u64_ne(task.data.len() as u64);
        buf.put_u64_ne(task.data.as_ptr() as usize as u64);
    }

    /// Borrow the payload of the most recently received message.
    ///
    /// Resolves the three delivery routes: scratch-resident payloads,
    /// pool-resident reassembled payloads ([`flag::OBJ_PTR`]), and local
    /// pointer hand-offs ([`flag::PTR`]). Returns `None` when a reassembled
    /// payload was already taken with [`MessageBus::move_packet`].
    pub fn get_packet(&self) -> Option<&[u8]> {
        let info = &self.scratch.info;
        if info.flags & flag::PTR != 0 {
            let mut buf = &self.scratch.data[..PTR_RECORD_LEN];
            let len = buf.get_u64_ne() as usize;
            let ptr = buf.get_u64_ne() as usize as *const u8;
            if ptr.is_null() {
                return None;
            }
            // SAFETY: PTR packets are produced only by `pass` in this same
            // process, which requires the referenced bytes to outlive the
            // hand-off (documented there).
            Some(unsafe { std::slice::from_raw_parts(ptr, len) })
        } else if info.flags & flag::OBJ_PTR != 0 {
            self.pool.get(info.msg_id).map(PacketBuffer::as_slice)
        } else {
            Some(&self.scratch.data[..info.len as usize])
        }
    }

    /// Take ownership of the reassembled payload for the scratch `msg_id`.
    ///
    /// Must be called after a [`ReadStatus::Ready`] return whose header
    /// carries [`flag::OBJ_PTR`]; the pool entry is erased.
    pub fn move_packet(&mut self) -> Option<Box<[u8]>> {
        self.pool.move_out(self.scratch.info.msg_id)
    }

    fn send<S: BusSocket>(&self, sock: &S, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match &self.event_hook {
            Some(hook) if hook.is_available() => hook.writev(sock.fd(), bufs),
            _ => sock.writev_sync(bufs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use pipebus_transport::{datagram_pair, stream_pair};

    use super::*;

    fn bus_with(buffer_size: usize) -> MessageBus {
        MessageBus::new(BusConfig {
            buffer_size,
            ..BusConfig::default()
        })
        .unwrap()
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Write one raw frame, bypassing the writer state machine.
    fn send_frame<S: BusSocket>(sock: &S, info: &FrameHeader, payload: &[u8]) {
        let raw = info.encode();
        let n = sock
            .writev_sync(&[IoSlice::new(&raw), IoSlice::new(payload)])
            .unwrap();
        assert_eq!(n, HEADER_SIZE + payload.len());
    }

    /// In-memory socket: writes append to a queue, reads drain it.
    ///
    /// `fail_writes` makes the next N writes fail with `EMSGSIZE` to drive
    /// the adaptive-writer path.
    struct LoopbackSocket {
        queue: RefCell<VecDeque<u8>>,
        fail_writes: Cell<u32>,
    }

    impl LoopbackSocket {
        fn new() -> Self {
            Self {
                queue: RefCell::new(VecDeque::new()),
                fail_writes: Cell::new(0),
            }
        }

        fn failing_writes(n: u32) -> Self {
            let sock = Self::new();
            sock.fail_writes.set(n);
            sock
        }

        fn written(&self) -> Vec<u8> {
            self.queue.borrow().iter().copied().collect()
        }
    }

    impl BusSocket for LoopbackSocket {
        fn fd(&self) -> std::os::fd::RawFd {
            -1
        }

        fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
            let queue = self.queue.borrow();
            if queue.is_empty() {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            let n = buf.len().min(queue.len());
            for (slot, byte) in buf.iter_mut().zip(queue.iter()) {
                *slot = *byte;
            }
            Ok(n)
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut queue = self.queue.borrow_mut();
            if queue.is_empty() {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            let n = buf.len().min(queue.len());
            for slot in buf.iter_mut().take(n) {
                *slot = queue.pop_front().unwrap();
            }
            Ok(n)
        }

        fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
            let mut queue = self.queue.borrow_mut();
            if queue.is_empty() {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            let mut total = 0;
            for buf in bufs.iter_mut() {
                for slot in buf.iter_mut() {
                    match queue.pop_front() {
                        Some(byte) => {
                            *slot = byte;
                            total += 1;
                        }
                        None => return Ok(total),
                    }
                }
            }
            Ok(total)
        }

        fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            if self.fail_writes.get() > 0 {
                self.fail_writes.set(self.fail_writes.get() - 1);
                return Err(io::Error::from_raw_os_error(libc::EMSGSIZE));
            }
            let mut queue = self.queue.borrow_mut();
            let mut total = 0;
            for buf in bufs {
                queue.extend(buf.iter().copied());
                total += buf.len();
            }
            Ok(total)
        }

        fn writev_sync(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            self.writev(bufs)
        }
    }

    /// Parse frames out of a captured byte stream.
    ///
    /// Chunk payload lengths are implicit on the wire, so the writer's chunk
    /// size must be supplied to delimit non-final chunks.
    fn parse_frames(mut wire: &[u8], max_chunk: usize) -> Vec<(FrameHeader, usize)> {
        let mut frames: Vec<(FrameHeader, usize)> = Vec::new();
        while !wire.is_empty() {
            let info = FrameHeader::decode(wire);
            wire = &wire[HEADER_SIZE..];
            let already: usize = frames
                .iter()
                .filter(|(h, _)| h.msg_id == info.msg_id)
                .map(|(_, n)| n)
                .sum();
            let chunk = if !info.is_chunked() {
                info.len as usize
            } else if info.is_end() {
                info.len as usize - already
            } else {
                max_chunk.min(info.len as usize - already)
            };
            frames.push((info, chunk));
            wire = &wire[chunk..];
        }
        frames
    }

    #[test]
    fn short_message_roundtrips_without_chunking() {
        let (tx, rx) = stream_pair().unwrap();
        let mut writer = bus_with(4096);
        let mut reader = bus_with(4096);

        let payload = patterned(100);
        let mut resp = SendData::new(7, &payload);
        resp.info.fd = 12;
        writer.write(&tx, &mut resp).unwrap();

        let status = reader.read(&rx).unwrap();
        assert_eq!(status, ReadStatus::Ready(HEADER_SIZE + 100));

        let header = reader.header();
        assert_eq!(header.flags, 0);
        assert_eq!(header.len, 100);
        assert_eq!(header.kind, 7);
        assert_eq!(header.fd, 12);
        assert_eq!(header.msg_id, resp.info.msg_id);
        assert_eq!(reader.get_packet().unwrap(), payload.as_slice());
        assert!(reader.pool().is_empty());
    }

    #[test]
    fn one_byte_over_fast_path_is_chunked() {
        let buffer_size = HEADER_SIZE + 64;
        let (tx, rx) = stream_pair().unwrap();
        let mut writer = bus_with(buffer_size);
        let mut reader = bus_with(buffer_size);

        let payload = patterned(65);
        let mut resp = SendData::new(1, &payload);
        writer.write(&tx, &mut resp).unwrap();

        let status = reader.read(&rx).unwrap();
        assert!(status.is_ready());
        let header = *reader.header();
        assert!(header.is_chunked() && header.is_end());
        assert_ne!(header.flags & flag::OBJ_PTR, 0);
        assert_eq!(header.len, 65);

        let assembled = reader.move_packet().unwrap();
        assert_eq!(&assembled[..], payload.as_slice());
        assert!(reader.pool().is_empty());
    }

    #[test]
    fn chunks_arriving_one_at_a_time_complete_on_end() {
        let buffer_size = HEADER_SIZE + 64;
        let (tx, rx) = stream_pair().unwrap();
        let mut reader = bus_with(buffer_size);

        let payload = patterned(100);
        let mut info = FrameHeader {
            msg_id: 5,
            len: 100,
            flags: flag::CHUNK | flag::BEGIN,
            ..FrameHeader::default()
        };

        send_frame(&tx, &info, &payload[..64]);
        assert_eq!(reader.read(&rx).unwrap(), ReadStatus::Pending);
        assert_eq!(reader.pool().get(5).unwrap().filled(), 64);

        info.flags = flag::CHUNK | flag::END;
        send_frame(&tx, &info, &payload[64..]);
        assert!(reader.read(&rx).unwrap().is_ready());
        assert_eq!(&reader.move_packet().unwrap()[..], payload.as_slice());
    }

    #[test]
    fn four_chunk_message_reassembles() {
        let buffer_size = HEADER_SIZE + 1000;
        let (tx, rx) = stream_pair().unwrap();
        let mut writer = bus_with(buffer_size);
        let mut reader = bus_with(buffer_size);

        let payload = patterned(3500);
        let mut resp = SendData::new(9, &payload);
        writer.write(&tx, &mut resp).unwrap();

        let status = reader.read(&rx).unwrap();
        assert!(status.is_ready());
        let assembled = reader.move_packet().unwrap();
        assert_eq!(assembled.len(), 3500);
        assert_eq!(&assembled[..], payload.as_slice());
    }

    #[test]
    fn fairness_cap_yields_and_resumes() {
        let buffer_size = HEADER_SIZE + 100;
        let (tx, rx) = stream_pair().unwrap();
        let mut writer = bus_with(buffer_size);
        let mut reader = MessageBus::new(BusConfig {
            buffer_size,
            max_recv_chunk_count: 2,
            ..BusConfig::default()
        })
        .unwrap();

        let payload = patterned(300);
        let mut resp = SendData::new(2, &payload);
        writer.write(&tx, &mut resp).unwrap();
        let msg_id = resp.info.msg_id;

        assert_eq!(reader.read(&rx).unwrap(), ReadStatus::Pending);
        assert_eq!(reader.pool().get(msg_id).unwrap().filled(), 200);

        assert!(reader.read(&rx).unwrap().is_ready());
        assert_eq!(&reader.move_packet().unwrap()[..], payload.as_slice());
    }

    #[test]
    fn orphan_continuation_discards_exactly_one_header() {
        let (tx, rx) = stream_pair().unwrap();
        let mut reader = bus_with(4096);

        let orphan = FrameHeader {
            msg_id: 77,
            len: 500,
            flags: flag::CHUNK,
            ..FrameHeader::default()
        };
        send_frame(&tx, &orphan, b"");

        assert_eq!(reader.read(&rx).unwrap(), ReadStatus::Pending);
        assert!(reader.pool().is_empty());

        // The stream resynchronizes on the next frame boundary.
        let payload = patterned(40);
        let mut writer = bus_with(4096);
        let mut resp = SendData::new(3, &payload);
        writer.write(&tx, &mut resp).unwrap();

        assert!(reader.read(&rx).unwrap().is_ready());
        assert_eq!(reader.get_packet().unwrap(), payload.as_slice());
    }

    #[test]
    fn adaptive_writer_falls_back_to_floor_chunks() {
        let sock = LoopbackSocket::failing_writes(1);
        let mut writer = MessageBus::new(BusConfig {
            buffer_size: HEADER_SIZE + 64,
            min_chunk_bytes: 16,
            ..BusConfig::default()
        })
        .unwrap();

        let payload = patterned(32);
        let mut resp = SendData::new(4, &payload);
        writer.write(&sock, &mut resp).unwrap();

        let frames = parse_frames(&sock.written(), 16);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0.flags, flag::CHUNK | flag::BEGIN);
        assert_eq!(frames[0].1, 16);
        assert_eq!(frames[1].0.flags, flag::CHUNK | flag::END);
        assert_eq!(frames[1].1, 16);
        for (info, _) in &frames {
            assert_eq!(info.len, 32);
        }

        // The peer reassembles the same payload from the reduced frames.
        let mut reader = bus_with(HEADER_SIZE + 64);
        assert!(reader.read(&sock).unwrap().is_ready());
        assert_eq!(&reader.move_packet().unwrap()[..], payload.as_slice());
    }

    #[test]
    fn reduce_size_without_headroom_is_an_error() {
        let sock = LoopbackSocket::failing_writes(1);
        let mut writer = MessageBus::new(BusConfig {
            buffer_size: HEADER_SIZE + 16,
            min_chunk_bytes: 16,
            ..BusConfig::default()
        })
        .unwrap();

        let payload = patterned(8);
        let mut resp = SendData::new(4, &payload);
        let err = writer.write(&sock, &mut resp).unwrap_err();
        assert!(matches!(err, BusError::Io(_)));
    }

    #[test]
    fn completed_message_leaves_no_state_behind() {
        let buffer_size = HEADER_SIZE + 50;
        let (tx, rx) = stream_pair().unwrap();
        let mut writer = bus_with(buffer_size);
        let mut reader = bus_with(buffer_size);

        let payload = patterned(120);
        let mut resp = SendData::new(1, &payload);
        writer.write(&tx, &mut resp).unwrap();

        assert!(reader.read(&rx).unwrap().is_ready());
        let msg_id = reader.header().msg_id;
        assert_eq!(&reader.move_packet().unwrap()[..], payload.as_slice());

        assert_eq!(reader.read(&rx).unwrap(), ReadStatus::Pending);
        assert!(!reader.pool().contains(msg_id));
    }

    #[test]
    fn interleaved_messages_reassemble_independently() {
        let (tx, rx) = stream_pair().unwrap();
        let mut reader = bus_with(4096);

        let a = vec![b'a'; 80];
        let b = vec![b'b'; 60];
        let header = |msg_id, len, flags| FrameHeader {
            msg_id,
            len,
            flags,
            ..FrameHeader::default()
        };

        send_frame(&tx, &header(1, 80, flag::CHUNK | flag::BEGIN), &a[..40]);
        send_frame(&tx, &header(2, 60, flag::CHUNK | flag::BEGIN), &b[..30]);
        send_frame(&tx, &header(1, 80, flag::CHUNK | flag::END), &a[40..]);
        send_frame(&tx, &header(2, 60, flag::CHUNK | flag::END), &b[30..]);

        assert!(reader.read(&rx).unwrap().is_ready());
        assert_eq!(reader.header().msg_id, 1);
        assert_eq!(&reader.move_packet().unwrap()[..], a.as_slice());

        assert!(reader.read(&rx).unwrap().is_ready());
        assert_eq!(reader.header().msg_id, 2);
        assert_eq!(&reader.move_packet().unwrap()[..], b.as_slice());
        assert!(reader.pool().is_empty());
    }

    #[test]
    fn empty_payload_sends_header_only() {
        let (tx, rx) = stream_pair().unwrap();
        let mut writer = bus_with(4096);
        let mut reader = bus_with(4096);

        let mut resp = SendData::new(5, b"");
        writer.write(&tx, &mut resp).unwrap();

        assert_eq!(reader.read(&rx).unwrap(), ReadStatus::Ready(HEADER_SIZE));
        assert_eq!(reader.header().flags, 0);
        assert_eq!(reader.header().len, 0);
        assert_eq!(reader.get_packet().unwrap(), b"");
    }

    #[test]
    fn always_chunked_disables_the_fast_path() {
        let sock = LoopbackSocket::new();
        let mut writer = MessageBus::new(BusConfig {
            buffer_size: 4096,
            always_chunked: true,
            ..BusConfig::default()
        })
        .unwrap();

        let payload = patterned(10);
        let mut resp = SendData::new(6, &payload);
        writer.write(&sock, &mut resp).unwrap();

        let frames = parse_frames(&sock.written(), writer.max_chunk_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.flags, flag::CHUNK | flag::BEGIN | flag::END);

        let mut reader = bus_with(4096);
        assert!(reader.read(&sock).unwrap().is_ready());
        assert_eq!(&reader.move_packet().unwrap()[..], payload.as_slice());
    }

    #[test]
    fn datagram_roundtrip() {
        let (tx, rx) = datagram_pair().unwrap();
        let mut writer = bus_with(4096);
        let mut reader = bus_with(4096);

        let payload = patterned(200);
        let mut resp = SendData::new(8, &payload);
        writer.write(&tx, &mut resp).unwrap();

        let status = reader.read_with_buffer(&rx).unwrap();
        assert_eq!(status, ReadStatus::Ready(HEADER_SIZE + 200));
        assert_eq!(reader.get_packet().unwrap(), payload.as_slice());
    }

    #[test]
    fn datagram_chunked_roundtrip() {
        let buffer_size = HEADER_SIZE + 256;
        let (tx, rx) = datagram_pair().unwrap();
        let mut writer = bus_with(buffer_size);
        let mut reader = bus_with(buffer_size);

        let payload = patterned(1000);
        let mut resp = SendData::new(8, &payload);
        writer.write(&tx, &mut resp).unwrap();

        assert!(reader.read_with_buffer(&rx).unwrap().is_ready());
        assert_eq!(&reader.move_packet().unwrap()[..], payload.as_slice());
    }

    #[test]
    fn datagram_orphan_is_fatal() {
        let (tx, rx) = datagram_pair().unwrap();
        let mut reader = bus_with(4096);

        let orphan = FrameHeader {
            msg_id: 13,
            len: 64,
            flags: flag::CHUNK,
            ..FrameHeader::default()
        };
        send_frame(&tx, &orphan, &patterned(32));

        let err = reader.read_with_buffer(&rx).unwrap_err();
        assert!(matches!(err, BusError::OrphanChunk { msg_id: 13, .. }));
    }

    #[test]
    fn read_on_idle_socket_is_pending() {
        let (_tx, rx) = stream_pair().unwrap();
        let mut reader = bus_with(4096);
        assert_eq!(reader.read(&rx).unwrap(), ReadStatus::Pending);
    }

    #[test]
    fn peer_close_is_fatal() {
        let (tx, rx) = stream_pair().unwrap();
        drop(tx);
        let mut reader = bus_with(4096);
        let err = reader.read(&rx).unwrap_err();
        assert!(matches!(err, BusError::PeerClosed { .. }));
    }

    #[test]
    fn oversize_single_frame_is_rejected() {
        let (tx, rx) = stream_pair().unwrap();
        let mut reader = bus_with(HEADER_SIZE + 32);

        let info = FrameHeader {
            msg_id: 1,
            len: 64,
            ..FrameHeader::default()
        };
        send_frame(&tx, &info, &patterned(64));

        let err = reader.read(&rx).unwrap_err();
        assert!(matches!(err, BusError::OversizeFrame { len: 64, max: 32 }));
    }

    #[test]
    fn pass_hands_payload_through_without_copying_it_to_a_socket() {
        let mut bus = bus_with(4096);
        let payload = patterned(48);
        let mut task = SendData::new(11, &payload);
        task.info.fd = 3;

        bus.pass(&task);

        assert_ne!(bus.header().flags & flag::PTR, 0);
        assert_eq!(bus.header().kind, 11);
        assert_eq!(bus.header().fd, 3);
        assert_eq!(bus.get_packet().unwrap(), payload.as_slice());
    }

    #[test]
    fn pass_with_empty_payload_keeps_header_only() {
        let mut bus = bus_with(4096);
        let task = SendData::new(11, b"");

        bus.pass(&task);

        assert_eq!(bus.header().flags & flag::PTR, 0);
        assert_eq!(bus.header().len, 0);
        assert_eq!(bus.get_packet().unwrap(), b"");
    }

    #[test]
    fn pipe_socket_table_registers_without_owning() {
        let (tx, rx) = stream_pair().unwrap();
        let mut writer = bus_with(4096);
        let mut reader = bus_with(4096);

        reader.init_pipe_socket(rx.fd()).unwrap();
        let handle = reader.pipe_socket(rx.fd()).unwrap().as_borrowed();

        let payload = patterned(20);
        let mut resp = SendData::new(1, &payload);
        writer.write(&tx, &mut resp).unwrap();

        assert!(reader.read(&handle).unwrap().is_ready());
        assert_eq!(reader.get_packet().unwrap(), payload.as_slice());

        // Dropping the bus must not close the caller's descriptor.
        drop(reader);
        let mut buf = [0u8; 1];
        let err = rx.recv(&mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
    }

    #[test]
    fn memory_size_tracks_in_flight_buffers() {
        let buffer_size = HEADER_SIZE + 100;
        let (tx, rx) = stream_pair().unwrap();
        let mut reader = bus_with(buffer_size);
        assert_eq!(reader.memory_size(), buffer_size);

        let info = FrameHeader {
            msg_id: 4,
            len: 250,
            flags: flag::CHUNK | flag::BEGIN,
            ..FrameHeader::default()
        };
        send_frame(&tx, &info, &patterned(100));

        assert_eq!(reader.read(&rx).unwrap(), ReadStatus::Pending);
        assert_eq!(reader.memory_size(), buffer_size + 250);
    }

    #[test]
    fn buffer_must_hold_header_plus_one_byte() {
        let err = MessageBus::new(BusConfig {
            buffer_size: HEADER_SIZE,
            ..BusConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, BusError::BufferTooSmall { .. }));

        assert!(MessageBus::new(BusConfig {
            buffer_size: HEADER_SIZE + 1,
            ..BusConfig::default()
        })
        .is_ok());
    }

    #[test]
    fn msg_ids_are_assigned_and_monotonic() {
        let sock = LoopbackSocket::new();
        let mut writer = bus_with(4096);

        let mut first = SendData::new(0, b"x");
        let mut second = SendData::new(0, b"y");
        writer.write(&sock, &mut first).unwrap();
        writer.write(&sock, &mut second).unwrap();

        assert!(second.info.msg_id > first.info.msg_id);
    }

    #[test]
    fn injected_id_generator_is_used() {
        let sock = LoopbackSocket::new();
        let mut writer = bus_with(4096).with_id_generator(|| 4242);

        let mut resp = SendData::new(0, b"x");
        writer.write(&sock, &mut resp).unwrap();
        assert_eq!(resp.info.msg_id, 4242);
    }

    struct RecordingHook {
        active: bool,
        frames: RefCell<Vec<u8>>,
    }

    impl EventHook for RecordingHook {
        fn is_available(&self) -> bool {
            self.active
        }

        fn writev(&self, _fd: std::os::fd::RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let mut frames = self.frames.borrow_mut();
            let mut total = 0;
            for buf in bufs {
                frames.extend_from_slice(buf);
                total += buf.len();
            }
            Ok(total)
        }
    }

    #[test]
    fn available_event_hook_takes_the_write() {
        let sock = LoopbackSocket::new();
        let mut writer = bus_with(4096).with_event_hook(RecordingHook {
            active: true,
            frames: RefCell::new(Vec::new()),
        });

        let payload = patterned(24);
        let mut resp = SendData::new(2, &payload);
        writer.write(&sock, &mut resp).unwrap();

        // Nothing reached the socket; the hook got the whole frame.
        assert!(sock.written().is_empty());
    }

    #[test]
    fn unavailable_event_hook_falls_back_to_sync_writes() {
        let sock = LoopbackSocket::new();
        let mut writer = bus_with(4096).with_event_hook(RecordingHook {
            active: false,
            frames: RefCell::new(Vec::new()),
        });

        let payload = patterned(24);
        let mut resp = SendData::new(2, &payload);
        writer.write(&sock, &mut resp).unwrap();

        assert_eq!(sock.written().len(), HEADER_SIZE + 24);
    }
}
