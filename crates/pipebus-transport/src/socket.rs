use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};

use crate::error::{read_verdict, write_verdict, ReadVerdict, WriteVerdict};

/// The socket capability the message bus consumes.
///
/// [`PipeSocket`] is the production implementation; tests implement this
/// trait over in-memory buffers to drive the bus without file descriptors.
pub trait BusSocket {
    /// Descriptor identifying this socket in logs and headers.
    fn fd(&self) -> RawFd;

    /// Receive without consuming: the same bytes remain readable afterwards.
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Receive and consume up to `buf.len()` bytes.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Scatter-receive into multiple buffers with a single consume.
    fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;

    /// Gather-send in a single attempt; may write fewer bytes than offered.
    fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Gather-send the whole vector, polling for writability on would-block.
    ///
    /// Returns the total byte count on success. Errors other than
    /// would-block and interrupts surface unchanged so callers can classify
    /// them with [`BusSocket::write_verdict`].
    fn writev_sync(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Classify a receive error for the reader state machine.
    fn read_verdict(&self, err: &io::Error) -> ReadVerdict {
        read_verdict(err)
    }

    /// Classify a send error for the writer state machine.
    fn write_verdict(&self, err: &io::Error) -> WriteVerdict {
        write_verdict(err)
    }
}

/// A Unix socket descriptor used as a message-bus pipe.
///
/// The wrapper either owns its descriptor (created by [`stream_pair`],
/// [`datagram_pair`] or UDS accept/connect; closed on drop) or borrows one
/// whose lifetime belongs to the caller ([`PipeSocket::from_raw_fd`]; never
/// closed here).
#[derive(Debug)]
pub struct PipeSocket {
    fd: RawFd,
    owned: bool,
}

impl PipeSocket {
    /// Wrap a caller-owned descriptor without taking ownership.
    ///
    /// Dropping the wrapper releases nothing; the caller remains responsible
    /// for closing `fd`.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd, owned: false }
    }

    /// Take ownership of a descriptor; it is closed when the socket drops.
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self {
            fd: fd.into_raw_fd(),
            owned: true,
        }
    }

    /// The underlying descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// A non-owning handle to the same descriptor.
    ///
    /// The view stays valid only while the descriptor is open.
    pub fn as_borrowed(&self) -> PipeSocket {
        PipeSocket::from_raw_fd(self.fd)
    }

    /// Force the descriptor into non-blocking mode.
    pub fn set_nonblock(&self) -> io::Result<()> {
        // SAFETY: `fd` is an open descriptor; F_GETFL/F_SETFL do not touch
        // caller memory.
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK != 0 {
            return Ok(());
        }
        // SAFETY: see above.
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive into `buf` without consuming from the socket.
    pub fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is a valid writable region of the given length and
        // `fd` is an open socket descriptor.
        let n = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                libc::MSG_PEEK,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Receive and consume into `buf`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: as in `peek`.
        let n = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Scatter-receive into `bufs` with a single `readv`.
    pub fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        // SAFETY: `IoSliceMut` is ABI-compatible with `iovec`, the slice
        // outlives the call, and `fd` is an open descriptor.
        let n = unsafe {
            libc::readv(
                self.fd,
                bufs.as_mut_ptr().cast::<libc::iovec>(),
                bufs.len() as libc::c_int,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Gather-send `bufs` with a single `writev`.
    pub fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        // SAFETY: `IoSlice` is ABI-compatible with `iovec`, the slice
        // outlives the call, and `fd` is an open descriptor.
        let n = unsafe {
            libc::writev(
                self.fd,
                bufs.as_ptr().cast::<libc::iovec>(),
                bufs.len() as libc::c_int,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Gather-send the whole vector, waiting for writability as needed.
    pub fn writev_sync(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut written = 0usize;
        while written < total {
            match self.writev_from(bufs, written) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(err) => match write_verdict(&err) {
                    WriteVerdict::Wait => {
                        self.wait_writable()?;
                    }
                    _ => return Err(err),
                },
            }
        }
        Ok(total)
    }

    /// Block until the socket is readable or `timeout_ms` elapses.
    ///
    /// Returns `false` on timeout. A negative timeout waits indefinitely.
    pub fn wait_readable(&self, timeout_ms: i32) -> io::Result<bool> {
        self.poll_for(libc::POLLIN, timeout_ms)
    }

    fn wait_writable(&self) -> io::Result<()> {
        self.poll_for(libc::POLLOUT, -1).map(|_| ())
    }

    fn poll_for(&self, events: libc::c_short, timeout_ms: i32) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        };
        loop {
            // SAFETY: `pfd` is a valid pollfd for the duration of the call.
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0);
        }
    }

    /// Resume a gather-send at byte offset `skip` into the flattened vector.
    fn writev_from(&self, bufs: &[IoSlice<'_>], skip: usize) -> io::Result<usize> {
        if skip == 0 {
            return self.writev(bufs);
        }
        let mut remaining = skip;
        let mut iov: Vec<libc::iovec> = Vec::with_capacity(bufs.len());
        for buf in bufs {
            if remaining >= buf.len() {
                remaining -= buf.len();
                continue;
            }
            iov.push(libc::iovec {
                iov_base: buf[remaining..].as_ptr() as *mut libc::c_void,
                iov_len: buf.len() - remaining,
            });
            remaining = 0;
        }
        if iov.is_empty() {
            return Ok(0);
        }
        // SAFETY: every iovec points into a live `IoSlice` borrowed for the
        // duration of the call.
        let n = unsafe { libc::writev(self.fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Drop for PipeSocket {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            // SAFETY: `fd` is owned by this wrapper and closed exactly once.
            unsafe { libc::close(self.fd) };
        }
    }
}

impl BusSocket for PipeSocket {
    fn fd(&self) -> RawFd {
        PipeSocket::fd(self)
    }

    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        PipeSocket::peek(self, buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        PipeSocket::recv(self, buf)
    }

    fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        PipeSocket::recv_vectored(self, bufs)
    }

    fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        PipeSocket::writev(self, bufs)
    }

    fn writev_sync(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        PipeSocket::writev_sync(self, bufs)
    }
}

/// Create a connected pair of non-blocking stream sockets.
pub fn stream_pair() -> io::Result<(PipeSocket, PipeSocket)> {
    socket_pair(libc::SOCK_STREAM)
}

/// Create a connected pair of non-blocking datagram sockets.
pub fn datagram_pair() -> io::Result<(PipeSocket, PipeSocket)> {
    socket_pair(libc::SOCK_DGRAM)
}

fn socket_pair(kind: libc::c_int) -> io::Result<(PipeSocket, PipeSocket)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid writable array of two descriptors.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, kind, 0, fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let left = PipeSocket {
        fd: fds[0],
        owned: true,
    };
    let right = PipeSocket {
        fd: fds[1],
        owned: true,
    };
    left.set_nonblock()?;
    right.set_nonblock()?;
    Ok((left, right))
}
