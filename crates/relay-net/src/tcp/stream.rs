use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

/// Read buffer for a single non-blocking read. Unlike a length-prefixed
/// protocol there is no frame boundary to wait for: every readable byte is
/// handed straight to the caller.
const RX_BUF_SIZE: usize = 16 * 1024;

/// Cap on `read()` calls drained per wakeup, so one busy connection can't
/// starve the others sharing this reactor tick.
const MAX_READ_PASSES_PER_WAKEUP: u8 = 2;

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable. `Disconnected` means the
/// peer is gone (or the socket errored) and the caller must drop its state
/// for this connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

enum ReadOutcome<'a> {
    Data(&'a [u8]),
    WouldBlock,
    Disconnected,
}

/// A single mio-backed, unframed TCP connection.
///
/// Local SOCKS clients exchange opaque bytes with the remote proxy; this
/// type never looks inside them. It only tracks enough state to pump bytes
/// in both directions without blocking the reactor thread.
pub struct TcpStream {
    stream: mio::net::TcpStream,
    token: Token,
    peer_addr: SocketAddr,

    rx_buf: Vec<u8>,
    /// Queued writes that didn't fit in a single non-blocking `write` call.
    send_backlog: VecDeque<Vec<u8>>,
    /// Invariant: `writable_armed == !send_backlog.is_empty()`.
    writable_armed: bool,
    /// Set when a capped read round stopped with more data still sitting in
    /// the kernel buffer. mio's readiness notifications are edge-triggered,
    /// so nothing will tell us to come back for it; the reactor has to
    /// revisit this connection on its own next tick instead.
    read_pending: bool,
}

impl TcpStream {
    pub(crate) fn from_stream(
        stream: mio::net::TcpStream,
        token: Token,
        peer_addr: SocketAddr,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            token,
            peer_addr,
            rx_buf: vec![0; RX_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(8),
            writable_armed: false,
            read_pending: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Polls this stream and calls `on_data` with every chunk read this
    /// round. Returns [`ConnState::Disconnected`] on EOF or IO error.
    #[inline]
    pub fn poll_with<F>(&mut self, registry: &Registry, ev: &Event, on_data: &mut F) -> ConnState
    where
        F: for<'a> FnMut(Token, &'a [u8]),
    {
        if ev.is_readable() && self.drain_reads(on_data) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        if ev.is_writable() && self.drain_backlog(registry) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Reads up to [`MAX_READ_PASSES_PER_WAKEUP`] chunks, the second (and
    /// any later) pass gated by a cheap zero-timeout readability probe
    /// instead of looping until `WouldBlock`. Leaves `read_pending` set if
    /// the probe still finds data waiting once the cap is hit.
    pub(crate) fn drain_reads<F>(&mut self, on_data: &mut F) -> ConnState
    where
        F: for<'a> FnMut(Token, &'a [u8]),
    {
        self.read_pending = false;
        for pass in 0..MAX_READ_PASSES_PER_WAKEUP {
            match self.read_chunk() {
                ReadOutcome::Data(chunk) => on_data(self.token, chunk),
                ReadOutcome::WouldBlock => return ConnState::Alive,
                ReadOutcome::Disconnected => return ConnState::Disconnected,
            }
            if pass + 1 < MAX_READ_PASSES_PER_WAKEUP && !self.readable_now() {
                return ConnState::Alive;
            }
        }
        self.read_pending = self.readable_now();
        ConnState::Alive
    }

    pub(crate) fn has_pending_read(&self) -> bool {
        self.read_pending
    }

    pub(crate) fn has_backlog(&self) -> bool {
        !self.send_backlog.is_empty()
    }

    #[cfg(unix)]
    fn readable_now(&self) -> bool {
        use std::os::unix::io::AsRawFd;

        let mut pfd =
            libc::pollfd { fd: self.stream.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        rc > 0 && (pfd.revents & libc::POLLIN) != 0
    }

    /// No cheap zero-timeout probe on this platform; treat the connection as
    /// still readable so the caller keeps draining rather than risk leaving
    /// bytes stranded behind an edge-triggered notification.
    #[cfg(not(unix))]
    fn readable_now(&self) -> bool {
        true
    }

    /// Writes `data` immediately if possible, otherwise queues the
    /// unwritten remainder to flush on the next writable event.
    #[inline]
    pub fn write_or_enqueue(&mut self, registry: &Registry, data: &[u8]) -> ConnState {
        if data.is_empty() {
            return ConnState::Alive;
        }

        if !self.send_backlog.is_empty() {
            return self.enqueue_back(registry, data.to_vec());
        }

        match self.stream.write(data) {
            Ok(0) => {
                warn!("tcp: stream failed to write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == data.len() => ConnState::Alive,
            Ok(n) => self.enqueue_back(registry, data[n..].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, data.to_vec())
            }
            Err(err) => {
                warn!(?err, "tcp: stream write fail");
                ConnState::Disconnected
            }
        }
    }

    #[inline]
    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "tcp: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    #[inline]
    fn read_chunk(&mut self) -> ReadOutcome<'_> {
        match self.stream.read(&mut self.rx_buf) {
            Ok(0) => ReadOutcome::Disconnected,
            Ok(n) => ReadOutcome::Data(&self.rx_buf[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(err) => {
                debug!(?err, "tcp: read");
                ReadOutcome::Disconnected
            }
        }
    }

    #[inline]
    fn enqueue_back(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    #[inline]
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: poll reregister");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!(peer = %self.peer_addr, "closing tcp stream");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer_addr
    }
}
