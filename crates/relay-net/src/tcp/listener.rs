use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::{Events, Interest, Poll, Registry, Token, Waker, event::Event, net::TcpListener};
use tracing::{debug, error, warn};

use crate::tcp::stream::{ConnState, TcpStream};

/// The reactor blocks in `poll` for up to this long when idle.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Reserved token for the wakeup event source; never assigned to a real
/// connection since `next_token` starts at zero and only grows.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Where a `write_or_enqueue` call should deliver its bytes.
#[derive(Clone, Copy, Debug)]
pub enum SendBehavior {
    Broadcast,
    Single(Token),
}

enum Connection {
    /// A local SOCKS client accepted from one of our listeners.
    Inbound(TcpStream),
    /// A bound, listening socket. Never carries data itself.
    Listener(TcpListener),
}

/// Event emitted by [`TcpReactor::poll_with`] for one notable IO occurrence.
pub enum PollEvent<'a> {
    /// A new local client connected.
    Accept { listener: Token, stream: Token, peer_addr: SocketAddr },
    /// A connection was closed, by the peer or due to an IO error.
    Disconnect { token: Token },
    /// Raw bytes were read from a connection. No framing: this may be a
    /// partial SOCKS message, several concatenated ones, or anything in
    /// between.
    Data { token: Token, payload: &'a [u8] },
}

/// Connection table. Locked only to mutate it; never held across the
/// reactor's blocking `poll` call, since `Registry` (unlike `Poll` itself)
/// is safe to use concurrently with a poll in progress on another thread.
#[derive(Default)]
struct ConnTable {
    conns: Vec<(Token, Connection)>,
    next_token: usize,
}

impl ConnTable {
    fn listen_at(&mut self, addr: SocketAddr, registry: &Registry) -> Option<Token> {
        let mut listener = TcpListener::bind(addr)
            .inspect_err(|e| warn!("couldn't start listening at {addr}: {e}"))
            .ok()?;
        let token = Token(self.next_token);
        registry
            .register(&mut listener, token, Interest::READABLE)
            .inspect_err(|err| warn!("couldn't register listening addr {addr}: {err}"))
            .ok()?;
        self.conns.push((token, Connection::Listener(listener)));
        self.next_token += 1;
        Some(token)
    }

    fn disconnect_at_index(&mut self, index: usize, registry: &Registry) {
        let (_token, conn) = self.conns.swap_remove(index);
        match conn {
            Connection::Inbound(mut stream) => {
                let _ = stream.close(registry);
            }
            Connection::Listener(mut listener) => {
                let _ = registry.deregister(&mut listener);
            }
        }
    }

    fn disconnect_token(&mut self, token: Token, registry: &Registry) {
        if let Some(i) = self.conns.iter().position(|(t, _)| *t == token) {
            self.disconnect_at_index(i, registry);
        }
    }

    /// Returns whether this call armed a backlog that was previously empty,
    /// i.e. whether the reactor's blocking poll should be woken early.
    #[inline]
    fn write_or_enqueue(&mut self, registry: &Registry, where_to: SendBehavior, data: &[u8]) -> bool {
        let mut should_wake = false;
        match where_to {
            SendBehavior::Broadcast => {
                let mut i = self.conns.len();
                while i != 0 {
                    i -= 1;
                    if let Connection::Inbound(stream) = &mut self.conns[i].1 {
                        let was_empty = !stream.has_backlog();
                        if stream.write_or_enqueue(registry, data) == ConnState::Disconnected {
                            self.disconnect_at_index(i, registry);
                        } else if was_empty && stream.has_backlog() {
                            should_wake = true;
                        }
                    }
                }
            }
            SendBehavior::Single(token) => {
                let Some(i) = self.conns.iter().position(|(t, _)| *t == token) else {
                    warn!(?token, "tcp sending: unknown token");
                    return false;
                };
                match &mut self.conns[i].1 {
                    Connection::Inbound(stream) => {
                        let was_empty = !stream.has_backlog();
                        if stream.write_or_enqueue(registry, data) == ConnState::Disconnected {
                            self.disconnect_at_index(i, registry);
                        } else if was_empty && stream.has_backlog() {
                            should_wake = true;
                        }
                    }
                    Connection::Listener(_) => {
                        error!(?token, "cannot write to a listener token");
                    }
                }
            }
        }
        should_wake
    }

    #[inline]
    fn handle_event<F>(&mut self, e: &Event, registry: &Registry, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let event_token = e.token();
        let Some(i) = self.conns.iter().position(|(t, _)| t == &event_token) else {
            debug!(?event_token, "got event for unknown token");
            return;
        };

        match &mut self.conns[i].1 {
            Connection::Inbound(stream) => {
                if stream.poll_with(registry, e, &mut |token, payload| {
                    handler(PollEvent::Data { token, payload });
                }) == ConnState::Disconnected
                {
                    handler(PollEvent::Disconnect { token: event_token });
                    self.disconnect_at_index(i, registry);
                }
            }
            Connection::Listener(listener) => loop {
                match listener.accept() {
                    Ok((mut stream, addr)) => {
                        let token = Token(self.next_token);
                        if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
                            error!("couldn't register client {e}");
                            let _ = stream.shutdown(std::net::Shutdown::Both);
                            continue;
                        }
                        let Ok(conn) = TcpStream::from_stream(stream, token, addr) else {
                            continue;
                        };
                        self.conns.push((token, Connection::Inbound(conn)));
                        self.next_token += 1;
                        handler(PollEvent::Accept {
                            listener: event_token,
                            stream: token,
                            peer_addr: addr,
                        });
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        warn!(?err, "accept failed");
                        return;
                    }
                }
            },
        }
    }

    /// Revisits connections a capped read round left with data still
    /// buffered. Returns whether anything was forwarded.
    fn drain_pending_reads<F>(&mut self, registry: &Registry, handler: &mut F) -> bool
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let mut any = false;
        let mut i = self.conns.len();
        while i != 0 {
            i -= 1;
            let token = self.conns[i].0;
            let disconnected = match &mut self.conns[i].1 {
                Connection::Inbound(stream) if stream.has_pending_read() => {
                    any = true;
                    stream.drain_reads(&mut |t, payload| handler(PollEvent::Data { token: t, payload }))
                        == ConnState::Disconnected
                }
                _ => false,
            };
            if disconnected {
                handler(PollEvent::Disconnect { token });
                self.disconnect_at_index(i, registry);
            }
        }
        any
    }

    fn has_pending_reads(&self) -> bool {
        self.conns.iter().any(|(_, c)| matches!(c, Connection::Inbound(s) if s.has_pending_read()))
    }
}

/// Cheap, `Send + Sync` handle for enqueuing writes or forcing a disconnect
/// from a thread other than the one driving [`TcpReactor::poll_with`].
/// Never touches the reactor's `Poll`, so it can't block behind (or on) the
/// blocking poll call in progress on another thread.
#[derive(Clone)]
pub struct ReactorHandle {
    registry: Registry,
    table: Arc<Mutex<ConnTable>>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    pub fn write_or_enqueue(&self, where_to: SendBehavior, data: &[u8]) {
        let should_wake = self.table.lock().unwrap().write_or_enqueue(&self.registry, where_to, data);
        if should_wake {
            let _ = self.waker.wake();
        }
    }

    pub fn disconnect(&self, token: Token) {
        self.table.lock().unwrap().disconnect_token(token, &self.registry);
    }
}

/// Single-threaded TCP reactor built on `mio`.
///
/// Only accepts connections: local SOCKS clients connect in, nothing here
/// ever dials out. Drive all IO by calling [`poll_with`] in a tight loop.
/// Each call blocks up to one second when idle; a [`ReactorHandle`] can
/// wake it early once a write becomes pending.
pub struct TcpReactor {
    poll: Poll,
    events: Events,
    registry: Registry,
    waker: Arc<Waker>,
    table: Arc<Mutex<ConnTable>>,
}

impl Default for TcpReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpReactor {
    pub fn new() -> Self {
        let poll = Poll::new().expect("couldn't set up a poll for tcp reactor");
        let registry = poll.registry().try_clone().expect("couldn't clone tcp reactor registry");
        let waker = Arc::new(
            Waker::new(&registry, WAKE_TOKEN).expect("couldn't set up tcp reactor wakeup source"),
        );
        Self {
            poll,
            events: Events::with_capacity(128),
            registry,
            waker,
            table: Arc::new(Mutex::new(ConnTable::default())),
        }
    }

    /// A cloneable handle other threads can use to enqueue writes or force
    /// a disconnect without touching this reactor's `Poll` directly.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            registry: self.registry.clone(),
            table: Arc::clone(&self.table),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Starts listening on `addr`. Returns the token assigned to the
    /// listener, used to identify it in [`PollEvent::Accept`].
    pub fn listen_at(&mut self, addr: SocketAddr) -> Option<Token> {
        self.table.lock().unwrap().listen_at(addr, &self.registry)
    }

    /// Polls sockets, blocking up to one second unless a [`ReactorHandle`]
    /// wakes it early or a read round already left data pending, and
    /// dispatches events via `handler`. Returns whether any IO event was
    /// processed.
    #[inline]
    pub fn poll_with<F>(&mut self, mut handler: F) -> bool
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let timeout =
            if self.table.lock().unwrap().has_pending_reads() { Duration::ZERO } else { POLL_TIMEOUT };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            error!("got error polling: {e}");
            return false;
        }

        let mut any = false;
        let mut table = self.table.lock().unwrap();
        for e in self.events.iter() {
            if e.token() == WAKE_TOKEN {
                continue;
            }
            any = true;
            table.handle_event(e, &self.registry, &mut handler);
        }
        if table.drain_pending_reads(&self.registry, &mut handler) {
            any = true;
        }
        any
    }

    /// Writes immediately or enqueues bytes for later sending.
    #[inline]
    pub fn write_or_enqueue(&mut self, where_to: SendBehavior, data: &[u8]) {
        let should_wake = self.table.lock().unwrap().write_or_enqueue(&self.registry, where_to, data);
        if should_wake {
            let _ = self.waker.wake();
        }
    }

    /// Disconnects a specific client by token. No-op if the token is
    /// unknown or names a listener.
    pub fn disconnect(&mut self, token: Token) {
        self.table.lock().unwrap().disconnect_token(token, &self.registry);
    }
}
