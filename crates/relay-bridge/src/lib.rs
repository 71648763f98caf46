//! Multiplexer tying local SOCKS TCP clients to pipe-side `link_id`s.
//!
//! Owns a [`ProtoClient`] (pipe transport) and a [`TcpReactor`] (local SOCKS
//! listener). Data flows both ways are opaque byte copies; this crate only
//! ever interprets the packet *envelope* (opcode, uid, link_id), never the
//! SOCKS payload itself.

mod link;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use relay_net::tcp::{PollEvent, ReactorHandle, SendBehavior, TcpReactor, Token};
use relay_proto::{Packet, Status};
use relay_transport::{PipeOpener, ProtoClient, ProtoObserver};

use link::LinkTable;

/// Idle backoff between `poll_with` calls when nothing happened, to avoid
/// spinning the reactor thread at 100% CPU.
const IDLE_POLL_BACKOFF: std::time::Duration = std::time::Duration::from_millis(1);

pub struct Bridge {
    proto: Arc<ProtoClient>,
    /// Only ever locked by the thread calling [`Bridge::pump`]; cross-thread
    /// writes go through `reactor_handle` instead so they never wait behind
    /// the reactor's blocking poll.
    reactor: Mutex<TcpReactor>,
    reactor_handle: ReactorHandle,
    links: Mutex<LinkTable>,
    shutdown: Mutex<bool>,
}

impl Bridge {
    /// Connects the pipe transport and binds all `socks_bind_addrs`. Pipe
    /// connection and TCP accepts both proceed independently of each
    /// other and of this call returning. `keep_alive` of `None` disables
    /// the keep-alive ping.
    pub fn start(
        opener: Box<dyn PipeOpener>,
        read_pipe_name: impl Into<String>,
        write_pipe_name: impl Into<String>,
        socks_bind_addrs: &[SocketAddr],
        keep_alive: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| {
            let proto_observer: Arc<dyn ProtoObserver> = Arc::new(ProtoBridge(weak_self.clone()));
            let proto =
                ProtoClient::connect(opener, read_pipe_name, write_pipe_name, proto_observer, keep_alive);

            let mut reactor = TcpReactor::new();
            for addr in socks_bind_addrs {
                if reactor.listen_at(*addr).is_none() {
                    tracing::error!(%addr, "failed to bind SOCKS relay listener");
                }
            }
            let reactor_handle = reactor.handle();

            Self {
                proto,
                reactor: Mutex::new(reactor),
                reactor_handle,
                links: Mutex::new(LinkTable::default()),
                shutdown: Mutex::new(false),
            }
        })
    }

    pub fn protoclient_connected(&self) -> bool {
        self.proto.is_connected()
    }

    /// Pumps TCP IO once. Call in a tight loop from the process' main
    /// thread; sleeps briefly when idle to avoid a busy spin.
    pub fn pump(&self) {
        let any = self.reactor.lock().unwrap().poll_with(|event| self.handle_tcp_event(event));
        if !any {
            std::thread::sleep(IDLE_POLL_BACKOFF);
        }
    }

    pub fn request_termination(&self) {
        *self.shutdown.lock().unwrap() = true;
        self.proto.request_termination();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().unwrap()
    }

    /// Waits for the pipe transport's worker threads to stop, polling with
    /// a 100ms tick until they're down or `timeout` elapses. The TCP
    /// reactor has no worker thread of its own to join — it's driven
    /// synchronously by whatever thread calls `pump`. May be called
    /// repeatedly; returns `false` on timeout.
    pub fn join(&self, timeout: Duration) -> bool {
        self.proto.join(timeout)
    }

    fn handle_tcp_event(&self, event: PollEvent<'_>) {
        match event {
            PollEvent::Accept { stream, peer_addr, .. } => {
                let link_id = self.links.lock().unwrap().register(stream);
                tracing::info!(%peer_addr, link_id, "accepted local SOCKS client");
            }
            PollEvent::Data { token, payload } => {
                let link_id = self.links.lock().unwrap().link_id_for_token(token);
                match link_id {
                    Some(link_id) => self.proto.send(&Packet::socks(link_id, payload.to_vec())),
                    None => tracing::warn!(
                        ?token,
                        "local SOCKS listener notified about an unregistered client; ignoring"
                    ),
                }
            }
            PollEvent::Disconnect { token } => {
                let link_id = self.links.lock().unwrap().unregister_by_token(token);
                if let Some(link_id) = link_id {
                    let packet = Packet::socks_disconnected(link_id);
                    self.links.lock().unwrap().mark_disconnect_pending(packet.uid());
                    self.proto.send(&packet);
                }
            }
        }
    }

    fn handle_proto_packet(&self, packet: &Packet) {
        match packet {
            Packet::ChannelSetup { .. } | Packet::ChannelSetupAck { .. } => {
                tracing::debug!(opcode = ?packet.opcode(), "weird, received a setup packet on an established channel");
            }
            Packet::Status { uid, status } => {
                if self.links.lock().unwrap().take_pending_disconnect(*uid) {
                    return;
                }
                tracing::info!(uid, ?status, "received unsolicited STATUS response");
            }
            Packet::Ping { uid } => {
                self.proto.send(&Packet::status(*uid, Status::Ok));
            }
            Packet::Socks { link_id, data, .. } => {
                let token = self.links.lock().unwrap().token_for_link_id(*link_id);
                match token {
                    Some(token) => {
                        self.reactor_handle.write_or_enqueue(SendBehavior::Single(token), data);
                    }
                    None => tracing::debug!(
                        link_id,
                        "server-side notified about an unregistered SOCKS link; ignoring"
                    ),
                }
            }
            Packet::SocksClose { link_id, .. } | Packet::SocksDisconnected { link_id, .. } => {
                let token = self.links.lock().unwrap().unregister_by_link_id(*link_id);
                if let Some(token) = token {
                    self.reactor_handle.disconnect(token);
                }
            }
            Packet::UninstallSelf { .. } => {
                tracing::debug!("weird, received an UNINSTALL_SELF packet from named pipe server");
            }
        }
    }
}

/// Bridges [`ProtoClient`]'s packet callbacks back into a [`Bridge`]
/// without creating an `Arc` reference cycle.
struct ProtoBridge(Weak<Bridge>);

impl ProtoObserver for ProtoBridge {
    fn on_connected(&self) {
        tracing::info!("pipe transport connected");
    }

    fn on_disconnected(&self) {
        tracing::warn!("pipe transport disconnected");
    }

    fn on_packet(&self, packet: &Packet) {
        if let Some(bridge) = self.0.upgrade() {
            bridge.handle_proto_packet(packet);
        }
    }
}
