use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use relay_proto::{Packet, generate_uid};

use crate::channel::PipeChannel;
use crate::observer::{PipeChannelObserver, ProtoObserver};
use crate::pipe::PipeOpener;

/// An outstanding ping older than this is considered lost; it is dropped
/// from the tracking table rather than retried indefinitely.
const KEEPALIVE_EXPIRY: Duration = Duration::from_secs(30);
/// Polling granularity for [`ProtoClient::join`].
const JOIN_POLL_TICK: Duration = Duration::from_millis(100);

/// Sits on top of a [`PipeChannel`], turning its raw byte stream into typed
/// packets and back, and maintaining a keep-alive ping table.
///
/// This is the layer the bridge multiplexer talks to: it never sees pipe
/// handles or byte framing, only [`Packet`] values via [`ProtoObserver`].
pub struct ProtoClient {
    channel: Arc<PipeChannel>,
    input: relay_proto::InputStream,
    observer: Arc<dyn ProtoObserver>,
    keepalive: Mutex<HashMap<u32, Instant>>,
    keepalive_interval: Option<Duration>,
    /// Set whenever a packet is received, cleared once the input stream has
    /// no more decodable packets buffered. The keep-alive loop skips a
    /// scheduled ping while this is set: a connection that's actively
    /// talking doesn't need a liveness probe.
    recv_pending: AtomicBool,
    shutdown: Mutex<bool>,
    keepalive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProtoClient {
    /// `keep_alive` of `None` disables the keep-alive ping entirely, mirroring
    /// the original CLI's `proto_keep_alive=None` default.
    pub fn connect(
        opener: Box<dyn PipeOpener>,
        read_pipe_name: impl Into<String>,
        write_pipe_name: impl Into<String>,
        observer: Arc<dyn ProtoObserver>,
        keep_alive: Option<Duration>,
    ) -> Arc<Self> {
        let read_pipe_name = read_pipe_name.into();
        let write_pipe_name = write_pipe_name.into();

        let client = Arc::new_cyclic(|weak_self| {
            let bridge: Arc<dyn PipeChannelObserver> = Arc::new(ChannelBridge(weak_self.clone()));
            let channel = PipeChannel::connect(opener, read_pipe_name, write_pipe_name, bridge);
            Self {
                channel,
                input: relay_proto::InputStream::new(),
                observer,
                keepalive: Mutex::new(HashMap::new()),
                keepalive_interval: keep_alive,
                recv_pending: AtomicBool::new(false),
                shutdown: Mutex::new(false),
                keepalive_thread: Mutex::new(None),
            }
        });

        let keepalive_client = Arc::clone(&client);
        let handle = std::thread::Builder::new()
            .name("proto-keepalive".to_string())
            .spawn(move || keepalive_loop(keepalive_client))
            .expect("spawn proto-keepalive thread");
        *client.keepalive_thread.lock().unwrap() = Some(handle);

        client
    }

    pub fn client_id(&self) -> u64 {
        self.channel.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn send(&self, packet: &Packet) {
        self.channel.send(packet.encode());
    }

    pub fn request_termination(&self) {
        *self.shutdown.lock().unwrap() = true;
        self.channel.request_termination();
    }

    /// Waits for the channel's worker threads and the keep-alive thread to
    /// stop, polling with a 100ms tick until both are down or `timeout`
    /// elapses. May be called repeatedly. Returns `false` on timeout.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.channel.join(timeout) {
            return false;
        }
        self.join_keepalive(deadline.saturating_duration_since(Instant::now()))
    }

    fn join_keepalive(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let done =
                self.keepalive_thread.lock().unwrap().as_ref().is_none_or(JoinHandle::is_finished);
            if done {
                if let Some(handle) = self.keepalive_thread.lock().unwrap().take() {
                    let _ = handle.join();
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(JOIN_POLL_TICK);
        }
    }

    fn handle_connected(&self) {
        self.observer.on_connected();
    }

    fn handle_disconnected(&self) {
        self.input.clear();
        self.keepalive.lock().unwrap().clear();
        self.observer.on_disconnected();
    }

    fn handle_data(&self, data: &[u8]) {
        self.recv_pending.store(true, Ordering::Relaxed);
        self.input.feed(data);
        loop {
            match self.input.flush_next_packet() {
                Ok(Some(packet)) => self.dispatch(packet),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping corrupt packet stream, forcing reconnect");
                    self.input.clear();
                    self.channel.force_reconnect();
                    break;
                }
            }
        }
        self.recv_pending.store(false, Ordering::Relaxed);
    }

    fn dispatch(&self, packet: Packet) {
        if let Packet::Status { uid, .. } = &packet {
            self.keepalive.lock().unwrap().remove(uid);
        }
        self.observer.on_packet(&packet);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().unwrap()
    }
}

/// Bridges [`PipeChannel`]'s byte-level callbacks back into a [`ProtoClient`]
/// without creating an `Arc` reference cycle.
struct ChannelBridge(Weak<ProtoClient>);

impl PipeChannelObserver for ChannelBridge {
    fn on_connected(&self) {
        if let Some(client) = self.0.upgrade() {
            client.handle_connected();
        }
    }

    fn on_disconnected(&self) {
        if let Some(client) = self.0.upgrade() {
            client.handle_disconnected();
        }
    }

    fn on_data(&self, data: &[u8]) {
        if let Some(client) = self.0.upgrade() {
            client.handle_data(data);
        }
    }
}

fn keepalive_loop(client: Arc<ProtoClient>) {
    const TICK: Duration = Duration::from_millis(500);

    let Some(interval) = client.keepalive_interval else {
        return;
    };

    while !client.is_shutdown() {
        let mut waited = Duration::ZERO;
        while waited < interval {
            if client.is_shutdown() {
                return;
            }
            std::thread::sleep(TICK);
            waited += TICK;
        }
        if !client.is_connected() {
            continue;
        }
        if client.recv_pending.load(Ordering::Relaxed) {
            // A packet arrived since the last tick; the link is
            // demonstrably alive, so skip this round's ping.
            continue;
        }

        let uid = {
            let mut table = client.keepalive.lock().unwrap();
            let now = Instant::now();
            table.retain(|uid, sent_at| {
                let alive = now.duration_since(*sent_at) < KEEPALIVE_EXPIRY;
                if !alive {
                    tracing::warn!(uid, "keep-alive ping never acknowledged, dropping");
                }
                alive
            });

            let mut uid = generate_uid();
            while table.contains_key(&uid) {
                uid = generate_uid();
            }
            table.insert(uid, now);
            uid
        };

        client.send(&Packet::ping_with_uid(uid));
    }
}
