use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use relay_proto::{ChannelSetupFlags, InputStream, Packet, UNASSIGNED_ID};

use crate::error::TransportError;
use crate::observer::PipeChannelObserver;
use crate::pipe::{PipeEndpoint, PipeIoError, PipeOpener};

/// Idle read timeout once a connection is established; also the polling
/// granularity for noticing a shutdown request.
const STEADY_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Timeout for a single write once connected. Generous: a stalled SMB
/// session should surface as a disconnect, not a silent stall.
const STEADY_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
/// How long the handshake (open both pipes, exchange setup/ack) may take
/// before the attempt is abandoned and retried.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Back-off between a detected disconnect and the next handshake attempt.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
/// Poll interval while waiting for a pipe instance to become available.
const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Deadline for a single pipe to appear before the handshake attempt fails.
const PIPE_OPEN_DEADLINE: Duration = Duration::from_secs(5);
/// Polling granularity for [`PipeChannel::join`].
const JOIN_POLL_TICK: Duration = Duration::from_millis(100);

/// A dual-pipe (read-only + write-only) transport to the remote relay
/// implant, with an automatic reconnect-on-failure handshake.
///
/// `PipeChannel` owns two worker threads: one pumping inbound bytes to
/// [`PipeChannelObserver::on_data`], one draining an outgoing queue to the
/// write pipe. Either thread can independently notice a disconnect; both
/// pipes are torn down together regardless of which side failed, and only
/// one thread at a time attempts the reconnect handshake.
pub struct PipeChannel {
    inner: Arc<Inner>,
    read_thread: Mutex<Option<JoinHandle<()>>>,
    write_thread: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    opener: Box<dyn PipeOpener>,
    read_pipe_name: String,
    write_pipe_name: String,
    /// Assigned by the remote side during the handshake; `UNASSIGNED_ID`
    /// until the first successful connect.
    client_id: Mutex<u64>,
    observer: Arc<dyn PipeChannelObserver>,

    pipe_read: Mutex<Option<Box<dyn PipeEndpoint>>>,
    pipe_write: Mutex<Option<Box<dyn PipeEndpoint>>>,
    reconnect_lock: Mutex<()>,
    connected: Mutex<bool>,

    outgoing: Mutex<VecDeque<Vec<u8>>>,
    outgoing_cv: Condvar,

    shutdown: Mutex<bool>,
}

impl PipeChannel {
    pub fn connect(
        opener: Box<dyn PipeOpener>,
        read_pipe_name: impl Into<String>,
        write_pipe_name: impl Into<String>,
        observer: Arc<dyn PipeChannelObserver>,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner {
            opener,
            read_pipe_name: read_pipe_name.into(),
            write_pipe_name: write_pipe_name.into(),
            client_id: Mutex::new(UNASSIGNED_ID),
            observer,
            pipe_read: Mutex::new(None),
            pipe_write: Mutex::new(None),
            reconnect_lock: Mutex::new(()),
            connected: Mutex::new(false),
            outgoing: Mutex::new(VecDeque::new()),
            outgoing_cv: Condvar::new(),
            shutdown: Mutex::new(false),
        });

        let read_inner = Arc::clone(&inner);
        let read_thread = std::thread::Builder::new()
            .name("pipe-read".to_string())
            .spawn(move || read_loop(read_inner))
            .expect("spawn pipe-read thread");

        let write_inner = Arc::clone(&inner);
        let write_thread = std::thread::Builder::new()
            .name("pipe-write".to_string())
            .spawn(move || write_loop(write_inner))
            .expect("spawn pipe-write thread");

        Arc::new(Self {
            inner,
            read_thread: Mutex::new(Some(read_thread)),
            write_thread: Mutex::new(Some(write_thread)),
        })
    }

    pub fn client_id(&self) -> u64 {
        *self.inner.client_id.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.lock().unwrap()
    }

    /// Queues raw bytes for the write thread. Non-blocking; bytes are
    /// dropped only once the channel is shut down.
    pub fn send(&self, data: Vec<u8>) {
        let mut queue = self.inner.outgoing.lock().unwrap();
        queue.push_back(data);
        self.inner.outgoing_cv.notify_one();
    }

    /// Tears down the current connection without shutting the channel
    /// down; the worker threads will run the reconnect handshake again.
    pub fn force_reconnect(&self) {
        self.inner.disconnect();
    }

    pub fn request_termination(&self) {
        *self.inner.shutdown.lock().unwrap() = true;
        self.inner.outgoing_cv.notify_all();
        self.inner.disconnect();
    }

    /// Waits for both worker threads to stop, polling with a 100ms tick
    /// until both are down or `timeout` elapses. May be called repeatedly;
    /// threads already reaped by a prior call are treated as already down.
    /// Returns `false` on timeout.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.threads_finished() {
                self.reap_threads();
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(JOIN_POLL_TICK);
        }
    }

    fn threads_finished(&self) -> bool {
        let read_done =
            self.read_thread.lock().unwrap().as_ref().is_none_or(JoinHandle::is_finished);
        let write_done =
            self.write_thread.lock().unwrap().as_ref().is_none_or(JoinHandle::is_finished);
        read_done && write_done
    }

    fn reap_threads(&self) {
        if let Some(handle) = self.read_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.write_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Inner {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().unwrap()
    }

    /// Closes both pipes and flips to the disconnected state. Idempotent
    /// and safe to call from either worker thread.
    fn disconnect(&self) {
        let was_connected = {
            let mut connected = self.connected.lock().unwrap();
            std::mem::replace(&mut *connected, false)
        };
        if let Some(mut pipe) = self.pipe_read.lock().unwrap().take() {
            pipe.close();
        }
        if let Some(mut pipe) = self.pipe_write.lock().unwrap().take() {
            pipe.close();
        }
        if was_connected {
            self.observer.on_disconnected();
        }
    }

    /// Attempts the full reconnect handshake. Returns once connected, once
    /// `is_shutdown()`, or on a best-effort basis gives up an attempt and
    /// lets the caller retry after `RECONNECT_BACKOFF`.
    ///
    /// Only one thread performs the handshake at a time: a thread that
    /// cannot acquire `reconnect_lock` assumes another thread is already
    /// reconnecting and simply waits.
    fn reconnect_once(&self) -> bool {
        let _guard = match self.reconnect_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                std::thread::sleep(RECONNECT_BACKOFF);
                return self.is_connected_snapshot();
            }
        };

        if self.is_connected_snapshot() {
            return true;
        }

        match self.try_handshake() {
            Ok(()) => {
                *self.connected.lock().unwrap() = true;
                self.observer.on_connected();
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "handshake attempt failed");
                std::thread::sleep(RECONNECT_BACKOFF);
                false
            }
        }
    }

    fn is_connected_snapshot(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    /// Sets up the read pipe first, requesting a fresh `client_id` from the
    /// remote side (sent as `UNASSIGNED_ID`); the write pipe's setup then
    /// asserts ownership of that same `client_id`. The two pipes are never
    /// set up with a single combined flag: each establishes only the
    /// direction it will actually carry.
    fn try_handshake(&self) -> Result<(), TransportError> {
        let mut read_pipe = open_with_deadline(&*self.opener, &self.read_pipe_name)?;
        let client_id = setup_channel(&mut *read_pipe, UNASSIGNED_ID, ChannelSetupFlags::READ)?;

        let mut write_pipe = open_with_deadline(&*self.opener, &self.write_pipe_name)?;
        setup_channel(&mut *write_pipe, client_id, ChannelSetupFlags::WRITE)?;

        *self.client_id.lock().unwrap() = client_id;
        *self.pipe_read.lock().unwrap() = Some(read_pipe);
        *self.pipe_write.lock().unwrap() = Some(write_pipe);
        Ok(())
    }
}

fn open_with_deadline(
    opener: &dyn PipeOpener,
    name: &str,
) -> Result<Box<dyn PipeEndpoint>, TransportError> {
    let deadline = Instant::now() + PIPE_OPEN_DEADLINE;
    loop {
        match opener.open(name) {
            Ok(pipe) => return Ok(pipe),
            Err(PipeIoError::Io(_)) | Err(PipeIoError::Closed) if Instant::now() < deadline => {
                std::thread::sleep(PIPE_POLL_INTERVAL);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Sends a `ChannelSetup` for one pipe direction and waits for its ack.
///
/// `client_id` is `UNASSIGNED_ID` to request a fresh one (read pipe, first
/// in the sequence) or the previously assigned id to bind the write pipe to
/// the same logical client. Returns the `client_id` the remote side echoed
/// back, which must match what we sent whenever we sent a nonzero one.
fn setup_channel(
    pipe: &mut dyn PipeEndpoint,
    client_id: u64,
    flags: ChannelSetupFlags,
) -> Result<u64, TransportError> {
    let setup = Packet::channel_setup(client_id, flags);
    pipe.write(&setup.encode(), HANDSHAKE_TIMEOUT)?;

    let ack = read_handshake_packet(pipe, HANDSHAKE_TIMEOUT)?;
    match ack {
        Packet::ChannelSetupAck { client_id: acked, .. }
            if client_id == UNASSIGNED_ID || acked == client_id =>
        {
            Ok(acked)
        }
        _ => Err(TransportError::HandshakeMismatch),
    }
}

fn read_handshake_packet(
    pipe: &mut dyn PipeEndpoint,
    overall_timeout: Duration,
) -> Result<Packet, TransportError> {
    let stream = InputStream::new();
    let deadline = Instant::now() + overall_timeout;

    loop {
        if let Some(packet) = stream.flush_next_packet()? {
            return Ok(packet);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::HandshakeTimeout);
        }
        let chunk = pipe.read(remaining)?;
        if chunk.is_empty() {
            return Err(TransportError::Closed);
        }
        stream.feed(&chunk);
    }
}

fn read_loop(inner: Arc<Inner>) {
    while !inner.is_shutdown() {
        if !inner.is_connected_snapshot() {
            inner.reconnect_once();
            continue;
        }

        let result = {
            let mut guard = inner.pipe_read.lock().unwrap();
            match guard.as_deref_mut() {
                Some(pipe) => pipe.read(STEADY_READ_TIMEOUT),
                None => continue,
            }
        };

        match result {
            Ok(data) if data.is_empty() => {
                tracing::info!("read pipe reported eof");
                inner.disconnect();
            }
            Ok(data) => inner.observer.on_data(&data),
            Err(PipeIoError::Timeout) => {}
            Err(err) => {
                tracing::warn!(error = %err, "read pipe failed");
                inner.disconnect();
            }
        }
    }
}

fn write_loop(inner: Arc<Inner>) {
    while !inner.is_shutdown() {
        if !inner.is_connected_snapshot() {
            // The read thread owns reconnect attempts too; either side can
            // win the race via `reconnect_lock`.
            inner.reconnect_once();
            continue;
        }

        let next = {
            let mut queue = inner.outgoing.lock().unwrap();
            while queue.is_empty() && !inner.is_shutdown() {
                let (guard, timeout_result) =
                    inner.outgoing_cv.wait_timeout(queue, STEADY_READ_TIMEOUT).unwrap();
                queue = guard;
                if timeout_result.timed_out() {
                    break;
                }
            }
            queue.pop_front()
        };

        let Some(data) = next else {
            continue;
        };

        let result = {
            let mut guard = inner.pipe_write.lock().unwrap();
            match guard.as_deref_mut() {
                Some(pipe) => pipe.write(&data, STEADY_WRITE_TIMEOUT),
                None => {
                    inner.outgoing.lock().unwrap().push_front(data);
                    continue;
                }
            }
        };

        if let Err(err) = result {
            tracing::warn!(error = %err, "write pipe failed");
            inner.outgoing.lock().unwrap().push_front(data);
            inner.disconnect();
        }
    }
}
