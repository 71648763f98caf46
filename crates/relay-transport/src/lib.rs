//! Named-pipe transport for the relay: a dual-pipe handshake/reconnect
//! channel ([`channel::PipeChannel`]) with a packet-aware client on top
//! ([`client::ProtoClient`]) that maintains a keep-alive ping table.

mod channel;
mod client;
mod error;
mod observer;
mod pipe;

pub use channel::PipeChannel;
pub use client::ProtoClient;
pub use error::TransportError;
pub use observer::{PipeChannelObserver, ProtoObserver};
pub use pipe::{PipeEndpoint, PipeIoError, PipeOpener};

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use relay_proto::{ChannelSetupFlags, Packet, Status};

    use super::*;

    /// A pair of loopback pipes wired directly to each other's peer queue,
    /// standing in for the real SMB-backed named pipes in tests.
    struct LoopbackEndpoint {
        inbox: Arc<Mutex<VecDeque<u8>>>,
        outbox: Arc<Mutex<VecDeque<u8>>>,
        closed: bool,
    }

    impl PipeEndpoint for LoopbackEndpoint {
        fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, PipeIoError> {
            if self.closed {
                return Err(PipeIoError::Closed);
            }
            let deadline = std::time::Instant::now() + timeout;
            loop {
                {
                    let mut inbox = self.inbox.lock().unwrap();
                    if !inbox.is_empty() {
                        return Ok(inbox.drain(..).collect());
                    }
                }
                if std::time::Instant::now() >= deadline {
                    return Err(PipeIoError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<(), PipeIoError> {
            if self.closed {
                return Err(PipeIoError::Closed);
            }
            self.outbox.lock().unwrap().extend(data.iter().copied());
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    struct LoopbackOpener {
        client_to_server: Arc<Mutex<VecDeque<u8>>>,
        server_to_client: Arc<Mutex<VecDeque<u8>>>,
    }

    impl PipeOpener for LoopbackOpener {
        fn open(&self, name: &str) -> Result<Box<dyn PipeEndpoint>, PipeIoError> {
            let endpoint = match name {
                "\\\\.\\pipe\\relay-read" => LoopbackEndpoint {
                    inbox: Arc::clone(&self.server_to_client),
                    outbox: Arc::clone(&self.client_to_server),
                    closed: false,
                },
                "\\\\.\\pipe\\relay-write" => LoopbackEndpoint {
                    inbox: Arc::clone(&self.server_to_client),
                    outbox: Arc::clone(&self.client_to_server),
                    closed: false,
                },
                other => panic!("unexpected pipe name in test: {other}"),
            };
            Ok(Box::new(endpoint))
        }
    }

    struct RecordingPipeObserver {
        connected: Mutex<bool>,
    }

    impl PipeChannelObserver for RecordingPipeObserver {
        fn on_connected(&self) {
            *self.connected.lock().unwrap() = true;
        }
        fn on_disconnected(&self) {
            *self.connected.lock().unwrap() = false;
        }
    }

    #[test]
    fn handshake_completes_against_a_cooperative_peer() {
        let client_to_server = Arc::new(Mutex::new(VecDeque::new()));
        let server_to_client = Arc::new(Mutex::new(VecDeque::new()));
        let opener = LoopbackOpener {
            client_to_server: Arc::clone(&client_to_server),
            server_to_client: Arc::clone(&server_to_client),
        };

        let observer = Arc::new(RecordingPipeObserver { connected: Mutex::new(false) });
        let channel = PipeChannel::connect(
            Box::new(opener),
            "\\\\.\\pipe\\relay-read",
            "\\\\.\\pipe\\relay-write",
            observer.clone(),
        );

        // Drive the server side of both handshake round-trips by hand: the
        // read pipe requests a fresh client_id, then the write pipe binds
        // to that same id.
        let setup = read_one_packet(&client_to_server);
        let Packet::ChannelSetup { client_id: requested, flags, .. } = setup else {
            panic!("expected ChannelSetup, got {setup:?}");
        };
        assert_eq!(requested, relay_proto::UNASSIGNED_ID);
        assert_eq!(flags, ChannelSetupFlags::READ);

        let assigned_client_id = 0x1234_5678;
        let ack = Packet::channel_setup_ack(assigned_client_id);
        server_to_client.lock().unwrap().extend(ack.encode());

        let setup = read_one_packet(&client_to_server);
        let Packet::ChannelSetup { client_id: bound, flags, .. } = setup else {
            panic!("expected ChannelSetup, got {setup:?}");
        };
        assert_eq!(bound, assigned_client_id);
        assert_eq!(flags, ChannelSetupFlags::WRITE);

        let ack = Packet::channel_setup_ack(assigned_client_id);
        server_to_client.lock().unwrap().extend(ack.encode());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !channel.is_connected() {
            assert!(std::time::Instant::now() < deadline, "handshake never completed");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(*observer.connected.lock().unwrap());
        assert_eq!(channel.client_id(), assigned_client_id);

        channel.request_termination();
        assert!(channel.join(Duration::from_secs(2)), "channel threads didn't stop in time");
    }

    struct RecordingProtoObserver {
        connected: Mutex<bool>,
    }

    impl ProtoObserver for RecordingProtoObserver {
        fn on_connected(&self) {
            *self.connected.lock().unwrap() = true;
        }
        fn on_disconnected(&self) {
            *self.connected.lock().unwrap() = false;
        }
    }

    /// Drains every fully-received packet currently sitting in `queue`
    /// without blocking for more.
    fn drain_available_packets(queue: &Arc<Mutex<VecDeque<u8>>>) -> Vec<Packet> {
        let mut packets = Vec::new();
        loop {
            let mut q = queue.lock().unwrap();
            if q.len() < relay_proto::HEADER_SIZE {
                return packets;
            }
            let bytes: Vec<u8> = q.iter().copied().collect();
            let header = relay_proto::PacketHeader::parse(&bytes[..relay_proto::HEADER_SIZE])
                .expect("valid header");
            if bytes.len() < header.total_length as usize {
                return packets;
            }
            let bytes: Vec<u8> = q.drain(..header.total_length as usize).collect();
            drop(q);
            packets.push(
                Packet::decode(&header, &bytes[relay_proto::HEADER_SIZE..])
                    .expect("valid packet payload"),
            );
        }
    }

    /// Completes the two-step handshake against a `ProtoClient` by hand,
    /// returning the assigned `client_id`.
    fn drive_proto_handshake(
        client_to_server: &Arc<Mutex<VecDeque<u8>>>,
        server_to_client: &Arc<Mutex<VecDeque<u8>>>,
    ) -> u64 {
        let setup = read_one_packet(client_to_server);
        let Packet::ChannelSetup { flags, .. } = setup else {
            panic!("expected ChannelSetup, got {setup:?}")
        };
        assert_eq!(flags, ChannelSetupFlags::READ);
        let assigned_client_id = 0x99;
        server_to_client.lock().unwrap().extend(Packet::channel_setup_ack(assigned_client_id).encode());

        let setup = read_one_packet(client_to_server);
        let Packet::ChannelSetup { client_id, flags, .. } = setup else {
            panic!("expected ChannelSetup, got {setup:?}")
        };
        assert_eq!(client_id, assigned_client_id);
        assert_eq!(flags, ChannelSetupFlags::WRITE);
        server_to_client.lock().unwrap().extend(Packet::channel_setup_ack(assigned_client_id).encode());

        assigned_client_id
    }

    #[test]
    fn keepalive_pings_when_idle_and_skips_it_while_data_is_flowing() {
        let client_to_server = Arc::new(Mutex::new(VecDeque::new()));
        let server_to_client = Arc::new(Mutex::new(VecDeque::new()));
        let opener = LoopbackOpener {
            client_to_server: Arc::clone(&client_to_server),
            server_to_client: Arc::clone(&server_to_client),
        };

        let observer = Arc::new(RecordingProtoObserver { connected: Mutex::new(false) });
        let client = super::ProtoClient::connect(
            Box::new(opener),
            "\\\\.\\pipe\\relay-read",
            "\\\\.\\pipe\\relay-write",
            observer.clone(),
            Some(Duration::from_millis(150)),
        );

        drive_proto_handshake(&client_to_server, &server_to_client);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !client.is_connected() {
            assert!(std::time::Instant::now() < deadline, "handshake never completed");
            std::thread::sleep(Duration::from_millis(5));
        }

        // Keep the link "busy" well past one keep-alive interval: every
        // tick we feed it a harmless Status packet to simulate the remote
        // still talking. No Ping should be sent while that's happening.
        let busy_deadline = std::time::Instant::now() + Duration::from_millis(450);
        while std::time::Instant::now() < busy_deadline {
            server_to_client.lock().unwrap().extend(Packet::status(0, Status::Ok).encode());
            std::thread::sleep(Duration::from_millis(40));
        }
        let sent = drain_available_packets(&client_to_server);
        assert!(
            !sent.iter().any(|p| matches!(p, Packet::Ping { .. })),
            "keep-alive pinged while the link was actively receiving data: {sent:?}"
        );

        // Now go quiet; the next tick should send a ping.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let sent = drain_available_packets(&client_to_server);
            if sent.iter().any(|p| matches!(p, Packet::Ping { .. })) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "keep-alive never pinged while idle");
            std::thread::sleep(Duration::from_millis(20));
        }

        client.request_termination();
        assert!(client.join(Duration::from_secs(2)), "client threads didn't stop in time");
    }

    /// Blocks until one full packet is available in `queue` and decodes it.
    fn read_one_packet(queue: &Arc<Mutex<VecDeque<u8>>>) -> Packet {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let q = queue.lock().unwrap();
                if q.len() >= relay_proto::HEADER_SIZE {
                    let bytes: Vec<u8> = q.iter().copied().collect();
                    let header = relay_proto::PacketHeader::parse(&bytes[..relay_proto::HEADER_SIZE])
                        .expect("valid header");
                    if bytes.len() >= header.total_length as usize {
                        drop(q);
                        let mut q = queue.lock().unwrap();
                        let bytes: Vec<u8> = q.drain(..header.total_length as usize).collect();
                        return Packet::decode(&header, &bytes[relay_proto::HEADER_SIZE..])
                            .expect("valid packet payload");
                    }
                }
            }
            assert!(std::time::Instant::now() < deadline, "peer never sent expected packet");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
