use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use relay_bridge::Bridge;
use relay_proto::{ChannelSetupFlags, Packet};
use relay_transport::{PipeEndpoint, PipeIoError, PipeOpener};

/// Stands in for the remote relay implant: a pair of queues shared between
/// the "read" and "write" named pipes, exactly as in `relay-transport`'s own
/// handshake test.
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
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inbox = self.inbox.lock().unwrap();
                if !inbox.is_empty() {
                    return Ok(inbox.drain(..).collect());
                }
            }
            if Instant::now() >= deadline {
                return Err(PipeIoError::Timeout);
            }
            thread::sleep(Duration::from_millis(5));
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
    fn open(&self, _name: &str) -> Result<Box<dyn PipeEndpoint>, PipeIoError> {
        Ok(Box::new(LoopbackEndpoint {
            inbox: Arc::clone(&self.server_to_client),
            outbox: Arc::clone(&self.client_to_server),
            closed: false,
        }))
    }
}

/// Blocks until one full packet is available in `queue` and decodes it.
fn read_one_packet(queue: &Arc<Mutex<VecDeque<u8>>>, timeout: Duration) -> Packet {
    let deadline = Instant::now() + timeout;
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
        assert!(Instant::now() < deadline, "peer never sent expected packet");
        thread::sleep(Duration::from_millis(5));
    }
}

/// A local SOCKS client's bytes should reach the pipe peer as a `Socks`
/// packet carrying the registered `link_id`, and the peer's reply should
/// reach the same TCP client verbatim.
#[test]
fn socks_bytes_roundtrip_between_tcp_client_and_pipe_peer() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24901));

    let client_to_server = Arc::new(Mutex::new(VecDeque::new()));
    let server_to_client = Arc::new(Mutex::new(VecDeque::new()));
    let opener = LoopbackOpener {
        client_to_server: Arc::clone(&client_to_server),
        server_to_client: Arc::clone(&server_to_client),
    };

    let bridge =
        Bridge::start(Box::new(opener), "\\\\.\\pipe\\relay-read", "\\\\.\\pipe\\relay-write", &[bind_addr], None);

    let remote = {
        let client_to_server = Arc::clone(&client_to_server);
        let server_to_client = Arc::clone(&server_to_client);
        thread::spawn(move || {
            let setup = read_one_packet(&client_to_server, Duration::from_secs(2));
            let Packet::ChannelSetup { flags, .. } = setup else {
                panic!("expected ChannelSetup, got {setup:?}")
            };
            assert_eq!(flags, ChannelSetupFlags::READ);
            server_to_client.lock().unwrap().extend(Packet::channel_setup_ack(0xAA).encode());

            let setup = read_one_packet(&client_to_server, Duration::from_secs(2));
            let Packet::ChannelSetup { client_id, flags, .. } = setup else {
                panic!("expected ChannelSetup, got {setup:?}")
            };
            assert_eq!(client_id, 0xAA);
            assert_eq!(flags, ChannelSetupFlags::WRITE);
            server_to_client.lock().unwrap().extend(Packet::channel_setup_ack(0xAA).encode());

            let forwarded = read_one_packet(&client_to_server, Duration::from_secs(2));
            let Packet::Socks { link_id, data, .. } = forwarded else {
                panic!("expected Socks packet, got {forwarded:?}")
            };
            assert_eq!(data.as_slice(), b"ping");

            server_to_client.lock().unwrap().extend(Packet::socks(link_id, b"pong".to_vec()).encode());
        })
    };

    let tcp_client = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut conn = loop {
            match std::net::TcpStream::connect(bind_addr) {
                Ok(conn) => break conn,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Err(err) => panic!("failed to connect to relay: {err}"),
            }
        };

        use std::io::{Read, Write};
        conn.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    });

    let deadline = Instant::now() + Duration::from_secs(3);
    while !tcp_client.is_finished() {
        bridge.pump();
        assert!(Instant::now() < deadline, "bridge never relayed the roundtrip in time");
    }

    tcp_client.join().unwrap();
    remote.join().unwrap();

    bridge.request_termination();
    assert!(bridge.join(Duration::from_secs(2)), "bridge threads didn't stop in time");
}
