use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use relay_net::tcp::{PollEvent, SendBehavior, TcpReactor};

#[test]
fn tcp_roundtrip_forwards_raw_bytes() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24813));

    let mut listener = TcpReactor::new();
    listener.listen_at(bind_addr).unwrap();

    let server = thread::spawn(move || {
        let mut stream_token = None;
        while stream_token.is_none() {
            listener.poll_with(|event| match event {
                PollEvent::Accept { stream, .. } => stream_token = Some(stream),
                PollEvent::Data { .. } => panic!("shouldn't have gotten here"),
                _ => {}
            });
        }
        let stream_token = stream_token.unwrap();

        let mut received = Vec::new();
        while received != b"ping" {
            listener.poll_with(|event| {
                if let PollEvent::Data { payload, .. } = event {
                    received.extend_from_slice(payload);
                }
            });
            thread::sleep(Duration::from_micros(50));
        }

        listener.write_or_enqueue(SendBehavior::Single(stream_token), b"pong");
        listener.poll_with(|_| {});
    });

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let mut conn = std::net::TcpStream::connect(bind_addr).unwrap();
        use std::io::{Read, Write};
        conn.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    });

    client.join().unwrap();
    server.join().unwrap();
}

#[test]
fn disconnect_removes_the_connection() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24814));
    let mut reactor = TcpReactor::new();
    reactor.listen_at(bind_addr).unwrap();

    let client = thread::spawn(move || {
        let _conn = std::net::TcpStream::connect(bind_addr).unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let mut stream_token = None;
    while stream_token.is_none() {
        reactor.poll_with(|event| {
            if let PollEvent::Accept { stream, .. } = event {
                stream_token = Some(stream);
            }
        });
    }

    reactor.disconnect(stream_token.unwrap());
    // Writing to a disconnected token is a harmless no-op, not a panic.
    reactor.write_or_enqueue(SendBehavior::Single(stream_token.unwrap()), b"x");

    client.join().unwrap();
}
