use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use rpc_mamont::tcp::{RecordCodec, TcpTransportClient, TcpTransportServer};

const CYCLE: Duration = Duration::from_millis(10);

async fn bind_server() -> (TcpTransportServer, String) {
    let server = TcpTransportServer::bind("127.0.0.1:0").await.expect("bind");
    let addr = server.local_addr().expect("local addr").to_string();
    (server, addr)
}

/// Drives both sides until the server has received `want` messages.
async fn pump_until(
    server: &mut TcpTransportServer,
    clients: &mut [&mut TcpTransportClient],
    want: usize,
) -> Vec<(rpc_mamont::tcp::ConnectionId, Vec<u8>)> {
    timeout(Duration::from_secs(5), async {
        let mut got = Vec::new();
        loop {
            server.cycle(CYCLE).await;
            for client in clients.iter_mut() {
                client.cycle(Duration::ZERO).await.expect("client cycle");
            }
            while let Some(entry) = server.pop_message() {
                got.push(entry);
            }
            if got.len() >= want {
                return got;
            }
        }
    })
    .await
    .expect("messages did not arrive in time")
}

#[tokio::test]
async fn round_trip_through_server_and_client() {
    let (mut server, addr) = bind_server().await;

    let mut client = TcpTransportClient::connect(&addr).await.expect("connect");
    client.push_message(b"ping".to_vec(), true);

    let got = pump_until(&mut server, &mut [&mut client], 1).await;
    let (connection, message) = got.into_iter().next().expect("one message");
    assert_eq!(message, b"ping");

    assert!(server.push_message(connection, b"pong".to_vec(), true));
    let reply = timeout(Duration::from_secs(5), async {
        loop {
            server.cycle(CYCLE).await;
            client.cycle(CYCLE).await.expect("client cycle");
            if let Some(reply) = client.pop_message() {
                return reply;
            }
        }
    })
    .await
    .expect("no reply in time");
    assert_eq!(reply, b"pong");
}

#[tokio::test]
async fn multiplexes_messages_from_many_connections() {
    let (mut server, addr) = bind_server().await;

    let mut a = TcpTransportClient::connect(&addr).await.expect("connect a");
    let mut b = TcpTransportClient::connect(&addr).await.expect("connect b");
    a.push_message(b"from-a".to_vec(), true);
    b.push_message(b"from-b".to_vec(), true);

    let got = pump_until(&mut server, &mut [&mut a, &mut b], 2).await;
    assert_eq!(server.connection_count(), 2);

    let mut payloads: Vec<Vec<u8>> = got.iter().map(|(_, m)| m.clone()).collect();
    payloads.sort();
    assert_eq!(payloads, vec![b"from-a".to_vec(), b"from-b".to_vec()]);

    // The two messages must carry distinct connection ids.
    assert_ne!(got[0].0, got[1].0);
}

#[tokio::test]
async fn fragments_pushed_separately_form_one_record() {
    let (mut server, addr) = bind_server().await;

    let mut client = TcpTransportClient::connect(&addr).await.expect("connect");
    client.push_message(b"part one, ".to_vec(), false);
    client.push_message(b"part two".to_vec(), true);

    let got = pump_until(&mut server, &mut [&mut client], 1).await;
    assert_eq!(got[0].1, b"part one, part two");
}

#[tokio::test]
async fn raw_peer_sees_record_marked_bytes() {
    let (mut server, addr) = bind_server().await;

    let mut raw = TcpStream::connect(&addr).await.expect("connect raw");
    let mut wire = Vec::new();
    RecordCodec::frame(b"hello", true, &mut wire);
    raw.write_all(&wire).await.expect("write");

    let got = timeout(Duration::from_secs(5), async {
        loop {
            server.cycle(CYCLE).await;
            if let Some(entry) = server.pop_message() {
                return entry;
            }
        }
    })
    .await
    .expect("message did not arrive");
    assert_eq!(got.1, b"hello");

    server.push_message(got.0, b"world".to_vec(), true);

    // Expected on the wire: a final-fragment header and the payload.
    let mut expected = Vec::new();
    RecordCodec::frame(b"world", true, &mut expected);
    let mut read_back = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), async {
        let mut filled = 0;
        loop {
            server.cycle(CYCLE).await;
            raw.readable().await.expect("readable");
            match raw.try_read(&mut read_back[filled..]) {
                Ok(n) => {
                    filled += n;
                    if filled == read_back.len() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
    })
    .await
    .expect("reply did not arrive");
    assert_eq!(read_back, expected);
}

#[tokio::test]
async fn close_flushes_queued_output_first() {
    let (mut server, addr) = bind_server().await;

    let mut client = TcpTransportClient::connect(&addr).await.expect("connect");
    client.push_message(b"hi".to_vec(), true);
    let got = pump_until(&mut server, &mut [&mut client], 1).await;
    let connection = got[0].0;

    assert!(server.push_message(connection, b"bye".to_vec(), true));
    assert!(server.close(connection));
    // Once closing, no further output is accepted.
    assert!(!server.push_message(connection, b"late".to_vec(), true));

    let reply = timeout(Duration::from_secs(5), async {
        loop {
            server.cycle(CYCLE).await;
            client.cycle(CYCLE).await.expect("client cycle");
            if let Some(reply) = client.pop_message() {
                return reply;
            }
        }
    })
    .await
    .expect("no reply before close");
    assert_eq!(reply, b"bye");

    timeout(Duration::from_secs(5), async {
        while !client.is_closed() {
            server.cycle(CYCLE).await;
            client.cycle(CYCLE).await.expect("client cycle");
        }
    })
    .await
    .expect("connection did not close");
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn disconnected_peer_is_dropped() {
    let (mut server, addr) = bind_server().await;

    let raw = TcpStream::connect(&addr).await.expect("connect raw");
    timeout(Duration::from_secs(5), async {
        while server.connection_count() == 0 {
            server.cycle(CYCLE).await;
        }
    })
    .await
    .expect("connection was not accepted");

    drop(raw);
    timeout(Duration::from_secs(5), async {
        while server.connection_count() > 0 {
            server.cycle(CYCLE).await;
        }
    })
    .await
    .expect("connection was not dropped");

    // Replies to a vanished connection are refused, not queued.
    assert!(!server.push_message(0, b"ghost".to_vec(), true));
}

#[tokio::test]
async fn zero_timeout_cycle_does_not_block() {
    let (mut server, _addr) = bind_server().await;

    // With no connections and no traffic this returns promptly.
    let start = std::time::Instant::now();
    for _ in 0..100 {
        server.cycle(Duration::ZERO).await;
    }
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(server.pop_message().is_none());
}

#[tokio::test]
async fn oversized_record_drops_the_connection() {
    let (mut server, addr) = bind_server().await;

    let mut raw = TcpStream::connect(&addr).await.expect("connect raw");
    let oversized = (rpc_mamont::protocol::rpc::MAX_RPC_RECORD_LENGTH as u32 + 1) | (1 << 31);
    raw.write_all(&oversized.to_be_bytes()).await.expect("write header");

    // The connection may be accepted and dropped within one cycle, so the
    // observable outcome is the peer seeing the close.
    let mut buf = [0u8; 1];
    timeout(Duration::from_secs(5), async {
        loop {
            server.cycle(CYCLE).await;
            match timeout(Duration::from_millis(10), raw.read(&mut buf)).await {
                Ok(Ok(0)) => return,
                Ok(Ok(_)) => panic!("unexpected data from server"),
                Ok(Err(e)) => panic!("read failed: {e}"),
                Err(_) => {}
            }
        }
    })
    .await
    .expect("oversized connection was not dropped");
    assert_eq!(server.connection_count(), 0);
}
