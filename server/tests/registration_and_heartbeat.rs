use std::time::Duration;

use spider_protocol::{Envelope, FrameCodec, HeartbeatPayload, MessageType, RegisterPayload};
use spider_server::{Server, ServerConfig};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

async fn start_server() -> (std::net::SocketAddr, spider_server::Server) {
    let config = ServerConfig::for_test("127.0.0.1:0");
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    (addr, server)
}

async fn register(stream: &mut TcpStream, client_id: &str, name: &str) {
    let payload = RegisterPayload {
        client_id: client_id.into(),
        name: name.into(),
        public_addr: "127.0.0.1:1".into(),
        private_addr: String::new(),
    };
    let env = Envelope::with_payload(MessageType::Register, client_id, "server", &payload).unwrap();
    stream.write_all(&env.encode().unwrap()).await.unwrap();
}

#[tokio::test]
async fn register_then_ack_sets_connected_and_empty_peers() {
    let (addr, server) = start_server().await;
    let registry = server.registry();
    tokio::spawn(server.run());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    register(&mut stream, "a1", "A").await;

    let (read_half, _write_half) = stream.into_split();
    let mut codec = FrameCodec::new(BufReader::new(read_half));
    let ack = codec.next_envelope().await.unwrap().unwrap();
    assert_eq!(ack.kind, MessageType::Register);
    assert_eq!(ack.from, "server");
    assert_eq!(ack.to, "a1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let snap = registry.snapshot();
    let session = &snap["a1"];
    assert!(session.connected);
    assert!(session.peers.is_empty());
}

#[tokio::test]
async fn heartbeat_updates_counters_and_filters_peers() {
    let (addr, server) = start_server().await;
    let registry = server.registry();
    tokio::spawn(server.run());

    let mut s1 = TcpStream::connect(addr).await.unwrap();
    register(&mut s1, "a1", "A").await;
    let mut s2 = TcpStream::connect(addr).await.unwrap();
    register(&mut s2, "a2", "B").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let now_nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap();
    let hb = HeartbeatPayload {
        client_id: "a1".into(),
        bytes_sent: 100,
        bytes_recv: 50,
        p2p_bytes_sent: 0,
        p2p_bytes_recv: 0,
        peers: vec!["a1".into(), "a2".into(), "ghost".into()],
        timestamp: now_nanos,
    };
    let env = Envelope::with_payload(MessageType::Heartbeat, "a1", "server", &hb).unwrap();
    s1.write_all(&env.encode().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let snap = registry.snapshot();
    let session = &snap["a1"];
    assert_eq!(session.bytes_sent, 100);
    assert_eq!(session.bytes_recv, 50);
    assert_eq!(session.peers, vec!["a2".to_string()]);
}

#[tokio::test]
async fn disconnect_clears_self_from_every_peer_list() {
    let (addr, server) = start_server().await;
    let registry = server.registry();
    tokio::spawn(server.run());

    let mut s1 = TcpStream::connect(addr).await.unwrap();
    register(&mut s1, "a1", "A").await;
    let mut s2 = TcpStream::connect(addr).await.unwrap();
    register(&mut s2, "a2", "B").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let now_nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap();
    let hb = HeartbeatPayload {
        client_id: "a2".into(),
        bytes_sent: 0,
        bytes_recv: 0,
        p2p_bytes_sent: 0,
        p2p_bytes_recv: 0,
        peers: vec!["a1".into()],
        timestamp: now_nanos,
    };
    let env = Envelope::with_payload(MessageType::Heartbeat, "a2", "server", &hb).unwrap();
    s2.write_all(&env.encode().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.snapshot()["a2"].peers, vec!["a1".to_string()]);

    drop(s1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snap = registry.snapshot();
    assert!(!snap["a1"].connected);
    assert!(snap["a2"].peers.is_empty());
}

#[tokio::test]
async fn reregistration_closes_previous_connection() {
    let (addr, server) = start_server().await;
    let registry = server.registry();
    tokio::spawn(server.run());

    let mut s1 = TcpStream::connect(addr).await.unwrap();
    register(&mut s1, "a1", "A").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut s2 = TcpStream::connect(addr).await.unwrap();
    register(&mut s2, "a1", "A").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the first connection should now observe EOF
    let mut buf = [0u8; 16];
    use tokio::io::AsyncReadExt;
    let n = s1.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "previous connection should have been closed");

    assert_eq!(registry.snapshot().len(), 1);
}
