use std::time::Duration;

use spider_agent::{Agent, AgentConfig};
use spider_server::{Server, ServerConfig};

fn config_for(client_id: &str, server_addr: &str) -> AgentConfig {
    AgentConfig {
        server_addr: server_addr.to_string(),
        client_id: client_id.to_string(),
        name: client_id.to_string(),
        reconnect_initial_ms: 50,
        reconnect_max_ms: 200,
        dial_timeout_secs: 5,
        heartbeat_period_secs: 10,
        max_frame_bytes: spider_protocol::DEFAULT_MAX_FRAME,
    }
}

#[tokio::test]
async fn two_agents_punch_through_and_exchange_a_message() {
    let server_config = ServerConfig::for_test("127.0.0.1:0");
    let server = Server::bind(server_config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let a1 = Agent::connect(config_for("a1", &addr.to_string())).await.unwrap();
    let a2 = Agent::connect(config_for("a2", &addr.to_string())).await.unwrap();

    a1.connect_to_peer("a2").await.unwrap();

    let mut linked = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if a1.list_peers().contains(&"a2".to_string()) && a2.list_peers().contains(&"a1".to_string()) {
            linked = true;
            break;
        }
    }
    assert!(linked, "a1 and a2 should have established a peer link");

    a1.send_message("a2", "hi").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    a1.close();
    a2.close();
}

#[tokio::test]
async fn connect_to_peer_is_a_noop_when_already_linked() {
    let server_config = ServerConfig::for_test("127.0.0.1:0");
    let server = Server::bind(server_config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let a1 = Agent::connect(config_for("a1", &addr.to_string())).await.unwrap();
    let a2 = Agent::connect(config_for("a2", &addr.to_string())).await.unwrap();

    a1.connect_to_peer("a2").await.unwrap();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if a1.list_peers().contains(&"a2".to_string()) {
            break;
        }
    }
    assert!(a1.list_peers().contains(&"a2".to_string()));

    // A second punch for an already-linked peer must not create a
    // second connection.
    a1.connect_to_peer("a2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a1.list_peers().iter().filter(|p| *p == "a2").count(), 1);

    a1.close();
    a2.close();
}
