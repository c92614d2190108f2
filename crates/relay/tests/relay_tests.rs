//! End-to-end tests: the real relay server against the agent's transport
//! channel and against raw WebSocket clients.

use agent_lib::supervisor::BackoffPolicy;
use agent_lib::sync::{ChannelConfig, CommandRequest, ConnectTarget, PayloadKind, TransportChannel};
use fleet_relay::{load_acceptor, RelayConfig, RelayServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type RawClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    server: RelayServer,
    port: u16,
    serving: JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    async fn start(config: RelayConfig, tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = RelayServer::new(config);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener, tls).await })
        };
        Self {
            server,
            port,
            serving,
        }
    }

    async fn plain() -> Self {
        Self::start(fast_config(), None).await
    }

    fn url(&self, scheme: &str) -> String {
        format!("{}://127.0.0.1:{}/ws/monitoring/", scheme, self.port)
    }

    async fn stop(self) {
        self.server.shutdown().await;
        tokio::time::timeout(WAIT, self.serving)
            .await
            .expect("listener did not stop")
            .unwrap()
            .unwrap();
    }
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        registration_timeout: Duration::from_millis(300),
        ..RelayConfig::default()
    }
}

fn channel_for(url: &str, server_id: &str) -> TransportChannel {
    TransportChannel::builder()
        .config(ChannelConfig {
            server_id: server_id.to_string(),
            target: ConnectTarget::Custom(url.to_string()),
            ssl_verify: false,
            connect_timeout: Duration::from_secs(2),
            register_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(100)),
            ..ChannelConfig::default()
        })
        .build()
        .unwrap()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn raw_client(url: &str) -> RawClient {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut RawClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, or `None` once the relay closes the connection
async fn next_json(ws: &mut RawClient) -> Option<Value> {
    tokio::time::timeout(WAIT, async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .expect("no frame from relay")
}

fn stats_payload(host: &str) -> Value {
    json!({
        "system": { "host_name": host, "docker_memory_percent": 41.5 },
        "containers": [{ "name": "3node1" }, { "name": "3node2" }],
        "configured_nodes": ["3node"]
    })
}

mod registration_tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_channel_registers() {
        let relay = TestRelay::plain().await;
        let channel = channel_for(&relay.url("ws"), "validator-01");

        assert!(channel.connect().await);
        wait_until("client registration", || relay.server.is_connected("validator-01")).await;
        assert_eq!(relay.server.client_count(), 1);

        channel.shutdown().await;
        wait_until("client removal", || relay.server.client_count() == 0).await;
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_missing_server_id_gets_generated_identity() {
        let relay = TestRelay::plain().await;
        let mut ws = raw_client(&relay.url("ws")).await;

        send_json(&mut ws, json!({ "type": "register", "version": "1.1.0" })).await;
        let ack = next_json(&mut ws).await.unwrap();

        assert_eq!(ack["type"], "register_ack");
        assert_eq!(ack["status"], "success");
        let id = ack["serverId"].as_str().unwrap();
        assert!(id.starts_with("unknown-"));
        assert_eq!(id.len(), "unknown-".len() + 4);

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_registration_timeout_closes_connection() {
        let relay = TestRelay::plain().await;
        let mut ws = raw_client(&relay.url("ws")).await;

        assert!(next_json(&mut ws).await.is_none());
        assert_eq!(relay.server.client_count(), 0);

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_message_before_registration_is_rejected() {
        let relay = TestRelay::plain().await;
        let mut ws = raw_client(&relay.url("ws")).await;

        send_json(&mut ws, json!({ "type": "stats", "serverId": "x", "data": {} })).await;

        assert!(next_json(&mut ws).await.is_none());
        assert_eq!(relay.server.client_count(), 0);

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_replaces_previous_connection() {
        let relay = TestRelay::plain().await;

        let mut first = raw_client(&relay.url("ws")).await;
        send_json(&mut first, json!({ "type": "register", "serverId": "dup" })).await;
        assert_eq!(next_json(&mut first).await.unwrap()["type"], "register_ack");

        let mut second = raw_client(&relay.url("ws")).await;
        send_json(&mut second, json!({ "type": "register", "serverId": "dup" })).await;
        assert_eq!(next_json(&mut second).await.unwrap()["type"], "register_ack");

        assert!(next_json(&mut first).await.is_none());
        assert_eq!(relay.server.client_count(), 1);

        send_json(&mut second, json!({ "type": "ping", "timestamp": 1 })).await;
        assert_eq!(next_json(&mut second).await.unwrap()["type"], "pong");

        relay.stop().await;
    }
}

mod traffic_tests {
    use super::*;

    #[tokio::test]
    async fn test_stats_are_acknowledged_by_sequence() {
        let relay = TestRelay::plain().await;
        let channel = channel_for(&relay.url("ws"), "validator-02");
        assert!(channel.connect().await);

        assert!(channel.send(stats_payload("host-a"), PayloadKind::Stats).await);
        assert!(channel.send(stats_payload("host-a"), PayloadKind::Stats).await);

        wait_until("stats acknowledgments", || {
            channel.pending_ack_count() == 0 && relay.server.stats().total_received == 2
        })
        .await;

        let clients = relay.server.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].server_id, "validator-02");
        assert_eq!(clients[0].host_name, "host-a");
        assert_eq!(clients[0].messages_received, 2);
        assert_eq!(relay.server.stats().total_success, 2);

        channel.shutdown().await;
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_summary_and_ping_replies() {
        let relay = TestRelay::plain().await;
        let mut ws = raw_client(&relay.url("ws")).await;
        send_json(&mut ws, json!({ "type": "register", "serverId": "raw-1" })).await;
        next_json(&mut ws).await.unwrap();

        send_json(&mut ws, json!({ "type": "heartbeat", "serverId": "raw-1", "timestamp": 1 })).await;
        assert_eq!(next_json(&mut ws).await.unwrap()["type"], "heartbeat_ack");

        send_json(
            &mut ws,
            json!({ "type": "summary", "serverId": "raw-1", "sequence": 4, "data": { "data_points": 60 } }),
        )
        .await;
        let ack = next_json(&mut ws).await.unwrap();
        assert_eq!(ack["type"], "summary_ack");
        assert_eq!(ack["status"], "success");

        send_json(&mut ws, json!({ "type": "stats", "serverId": "raw-1", "sequence": 9, "data": {} })).await;
        let ack = next_json(&mut ws).await.unwrap();
        assert_eq!(ack["type"], "stats_ack");
        assert_eq!(ack["sequence"], 9);

        // unknown and malformed frames are ignored without closing
        send_json(&mut ws, json!({ "type": "telemetry" })).await;
        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        send_json(&mut ws, json!({ "type": "ping", "timestamp": 2 })).await;
        assert_eq!(next_json(&mut ws).await.unwrap()["type"], "pong");

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let relay = TestRelay::plain().await;
        let channel = channel_for(&relay.url("ws"), "validator-03");
        assert!(channel.connect().await);
        wait_until("registration", || relay.server.is_connected("validator-03")).await;

        let command = CommandRequest {
            id: Some("cmd-42".to_string()),
            command: "payout".to_string(),
            target: "3node1".to_string(),
            ..CommandRequest::default()
        };
        assert!(relay.server.send_command("validator-03", command));

        // the agent answers with a sequenced command_response
        wait_until("command response", || channel.sequence() == 1).await;
        wait_until("delivery", || channel.totals().success == 1).await;

        channel.shutdown().await;
        relay.stop().await;
    }
}

mod liveness_tests {
    use super::*;

    #[tokio::test]
    async fn test_silent_idle_client_is_dropped() {
        let relay = TestRelay::start(
            RelayConfig {
                ping_interval: Duration::from_millis(100),
                ping_idle: Duration::from_millis(50),
                pong_timeout: Duration::from_millis(200),
                ..fast_config()
            },
            None,
        )
        .await;
        relay.server.start_sweeps().await;

        // a responsive agent answers ping frames while it reads
        let channel = channel_for(&relay.url("ws"), "responsive");
        assert!(channel.connect().await);

        // a raw client that never reads cannot answer pings
        let mut silent = raw_client(&relay.url("ws")).await;
        send_json(&mut silent, json!({ "type": "register", "serverId": "silent" })).await;
        wait_until("silent registration", || relay.server.is_connected("silent")).await;

        wait_until("silent client drop", || !relay.server.is_connected("silent")).await;
        assert!(relay.server.is_connected("responsive"));

        drop(silent);
        channel.shutdown().await;
        relay.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_client() {
        let relay = TestRelay::plain().await;
        let channel = channel_for(&relay.url("ws"), "validator-04");
        assert!(channel.connect().await);

        let mut raw = raw_client(&relay.url("ws")).await;
        send_json(&mut raw, json!({ "type": "register", "serverId": "raw-2" })).await;
        next_json(&mut raw).await.unwrap();

        let server = relay.server.clone();
        relay.stop().await;

        assert_eq!(server.client_count(), 0);
        assert!(next_json(&mut raw).await.is_none());
        let noticed = tokio::time::timeout(WAIT, async {
            while channel.is_registered().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(noticed.is_ok(), "agent never noticed the close");

        channel.shutdown().await;
    }
}

mod tls_tests {
    use super::*;

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    #[tokio::test]
    async fn test_agent_registers_over_tls() {
        let acceptor = load_acceptor(&fixture("cert.pem"), &fixture("key.pem")).unwrap();
        let relay = TestRelay::start(fast_config(), Some(acceptor)).await;

        let channel = channel_for(&relay.url("wss"), "validator-tls");
        assert!(channel.connect().await);
        assert_eq!(
            channel.active_url().await.as_deref(),
            Some(relay.url("wss").as_str())
        );

        assert!(channel.send(stats_payload("secure-host"), PayloadKind::Stats).await);
        wait_until("acknowledged stats", || {
            relay.server.stats().total_received == 1 && channel.pending_ack_count() == 0
        })
        .await;

        channel.shutdown().await;
        relay.stop().await;
    }
}
