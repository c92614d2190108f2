//! Relay server
//!
//! Accepts agent connections over WebSocket (plain or TLS), registers them
//! by server id and acknowledges their traffic:
//! - The first frame must be `register` within the registration timeout
//! - A second connection with the same id replaces the first
//! - Idle clients are probed with ping frames and dropped when silent
//!
//! All state lives in [`RelayServer`]; clones share it.

use agent_lib::supervisor::{spawn_periodic, Pace, PeriodicConfig, PeriodicWork};
use agent_lib::sync::{now_millis, ClientMessage, CommandRequest, Envelope, RelayMessage};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Time connection tasks get to wind down after shutdown
const CONNECTION_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Relay timing settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deadline for the first `register` frame
    pub registration_timeout: Duration,
    /// Cadence of the idle-client ping sweep
    pub ping_interval: Duration,
    /// Idle time after which the ping sweep probes a client
    pub ping_idle: Duration,
    /// Cadence of the stale-client sweep
    pub stale_interval: Duration,
    /// Idle time after which the stale sweep probes a client
    pub stale_idle: Duration,
    /// Wait for a pong before the client is dropped
    pub pong_timeout: Duration,
    /// Aggregate statistics are logged every this many stats messages
    pub stats_log_every: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            ping_idle: Duration::from_secs(30),
            stale_interval: Duration::from_secs(60),
            stale_idle: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(5),
            stats_log_every: 10,
        }
    }
}

/// Aggregate counters since startup
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RelayStats {
    pub total_received: u64,
    pub total_success: u64,
    pub connected_clients: usize,
    pub uptime_secs: u64,
}

/// One registered agent, as reported by [`RelayServer::clients`]
#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub server_id: String,
    pub host_name: String,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    pub messages_received: u64,
}

/// Shared state of one registered connection
struct Client {
    server_id: String,
    connection_id: u64,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Message>,
    token: CancellationToken,
    last_activity: StdMutex<Instant>,
    host_name: StdMutex<String>,
    received: AtomicU64,
    pongs: watch::Sender<u64>,
}

impl Client {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn host_name(&self) -> String {
        self.host_name
            .lock()
            .map(|name| name.clone())
            .unwrap_or_default()
    }

    fn set_host_name(&self, name: &str) {
        if let Ok(mut current) = self.host_name.lock() {
            if *current != name {
                *current = name.to_string();
            }
        }
    }

    /// Queue a frame for the writer task; false once the connection is gone
    fn send(&self, message: &RelayMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.outbound.send(Message::Text(text)).is_ok(),
            Err(e) => {
                error!(server_id = %self.server_id, error = %e, "Failed to encode relay message");
                false
            }
        }
    }

    /// Ping frame round trip within `timeout`
    async fn probe(&self, timeout: Duration) -> bool {
        let mut pongs = self.pongs.subscribe();
        pongs.borrow_and_update();
        if self.outbound.send(Message::Ping(Vec::new())).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, pongs.changed()).await, Ok(Ok(())))
    }

    fn close(&self) {
        self.token.cancel();
    }

    fn summary(&self) -> ClientSummary {
        ClientSummary {
            server_id: self.server_id.clone(),
            host_name: self.host_name(),
            peer: self.peer.to_string(),
            connected_at: self.connected_at,
            messages_received: self.received.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    config: RelayConfig,
    clients: DashMap<String, Arc<Client>>,
    next_connection: AtomicU64,
    total_received: AtomicU64,
    total_success: AtomicU64,
    started: Instant,
    last_report: StdMutex<Instant>,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// WebSocket relay for fleet agents
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                config,
                clients: DashMap::new(),
                next_connection: AtomicU64::new(1),
                total_received: AtomicU64::new(0),
                total_success: AtomicU64::new(0),
                started: now,
                last_report: StdMutex::new(now),
                sweeps: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.inner.clients.contains_key(server_id)
    }

    pub fn clients(&self) -> Vec<ClientSummary> {
        let mut clients: Vec<ClientSummary> = self
            .inner
            .clients
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        clients.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        clients
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_received: self.inner.total_received.load(Ordering::Relaxed),
            total_success: self.inner.total_success.load(Ordering::Relaxed),
            connected_clients: self.inner.clients.len(),
            uptime_secs: self.inner.started.elapsed().as_secs(),
        }
    }

    /// Forward a command to a registered agent
    pub fn send_command(&self, server_id: &str, command: CommandRequest) -> bool {
        let Some(client) = self.client(server_id) else {
            warn!(server_id = %server_id, "Command for unknown client");
            return false;
        };
        info!(
            server_id = %server_id,
            command = %command.command,
            target = %command.target,
            "Forwarding command"
        );
        client.send(&RelayMessage::Command { data: command })
    }

    /// Close the connection registered under `server_id`
    pub fn disconnect(&self, server_id: &str) -> bool {
        match self.inner.clients.remove(server_id) {
            Some((_, client)) => {
                client.close();
                true
            }
            None => false,
        }
    }

    /// Start the idle-ping and stale-client sweeps
    pub async fn start_sweeps(&self) {
        let config = &self.inner.config;
        let mut sweeps = self.inner.sweeps.lock().await;
        if !sweeps.is_empty() || self.inner.shutdown.is_cancelled() {
            return;
        }

        for (name, interval, idle) in [
            ("relay:ping-sweep", config.ping_interval, config.ping_idle),
            ("relay:stale-sweep", config.stale_interval, config.stale_idle),
        ] {
            let work = IdleSweep {
                server: self.clone(),
                idle,
            };
            let periodic = PeriodicConfig::new(name, interval).with_initial_delay(interval);
            sweeps.push(spawn_periodic(work, periodic, self.inner.shutdown.child_token()));
        }
    }

    /// Accept connections on `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener, tls: Option<TlsAcceptor>) -> Result<()> {
        let local = listener.local_addr()?;
        let scheme = if tls.is_some() { "wss" } else { "ws" };
        info!(addr = %local, scheme = scheme, "Relay listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let tls = tls.clone();
                        connections.spawn(async move { server.accept(stream, peer, tls).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task ended abnormally");
                    }
                }
            }
        }

        while let Ok(Some(_)) =
            tokio::time::timeout(CONNECTION_JOIN_GRACE, connections.join_next()).await
        {}
        connections.shutdown().await;
        info!(addr = %local, "Relay listener stopped");
        Ok(())
    }

    /// Close every client, stop the sweeps and the listeners. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let ids: Vec<String> = self.inner.clients.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id);
        }

        let sweeps: Vec<JoinHandle<()>> = self.inner.sweeps.lock().await.drain(..).collect();
        for sweep in sweeps {
            let _ = sweep.await;
        }
    }

    fn client(&self, server_id: &str) -> Option<Arc<Client>> {
        self.inner
            .clients
            .get(server_id)
            .map(|entry| entry.value().clone())
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) {
        match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => self.handle_connection(stream, peer).await,
                Err(e) => warn!(peer = %peer, error = %e, "TLS handshake failed"),
            },
            None => self.handle_connection(stream, peer).await,
        }
    }

    async fn handle_connection<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer = %peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        info!(peer = %peer, "Client connected");

        let (mut sink, mut source) = ws.split();
        let registration = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            first = tokio::time::timeout(self.inner.config.registration_timeout, first_text(&mut source)) => first,
        };

        let server_id = match registration {
            Ok(Some(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Register { server_id, .. }) => server_id
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| {
                        warn!(peer = %peer, "Registration without server id");
                        generated_server_id()
                    }),
                Ok(other) => {
                    warn!(peer = %peer, message_type = other.type_name(), "Message before registration");
                    let _ = sink.close().await;
                    return;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Invalid registration frame");
                    let _ = sink.close().await;
                    return;
                }
            },
            Ok(None) => {
                debug!(peer = %peer, "Connection closed before registration");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "Registration timed out, closing connection");
                let _ = sink.close().await;
                return;
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (pongs, _) = watch::channel(0u64);
        let client = Arc::new(Client {
            server_id: server_id.clone(),
            connection_id: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            peer,
            connected_at: Utc::now(),
            outbound,
            token: self.inner.shutdown.child_token(),
            last_activity: StdMutex::new(Instant::now()),
            host_name: StdMutex::new("unknown_host".to_string()),
            received: AtomicU64::new(0),
            pongs,
        });

        if let Some(previous) = self.inner.clients.insert(server_id.clone(), client.clone()) {
            warn!(server_id = %server_id, previous_peer = %previous.peer, "Replacing existing connection");
            previous.close();
        }

        let writer = tokio::spawn(run_writer(sink, outbound_rx, client.token.clone()));
        client.send(&RelayMessage::RegisterAck {
            status: "success".to_string(),
            server_id: Some(server_id.clone()),
            message: Some("registered".to_string()),
            timestamp: now_millis(),
        });
        info!(event = "client_registered", server_id = %server_id, peer = %peer, "Client registered");

        self.read_loop(&client, &mut source).await;

        self.inner
            .clients
            .remove_if(&server_id, |_, current| current.connection_id == client.connection_id);
        client.close();
        if let Err(e) = writer.await {
            warn!(server_id = %server_id, error = %e, "Writer task ended abnormally");
        }
        info!(
            event = "client_disconnected",
            server_id = %server_id,
            host_name = %client.host_name(),
            messages = client.received.load(Ordering::Relaxed),
            "Client disconnected"
        );
    }

    async fn read_loop<S>(&self, client: &Client, source: &mut SplitStream<WebSocketStream<S>>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = client.token.cancelled() => break,
                frame = source.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    client.touch();
                    self.dispatch(client, &text);
                }
                Some(Ok(Message::Pong(_))) => {
                    client.touch();
                    client.pongs.send_modify(|count| *count += 1);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Binary(_))) => client.touch(),
                Some(Ok(Message::Close(frame))) => {
                    debug!(server_id = %client.server_id, frame = ?frame, "Close frame received");
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    debug!(server_id = %client.server_id, error = %e, "Read failed");
                    break;
                }
                None => break,
            }
        }
    }

    fn dispatch(&self, client: &Client, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(server_id = %client.server_id, error = %e, "Invalid message");
                return;
            }
        };

        match message {
            ClientMessage::Ping { .. } => {
                client.send(&RelayMessage::Pong {
                    timestamp: now_millis(),
                });
            }
            ClientMessage::Heartbeat { .. } => {
                client.send(&RelayMessage::HeartbeatAck {
                    timestamp: now_millis(),
                });
            }
            ClientMessage::Stats(envelope) => self.record_stats(client, &envelope),
            ClientMessage::Summary(envelope) => {
                info!(
                    event = "summary_received",
                    server_id = %client.server_id,
                    host_name = %client.host_name(),
                    data_points = envelope.data["data_points"].as_u64().unwrap_or(0),
                    period_secs = envelope.data["period_seconds"].as_u64().unwrap_or(0),
                    "Summary received"
                );
                client.send(&RelayMessage::SummaryAck {
                    status: Some("success".to_string()),
                    timestamp: now_millis(),
                });
            }
            ClientMessage::CommandResponse(envelope) => {
                info!(
                    event = "command_response",
                    server_id = %client.server_id,
                    command_id = %envelope.data["command_id"].as_str().unwrap_or("unknown"),
                    status = %envelope.data["status"].as_str().unwrap_or("unknown"),
                    "Command response received"
                );
            }
            ClientMessage::Register { .. } => {
                debug!(server_id = %client.server_id, "Repeated registration");
                client.send(&RelayMessage::RegisterAck {
                    status: "success".to_string(),
                    server_id: Some(client.server_id.clone()),
                    message: Some("already registered".to_string()),
                    timestamp: now_millis(),
                });
            }
            ClientMessage::Pong { .. } => debug!(server_id = %client.server_id, "Pong received"),
            ClientMessage::Unknown => {
                warn!(server_id = %client.server_id, "Unknown message type")
            }
        }
    }

    fn record_stats(&self, client: &Client, envelope: &Envelope) {
        let count = client.received.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.inner.total_received.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.total_success.fetch_add(1, Ordering::Relaxed);

        let system = &envelope.data["system"];
        if let Some(host_name) = system["host_name"].as_str() {
            client.set_host_name(host_name);
        }
        let memory_percent = system["docker_memory_percent"]
            .as_f64()
            .or_else(|| system["memory_used_percent"].as_f64())
            .unwrap_or(0.0);
        let containers = envelope.data["containers"].as_array().map_or(0, Vec::len);

        info!(
            event = "stats_received",
            server_id = %client.server_id,
            host_name = %client.host_name(),
            count = count,
            sequence = ?envelope.sequence,
            memory_percent = memory_percent,
            containers = containers,
            "Stats received"
        );

        let every = self.inner.config.stats_log_every;
        if every > 0 && total % every == 0 {
            self.log_aggregate(every);
        }

        client.send(&RelayMessage::StatsAck {
            status: Some("success".to_string()),
            sequence: envelope.sequence,
            data: None,
            timestamp: now_millis(),
        });
    }

    fn log_aggregate(&self, window: u64) {
        let stats = self.stats();
        let since_last = match self.inner.last_report.lock() {
            Ok(mut last) => {
                let elapsed = last.elapsed();
                *last = Instant::now();
                elapsed
            }
            Err(_) => Duration::ZERO,
        };
        let per_minute = if since_last.is_zero() {
            0.0
        } else {
            window as f64 / since_last.as_secs_f64() * 60.0
        };
        let success_rate = if stats.total_received == 0 {
            0.0
        } else {
            stats.total_success as f64 / stats.total_received as f64 * 100.0
        };
        let hosts: Vec<String> = self
            .clients()
            .into_iter()
            .map(|c| format!("{} ({})", c.host_name, c.connected_at.format("%Y-%m-%d %H:%M:%S")))
            .collect();

        info!(
            event = "relay_statistics",
            total_received = stats.total_received,
            success_rate = success_rate,
            messages_per_minute = per_minute,
            connected_clients = stats.connected_clients,
            uptime_minutes = stats.uptime_secs as f64 / 60.0,
            clients = ?hosts,
            "Relay statistics"
        );
    }
}

/// First text frame of a connection, or `None` if it closes first
async fn first_text<S>(source: &mut SplitStream<WebSocketStream<S>>) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Drains the outbound queue into the socket; closes it on cancellation
async fn run_writer<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        debug!(error = %e, "Write failed");
                        token.cancel();
                        return;
                    }
                }
                None => break,
            },
        }
    }

    // Flush whatever was queued before the close, e.g. a final ack
    while let Ok(message) = outbound.try_recv() {
        if sink.send(message).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

/// Identity for agents that register without one: `unknown-NNNN`
fn generated_server_id() -> String {
    let suffix = 1000 + (uuid::Uuid::new_v4().as_u128() % 9000) as u16;
    format!("unknown-{}", suffix)
}

/// Probes clients idle longer than `idle` and drops the silent ones
struct IdleSweep {
    server: RelayServer,
    idle: Duration,
}

#[async_trait]
impl PeriodicWork for IdleSweep {
    async fn run_once(&mut self) -> anyhow::Result<Pace> {
        let idle: Vec<Arc<Client>> = self
            .server
            .inner
            .clients
            .iter()
            .filter(|entry| entry.value().idle_for() > self.idle)
            .map(|entry| entry.value().clone())
            .collect();

        let timeout = self.server.inner.config.pong_timeout;
        let probes = idle.iter().map(|client| async move {
            debug!(server_id = %client.server_id, idle_secs = client.idle_for().as_secs(), "Probing idle client");
            (client, client.probe(timeout).await)
        });

        for (client, alive) in futures_util::future::join_all(probes).await {
            if alive {
                client.touch();
                continue;
            }
            warn!(
                event = "client_dropped",
                server_id = %client.server_id,
                host_name = %client.host_name(),
                "No pong from idle client, closing connection"
            );
            self.server
                .inner
                .clients
                .remove_if(&client.server_id, |_, current| {
                    current.connection_id == client.connection_id
                });
            client.close();
        }

        Ok(Pace::Normal)
    }
}
