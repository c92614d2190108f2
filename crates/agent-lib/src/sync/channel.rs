//! Persistent relay connection
//!
//! [`TransportChannel`] owns the WebSocket link to the relay:
//! - Candidate URL selection (TLS first in `auto` mode) and registration
//! - Sequenced sends with a bounded pending queue while disconnected
//! - Keepalive pings, application heartbeats and an inbound reader per link
//! - Relay commands handled on their own tasks, outside the reader
//! - A single background reconnect driver with deterministic backoff
//!
//! The handle is cheap to clone; all clones share one connection.

use super::error::{ChannelError, ChannelResult};
use super::protocol::{ClientMessage, CommandRequest, PayloadKind, RelayMessage};
use super::queue::{PendingQueue, QueuedMessage, DEFAULT_QUEUE_CAPACITY};
use crate::command::{CommandHandler, RejectingHandler};
use crate::observability::{AgentMetrics, StructuredLogger, TransmissionTotals};
use crate::supervisor::{
    sleep_or_cancel, spawn_periodic, BackoffPolicy, Pace, PeriodicConfig, PeriodicWork,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long link tasks get to finish after cancellation before being aborted
const LINK_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Pause while another caller owns the reconnect guard
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Unacknowledged stats entries kept before the oldest are dropped
const MAX_PENDING_ACKS: usize = 1000;

/// Which relay endpoint(s) to try
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// TLS endpoint first, then plaintext
    Auto,
    Ws,
    Wss,
    /// TLS endpoint on an internal network (same URL shape as `Wss`)
    WssInternal,
    /// Explicit URL, used as-is
    Custom(String),
}

impl ConnectTarget {
    /// Parse a `ws_mode` setting. Returns `None` for unknown modes.
    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(ConnectTarget::Auto),
            "ws" => Some(ConnectTarget::Ws),
            "wss" => Some(ConnectTarget::Wss),
            "wss_internal" => Some(ConnectTarget::WssInternal),
            _ => None,
        }
    }
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registered,
    Reconnecting,
}

impl ConnectionState {
    /// Numeric code exported as the connection-state gauge
    pub fn code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Registered => 2,
            ConnectionState::Reconnecting => 3,
        }
    }
}

/// Configuration for the transport channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Identity announced during registration and stamped on every envelope
    pub server_id: String,
    pub target: ConnectTarget,
    /// Relay host for the non-custom targets
    pub host: String,
    pub ws_port: u16,
    pub wss_port: u16,
    /// URL path of the monitoring endpoint
    pub path: String,
    /// Verify relay certificates on TLS connections
    pub ssl_verify: bool,
    pub connect_timeout: Duration,
    pub register_timeout: Duration,
    pub keepalive_interval: Duration,
    pub pong_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            target: ConnectTarget::Auto,
            host: "localhost".to_string(),
            ws_port: 8080,
            wss_port: 4443,
            path: "/ws/monitoring/".to_string(),
            ssl_verify: true,
            connect_timeout: Duration::from_secs(10),
            register_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(45),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(1024)),
        }
    }
}

impl ChannelConfig {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.ws_port, self.path)
    }

    pub fn wss_url(&self) -> String {
        format!("wss://{}:{}{}", self.host, self.wss_port, self.path)
    }

    /// URLs to try, in priority order
    pub fn candidate_urls(&self) -> Vec<String> {
        match &self.target {
            ConnectTarget::Auto => vec![self.wss_url(), self.ws_url()],
            ConnectTarget::Ws => vec![self.ws_url()],
            ConnectTarget::Wss | ConnectTarget::WssInternal => vec![self.wss_url()],
            ConnectTarget::Custom(url) => vec![url.clone()],
        }
    }

    /// Human-readable description of the relay target for startup logs
    pub fn describe_target(&self) -> String {
        self.candidate_urls().join(" | ")
    }
}

/// Point-in-time view of the channel, served on the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub last_sequence: u64,
    pub pending_messages: usize,
    pub pending_acks: usize,
    pub reconnect_attempts: u32,
}

/// Tasks bound to one registered link
struct LinkTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

enum ReconnectOutcome {
    Connected,
    Failed,
    Busy,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
}

struct Inner {
    config: ChannelConfig,
    handler: Arc<dyn CommandHandler>,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<WsSink>>,
    /// Also serializes sequenced writes so flushes and live sends never interleave
    queue: Mutex<PendingQueue>,
    sequence: AtomicU64,
    pending_acks: DashMap<u64, Instant>,
    reconnecting: AtomicBool,
    attempts: AtomicU32,
    generation: AtomicU64,
    pongs: watch::Sender<u64>,
    link: Mutex<Option<LinkTasks>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// In-flight relay commands; they outlive the link they arrived on
    commands: Mutex<Vec<JoinHandle<()>>>,
    active_url: RwLock<Option<String>>,
    shutdown: CancellationToken,
    counters: Counters,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

/// Handle to the relay connection
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Inner>,
}

impl TransportChannel {
    pub fn new(config: ChannelConfig, handler: Arc<dyn CommandHandler>) -> Self {
        let (pongs, _) = watch::channel(0u64);
        let logger = StructuredLogger::new(config.server_id.clone());
        let queue = PendingQueue::new(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                handler,
                state: RwLock::new(ConnectionState::Disconnected),
                writer: Mutex::new(None),
                queue: Mutex::new(queue),
                sequence: AtomicU64::new(0),
                pending_acks: DashMap::new(),
                reconnecting: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                pongs,
                link: Mutex::new(None),
                driver: Mutex::new(None),
                commands: Mutex::new(Vec::new()),
                active_url: RwLock::new(None),
                shutdown: CancellationToken::new(),
                counters: Counters::default(),
                metrics: AgentMetrics::new(),
                logger,
                config,
            }),
        }
    }

    pub fn builder() -> TransportChannelBuilder {
        TransportChannelBuilder::default()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_registered(&self) -> bool {
        self.state().await == ConnectionState::Registered
    }

    /// Last sequence number handed out (0 before the first send)
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Sequences of queued messages, oldest first
    pub async fn pending_sequences(&self) -> Vec<u64> {
        self.inner.queue.lock().await.sequences()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.inner.pending_acks.len()
    }

    pub async fn active_url(&self) -> Option<String> {
        self.inner.active_url.read().await.clone()
    }

    pub fn totals(&self) -> TransmissionTotals {
        let counters = &self.inner.counters;
        TransmissionTotals {
            total: counters.total.load(Ordering::Relaxed),
            success: counters.success.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            bytes: counters.bytes.load(Ordering::Relaxed),
        }
    }

    pub async fn status(&self) -> ChannelStatus {
        ChannelStatus {
            state: self.state().await,
            server_id: self.inner.config.server_id.clone(),
            url: self.active_url().await,
            last_sequence: self.sequence(),
            pending_messages: self.pending_len().await,
            pending_acks: self.pending_ack_count(),
            reconnect_attempts: self.reconnect_attempts(),
        }
    }

    /// Open a link to the first reachable candidate URL and register.
    ///
    /// Returns false when no candidate registered or the queue flush failed.
    /// A no-op returning false while a reconnect is in flight.
    pub async fn connect(&self) -> bool {
        if !self.acquire_guard() {
            return false;
        }
        self.teardown_link().await;
        let connected = self.connect_inner().await;
        self.release_guard();
        connected
    }

    /// Initial connection with retries on the reconnect backoff schedule.
    ///
    /// `max_retries == 0` retries until shutdown.
    pub async fn establish(&self, max_retries: u32) -> ChannelResult<()> {
        let mut attempt: u32 = 0;
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(ChannelError::ShuttingDown);
            }
            if self.connect().await {
                return Ok(());
            }
            attempt += 1;
            if max_retries > 0 && attempt >= max_retries {
                return Err(ChannelError::RetriesExhausted { attempts: attempt });
            }
            let delay = self.inner.config.backoff.delay(attempt);
            self.inner
                .logger
                .log_reconnect_attempt(attempt, delay.as_secs_f64());
            if !sleep_or_cancel(&self.inner.shutdown, delay).await {
                return Err(ChannelError::ShuttingDown);
            }
        }
    }

    /// Submit a sequenced payload.
    ///
    /// The sequence is assigned here whether the message is written or
    /// queued. Returns true only when the frame was written to a registered
    /// link; otherwise the message waits in the pending queue and a
    /// reconnect is triggered.
    pub async fn send(&self, payload: Value, kind: PayloadKind) -> bool {
        let inner = &self.inner;
        let mut queue = inner.queue.lock().await;

        let sequence = inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = ClientMessage::envelope(kind, &inner.config.server_id, sequence, payload);
        inner.counters.total.fetch_add(1, Ordering::Relaxed);

        if self.state().await != ConnectionState::Registered {
            self.enqueue(&mut queue, QueuedMessage::new(sequence, kind, message));
            drop(queue);
            inner.metrics.inc_send_failures();
            self.ensure_reconnecting().await;
            return false;
        }

        match self.write_message(&message).await {
            Ok(bytes) => {
                drop(queue);
                self.record_delivery(sequence, kind, bytes);
                true
            }
            Err(e) => {
                warn!(
                    sequence = sequence,
                    kind = kind.as_str(),
                    error = %e,
                    "Relay write failed, queueing message"
                );
                inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                inner.metrics.inc_send_failures();
                self.mark_disconnected().await;
                self.enqueue(&mut queue, QueuedMessage::new(sequence, kind, message));
                let queued = queue.len();
                drop(queue);
                self.log_lost_link(queued).await;
                self.ensure_reconnecting().await;
                false
            }
        }
    }

    /// One reconnect attempt: tear down the link, back off, connect.
    ///
    /// Returns false without doing anything when another reconnect is in
    /// flight.
    pub async fn reconnect(&self) -> bool {
        matches!(self.try_reconnect().await, ReconnectOutcome::Connected)
    }

    /// Drop the current link without shutting the channel down
    pub async fn disconnect(&self) {
        self.teardown_link().await;
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Stop the reconnect driver and link tasks, close the link.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let driver = self.inner.driver.lock().await.take();
        if let Some(handle) = driver {
            join_with_grace(handle, LINK_JOIN_GRACE).await;
        }
        let commands = std::mem::take(&mut *self.inner.commands.lock().await);
        for handle in commands {
            join_with_grace(handle, LINK_JOIN_GRACE).await;
        }
        self.teardown_link().await;
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Start the background reconnect driver unless one is already running
    pub async fn ensure_reconnecting(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let mut driver = self.inner.driver.lock().await;
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *driver = Some(tokio::spawn(reconnect_driver(self.clone())));
    }

    async fn drive_reconnect(&self) {
        loop {
            if self.inner.shutdown.is_cancelled() || self.is_registered().await {
                break;
            }
            match self.try_reconnect().await {
                ReconnectOutcome::Connected => break,
                ReconnectOutcome::Failed => {}
                ReconnectOutcome::Busy => {
                    if !sleep_or_cancel(&self.inner.shutdown, BUSY_RETRY_DELAY).await {
                        break;
                    }
                }
            }
        }
    }

    fn acquire_guard(&self) -> bool {
        self.inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release_guard(&self) {
        self.inner.reconnecting.store(false, Ordering::SeqCst);
    }

    async fn try_reconnect(&self) -> ReconnectOutcome {
        if !self.acquire_guard() {
            return ReconnectOutcome::Busy;
        }
        let outcome = self.reconnect_attempt().await;
        self.release_guard();
        outcome
    }

    async fn reconnect_attempt(&self) -> ReconnectOutcome {
        let inner = &self.inner;
        self.set_state(ConnectionState::Reconnecting).await;
        self.teardown_link().await;

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        inner.metrics.set_reconnect_attempts(attempt as i64);
        let delay = inner.config.backoff.delay(attempt);
        inner.logger.log_reconnect_attempt(attempt, delay.as_secs_f64());

        if !sleep_or_cancel(&inner.shutdown, delay).await {
            self.set_state(ConnectionState::Disconnected).await;
            return ReconnectOutcome::Failed;
        }

        if self.connect_inner().await {
            info!(attempts = attempt, "Reconnected to relay");
            ReconnectOutcome::Connected
        } else {
            ReconnectOutcome::Failed
        }
    }

    async fn connect_inner(&self) -> bool {
        self.set_state(ConnectionState::Connecting).await;
        for url in self.inner.config.candidate_urls() {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            match self.open_and_register(&url).await {
                Ok((sink, stream)) => {
                    let installed = self.install_link(url, sink, stream).await;
                    if installed {
                        // any successful registration ends the retry streak
                        self.inner.attempts.store(0, Ordering::SeqCst);
                        self.inner.metrics.set_reconnect_attempts(0);
                    }
                    return installed;
                }
                Err(e) => warn!(url = %url, error = %e, "Relay connection attempt failed"),
            }
        }
        self.set_state(ConnectionState::Disconnected).await;
        false
    }

    async fn open_and_register(&self, url: &str) -> ChannelResult<(WsSink, WsSource)> {
        let config = &self.inner.config;
        let connector = tls_connector(url, config.ssl_verify)?;

        let (socket, _response) = tokio::time::timeout(
            config.connect_timeout,
            connect_async_tls_with_config(url, None, false, connector),
        )
        .await
        .map_err(|_| ChannelError::ConnectTimeout {
            url: url.to_string(),
        })?
        .map_err(|source| ChannelError::Connect {
            url: url.to_string(),
            source,
        })?;

        let (mut sink, mut stream) = socket.split();
        let register = serde_json::to_string(&ClientMessage::register(&config.server_id))?;
        sink.send(Message::Text(register)).await?;

        let ack = tokio::time::timeout(config.register_timeout, first_text_frame(&mut stream))
            .await
            .map_err(|_| ChannelError::RegistrationTimeout)??;

        if !ack.is_register_success() {
            return Err(ChannelError::RegistrationRejected(format!("{:?}", ack)));
        }
        Ok((sink, stream))
    }

    async fn install_link(&self, url: String, sink: WsSink, stream: WsSource) -> bool {
        *self.inner.writer.lock().await = Some(sink);
        *self.inner.active_url.write().await = Some(url.clone());
        self.start_link_tasks(stream).await;

        let mut queue = self.inner.queue.lock().await;
        let backlog = queue.len();
        let flushed = self.flush_locked(&mut queue).await;
        if flushed {
            self.set_state(ConnectionState::Registered).await;
        }
        let remaining = queue.len();
        drop(queue);
        self.inner.metrics.set_pending_queue_depth(remaining as i64);

        if flushed {
            self.inner.logger.log_connection(true, &url, backlog);
            true
        } else {
            warn!(url = %url, remaining = remaining, "Queue flush failed after registration");
            self.teardown_link().await;
            self.set_state(ConnectionState::Disconnected).await;
            false
        }
    }

    /// Write queued messages in FIFO order; on failure the message goes back
    /// to the head of the queue.
    async fn flush_locked(&self, queue: &mut PendingQueue) -> bool {
        while let Some(item) = queue.pop_front() {
            match self.write_message(&item.message).await {
                Ok(bytes) => self.record_delivery(item.sequence, item.kind, bytes),
                Err(e) => {
                    warn!(sequence = item.sequence, error = %e, "Flush write failed");
                    self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                    queue.requeue_front(item);
                    return false;
                }
            }
        }
        true
    }

    fn enqueue(&self, queue: &mut PendingQueue, message: QueuedMessage) {
        if let Some(evicted) = queue.push(message) {
            debug!(sequence = evicted.sequence, "Evicted oldest pending message");
        }
        self.inner.metrics.set_pending_queue_depth(queue.len() as i64);
    }

    fn record_delivery(&self, sequence: u64, kind: PayloadKind, bytes: usize) {
        let inner = &self.inner;
        inner.counters.success.fetch_add(1, Ordering::Relaxed);
        inner.counters.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        inner.metrics.inc_messages_sent();

        if kind == PayloadKind::Stats {
            if inner.pending_acks.len() >= MAX_PENDING_ACKS {
                let oldest = inner.pending_acks.iter().map(|entry| *entry.key()).min();
                if let Some(oldest) = oldest {
                    inner.pending_acks.remove(&oldest);
                }
            }
            inner.pending_acks.insert(sequence, Instant::now());
        }
    }

    async fn write_message(&self, message: &ClientMessage) -> ChannelResult<usize> {
        let text = serde_json::to_string(message)?;
        let bytes = text.len();
        self.write_frame(Message::Text(text)).await?;
        Ok(bytes)
    }

    async fn write_frame(&self, frame: Message) -> ChannelResult<()> {
        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(ChannelError::Closed)?;
        tokio::time::timeout(self.inner.config.write_timeout, sink.send(frame))
            .await
            .map_err(|_| ChannelError::Closed)??;
        Ok(())
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.inner.state.write().await = state;
        self.inner.metrics.set_connection_state(state.code());
    }

    async fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected).await;
        self.inner.writer.lock().await.take();
    }

    async fn log_lost_link(&self, queued: usize) {
        let url = self.active_url().await.unwrap_or_default();
        self.inner.logger.log_connection(false, &url, queued);
    }

    async fn start_link_tasks(&self, stream: WsSource) {
        let config = &self.inner.config;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.inner.shutdown.child_token();

        let reader = tokio::spawn(run_reader(
            self.clone(),
            stream,
            generation,
            token.clone(),
        ));
        let keepalive = spawn_periodic(
            KeepaliveWork {
                channel: self.clone(),
                generation,
            },
            PeriodicConfig::new("keepalive", config.keepalive_interval)
                .with_initial_delay(config.keepalive_interval),
            token.clone(),
        );
        let heartbeat = spawn_periodic(
            HeartbeatWork {
                channel: self.clone(),
                generation,
            },
            PeriodicConfig::new("heartbeat", config.heartbeat_interval)
                .with_initial_delay(config.heartbeat_interval),
            token.clone(),
        );

        let previous = self.inner.link.lock().await.replace(LinkTasks {
            token,
            handles: vec![reader, keepalive, heartbeat],
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }

    /// Cancel and join the link tasks, then close the socket
    async fn teardown_link(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            link.token.cancel();
            for handle in link.handles {
                join_with_grace(handle, LINK_JOIN_GRACE).await;
            }
        }

        let sink = self.inner.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
        }
    }

    /// Called by a link task when its link is no longer usable
    async fn link_failed(&self, generation: u64, reason: &str) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let was_registered = {
            let mut state = self.inner.state.write().await;
            let registered = *state == ConnectionState::Registered;
            if registered {
                *state = ConnectionState::Disconnected;
            }
            registered
        };
        self.inner.writer.lock().await.take();

        if was_registered {
            self.inner
                .metrics
                .set_connection_state(ConnectionState::Disconnected.code());
            warn!(reason = %reason, "Relay link failed");
            let queued = self.pending_len().await;
            self.log_lost_link(queued).await;
        }
        self.ensure_reconnecting().await;
    }

    /// Handle a relay command off the reader task; the reader must keep
    /// consuming pongs and acks. A response finished after the link dropped
    /// is queued by `send`.
    async fn spawn_command(&self, request: CommandRequest) {
        let channel = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = channel.run_command(request) => {}
            }
        });

        let mut commands = self.inner.commands.lock().await;
        commands.retain(|handle| !handle.is_finished());
        commands.push(handle);
    }

    async fn run_command(&self, request: CommandRequest) {
        let command = request.command.clone();
        let response = self.inner.handler.handle(request).await;
        match serde_json::to_value(&response) {
            Ok(payload) => {
                let delivered = self.send(payload, PayloadKind::CommandResponse).await;
                debug!(command = %command, delivered = delivered, "Command handled");
            }
            Err(e) => warn!(command = %command, error = %e, "Failed to encode command response"),
        }
    }

    async fn dispatch(&self, text: &str) {
        let message: RelayMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable relay message");
                return;
            }
        };

        let acked = message.acked_sequence();
        match message {
            RelayMessage::Command { data } => self.spawn_command(data).await,
            RelayMessage::Ping { .. } => {
                if let Err(e) = self.write_message(&ClientMessage::pong()).await {
                    debug!(error = %e, "Failed to answer relay ping");
                }
            }
            RelayMessage::StatsAck { .. } => {
                if let Some(sequence) = acked {
                    self.inner.pending_acks.remove(&sequence);
                }
            }
            RelayMessage::Unknown => debug!("Ignoring relay message of unknown type"),
            other => debug!(kind = other.type_name(), "Relay message"),
        }
    }
}

/// Boxed so the link tasks that trigger reconnects do not make the driver's
/// future type recursive.
fn reconnect_driver(channel: TransportChannel) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move { channel.drive_reconnect().await })
}

/// Wait for the registration reply, skipping control frames
async fn first_text_frame(stream: &mut WsSource) -> ChannelResult<RelayMessage> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(_) => return Err(ChannelError::Closed),
            _ => continue,
        }
    }
    Err(ChannelError::Closed)
}

async fn run_reader(
    channel: TransportChannel,
    mut stream: WsSource,
    generation: u64,
    token: CancellationToken,
) {
    let read_timeout = channel.inner.config.read_timeout;
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };

        let frame = match next {
            // idle link, keepalive decides liveness
            Err(_) => continue,
            Ok(None) => {
                channel.link_failed(generation, "connection closed").await;
                return;
            }
            Ok(Some(Err(e))) => {
                channel.link_failed(generation, &e.to_string()).await;
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = channel.dispatch(&text) => {}
                }
            }
            Message::Pong(_) => channel.inner.pongs.send_modify(|count| *count += 1),
            Message::Close(close) => {
                debug!(frame = ?close, "Relay closed the connection");
                channel.link_failed(generation, "close frame").await;
                return;
            }
            _ => {}
        }
    }
}

/// WebSocket ping with a bounded wait for the pong
struct KeepaliveWork {
    channel: TransportChannel,
    generation: u64,
}

#[async_trait]
impl PeriodicWork for KeepaliveWork {
    async fn run_once(&mut self) -> anyhow::Result<Pace> {
        let inner = &self.channel.inner;
        let mut pongs = inner.pongs.subscribe();
        let before = *pongs.borrow_and_update();

        if let Err(e) = self.channel.write_frame(Message::Ping(Vec::new())).await {
            self.channel
                .link_failed(self.generation, &format!("ping failed: {e}"))
                .await;
            return Ok(Pace::Stop);
        }

        let answered = matches!(
            tokio::time::timeout(inner.config.pong_timeout, pongs.wait_for(|n| *n > before)).await,
            Ok(Ok(_))
        );
        if !answered {
            self.channel.link_failed(self.generation, "pong timeout").await;
            return Ok(Pace::Stop);
        }
        Ok(Pace::Normal)
    }
}

/// Application-level heartbeat frame
struct HeartbeatWork {
    channel: TransportChannel,
    generation: u64,
}

#[async_trait]
impl PeriodicWork for HeartbeatWork {
    async fn run_once(&mut self) -> anyhow::Result<Pace> {
        let heartbeat = ClientMessage::heartbeat(self.channel.server_id());
        if let Err(e) = self.channel.write_message(&heartbeat).await {
            self.channel
                .link_failed(self.generation, &format!("heartbeat failed: {e}"))
                .await;
            return Ok(Pace::Stop);
        }
        Ok(Pace::Normal)
    }
}

async fn join_with_grace(mut handle: JoinHandle<()>, grace: Duration) {
    tokio::select! {
        _ = &mut handle => {}
        _ = tokio::time::sleep(grace) => {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// TLS connector for `url`; `None` for plaintext
fn tls_connector(url: &str, ssl_verify: bool) -> ChannelResult<Option<Connector>> {
    let parsed = url::Url::parse(url).map_err(|e| ChannelError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "ws" => Ok(None),
        "wss" => {
            let host = parsed.host_str().unwrap_or_default();
            let config = if ssl_verify && !is_loopback(host) {
                verified_client_config()
            } else {
                insecure_client_config()
            };
            Ok(Some(Connector::Rustls(Arc::new(config))))
        }
        other => Err(ChannelError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

fn verified_client_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Accepts any server certificate; used when verification is disabled
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Builder for [`TransportChannel`]
#[derive(Default)]
pub struct TransportChannelBuilder {
    config: ChannelConfig,
    server_id: Option<String>,
    handler: Option<Arc<dyn CommandHandler>>,
}

impl TransportChannelBuilder {
    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn target(mut self, target: ConnectTarget) -> Self {
        self.config.target = target;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn ports(mut self, ws_port: u16, wss_port: u16) -> Self {
        self.config.ws_port = ws_port;
        self.config.wss_port = wss_port;
        self
    }

    pub fn ssl_verify(mut self, verify: bool) -> Self {
        self.config.ssl_verify = verify;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn command_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Replace every setting except the server id and handler
    pub fn config(mut self, config: ChannelConfig) -> Self {
        if self.server_id.is_none() && !config.server_id.is_empty() {
            self.server_id = Some(config.server_id.clone());
        }
        self.config = config;
        self
    }

    pub fn build(self) -> anyhow::Result<TransportChannel> {
        let server_id = self
            .server_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("server_id is required"))?;
        if self.config.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(RejectingHandler) as Arc<dyn CommandHandler>);

        let mut config = self.config;
        config.server_id = server_id;
        Ok(TransportChannel::new(config, handler))
    }
}
