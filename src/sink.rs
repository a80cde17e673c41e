// src/sink.rs - MQTT side of the bridge: session lifecycle and acknowledged publish
use crate::{
    error::{ConnectError, PublishError},
    node_map::QosLevel,
    reconnect::{BackoffPolicy, ConnectOutcome, ReconnectSupervisor},
    status::{Component, ConnectionState, StatusBoard},
};
use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Generated as `petra-bridge-<uuid>` when left empty
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Retained online/offline announcements; `None` disables the last will
    #[serde(default = "default_status_topic")]
    pub status_topic: Option<String>,
    /// Write commands arrive here; results go to `<control_topic>/result`
    /// and binding-update confirmations to `<control_topic>/config`
    #[serde(default)]
    pub control_topic: Option<String>,
}

fn default_port() -> u16 { 1883 }
fn default_client_id() -> String { format!("petra-bridge-{}", uuid::Uuid::new_v4().simple()) }
fn default_keep_alive_secs() -> u64 { 60 }
fn default_ack_timeout_ms() -> u64 { 5_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_true() -> bool { true }
fn default_status_topic() -> Option<String> { Some("petra-bridge/status".to_string()) }

impl SinkConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            ack_timeout_ms: default_ack_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            clean_session: true,
            status_topic: default_status_topic(),
            control_topic: None,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Payload of the retained status announcement
pub fn status_payload(online: bool) -> Bytes {
    let status = if online { "online" } else { "offline" };
    Bytes::from(serde_json::json!({ "status": status }).to_string())
}

/// Messages buffered between a session and the control task
const INBOUND_CAPACITY: usize = 64;

/// Message received on the control topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Factory for broker sessions
#[async_trait]
pub trait SinkTransport: Send + Sync + 'static {
    type Session: SinkSession;

    /// Open a session. When `config.control_topic` is set the session
    /// subscribes to it and forwards what arrives to `inbound`.
    async fn connect(
        &self,
        config: &SinkConfig,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Self::Session, ConnectError>;
}

/// One live broker session
#[async_trait]
pub trait SinkSession: Send + Sync + 'static {
    /// Resolves once the message is handed over (QoS 0) or acknowledged (QoS 1/2)
    async fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel, retain: bool) -> Result<(), PublishError>;

    /// Resolves when the broker or the network ends the session
    async fn closed(&self);

    async fn disconnect(&self);
}

/// Owns the broker session.
///
/// At most one QoS 1/2 publish is in flight per topic, so acknowledgements
/// arrive in send order.
pub struct SinkConnection<T: SinkTransport> {
    transport: T,
    config: ArcSwap<SinkConfig>,
    backoff: BackoffPolicy,
    session: ArcSwapOption<T::Session>,
    topic_locks: DashMap<String, Arc<Mutex<()>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<InboundMessage>>>,
    reconfigured: Notify,
    board: Arc<StatusBoard>,
}

impl<T: SinkTransport> SinkConnection<T> {
    pub fn new(transport: T, config: SinkConfig, backoff: BackoffPolicy, board: Arc<StatusBoard>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            transport,
            config: ArcSwap::from_pointee(config),
            backoff,
            session: ArcSwapOption::empty(),
            topic_locks: DashMap::new(),
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            reconfigured: Notify::new(),
            board,
        }
    }

    pub fn config(&self) -> Arc<SinkConfig> {
        self.config.load_full()
    }

    /// Receiver for control-topic messages of every session. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Drop per-topic locks for topics `keep` rejects, unless a publish holds one.
    ///
    /// Returns the number of locks removed.
    pub fn retain_topics(&self, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.topic_locks.len();
        self.topic_locks
            .retain(|topic, lock| keep(topic) || Arc::strong_count(lock) > 1);
        before.saturating_sub(self.topic_locks.len())
    }

    pub fn topic_lock_count(&self) -> usize {
        self.topic_locks.len()
    }

    pub fn state(&self) -> ConnectionState {
        self.board.sink()
    }

    pub fn is_connected(&self) -> bool {
        self.session.load().is_some()
    }

    /// Replace broker settings; wakes a connection parked on rejected credentials
    pub fn reconfigure(&self, config: SinkConfig) {
        info!(host = %config.host, port = config.port, "Sink reconfigured");
        self.config.store(Arc::new(config));
        self.reconfigured.notify_one();
    }

    /// Publish one message on the current session
    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel, retain: bool) -> Result<(), PublishError> {
        let session = self.session.load_full().ok_or(PublishError::NotConnected)?;
        let ack_timeout = self.config.load().ack_timeout();

        if !qos.requires_ack() {
            return match tokio::time::timeout(ack_timeout, session.publish(topic, payload, qos, retain)).await {
                Ok(result) => result,
                Err(_) => Err(PublishError::Timeout(ack_timeout.as_millis() as u64)),
            };
        }

        let lock = self.topic_locks.entry(topic.to_string()).or_default().clone();
        let _in_flight = lock.lock().await;
        match tokio::time::timeout(ack_timeout, session.publish(topic, payload, qos, retain)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(topic, ?qos, "No acknowledgement within {} ms", ack_timeout.as_millis());
                Err(PublishError::Timeout(ack_timeout.as_millis() as u64))
            }
        }
    }

    async fn connect_once(&self) -> Result<T::Session, ConnectError> {
        let config = self.config.load_full();
        let timeout = config.connect_timeout();
        let result = match tokio::time::timeout(timeout, self.transport.connect(&config, self.inbound_tx.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Network(format!(
                "connect to {}:{} timed out after {} ms",
                config.host,
                config.port,
                timeout.as_millis()
            ))),
        };
        if let Err(e) = &result {
            self.board.record_error(Component::Sink, e.to_string());
        }
        result
    }

    /// Drive the connection until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut supervisor = ReconnectSupervisor::new("sink", self.backoff.clone());

        loop {
            self.board.set_sink(ConnectionState::Connecting);
            match supervisor.connect_with_backoff(&cancel, || self.connect_once()).await {
                ConnectOutcome::Connected(session) => {
                    let session = Arc::new(session);
                    self.session.store(Some(session.clone()));
                    self.board.clear_error(Component::Sink);
                    self.board.set_sink(ConnectionState::Connected);
                    {
                        let config = self.config.load();
                        info!(host = %config.host, port = config.port, client_id = %config.client_id, "MQTT session established");
                    }

                    let cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = session.closed() => false,
                    };

                    self.session.store(None);
                    self.board.set_sink(ConnectionState::Disconnected);
                    supervisor.on_disconnected(Instant::now());

                    if cancelled {
                        session.disconnect().await;
                        info!("MQTT session closed");
                        return;
                    }
                    warn!("MQTT session lost");
                    self.board.record_error(Component::Sink, "session closed by broker or network");
                    if !supervisor.wait(&cancel).await {
                        return;
                    }
                }
                ConnectOutcome::Failed(e) => {
                    self.board.set_sink(ConnectionState::Disconnected);
                    error!(error = %e, "MQTT connect rejected, waiting for reconfiguration");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.reconfigured.notified() => supervisor.reset(),
                    }
                }
                ConnectOutcome::Cancelled => {
                    self.board.set_sink(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }
}
