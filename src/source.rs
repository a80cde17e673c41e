// src/source.rs - OPC UA side of the bridge: session lifecycle and monitored items
//
// The protocol itself sits behind `SourceTransport`/`SourceSession` so the
// state machine can be driven by the real client (feature `opcua-support`)
// or by the in-memory transport in `test_utils`.

use crate::{
    error::{ConnectError, SubscribeError, WriteError},
    node_map::NodeBinding,
    reconnect::{BackoffPolicy, ConnectOutcome, ReconnectSupervisor},
    status::{bump, Component, ConnectionState, SourceLink, StatusBoard},
    value::{DataChangeEvent, Value},
};
use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection settings for the OPC UA server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// e.g. `opc.tcp://plc.local:4840`
    pub endpoint_url: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Consecutive keep-alive failures before the session is declared lost
    #[serde(default = "default_max_failed_keep_alives")]
    pub max_failed_keep_alives: u32,
    /// Publishing interval of the OPC UA subscription that holds the monitored items
    #[serde(default = "default_publishing_interval_ms")]
    pub publishing_interval_ms: u64,
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_keep_alive_interval_ms() -> u64 { 5_000 }
fn default_max_failed_keep_alives() -> u32 { 3 }
fn default_publishing_interval_ms() -> u64 { 1_000 }
fn default_application_name() -> String { "petra-bridge".to_string() }

impl SourceConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            credentials: Credentials::Anonymous,
            connect_timeout_ms: default_connect_timeout_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            max_failed_keep_alives: default_max_failed_keep_alives(),
            publishing_interval_ms: default_publishing_interval_ms(),
            application_name: default_application_name(),
        }
    }

    pub fn endpoint(&self) -> SourceEndpoint {
        SourceEndpoint {
            url: self.endpoint_url.clone(),
            credentials: self.credentials.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

/// Identity presented to the server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    #[default]
    Anonymous,
    UserName { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::UserName { username, .. } => {
                f.debug_struct("UserName").field("username", username).finish_non_exhaustive()
            }
        }
    }
}

/// Where and as whom to connect; swapped as a unit by `reconfigure`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEndpoint {
    pub url: String,
    pub credentials: Credentials,
}

/// Server-side identity of one monitored item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitoredItemId {
    pub subscription_id: u32,
    pub monitored_item_id: u32,
}

/// Correlates a monitored item to its binding.
///
/// Only valid for the session epoch it was created in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub epoch: u64,
    pub item: MonitoredItemId,
    pub source_node_id: String,
}

/// Keep-alive outcome reported by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveError {
    /// Read failed but the session may recover
    Transient(String),
    /// Session is gone
    Fatal(String),
}

/// Entry point for data-change notifications coming from the protocol layer.
///
/// Delivery never blocks: when the engine falls behind and the channel is
/// full the event is dropped and counted.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DataChangeEvent>,
    sequence: Arc<AtomicU64>,
    board: Arc<StatusBoard>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<DataChangeEvent>, board: Arc<StatusBoard>) -> Self {
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
            board,
        }
    }

    /// Stamp the intake sequence and hand the event to the engine.
    ///
    /// Returns false if the event was dropped.
    pub fn deliver(&self, mut event: DataChangeEvent) -> bool {
        event.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        bump!(self.board.counters, events_received);
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                bump!(self.board.counters, events_dropped_channel_full);
                debug!(node = %event.source_node_id, "Event channel full, dropping data change");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}

/// Factory for OPC UA sessions
#[async_trait]
pub trait SourceTransport: Send + Sync + 'static {
    type Session: SourceSession;

    /// Open a session. Data changes of items created on it go to `events`.
    async fn connect(
        &self,
        config: &SourceConfig,
        endpoint: &SourceEndpoint,
        events: EventSink,
    ) -> Result<Self::Session, ConnectError>;
}

/// One live OPC UA session
#[async_trait]
pub trait SourceSession: Send + Sync + 'static {
    async fn create_monitored_item(&self, binding: &NodeBinding) -> Result<MonitoredItemId, SubscribeError>;

    async fn delete_monitored_item(&self, item: MonitoredItemId) -> Result<(), SubscribeError>;

    /// Write the value attribute of `node_id`
    async fn write_value(&self, node_id: &str, value: &Value) -> Result<(), WriteError>;

    /// Cheap liveness check, called every keep-alive interval
    async fn keep_alive(&self) -> Result<(), KeepAliveError>;

    async fn disconnect(&self);
}

struct ActiveSession<S> {
    epoch: u64,
    session: S,
}

enum SessionEnd {
    Lost(String),
    Cancelled,
}

/// Owns the OPC UA session and its monitored items.
///
/// `run` drives the state machine
/// `Disconnected -> Connecting -> Connected <-> Degraded -> Disconnected`
/// and publishes every transition to the status board together with the
/// session epoch.
pub struct SourceConnection<T: SourceTransport> {
    transport: T,
    config: SourceConfig,
    backoff: BackoffPolicy,
    endpoint: ArcSwap<SourceEndpoint>,
    session: ArcSwapOption<ActiveSession<T::Session>>,
    epoch: AtomicU64,
    reconfigured: Notify,
    events: EventSink,
    board: Arc<StatusBoard>,
}

impl<T: SourceTransport> SourceConnection<T> {
    pub fn new(
        transport: T,
        config: SourceConfig,
        backoff: BackoffPolicy,
        events: EventSink,
        board: Arc<StatusBoard>,
    ) -> Self {
        let endpoint = config.endpoint();
        Self {
            transport,
            config,
            backoff,
            endpoint: ArcSwap::from_pointee(endpoint),
            session: ArcSwapOption::empty(),
            epoch: AtomicU64::new(0),
            reconfigured: Notify::new(),
            events,
            board,
        }
    }

    pub fn link(&self) -> SourceLink {
        self.board.source()
    }

    pub fn endpoint(&self) -> Arc<SourceEndpoint> {
        self.endpoint.load_full()
    }

    /// Replace endpoint and credentials.
    ///
    /// Takes effect on the next connect attempt and wakes a connection that
    /// stopped retrying after an authentication failure.
    pub fn reconfigure(&self, endpoint: SourceEndpoint) {
        info!(url = %endpoint.url, "Source endpoint reconfigured");
        self.endpoint.store(Arc::new(endpoint));
        self.reconfigured.notify_one();
    }

    fn set_state(&self, state: ConnectionState) {
        self.board.set_source(SourceLink {
            state,
            epoch: self.epoch.load(Ordering::SeqCst),
        });
    }

    async fn connect_once(&self, endpoint: &SourceEndpoint) -> Result<T::Session, ConnectError> {
        let timeout = self.config.connect_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.transport.connect(&self.config, endpoint, self.events.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Network(format!(
                "connect to {} timed out after {} ms",
                endpoint.url,
                timeout.as_millis()
            ))),
        };
        if let Err(e) = &result {
            self.board.record_error(Component::Source, e.to_string());
        }
        result
    }

    /// Drive the connection until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut supervisor = ReconnectSupervisor::new("source", self.backoff.clone());

        loop {
            self.set_state(ConnectionState::Connecting);
            let endpoint = self.endpoint.load_full();
            info!(url = %endpoint.url, "Connecting to OPC UA server");

            match supervisor
                .connect_with_backoff(&cancel, || self.connect_once(&endpoint))
                .await
            {
                ConnectOutcome::Connected(session) => {
                    let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let active = Arc::new(ActiveSession { epoch, session });
                    self.session.store(Some(active.clone()));
                    self.board.clear_error(Component::Source);
                    self.set_state(ConnectionState::Connected);
                    info!(url = %endpoint.url, epoch, "OPC UA session established");

                    let end = self.supervise(&active, &mut supervisor, &cancel).await;

                    // Handles from this epoch are dead from here on
                    self.session.store(None);
                    self.set_state(ConnectionState::Disconnected);
                    supervisor.on_disconnected(Instant::now());
                    if tokio::time::timeout(self.config.connect_timeout(), active.session.disconnect())
                        .await
                        .is_err()
                    {
                        debug!(epoch, "Session disconnect did not complete in time");
                    }

                    match end {
                        SessionEnd::Cancelled => return,
                        SessionEnd::Lost(reason) => {
                            warn!(epoch, %reason, "OPC UA session lost");
                            self.board.record_error(Component::Source, reason);
                            if !supervisor.wait(&cancel).await {
                                return;
                            }
                        }
                    }
                }
                ConnectOutcome::Failed(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    error!(url = %endpoint.url, error = %e, "OPC UA connect rejected, waiting for reconfiguration");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.reconfigured.notified() => {
                            supervisor.reset();
                        }
                    }
                }
                ConnectOutcome::Cancelled => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    async fn supervise(
        &self,
        active: &ActiveSession<T::Session>,
        supervisor: &mut ReconnectSupervisor,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let interval = self.config.keep_alive_interval();
        let max_failures = self.config.max_failed_keep_alives.max(1);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = ticker.tick() => {}
            }
            supervisor.observe_stable(Instant::now());

            let outcome = match tokio::time::timeout(interval, active.session.keep_alive()).await {
                Ok(result) => result,
                Err(_) => Err(KeepAliveError::Transient("keep-alive timed out".to_string())),
            };
            match outcome {
                Ok(()) => {
                    if failures > 0 {
                        info!(epoch = active.epoch, failures, "Keep-alive recovered");
                        failures = 0;
                        self.set_state(ConnectionState::Connected);
                    }
                }
                Err(KeepAliveError::Fatal(reason)) => return SessionEnd::Lost(reason),
                Err(KeepAliveError::Transient(reason)) => {
                    failures += 1;
                    warn!(epoch = active.epoch, failures, max_failures, %reason, "Keep-alive failed");
                    if failures >= max_failures {
                        return SessionEnd::Lost(format!(
                            "{failures} consecutive keep-alive failures: {reason}"
                        ));
                    }
                    self.set_state(ConnectionState::Degraded);
                }
            }
        }
    }

    /// Register a monitored item for `binding` on the current session
    pub async fn subscribe(&self, binding: &NodeBinding) -> Result<SubscriptionHandle, SubscribeError> {
        let active = self.session.load_full().ok_or(SubscribeError::SessionUnavailable)?;
        let item = active.session.create_monitored_item(binding).await?;
        debug!(node = %binding.source_node_id, epoch = active.epoch, ?item, "Monitored item created");
        Ok(SubscriptionHandle {
            epoch: active.epoch,
            item,
            source_node_id: binding.source_node_id.clone(),
        })
    }

    /// Write a value to a node on the current session
    pub async fn write(&self, node_id: &str, value: &Value) -> Result<(), WriteError> {
        let active = self.session.load_full().ok_or(WriteError::SessionUnavailable)?;
        active.session.write_value(node_id, value).await?;
        info!(node = node_id, epoch = active.epoch, value = %value, "Value written to source");
        Ok(())
    }

    /// Delete a monitored item. Best-effort: failures are only logged.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        match self.session.load_full() {
            Some(active) if active.epoch == handle.epoch => {
                if let Err(e) = active.session.delete_monitored_item(handle.item).await {
                    warn!(node = %handle.source_node_id, error = %e, "Failed to delete monitored item");
                }
            }
            _ => debug!(node = %handle.source_node_id, epoch = handle.epoch, "Handle belongs to a closed session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ConnectionState;
    use crate::test_utils::{eventually, MockSource};
    use crate::value::Value;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter: 0.0,
            min_stable_ms: 10_000,
        }
    }

    fn config() -> SourceConfig {
        SourceConfig {
            keep_alive_interval_ms: 20,
            ..SourceConfig::new("opc.tcp://test:4840")
        }
    }

    fn connection(
        mock: &MockSource,
        config: SourceConfig,
    ) -> (Arc<SourceConnection<MockSource>>, Arc<StatusBoard>, mpsc::Receiver<DataChangeEvent>) {
        let board = Arc::new(StatusBoard::new(10));
        let (tx, rx) = mpsc::channel(16);
        let events = EventSink::new(tx, board.clone());
        let conn = Arc::new(SourceConnection::new(mock.clone(), config, fast_backoff(), events, board.clone()));
        (conn, board, rx)
    }

    #[tokio::test]
    async fn test_connect_subscribe_and_receive() {
        let mock = MockSource::new();
        let (conn, board, mut rx) = connection(&mock, config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(conn.clone().run(cancel.clone()));

        assert!(eventually(Duration::from_secs(2), || board.source().state == ConnectionState::Connected).await);
        let handle = conn.subscribe(&NodeBinding::new("ns=2;i=100", "t")).await.unwrap();
        assert_eq!(handle.epoch, 1);

        assert!(mock.emit("ns=2;i=100", Value::Float(21.0)));
        assert!(mock.emit("ns=2;i=100", Value::Float(21.5)));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.sequence < second.sequence);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(board.source().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_without_session() {
        let mock = MockSource::new();
        let (conn, _, _rx) = connection(&mock, config());
        let err = conn.subscribe(&NodeBinding::new("ns=2;i=1", "t")).await.unwrap_err();
        assert_eq!(err, SubscribeError::SessionUnavailable);
        let err = conn.write("ns=2;i=1", &Value::Int(1)).await.unwrap_err();
        assert_eq!(err, WriteError::SessionUnavailable);
    }

    #[tokio::test]
    async fn test_write_on_current_session() {
        let mock = MockSource::new();
        mock.add_unknown_node("ns=2;i=404");
        let (conn, board, _rx) = connection(&mock, config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(conn.clone().run(cancel.clone()));
        assert!(eventually(Duration::from_secs(2), || board.source().state == ConnectionState::Connected).await);

        conn.write("ns=2;s=Line1.Setpoint", &Value::Float(80.0)).await.unwrap();
        assert_eq!(mock.writes(), vec![("ns=2;s=Line1.Setpoint".to_string(), Value::Float(80.0))]);
        assert_eq!(
            conn.write("ns=2;i=404", &Value::Int(1)).await.unwrap_err(),
            WriteError::NodeNotFound("ns=2;i=404".into())
        );

        mock.reject_writes(true);
        assert!(matches!(
            conn.write("ns=2;s=Line1.Setpoint", &Value::Float(81.0)).await,
            Err(WriteError::Rejected(_))
        ));
        assert_eq!(mock.writes().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_failures_degrade_then_disconnect() {
        let mock = MockSource::new();
        let (conn, board, _rx) = connection(&mock, config());
        let cancel = CancellationToken::new();
        let mut states = board.watch_source();
        let task = tokio::spawn(conn.clone().run(cancel.clone()));

        assert!(eventually(Duration::from_secs(2), || board.source().state == ConnectionState::Connected).await);
        mock.fail_keep_alives(3);

        let mut seen_degraded = false;
        loop {
            states.changed().await.unwrap();
            let link = *states.borrow();
            if link.state == ConnectionState::Degraded {
                seen_degraded = true;
            }
            if link.state == ConnectionState::Disconnected {
                break;
            }
        }
        assert!(seen_degraded);

        // Reconnects with a new epoch
        assert!(eventually(Duration::from_secs(2), || board.source().epoch == 2
            && board.source().state == ConnectionState::Connected)
        .await);
        assert_eq!(mock.connect_count(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_handle_unsubscribe_is_noop() {
        let mock = MockSource::new();
        let (conn, board, _rx) = connection(&mock, config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(conn.clone().run(cancel.clone()));

        assert!(eventually(Duration::from_secs(2), || board.source().state == ConnectionState::Connected).await);
        let handle = conn.subscribe(&NodeBinding::new("ns=2;i=1", "t")).await.unwrap();

        mock.drop_session();
        assert!(eventually(Duration::from_secs(2), || board.source().epoch == 2
            && board.source().state == ConnectionState::Connected)
        .await);

        conn.unsubscribe(&handle).await;
        assert_eq!(mock.unsubscribe_calls(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_parks_until_reconfigured() {
        let mock = MockSource::new();
        mock.require_password("secret");
        let (conn, board, _rx) = connection(&mock, config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(conn.clone().run(cancel.clone()));

        assert!(eventually(Duration::from_secs(2), || mock.connect_count() == 1
            && board.source().state == ConnectionState::Disconnected)
        .await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.connect_count(), 1, "auth failures must not be retried");
        assert!(board.snapshot().last_error(Component::Source).is_some());

        conn.reconfigure(SourceEndpoint {
            url: "opc.tcp://test:4840".into(),
            credentials: Credentials::UserName {
                username: "bridge".into(),
                password: "secret".into(),
            },
        });
        assert!(eventually(Duration::from_secs(2), || board.source().state == ConnectionState::Connected).await);
        assert!(board.snapshot().last_error(Component::Source).is_none());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let board = Arc::new(StatusBoard::new(10));
        let (tx, _rx) = mpsc::channel(1);
        let sink = EventSink::new(tx, board.clone());

        assert!(sink.deliver(DataChangeEvent::new("a", Value::Int(1))));
        assert!(!sink.deliver(DataChangeEvent::new("a", Value::Int(2))));
        let counters = board.counters.snapshot();
        assert_eq!(counters.events_received, 2);
        assert_eq!(counters.events_dropped_channel_full, 1);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::UserName {
            username: "op".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
