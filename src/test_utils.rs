// src/test_utils.rs - In-memory transports for exercising the engine without a server or broker
use crate::{
    error::{ConnectError, PublishError, SubscribeError, WriteError},
    node_map::{NodeBinding, QosLevel},
    sink::{InboundMessage, SinkConfig, SinkSession, SinkTransport},
    source::{
        Credentials, EventSink, KeepAliveError, MonitoredItemId, SourceConfig, SourceEndpoint,
        SourceSession, SourceTransport,
    },
    value::{DataChangeEvent, Value},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// SOURCE
// ============================================================================

#[derive(Default)]
struct MockSourceState {
    unreachable: bool,
    required_password: Option<String>,
    unknown_nodes: HashSet<String>,
    busy: HashMap<String, u32>,
    keep_alive_failures: u32,
    reject_writes: bool,
    writes: Vec<(String, Value)>,
    connects: u32,
    subscribe_calls: u32,
    unsubscribe_calls: u32,
    next_item: u32,
    items: HashMap<u32, String>,
    events: Option<EventSink>,
    alive: Option<CancellationToken>,
}

/// Scriptable OPC UA server
#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<MockSourceState>>,
}

pub struct MockSourceSession {
    state: Arc<Mutex<MockSourceState>>,
    alive: CancellationToken,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    /// Reject every identity except a user with this password
    pub fn require_password(&self, password: &str) {
        lock(&self.state).required_password = Some(password.to_string());
    }

    pub fn add_unknown_node(&self, node_id: &str) {
        lock(&self.state).unknown_nodes.insert(node_id.to_string());
    }

    /// Answer the next `times` subscribe calls for `node_id` with ServerBusy
    pub fn set_busy(&self, node_id: &str, times: u32) {
        lock(&self.state).busy.insert(node_id.to_string(), times);
    }

    /// Answer writes with BadTypeMismatch while set
    pub fn reject_writes(&self, reject: bool) {
        lock(&self.state).reject_writes = reject;
    }

    /// Values written so far, in order
    pub fn writes(&self) -> Vec<(String, Value)> {
        lock(&self.state).writes.clone()
    }

    pub fn fail_keep_alives(&self, times: u32) {
        lock(&self.state).keep_alive_failures = times;
    }

    /// Kill the current session; the next keep-alive reports it gone
    pub fn drop_session(&self) {
        let mut state = lock(&self.state);
        if let Some(alive) = state.alive.take() {
            alive.cancel();
        }
        state.items.clear();
    }

    /// Emit a data change for a monitored node. Returns false if nothing monitors it.
    pub fn emit(&self, node_id: &str, value: Value) -> bool {
        self.emit_event(DataChangeEvent::new(node_id, value))
    }

    pub fn emit_event(&self, event: DataChangeEvent) -> bool {
        let state = lock(&self.state);
        let monitored = state.items.values().any(|id| id == &event.source_node_id);
        match (&state.events, monitored) {
            (Some(events), true) => events.deliver(event),
            _ => false,
        }
    }

    pub fn connect_count(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn subscribe_calls(&self) -> u32 {
        lock(&self.state).subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> u32 {
        lock(&self.state).unsubscribe_calls
    }

    /// Node ids with a live monitored item, sorted
    pub fn monitored_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = lock(&self.state).items.values().cloned().collect();
        nodes.sort();
        nodes
    }
}

#[async_trait]
impl SourceTransport for MockSource {
    type Session = MockSourceSession;

    async fn connect(
        &self,
        _config: &SourceConfig,
        endpoint: &SourceEndpoint,
        events: EventSink,
    ) -> Result<Self::Session, ConnectError> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if state.unreachable {
            return Err(ConnectError::Network(format!("{} unreachable", endpoint.url)));
        }
        if let Some(required) = &state.required_password {
            let accepted = matches!(&endpoint.credentials, Credentials::UserName { password, .. } if password == required);
            if !accepted {
                return Err(ConnectError::Auth("BadUserAccessDenied".to_string()));
            }
        }
        let alive = CancellationToken::new();
        state.alive = Some(alive.clone());
        state.events = Some(events);
        state.items.clear();
        Ok(MockSourceSession {
            state: self.state.clone(),
            alive,
        })
    }
}

#[async_trait]
impl SourceSession for MockSourceSession {
    async fn create_monitored_item(&self, binding: &NodeBinding) -> Result<MonitoredItemId, SubscribeError> {
        let mut state = lock(&self.state);
        state.subscribe_calls += 1;
        if self.alive.is_cancelled() {
            return Err(SubscribeError::SessionUnavailable);
        }
        let node = &binding.source_node_id;
        if state.unknown_nodes.contains(node) {
            return Err(SubscribeError::NodeNotFound(node.clone()));
        }
        if let Some(remaining) = state.busy.get_mut(node) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SubscribeError::ServerBusy("BadTooManyMonitoredItems".to_string()));
            }
        }
        state.next_item += 1;
        let id = state.next_item;
        state.items.insert(id, node.clone());
        Ok(MonitoredItemId {
            subscription_id: 1,
            monitored_item_id: id,
        })
    }

    async fn delete_monitored_item(&self, item: MonitoredItemId) -> Result<(), SubscribeError> {
        let mut state = lock(&self.state);
        state.unsubscribe_calls += 1;
        if self.alive.is_cancelled() {
            return Err(SubscribeError::SessionUnavailable);
        }
        state.items.remove(&item.monitored_item_id);
        Ok(())
    }

    async fn write_value(&self, node_id: &str, value: &Value) -> Result<(), WriteError> {
        let mut state = lock(&self.state);
        if self.alive.is_cancelled() {
            return Err(WriteError::SessionUnavailable);
        }
        if state.unknown_nodes.contains(node_id) {
            return Err(WriteError::NodeNotFound(node_id.to_string()));
        }
        if state.reject_writes {
            return Err(WriteError::Rejected("BadTypeMismatch".to_string()));
        }
        state.writes.push((node_id.to_string(), value.clone()));
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), KeepAliveError> {
        if self.alive.is_cancelled() {
            return Err(KeepAliveError::Fatal("session closed by server".to_string()));
        }
        let mut state = lock(&self.state);
        if state.keep_alive_failures > 0 {
            state.keep_alive_failures -= 1;
            return Err(KeepAliveError::Transient("BadTimeout".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.alive.cancel();
    }
}

// ============================================================================
// SINK
// ============================================================================

/// Message acknowledged by the mock broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Default)]
struct MockSinkState {
    unreachable: bool,
    reject_auth: bool,
    hold_acks: bool,
    connects: u32,
    published: Vec<PublishedMessage>,
    in_flight: HashMap<String, usize>,
    max_in_flight: usize,
    alive: Option<CancellationToken>,
    control: Option<(String, mpsc::Sender<InboundMessage>)>,
}

/// Scriptable MQTT broker
#[derive(Clone, Default)]
pub struct MockSink {
    state: Arc<Mutex<MockSinkState>>,
}

pub struct MockSinkSession {
    state: Arc<Mutex<MockSinkState>>,
    alive: CancellationToken,
}

struct InFlight<'a> {
    state: &'a Mutex<MockSinkState>,
    topic: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = lock(self.state).in_flight.get_mut(&self.topic) {
            *count = count.saturating_sub(1);
        }
    }
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    pub fn reject_auth(&self, reject: bool) {
        lock(&self.state).reject_auth = reject;
    }

    /// Never acknowledge QoS 1/2 publishes while set
    pub fn hold_acks(&self, hold: bool) {
        lock(&self.state).hold_acks = hold;
    }

    /// Broker-initiated close of the current session
    pub fn drop_session(&self) {
        if let Some(alive) = lock(&self.state).alive.take() {
            alive.cancel();
        }
    }

    pub fn connect_count(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.state)
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Deliver a message from another client. Returns false unless the
    /// current session subscribed to `topic`.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let state = lock(&self.state);
        let alive = state.alive.as_ref().is_some_and(|alive| !alive.is_cancelled());
        match &state.control {
            Some((subscribed, inbound)) if alive && subscribed == topic => inbound
                .try_send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.into(),
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Highest number of concurrent publishes seen on any single topic
    pub fn max_in_flight(&self) -> usize {
        lock(&self.state).max_in_flight
    }
}

#[async_trait]
impl SinkTransport for MockSink {
    type Session = MockSinkSession;

    async fn connect(
        &self,
        config: &SinkConfig,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Self::Session, ConnectError> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if state.unreachable {
            return Err(ConnectError::Network(format!("{}:{} unreachable", config.host, config.port)));
        }
        if state.reject_auth {
            return Err(ConnectError::Auth("NotAuthorized".to_string()));
        }
        let alive = CancellationToken::new();
        state.alive = Some(alive.clone());
        state.control = config.control_topic.clone().map(|topic| (topic, inbound));
        Ok(MockSinkSession {
            state: self.state.clone(),
            alive,
        })
    }
}

#[async_trait]
impl SinkSession for MockSinkSession {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel, retain: bool) -> Result<(), PublishError> {
        let hold = {
            let mut state = lock(&self.state);
            if self.alive.is_cancelled() {
                return Err(PublishError::NotConnected);
            }
            let count = state.in_flight.entry(topic.to_string()).or_insert(0);
            *count += 1;
            let seen = *count;
            state.max_in_flight = state.max_in_flight.max(seen);
            state.hold_acks && qos.requires_ack()
        };
        let _in_flight = InFlight {
            state: &self.state,
            topic: topic.to_string(),
        };

        tokio::task::yield_now().await;
        if hold {
            self.alive.cancelled().await;
            return Err(PublishError::NotConnected);
        }
        if self.alive.is_cancelled() {
            return Err(PublishError::NotConnected);
        }
        lock(&self.state).published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn closed(&self) {
        self.alive.cancelled().await;
    }

    async fn disconnect(&self) {
        self.alive.cancel();
    }
}
