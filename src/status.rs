// src/status.rs - Shared status board read by the status/REST layer
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::watch;

#[cfg(feature = "metrics")]
use metrics::gauge;

/// Lifecycle state of one protocol connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Session alive but keep-alives are failing (source only)
    Degraded,
}

impl ConnectionState {
    /// Session usable for traffic
    pub fn is_up(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// Source state plus the session generation it refers to.
///
/// The epoch changes on every new session; all subscription handles from a
/// previous epoch are invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLink {
    pub state: ConnectionState,
    pub epoch: u64,
}

/// Overall engine health derived from both connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    /// No valid binding and no reachable endpoint
    Unhealthy,
}

/// Component that last reported an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Source,
    Sink,
    Engine,
}

/// Subscription status of a single binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum BindingStatus {
    /// Waiting for a source session
    Pending,
    /// Monitored item registered
    Active,
    /// Rejected by the server; not retried until the binding changes
    Invalid(String),
    /// Retriable failure, retry scheduled
    Retrying(String),
    /// Paused by the backpressure policy
    Paused,
}

/// Monotonic counters exported with the status snapshot
#[derive(Debug, Default)]
pub struct Counters {
    pub events_received: AtomicU64,
    pub events_dropped_channel_full: AtomicU64,
    pub events_dropped_unbound: AtomicU64,
    pub published: AtomicU64,
    pub queued: AtomicU64,
    pub coalesced: AtomicU64,
    pub overflow_evicted: AtomicU64,
    pub overflow_rejected: AtomicU64,
    pub dropped_stale: AtomicU64,
    pub dropped_removed: AtomicU64,
    pub publish_timeouts: AtomicU64,
    pub publish_failures: AtomicU64,
    pub commands_executed: AtomicU64,
    pub commands_rejected: AtomicU64,
}

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub events_received: u64,
    pub events_dropped_channel_full: u64,
    pub events_dropped_unbound: u64,
    pub published: u64,
    pub queued: u64,
    pub coalesced: u64,
    pub overflow_evicted: u64,
    pub overflow_rejected: u64,
    pub dropped_stale: u64,
    pub dropped_removed: u64,
    pub publish_timeouts: u64,
    pub publish_failures: u64,
    pub commands_executed: u64,
    pub commands_rejected: u64,
}

/// Increment a counter and mirror it to the metrics recorder when enabled
macro_rules! bump {
    ($counters:expr, $field:ident) => {{
        $counters.$field.fetch_add(1, ::std::sync::atomic::Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::counter!(concat!("petra_bridge_", stringify!($field), "_total")).increment(1);
    }};
}
pub(crate) use bump;

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            events_received: load(&self.events_received),
            events_dropped_channel_full: load(&self.events_dropped_channel_full),
            events_dropped_unbound: load(&self.events_dropped_unbound),
            published: load(&self.published),
            queued: load(&self.queued),
            coalesced: load(&self.coalesced),
            overflow_evicted: load(&self.overflow_evicted),
            overflow_rejected: load(&self.overflow_rejected),
            dropped_stale: load(&self.dropped_stale),
            dropped_removed: load(&self.dropped_removed),
            publish_timeouts: load(&self.publish_timeouts),
            publish_failures: load(&self.publish_failures),
            commands_executed: load(&self.commands_executed),
            commands_rejected: load(&self.commands_rejected),
        }
    }
}

/// Everything the status layer gets from `GetStatus`
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub source_state: ConnectionState,
    pub sink_state: ConnectionState,
    pub health: Health,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub backpressure: bool,
    pub last_error: BTreeMap<String, String>,
    pub bindings: BTreeMap<String, BindingStatus>,
    pub counters: CounterSnapshot,
}

impl BridgeStatus {
    pub fn binding(&self, source_node_id: &str) -> Option<&BindingStatus> {
        self.bindings.get(source_node_id)
    }

    pub fn last_error(&self, component: Component) -> Option<&str> {
        self.last_error.get(component_key(component)).map(String::as_str)
    }
}

fn component_key(component: Component) -> &'static str {
    match component {
        Component::Source => "source",
        Component::Sink => "sink",
        Component::Engine => "engine",
    }
}

/// Shared, concurrently readable status of the running bridge.
///
/// Connections publish their state here; the reconciler and the delivery
/// task subscribe to the watch channels to react to transitions.
#[derive(Debug)]
pub struct StatusBoard {
    source: watch::Sender<SourceLink>,
    sink: watch::Sender<ConnectionState>,
    last_errors: DashMap<Component, String>,
    bindings: DashMap<String, BindingStatus>,
    queue_depth: AtomicUsize,
    queue_capacity: usize,
    backpressure: AtomicBool,
    pub counters: Counters,
}

impl StatusBoard {
    pub fn new(queue_capacity: usize) -> Self {
        let (source, _) = watch::channel(SourceLink {
            state: ConnectionState::Disconnected,
            epoch: 0,
        });
        let (sink, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            source,
            sink,
            last_errors: DashMap::new(),
            bindings: DashMap::new(),
            queue_depth: AtomicUsize::new(0),
            queue_capacity,
            backpressure: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    // ------------------------------------------------------------------
    // Connection state
    // ------------------------------------------------------------------

    pub fn set_source(&self, link: SourceLink) {
        self.source.send_if_modified(|current| {
            let changed = *current != link;
            *current = link;
            changed
        });
    }

    pub fn source(&self) -> SourceLink {
        *self.source.borrow()
    }

    pub fn watch_source(&self) -> watch::Receiver<SourceLink> {
        self.source.subscribe()
    }

    pub fn set_sink(&self, state: ConnectionState) {
        self.sink.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub fn sink(&self) -> ConnectionState {
        *self.sink.borrow()
    }

    pub fn watch_sink(&self) -> watch::Receiver<ConnectionState> {
        self.sink.subscribe()
    }

    pub fn record_error(&self, component: Component, message: impl Into<String>) {
        self.last_errors.insert(component, message.into());
    }

    pub fn clear_error(&self, component: Component) {
        self.last_errors.remove(&component);
    }

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    pub fn set_binding(&self, source_node_id: &str, status: BindingStatus) {
        self.bindings.insert(source_node_id.to_string(), status);
    }

    pub fn remove_binding(&self, source_node_id: &str) {
        self.bindings.remove(source_node_id);
    }

    /// Drop status entries for bindings that no longer exist
    pub fn retain_bindings(&self, keep: impl Fn(&str) -> bool) {
        self.bindings.retain(|id, _| keep(id));
    }

    pub fn binding(&self, source_node_id: &str) -> Option<BindingStatus> {
        self.bindings.get(source_node_id).map(|entry| entry.value().clone())
    }

    /// Bindings that are not rejected by the server
    pub fn valid_binding_count(&self) -> usize {
        self.bindings
            .iter()
            .filter(|entry| !matches!(entry.value(), BindingStatus::Invalid(_)))
            .count()
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        gauge!("petra_bridge_queue_depth").set(depth as f64);
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn set_backpressure(&self, active: bool) {
        self.backpressure.store(active, Ordering::Relaxed);
    }

    pub fn backpressure(&self) -> bool {
        self.backpressure.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    pub fn health(&self) -> Health {
        let source = self.source().state;
        let sink = self.sink();
        let reachable = source.is_up() || sink.is_up();
        if !reachable && self.valid_binding_count() == 0 {
            Health::Unhealthy
        } else if source == ConnectionState::Connected
            && sink == ConnectionState::Connected
            && !self.backpressure()
        {
            Health::Healthy
        } else {
            Health::Degraded
        }
    }

    pub fn snapshot(&self) -> BridgeStatus {
        BridgeStatus {
            source_state: self.source().state,
            sink_state: self.sink(),
            health: self.health(),
            queue_depth: self.queue_depth(),
            queue_capacity: self.queue_capacity,
            backpressure: self.backpressure(),
            last_error: self
                .last_errors
                .iter()
                .map(|entry| (component_key(*entry.key()).to_string(), entry.value().clone()))
                .collect(),
            bindings: self
                .bindings
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            counters: self.counters.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_combination() {
        let board = StatusBoard::new(10);
        assert_eq!(board.health(), Health::Unhealthy);

        board.set_binding("ns=2;i=1", BindingStatus::Pending);
        assert_eq!(board.health(), Health::Degraded);

        board.set_source(SourceLink { state: ConnectionState::Connected, epoch: 1 });
        board.set_sink(ConnectionState::Connected);
        assert_eq!(board.health(), Health::Healthy);

        board.set_backpressure(true);
        assert_eq!(board.health(), Health::Degraded);
        board.set_backpressure(false);

        board.set_source(SourceLink { state: ConnectionState::Degraded, epoch: 1 });
        assert_eq!(board.health(), Health::Degraded);
    }

    #[test]
    fn test_invalid_bindings_do_not_count_as_valid() {
        let board = StatusBoard::new(10);
        board.set_binding("a", BindingStatus::Invalid("BadNodeIdUnknown".into()));
        board.set_binding("b", BindingStatus::Active);
        assert_eq!(board.valid_binding_count(), 1);

        board.remove_binding("b");
        assert_eq!(board.valid_binding_count(), 0);
        assert_eq!(board.health(), Health::Unhealthy);
    }

    #[test]
    fn test_snapshot_carries_errors_and_counters() {
        let board = StatusBoard::new(10);
        board.record_error(Component::Sink, "connection refused");
        bump!(board.counters, published);
        bump!(board.counters, published);

        let status = board.snapshot();
        assert_eq!(status.last_error(Component::Sink), Some("connection refused"));
        assert_eq!(status.last_error(Component::Source), None);
        assert_eq!(status.counters.published, 2);

        board.clear_error(Component::Sink);
        assert!(board.snapshot().last_error.is_empty());
    }

    #[tokio::test]
    async fn test_watchers_see_only_real_transitions() {
        let board = StatusBoard::new(10);
        let mut rx = board.watch_sink();
        board.set_sink(ConnectionState::Disconnected);
        assert!(!rx.has_changed().unwrap());
        board.set_sink(ConnectionState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }
}
