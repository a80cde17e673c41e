// src/engine.rs - Bridge engine: wires source, sink, reconciler and delivery together
//
// Tasks started by `BridgeEngine::start`:
//   source     SourceConnection::run (session + keep-alive)
//   sink       SinkConnection::run (session)
//   reconcile  keeps monitored items in line with the node map
//   delivery   event intake -> publish / pending queue -> drain
//
// The event channel and the pending queue are the only hand-over points.
// The queue is owned by the delivery task alone.

use crate::{
    config::{Config, ConfigSource},
    control::{BindingsApplied, Controller, NOTICE_CAPACITY},
    error::{BridgeError, PublishError, Result},
    node_map::{BindingDiff, NodeBinding, NodeMap, QosLevel},
    queue::{Admission, PendingPublish, PendingQueue},
    reconcile::Reconciler,
    reconnect::{BackoffPolicy, ReconnectSupervisor},
    sink::{SinkConnection, SinkTransport},
    source::{EventSink, SourceConnection, SourceTransport},
    status::{bump, BindingStatus, BridgeStatus, ConnectionState, Health, StatusBoard},
    value::DataChangeEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause between drain passes that made no progress
const DRAIN_RETRY_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Delivery tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pending messages older than this are discarded
    #[serde(default = "default_pending_max_age_ms")]
    pub pending_max_age_ms: u64,
    /// Attempts for a QoS 1/2 message whose acknowledgement timed out
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: u32,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Period of the stale sweep, backpressure check and queue retry
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
    /// Upper bound for executing one control command
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_event_channel_capacity() -> usize { 4096 }
fn default_queue_capacity() -> usize { 1000 }
fn default_pending_max_age_ms() -> u64 { 300_000 }
fn default_max_publish_attempts() -> u32 { 3 }
fn default_drain_timeout_ms() -> u64 { 5_000 }
fn default_housekeeping_interval_ms() -> u64 { 1_000 }
fn default_command_timeout_ms() -> u64 { 5_000 }

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            queue_capacity: default_queue_capacity(),
            pending_max_age_ms: default_pending_max_age_ms(),
            max_publish_attempts: default_max_publish_attempts(),
            drain_timeout_ms: default_drain_timeout_ms(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl BridgeConfig {
    pub fn pending_max_age(&self) -> Duration {
        Duration::from_millis(self.pending_max_age_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }
}

/// What to do while the sink cannot keep up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Defaults to the queue capacity
    #[serde(default)]
    pub high_watermark: Option<usize>,
    /// Defaults to half the high watermark
    #[serde(default)]
    pub low_watermark: Option<usize>,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Pause QoS 0 monitored items at the source while under backpressure
    #[serde(default)]
    pub pause_qos0: bool,
}

fn default_grace_period_ms() -> u64 { 30_000 }

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: None,
            low_watermark: None,
            grace_period_ms: default_grace_period_ms(),
            pause_qos0: false,
        }
    }
}

impl BackpressureConfig {
    /// `(high, low)` for a queue of `capacity` entries
    pub fn watermarks(&self, capacity: usize) -> (usize, usize) {
        let high = self.high_watermark.unwrap_or(capacity);
        let low = self.low_watermark.unwrap_or(high / 2);
        (high, low)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Orchestrates one source and one sink connection.
///
/// # Examples
///
/// ```rust,no_run
/// use petra_bridge::{BridgeEngine, Config, NodeBinding, SinkConfig, SourceConfig};
/// use petra_bridge::test_utils::{MockSink, MockSource};
///
/// # async fn run() -> petra_bridge::Result<()> {
/// let config = Config::new(SourceConfig::new("opc.tcp://plc:4840"), SinkConfig::new("broker", 1883));
/// let engine = BridgeEngine::new(&config, MockSource::new(), MockSink::new());
/// let handle = engine.start(vec![NodeBinding::new("ns=2;i=100", "plant/line1/temp")])?;
/// println!("{:?}", handle.status().health);
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct BridgeEngine<S: SourceTransport, K: SinkTransport> {
    source: Arc<SourceConnection<S>>,
    sink: Arc<SinkConnection<K>>,
    node_map: Arc<NodeMap>,
    board: Arc<StatusBoard>,
    events: mpsc::Receiver<DataChangeEvent>,
    bridge: BridgeConfig,
    backpressure: BackpressureConfig,
    reconnect: BackoffPolicy,
}

impl<S: SourceTransport, K: SinkTransport> BridgeEngine<S, K> {
    pub fn new(config: &Config, source: S, sink: K) -> Self {
        let board = Arc::new(StatusBoard::new(config.bridge.queue_capacity));
        let (tx, events) = mpsc::channel(config.bridge.event_channel_capacity.max(1));
        let event_sink = EventSink::new(tx, board.clone());

        let source = Arc::new(SourceConnection::new(
            source,
            config.source.clone(),
            config.reconnect.clone(),
            event_sink,
            board.clone(),
        ));
        let sink = Arc::new(SinkConnection::new(
            sink,
            config.sink.clone(),
            config.reconnect.clone(),
            board.clone(),
        ));

        Self {
            source,
            sink,
            node_map: Arc::new(NodeMap::new()),
            board,
            events,
            bridge: config.bridge.clone(),
            backpressure: config.backpressure.clone(),
            reconnect: config.reconnect.clone(),
        }
    }

    pub fn source(&self) -> Arc<SourceConnection<S>> {
        self.source.clone()
    }

    pub fn sink(&self) -> Arc<SinkConnection<K>> {
        self.sink.clone()
    }

    pub fn node_map(&self) -> Arc<NodeMap> {
        self.node_map.clone()
    }

    pub fn status_board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    /// Apply the initial bindings and spawn all tasks.
    ///
    /// Must be called from within a Tokio runtime. Invalid bindings are
    /// rejected before anything is started.
    pub fn start(self, bindings: Vec<NodeBinding>) -> Result<BridgeHandle> {
        let diff = self.node_map.apply_config(bindings)?;
        for binding in &diff.added {
            self.board.set_binding(&binding.source_node_id, BindingStatus::Pending);
        }
        info!(bindings = diff.added.len(), "Starting bridge engine");

        let intake = CancellationToken::new();
        let drain = CancellationToken::new();
        let sink_cancel = CancellationToken::new();
        let reconcile_trigger = Arc::new(Notify::new());
        let paused = Arc::new(AtomicBool::new(false));

        let source_task = tokio::spawn(self.source.clone().run(intake.clone()));
        let sink_task = tokio::spawn(self.sink.clone().run(sink_cancel.clone()));

        let reconcile_task = tokio::spawn(reconcile_loop(
            self.source.clone(),
            self.node_map.clone(),
            self.board.clone(),
            reconcile_trigger.clone(),
            paused.clone(),
            self.reconnect.clone(),
            intake.clone(),
        ));

        let (high, low) = self.backpressure.watermarks(self.bridge.queue_capacity);
        let delivery = Delivery {
            sink: self.sink.clone(),
            node_map: self.node_map.clone(),
            board: self.board.clone(),
            queue: PendingQueue::new(self.bridge.queue_capacity),
            high_watermark: high,
            low_watermark: low,
            pressure_since: None,
            paused,
            reconcile_trigger: reconcile_trigger.clone(),
            map_version: self.node_map.snapshot().version(),
            last_health: None,
            bridge: self.bridge.clone(),
            backpressure: self.backpressure,
        };
        let delivery_task = tokio::spawn(delivery.run(self.events, drain.clone()));

        let control_topic = self.sink.config().control_topic.clone();
        let (notices, notice_rx) = match &control_topic {
            Some(_) => {
                let (tx, rx) = mpsc::channel(NOTICE_CAPACITY);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let handle = BridgeHandle {
            inner: Arc::new(HandleInner {
                node_map: self.node_map,
                board: self.board.clone(),
                reconcile_trigger,
                notices,
                intake: intake.clone(),
                drain,
                sink_cancel,
                drain_timeout: self.bridge.drain_timeout(),
                shut_down: AtomicBool::new(false),
                control: StdMutex::new(None),
                tasks: tokio::sync::Mutex::new(Some(Tasks {
                    source: source_task,
                    sink: sink_task,
                    reconcile: reconcile_task,
                    delivery: delivery_task,
                })),
            }),
        };

        if let (Some(control_topic), Some(notice_rx), Some(inbound)) =
            (control_topic, notice_rx, self.sink.take_inbound())
        {
            let controller = Controller {
                source: self.source.clone(),
                sink: self.sink.clone(),
                handle: handle.clone(),
                board: self.board,
                control_topic,
                command_timeout: self.bridge.command_timeout(),
            };
            let task = tokio::spawn(controller.run(inbound, notice_rx, intake));
            *handle.inner.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        }

        Ok(handle)
    }
}

struct Tasks {
    source: JoinHandle<()>,
    sink: JoinHandle<()>,
    reconcile: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

struct HandleInner {
    node_map: Arc<NodeMap>,
    board: Arc<StatusBoard>,
    reconcile_trigger: Arc<Notify>,
    /// Present when a control topic is configured
    notices: Option<mpsc::Sender<BindingsApplied>>,
    intake: CancellationToken,
    drain: CancellationToken,
    sink_cancel: CancellationToken,
    drain_timeout: Duration,
    shut_down: AtomicBool,
    control: StdMutex<Option<JoinHandle<()>>>,
    tasks: tokio::sync::Mutex<Option<Tasks>>,
}

/// Cloneable control surface of a running bridge
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<HandleInner>,
}

impl BridgeHandle {
    /// Current status snapshot
    pub fn status(&self) -> BridgeStatus {
        self.inner.board.snapshot()
    }

    pub fn node_map(&self) -> Arc<NodeMap> {
        self.inner.node_map.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Replace the binding set.
    ///
    /// On error the previous bindings stay active. Queued messages for
    /// removed bindings are dropped when the queue is drained.
    pub fn apply_bindings(&self, bindings: Vec<NodeBinding>) -> Result<BindingDiff> {
        if self.is_shut_down() {
            return Err(BridgeError::ShutDown);
        }
        let diff = self.inner.node_map.apply_config(bindings)?;
        for binding in &diff.removed {
            self.inner.board.remove_binding(&binding.source_node_id);
        }
        for binding in diff.added.iter().chain(&diff.changed) {
            self.inner
                .board
                .set_binding(&binding.source_node_id, BindingStatus::Pending);
        }
        if !diff.is_empty() {
            self.inner.reconcile_trigger.notify_one();
        }
        if let Some(notices) = &self.inner.notices {
            let snapshot = self.inner.node_map.snapshot();
            let notice = BindingsApplied::new(&diff, snapshot.version(), snapshot.len());
            if notices.try_send(notice).is_err() {
                debug!("Binding update notice dropped");
            }
        }
        Ok(diff)
    }

    /// Follow binding updates from a provider
    pub fn attach_config_source(&self, source: &dyn ConfigSource) {
        let handle = self.clone();
        source.on_config_change(Arc::new(move |bindings| {
            if let Err(e) = handle.apply_bindings(bindings) {
                error!(error = %e, "Rejected binding update, keeping previous bindings");
            }
        }));
    }

    /// Stop intake, drain pending publishes within the drain timeout, then close the sink.
    ///
    /// Reconnect loops stop immediately. Calling this twice is harmless.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down bridge");
        self.inner.intake.cancel();
        self.inner.drain.cancel();

        let control = self.inner.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(control) = control {
            if let Err(e) = control.await {
                error!(task = "control", error = %e, "Task ended abnormally");
            }
        }

        let Some(tasks) = self.inner.tasks.lock().await.take() else {
            return;
        };
        for (name, task) in [("source", tasks.source), ("reconcile", tasks.reconcile)] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }

        let mut delivery = tasks.delivery;
        let grace = self.inner.drain_timeout + Duration::from_secs(1);
        match tokio::time::timeout(grace, &mut delivery).await {
            Ok(Err(e)) => error!(task = "delivery", error = %e, "Task ended abnormally"),
            Ok(Ok(())) => {}
            Err(_) => {
                warn!("Delivery drain overran, aborting");
                delivery.abort();
            }
        }

        self.inner.sink_cancel.cancel();
        if let Err(e) = tasks.sink.await {
            error!(task = "sink", error = %e, "Task ended abnormally");
        }
        info!("Bridge stopped");
    }
}

// ============================================================================
// RECONCILIATION TASK
// ============================================================================

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs on source link changes, binding changes, pause toggles and busy retries
async fn reconcile_loop<S: SourceTransport>(
    source: Arc<SourceConnection<S>>,
    node_map: Arc<NodeMap>,
    board: Arc<StatusBoard>,
    trigger: Arc<Notify>,
    paused: Arc<AtomicBool>,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
) {
    let mut reconciler = Reconciler::new(board.clone());
    let mut retry = ReconnectSupervisor::new("subscribe", backoff);
    let mut retry_at: Option<Instant> = None;
    let mut links = board.watch_source();

    loop {
        let link = *links.borrow_and_update();
        let desired = node_map.desired_bindings();
        match link.state {
            ConnectionState::Connected | ConnectionState::Degraded => {
                let report = reconciler
                    .reconcile(source.as_ref(), link.epoch, &desired, paused.load(Ordering::SeqCst))
                    .await;
                if report.needs_retry() {
                    let delay = retry.next_delay();
                    debug!(retry = report.retry, delay_ms = delay.as_millis() as u64, "Scheduling subscribe retry");
                    retry_at = Some(Instant::now() + delay);
                } else {
                    retry.reset();
                    retry_at = None;
                }
            }
            ConnectionState::Disconnected => {
                reconciler.invalidate_all(&desired);
                retry_at = None;
            }
            ConnectionState::Connecting => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = links.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = trigger.notified() => {}
            _ = sleep_until(retry_at) => {}
        }
    }
}

// ============================================================================
// DELIVERY TASK
// ============================================================================

enum Outcome {
    Published,
    /// Put back at the head and stop draining
    Retry(PendingPublish),
    Dropped,
}

struct Delivery<K: SinkTransport> {
    sink: Arc<SinkConnection<K>>,
    node_map: Arc<NodeMap>,
    board: Arc<StatusBoard>,
    queue: PendingQueue,
    bridge: BridgeConfig,
    backpressure: BackpressureConfig,
    high_watermark: usize,
    low_watermark: usize,
    pressure_since: Option<Instant>,
    paused: Arc<AtomicBool>,
    reconcile_trigger: Arc<Notify>,
    map_version: u64,
    last_health: Option<Health>,
}

impl<K: SinkTransport> Delivery<K> {
    async fn run(mut self, mut events: mpsc::Receiver<DataChangeEvent>, drain: CancellationToken) {
        let mut sink_state = self.board.watch_sink();
        let mut ticker = tokio::time::interval(self.bridge.housekeeping_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = drain.cancelled() => break,
                changed = sink_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *sink_state.borrow_and_update();
                    if state == ConnectionState::Connected && !self.queue.is_empty() {
                        info!(pending = self.queue.len(), "Sink connected, draining pending queue");
                        self.flush().await;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.housekeeping();
                    if self.sink.is_connected() && !self.queue.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        self.drain(events).await;
    }

    async fn handle_event(&mut self, event: DataChangeEvent) {
        let snapshot = self.node_map.snapshot();
        let Some(binding) = snapshot.resolve(&event.source_node_id) else {
            bump!(self.board.counters, events_dropped_unbound);
            debug!(node = %event.source_node_id, "No binding for data change, dropping");
            return;
        };

        let entry = PendingPublish::new(
            binding.source_node_id.clone(),
            binding.topic.clone(),
            binding.render_payload(&event),
            binding.qos,
            binding.retain,
        )
        .with_event(binding.format, Arc::new(event));

        // Anything already waiting must go first
        if !self.queue.is_empty() {
            self.enqueue(entry);
            if self.sink.is_connected() {
                self.flush().await;
            }
            return;
        }

        if let Outcome::Retry(entry) = self.publish(entry).await {
            self.enqueue(entry);
        }
    }

    async fn publish(&self, mut entry: PendingPublish) -> Outcome {
        match self
            .sink
            .publish(&entry.topic, entry.payload.clone(), entry.qos, entry.retain)
            .await
        {
            Ok(()) => {
                bump!(self.board.counters, published);
                Outcome::Published
            }
            Err(PublishError::NotConnected) => Outcome::Retry(entry),
            Err(PublishError::Timeout(ms)) => {
                bump!(self.board.counters, publish_timeouts);
                if entry.qos == QosLevel::AtMostOnce {
                    debug!(topic = %entry.topic, "QoS 0 publish timed out, dropping");
                    return Outcome::Dropped;
                }
                entry.attempts += 1;
                if entry.attempts >= self.bridge.max_publish_attempts {
                    bump!(self.board.counters, publish_failures);
                    warn!(topic = %entry.topic, attempts = entry.attempts, timeout_ms = ms, "Giving up on unacknowledged publish");
                    Outcome::Dropped
                } else {
                    Outcome::Retry(entry)
                }
            }
            Err(e @ PublishError::Rejected(_)) => {
                bump!(self.board.counters, publish_failures);
                warn!(topic = %entry.topic, error = %e, "Publish rejected");
                Outcome::Dropped
            }
        }
    }

    fn enqueue(&mut self, entry: PendingPublish) {
        match self.queue.push(entry) {
            Ok(Admission::Queued) => bump!(self.board.counters, queued),
            Ok(Admission::Coalesced(_)) => {
                bump!(self.board.counters, queued);
                bump!(self.board.counters, coalesced);
            }
            Ok(Admission::Evicted(old)) => {
                bump!(self.board.counters, queued);
                bump!(self.board.counters, overflow_evicted);
                warn!(topic = %old.topic, capacity = self.queue.capacity(), "Pending queue full, evicted oldest QoS 0 message");
            }
            Err(e) => {
                bump!(self.board.counters, overflow_rejected);
                warn!(error = %e, "Pending publish dropped");
            }
        }
        self.board.set_queue_depth(self.queue.len());
    }

    /// Publish queued messages in order until the queue is empty or the sink stalls
    async fn flush(&mut self) {
        let max_age = self.bridge.pending_max_age();
        while let Some(mut entry) = self.queue.pop_front() {
            let snapshot = self.node_map.snapshot();
            let Some(binding) = snapshot.resolve(&entry.source_node_id) else {
                bump!(self.board.counters, dropped_removed);
                debug!(node = %entry.source_node_id, "Binding removed, dropping queued message");
                continue;
            };
            if entry.age(Instant::now()) > max_age {
                bump!(self.board.counters, dropped_stale);
                continue;
            }
            entry.topic = binding.topic.clone();
            entry.qos = binding.qos;
            entry.retain = binding.retain;
            entry.rerender(binding.format, |event| binding.render_payload(event));

            if let Outcome::Retry(entry) = self.publish(entry).await {
                self.queue.push_front(entry);
                break;
            }
        }
        self.board.set_queue_depth(self.queue.len());
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();

        let expired = self.queue.expire(now, self.bridge.pending_max_age());
        if !expired.is_empty() {
            for _ in &expired {
                bump!(self.board.counters, dropped_stale);
            }
            warn!(dropped = expired.len(), "Discarded stale pending publishes");
        }

        let snapshot = self.node_map.snapshot();
        if snapshot.version() != self.map_version {
            self.map_version = snapshot.version();
            let unbound: HashSet<String> = self
                .queue
                .iter()
                .filter(|e| !snapshot.contains(&e.source_node_id))
                .map(|e| e.source_node_id.clone())
                .collect();
            for node in unbound {
                for _ in 0..self.queue.remove_node(&node) {
                    bump!(self.board.counters, dropped_removed);
                }
            }

            let topics: HashSet<&str> = snapshot
                .bindings()
                .map(|b| b.topic.as_str())
                .chain(self.queue.iter().map(|e| e.topic.as_str()))
                .collect();
            let pruned = self.sink.retain_topics(|topic| topics.contains(topic));
            if pruned > 0 {
                debug!(pruned, "Released in-flight locks of unbound topics");
            }
        }
        self.board.set_queue_depth(self.queue.len());

        self.evaluate_backpressure(now);

        let health = self.board.health();
        if self.last_health != Some(health) {
            if health == Health::Unhealthy {
                error!("No valid bindings and no reachable endpoint");
            } else if self.last_health.is_some() {
                info!(?health, "Bridge health changed");
            }
            self.last_health = Some(health);
        }
    }

    fn evaluate_backpressure(&mut self, now: Instant) {
        let depth = self.queue.len();
        let sink_connected = self.board.sink() == ConnectionState::Connected;

        if depth >= self.high_watermark && !sink_connected {
            let since = *self.pressure_since.get_or_insert(now);
            if !self.board.backpressure() && now.duration_since(since) >= self.backpressure.grace_period() {
                warn!(depth, high_watermark = self.high_watermark, "Sink not keeping up, entering backpressure");
                self.board.set_backpressure(true);
                if self.backpressure.pause_qos0 {
                    self.paused.store(true, Ordering::SeqCst);
                    self.reconcile_trigger.notify_one();
                }
            }
            return;
        }

        self.pressure_since = None;
        if self.board.backpressure() && depth <= self.low_watermark {
            info!(depth, low_watermark = self.low_watermark, "Backpressure released");
            self.board.set_backpressure(false);
            if self.paused.swap(false, Ordering::SeqCst) {
                self.reconcile_trigger.notify_one();
            }
        }
    }

    /// Process what is left in the channel and flush within the drain timeout
    async fn drain(&mut self, mut events: mpsc::Receiver<DataChangeEvent>) {
        events.close();
        let deadline = Instant::now() + self.bridge.drain_timeout();
        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(event) = events.recv().await {
                self.handle_event(event).await;
            }
            while !self.queue.is_empty() && self.sink.is_connected() {
                let before = self.queue.len();
                self.flush().await;
                if self.queue.len() >= before {
                    tokio::time::sleep(DRAIN_RETRY_INTERVAL).await;
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Drain timeout reached");
        }
        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!(dropped, "Discarding pending publishes at shutdown");
        }
        self.board.set_queue_depth(0);
    }
}
