// src/node_map.rs - Node to topic mapping with atomic snapshot replacement
//
// The map is written only by the configuration handler and read everywhere
// else. Each apply publishes a complete, immutable snapshot so readers never
// observe a partially applied configuration.

use crate::{
    error::ConfigError,
    value::{DataChangeEvent, Value},
};
use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Placeholder substituted with a topic-safe form of the node id
pub const NODE_ID_PLACEHOLDER: &str = "{node_id}";

/// MQTT delivery guarantee for a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    /// QoS 1 and 2 wait for a broker acknowledgement
    pub fn requires_ack(&self) -> bool {
        !matches!(self, QosLevel::AtMostOnce)
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(ConfigError::InvalidQos(other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// How the server should sample the node for the monitored item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplePolicy {
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,
    #[serde(default = "default_true")]
    pub discard_oldest: bool,
}

fn default_sampling_interval_ms() -> u64 { 500 }
fn default_queue_size() -> u32 { 10 }
fn default_true() -> bool { true }

impl Default for SamplePolicy {
    fn default() -> Self {
        Self {
            sampling_interval_ms: default_sampling_interval_ms(),
            queue_size: default_queue_size(),
            discard_oldest: true,
        }
    }
}

/// Serialization rule for the MQTT payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// `{"node_id", "value", "quality", "timestamp"}` envelope
    #[default]
    Json,
    /// Bare textual value; arrays and structures fall back to JSON
    Raw,
}

/// Mapping of one OPC UA node to one MQTT topic.
///
/// # Examples
///
/// ```rust
/// use petra_bridge::{NodeBinding, QosLevel};
///
/// let binding = NodeBinding::new("ns=2;i=100", "plant/line1/temp")
///     .with_qos(QosLevel::AtLeastOnce)
///     .with_retain(true);
/// assert_eq!(binding.topic, "plant/line1/temp");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeBinding {
    #[serde(alias = "node")]
    pub source_node_id: String,
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: QosLevel,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub sample_policy: SamplePolicy,
    #[serde(default)]
    pub format: PayloadFormat,
    /// Accept value writes for this node from the control topic
    #[serde(default)]
    pub writable: bool,
}

fn default_qos() -> QosLevel {
    QosLevel::AtLeastOnce
}

impl NodeBinding {
    pub fn new(source_node_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            topic: topic.into(),
            qos: default_qos(),
            retain: false,
            sample_policy: SamplePolicy::default(),
            format: PayloadFormat::default(),
            writable: false,
        }
    }

    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_sample_policy(mut self, policy: SamplePolicy) -> Self {
        self.sample_policy = policy;
        self
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Equality over the fields that require the monitored item to be recreated.
    ///
    /// Retain flag, payload format and write permission are read from the
    /// snapshot when used and do not touch the subscription.
    pub fn subscription_eq(&self, other: &NodeBinding) -> bool {
        self.topic == other.topic
            && self.qos == other.qos
            && self.sample_policy == other.sample_policy
    }

    /// Render the MQTT payload for an event on this binding
    pub fn render_payload(&self, event: &DataChangeEvent) -> Bytes {
        match self.format {
            PayloadFormat::Raw if event.value.is_scalar() => {
                Bytes::from(event.value.to_string())
            }
            PayloadFormat::Raw => Bytes::from(event.value.to_json().to_string()),
            PayloadFormat::Json => {
                let envelope = serde_json::json!({
                    "node_id": event.source_node_id,
                    "value": event.value.to_json(),
                    "quality": event.quality.as_str(),
                    "timestamp": event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                });
                Bytes::from(envelope.to_string())
            }
        }
    }

    fn normalized(mut self) -> Result<Self, ConfigError> {
        self.source_node_id = self.source_node_id.trim().to_string();
        if self.source_node_id.is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        if self.topic.contains(NODE_ID_PLACEHOLDER) {
            self.topic = self
                .topic
                .replace(NODE_ID_PLACEHOLDER, &topic_safe(&self.source_node_id));
        }
        validate_topic(&self.source_node_id, &self.topic)?;
        Ok(self)
    }
}

/// Replace characters that are not allowed or ambiguous inside a topic level
pub fn topic_safe(node_id: &str) -> String {
    node_id
        .chars()
        .map(|c| match c {
            '+' | '#' | ';' | '=' | '\0' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

fn validate_topic(node_id: &str, topic: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidTopic {
        node_id: node_id.to_string(),
        topic: topic.to_string(),
        reason,
    };
    if topic.is_empty() {
        return Err(invalid("topic is empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid("wildcards are not allowed in publish topics"));
    }
    if topic.contains('\0') {
        return Err(invalid("topic contains NUL"));
    }
    if topic.len() > u16::MAX as usize {
        return Err(invalid("topic exceeds 65535 bytes"));
    }
    Ok(())
}

/// Result of replacing the binding set, keyed by source node id.
///
/// `added`, `changed`, `unchanged` and `removed` partition the union of the
/// old and new keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BindingDiff {
    pub added: Vec<NodeBinding>,
    pub removed: Vec<NodeBinding>,
    /// New values of bindings whose subscription-relevant fields differ
    pub changed: Vec<NodeBinding>,
    pub unchanged: Vec<String>,
}

impl BindingDiff {
    /// True when no subscription has to be touched
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    fn between(old: &NodeMapSnapshot, new: &NodeMapSnapshot) -> Self {
        let mut diff = BindingDiff::default();
        for id in &new.order {
            let binding = &new.bindings[id];
            match old.bindings.get(id) {
                None => diff.added.push(binding.clone()),
                Some(prev) if prev.subscription_eq(binding) => diff.unchanged.push(id.clone()),
                Some(_) => diff.changed.push(binding.clone()),
            }
        }
        for id in &old.order {
            if !new.bindings.contains_key(id) {
                diff.removed.push(old.bindings[id].clone());
            }
        }
        diff
    }
}

/// Immutable view of the binding set at one configuration version
#[derive(Debug, Default)]
pub struct NodeMapSnapshot {
    bindings: HashMap<String, NodeBinding>,
    order: Vec<String>,
    version: u64,
}

impl NodeMapSnapshot {
    fn build(bindings: Vec<NodeBinding>, version: u64) -> Result<Self, ConfigError> {
        let mut map = HashMap::with_capacity(bindings.len());
        let mut order = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let binding = binding.normalized()?;
            let id = binding.source_node_id.clone();
            if map.contains_key(&id) {
                return Err(ConfigError::DuplicateNode(id));
            }
            order.push(id.clone());
            map.insert(id, binding);
        }
        Ok(Self { bindings: map, order, version })
    }

    pub fn resolve(&self, source_node_id: &str) -> Option<&NodeBinding> {
        self.bindings.get(source_node_id)
    }

    /// Bindings in configuration order
    pub fn bindings(&self) -> impl Iterator<Item = &NodeBinding> {
        self.order.iter().map(move |id| &self.bindings[id])
    }

    pub fn contains(&self, source_node_id: &str) -> bool {
        self.bindings.contains_key(source_node_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Single-writer, many-reader binding table.
///
/// # Examples
///
/// ```rust
/// use petra_bridge::{NodeBinding, NodeMap};
///
/// let map = NodeMap::new();
/// let diff = map.apply_config(vec![NodeBinding::new("ns=2;i=100", "plant/line1/temp")])?;
/// assert_eq!(diff.added.len(), 1);
/// assert!(map.resolve("ns=2;i=100").is_some());
/// # Ok::<(), petra_bridge::ConfigError>(())
/// ```
#[derive(Debug)]
pub struct NodeMap {
    current: ArcSwap<NodeMapSnapshot>,
    writer: Mutex<()>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(NodeMapSnapshot::default()),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot; stays consistent for as long as the caller holds it
    pub fn snapshot(&self) -> Arc<NodeMapSnapshot> {
        self.current.load_full()
    }

    pub fn resolve(&self, source_node_id: &str) -> Option<NodeBinding> {
        self.current.load().resolve(source_node_id).cloned()
    }

    pub fn desired_bindings(&self) -> Vec<NodeBinding> {
        self.current.load().bindings().cloned().collect()
    }

    /// Validate and atomically replace the binding set.
    ///
    /// On error the previous snapshot stays active.
    pub fn apply_config(&self, new_bindings: Vec<NodeBinding>) -> Result<BindingDiff, ConfigError> {
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let old = self.current.load_full();
        let next = NodeMapSnapshot::build(new_bindings, old.version + 1)?;
        let diff = BindingDiff::between(&old, &next);

        debug!(
            version = next.version,
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            unchanged = diff.unchanged.len(),
            "Binding diff computed"
        );
        if !diff.is_empty() {
            info!(version = next.version, bindings = next.len(), "Node map replaced");
        }
        self.current.store(Arc::new(next));
        Ok(diff)
    }
}

impl Default for NodeMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys touched by a diff, used to check partition properties
pub fn diff_keys(diff: &BindingDiff) -> (HashSet<String>, HashSet<String>, HashSet<String>, HashSet<String>) {
    let ids = |v: &[NodeBinding]| v.iter().map(|b| b.source_node_id.clone()).collect::<HashSet<_>>();
    (
        ids(&diff.added),
        ids(&diff.changed),
        diff.unchanged.iter().cloned().collect(),
        ids(&diff.removed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Quality;

    fn binding(id: &str, topic: &str) -> NodeBinding {
        NodeBinding::new(id, topic)
    }

    #[test]
    fn test_apply_config_diff() {
        let map = NodeMap::new();
        map.apply_config(vec![
            binding("ns=2;i=1", "a"),
            binding("ns=2;i=2", "b"),
            binding("ns=2;i=3", "c"),
        ])
        .unwrap();

        let diff = map
            .apply_config(vec![
                binding("ns=2;i=1", "a"),
                binding("ns=2;i=2", "b2"),
                binding("ns=2;i=4", "d"),
            ])
            .unwrap();

        assert_eq!(diff.unchanged, vec!["ns=2;i=1".to_string()]);
        assert_eq!(diff.changed, vec![binding("ns=2;i=2", "b2")]);
        assert_eq!(diff.added, vec![binding("ns=2;i=4", "d")]);
        assert_eq!(diff.removed, vec![binding("ns=2;i=3", "c")]);
        assert_eq!(map.snapshot().version(), 2);
    }

    #[test]
    fn test_changed_uses_value_equality() {
        let map = NodeMap::new();
        map.apply_config(vec![binding("ns=2;i=1", "a")]).unwrap();

        // Retain and format do not affect the subscription
        let diff = map
            .apply_config(vec![binding("ns=2;i=1", "a")
                .with_retain(true)
                .with_format(PayloadFormat::Raw)])
            .unwrap();
        assert!(diff.is_empty());
        assert!(map.resolve("ns=2;i=1").unwrap().retain);

        let slower = SamplePolicy { sampling_interval_ms: 2000, ..SamplePolicy::default() };
        let diff = map
            .apply_config(vec![binding("ns=2;i=1", "a").with_sample_policy(slower)])
            .unwrap();
        assert_eq!(diff.changed.len(), 1);

        let diff = map
            .apply_config(vec![binding("ns=2;i=1", "a").with_qos(QosLevel::AtMostOnce)])
            .unwrap();
        assert_eq!(diff.changed.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected_prior_retained() {
        let map = NodeMap::new();
        map.apply_config(vec![binding("ns=2;i=1", "a")]).unwrap();

        let err = map
            .apply_config(vec![binding("ns=2;i=7", "x"), binding("ns=2;i=7", "y")])
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateNode("ns=2;i=7".into()));
        assert!(map.resolve("ns=2;i=1").is_some());
        assert!(map.resolve("ns=2;i=7").is_none());
        assert_eq!(map.snapshot().version(), 1);
    }

    #[test]
    fn test_invalid_topics_rejected() {
        let map = NodeMap::new();
        assert!(matches!(
            map.apply_config(vec![binding("ns=2;i=1", "plant/+/temp")]),
            Err(ConfigError::InvalidTopic { .. })
        ));
        assert!(matches!(
            map.apply_config(vec![binding("ns=2;i=1", "")]),
            Err(ConfigError::InvalidTopic { .. })
        ));
        assert_eq!(
            map.apply_config(vec![binding("  ", "t")]),
            Err(ConfigError::EmptyNodeId)
        );
    }

    #[test]
    fn test_topic_template_rendering() {
        let map = NodeMap::new();
        map.apply_config(vec![binding("ns=2;i=100", "plant/{node_id}/value")])
            .unwrap();
        assert_eq!(
            map.resolve("ns=2;i=100").unwrap().topic,
            "plant/ns_2_i_100/value"
        );
    }

    #[test]
    fn test_qos_deserialization() {
        let yaml = "source_node_id: ns=2;i=1\ntopic: t\nqos: 0\n";
        let b: NodeBinding = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(b.qos, QosLevel::AtMostOnce);

        let yaml = "source_node_id: ns=2;i=1\ntopic: t\nqos: 3\n";
        assert!(serde_yaml::from_str::<NodeBinding>(yaml).is_err());
    }

    #[test]
    fn test_render_payload() {
        let event = DataChangeEvent::new("ns=2;i=100", Value::Float(21.5))
            .with_quality(Quality::Uncertain);

        let json: serde_json::Value =
            serde_json::from_slice(&binding("ns=2;i=100", "t").render_payload(&event)).unwrap();
        assert_eq!(json["value"], serde_json::json!(21.5));
        assert_eq!(json["quality"], "uncertain");
        assert_eq!(json["node_id"], "ns=2;i=100");

        let raw = binding("ns=2;i=100", "t").with_format(PayloadFormat::Raw);
        assert_eq!(&raw.render_payload(&event)[..], b"21.5");
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let map = NodeMap::new();
        map.apply_config(vec![binding("ns=2;i=1", "a")]).unwrap();
        let held = map.snapshot();
        map.apply_config(vec![]).unwrap();

        assert!(held.contains("ns=2;i=1"));
        assert!(map.resolve("ns=2;i=1").is_none());
    }
}
