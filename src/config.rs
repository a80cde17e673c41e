// src/config.rs - Bridge configuration, environment overrides and binding providers

use crate::{
    engine::{BackpressureConfig, BridgeConfig},
    error::{BridgeError, ConfigError, Result},
    node_map::{NodeBinding, NodeMap},
    reconnect::BackoffPolicy,
    sink::SinkConfig,
    source::{Credentials, SourceConfig},
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "PETRA_BRIDGE_";

/// Upper bound for `reconnect.max_delay_ms` (one hour)
pub const MAX_RECONNECT_DELAY_MS: u64 = 3_600_000;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OPC UA server
    pub source: SourceConfig,

    /// MQTT broker
    pub sink: SinkConfig,

    /// Delivery queue and shutdown tuning
    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub backpressure: BackpressureConfig,

    /// Backoff shared by both connections
    #[serde(default)]
    pub reconnect: BackoffPolicy,

    /// Inline bindings, used when `bindings_file` is not set
    #[serde(default)]
    pub bindings: Vec<NodeBinding>,

    /// Separate bindings file, re-read on reload
    #[serde(default)]
    pub bindings_file: Option<PathBuf>,

    #[serde(default)]
    pub status_server: Option<StatusServerConfig>,
}

/// HTTP status surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String { "0.0.0.0:8080".to_string() }

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Config {
    pub fn new(source: SourceConfig, sink: SinkConfig) -> Self {
        Self {
            source,
            sink,
            bridge: BridgeConfig::default(),
            backpressure: BackpressureConfig::default(),
            reconnect: BackoffPolicy::default(),
            bindings: Vec::new(),
            bindings_file: None,
            status_server: None,
        }
    }

    pub fn with_bindings(mut self, bindings: Vec<NodeBinding>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Load a YAML file, apply `PETRA_BRIDGE_*` environment overrides, then validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_file_with_overrides(path, |name| std::env::var(name).ok())
    }

    /// Like [`Config::from_file`] with overrides taken from `lookup`.
    ///
    /// Validation runs once, on the overridden configuration, so a value
    /// that is only supplied through the environment is accepted.
    pub fn from_file_with_overrides(
        path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;

        // Relative bindings files are resolved next to the main file
        if let (Some(file), Some(dir)) = (&config.bindings_file, path.parent()) {
            if file.is_relative() {
                config.bindings_file = Some(dir.join(file));
            }
        }

        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot express
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.source.endpoint_url.starts_with("opc.tcp://") {
            return Err(ConfigError::Invalid(format!(
                "source endpoint '{}' must start with opc.tcp://",
                self.source.endpoint_url
            )));
        }
        if self.sink.host.trim().is_empty() {
            return Err(ConfigError::Invalid("sink host is empty".into()));
        }
        if self.sink.port == 0 {
            return Err(ConfigError::Invalid("sink port must be non-zero".into()));
        }
        if let Some(topic) = &self.sink.control_topic {
            if topic.is_empty() || topic.contains(['+', '#']) {
                return Err(ConfigError::Invalid(format!(
                    "sink.control_topic '{topic}' must be a non-empty topic without wildcards"
                )));
            }
        }
        if self.sink.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sink.ack_timeout_ms must be positive".into()));
        }
        if self.bridge.queue_capacity == 0 || self.bridge.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid("queue and channel capacities must be positive".into()));
        }
        if self.bridge.max_publish_attempts == 0 {
            return Err(ConfigError::Invalid("bridge.max_publish_attempts must be at least 1".into()));
        }

        let capacity = self.bridge.queue_capacity;
        if let Some(high) = self.backpressure.high_watermark {
            if high == 0 || high > capacity {
                return Err(ConfigError::Invalid(format!(
                    "backpressure.high_watermark {high} outside 1..={capacity}"
                )));
            }
        }
        let (high, low) = self.backpressure.watermarks(capacity);
        if low >= high {
            return Err(ConfigError::Invalid(format!(
                "backpressure.low_watermark {low} must be below high_watermark {high}"
            )));
        }

        if self.reconnect.base_delay_ms == 0 || self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid("reconnect.base_delay_ms must be in 1..=max_delay_ms".into()));
        }
        if self.reconnect.max_delay_ms > MAX_RECONNECT_DELAY_MS {
            return Err(ConfigError::Invalid(format!(
                "reconnect.max_delay_ms must be at most {MAX_RECONNECT_DELAY_MS}"
            )));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid("reconnect.jitter must be in [0, 1)".into()));
        }

        // Same rules the node map applies at runtime
        NodeMap::new().apply_config(self.bindings.clone())?;
        Ok(())
    }

    /// Apply `PETRA_BRIDGE_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any key lookup; keys carry the `PETRA_BRIDGE_` prefix
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.is_empty());

        if let Some(url) = get("OPCUA_ENDPOINT") {
            self.source.endpoint_url = url;
        }
        if let (Some(username), Some(password)) = (get("OPCUA_USERNAME"), get("OPCUA_PASSWORD")) {
            self.source.credentials = Credentials::UserName { username, password };
        }
        if let Some(host) = get("MQTT_HOST") {
            self.sink.host = host;
        }
        if let Some(port) = get("MQTT_PORT") {
            match port.parse() {
                Ok(port) => self.sink.port = port,
                Err(_) => warn!(value = %port, "Ignoring invalid {}MQTT_PORT", ENV_PREFIX),
            }
        }
        if let Some(username) = get("MQTT_USERNAME") {
            self.sink.username = Some(username);
        }
        if let Some(password) = get("MQTT_PASSWORD") {
            self.sink.password = Some(password);
        }
        if let Some(client_id) = get("MQTT_CLIENT_ID") {
            self.sink.client_id = client_id;
        }
    }

    /// Binding provider for this configuration
    pub fn config_source(&self) -> Arc<dyn ConfigSource> {
        match &self.bindings_file {
            Some(path) => Arc::new(YamlConfigSource::new(path.clone())),
            None => Arc::new(StaticConfigSource::new(self.bindings.clone())),
        }
    }
}

// ============================================================================
// BINDING PROVIDERS
// ============================================================================

/// Called with the complete new binding set
pub type BindingsCallback = Arc<dyn Fn(Vec<NodeBinding>) + Send + Sync>;

/// Where bindings come from at startup and on every update
pub trait ConfigSource: Send + Sync {
    /// Ordered binding set
    fn get_bindings(&self) -> Result<Vec<NodeBinding>>;

    /// Register for future updates
    fn on_config_change(&self, callback: BindingsCallback);
}

#[derive(Default)]
struct Callbacks(Mutex<Vec<BindingsCallback>>);

impl Callbacks {
    fn push(&self, callback: BindingsCallback) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(callback);
    }

    fn fire(&self, bindings: &[NodeBinding]) {
        let callbacks = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        for callback in callbacks {
            callback(bindings.to_vec());
        }
    }
}

/// In-memory provider updated programmatically
pub struct StaticConfigSource {
    bindings: RwLock<Vec<NodeBinding>>,
    callbacks: Callbacks,
}

impl StaticConfigSource {
    pub fn new(bindings: Vec<NodeBinding>) -> Self {
        Self {
            bindings: RwLock::new(bindings),
            callbacks: Callbacks::default(),
        }
    }

    /// Replace the bindings and notify listeners
    pub fn set_bindings(&self, bindings: Vec<NodeBinding>) {
        *self.bindings.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = bindings.clone();
        self.callbacks.fire(&bindings);
    }
}

impl ConfigSource for StaticConfigSource {
    fn get_bindings(&self) -> Result<Vec<NodeBinding>> {
        Ok(self.bindings.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone())
    }

    fn on_config_change(&self, callback: BindingsCallback) {
        self.callbacks.push(callback);
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BindingsDocument {
    List(Vec<NodeBinding>),
    Keyed { bindings: Vec<NodeBinding> },
}

/// Bindings read from a YAML file, either a bare list or a `bindings:` key
pub struct YamlConfigSource {
    path: PathBuf,
    callbacks: Callbacks,
}

impl YamlConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            callbacks: Callbacks::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and notify listeners. Returns the number of bindings read.
    pub fn reload(&self) -> Result<usize> {
        let bindings = self.get_bindings()?;
        info!(path = %self.path.display(), bindings = bindings.len(), "Bindings file reloaded");
        self.callbacks.fire(&bindings);
        Ok(bindings.len())
    }
}

impl ConfigSource for YamlConfigSource {
    fn get_bindings(&self) -> Result<Vec<NodeBinding>> {
        let content = fs::read_to_string(&self.path)?;
        let document: BindingsDocument = serde_yaml::from_str(&content).map_err(BridgeError::Yaml)?;
        Ok(match document {
            BindingsDocument::List(bindings) | BindingsDocument::Keyed { bindings } => bindings,
        })
    }

    fn on_config_change(&self, callback: BindingsCallback) {
        self.callbacks.push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_map::QosLevel;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MINIMAL: &str = r#"
source:
  endpoint_url: opc.tcp://plc.local:4840
sink:
  host: broker.local
bindings:
  - source_node_id: ns=2;i=100
    topic: plant/line1/temp
    qos: 1
  - node: ns=2;i=101
    topic: plant/line1/{node_id}
    qos: 0
    retain: true
    format: raw
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.sink.port, 1883);
        assert_eq!(config.sink.keep_alive_secs, 60);
        assert!(config.sink.client_id.starts_with("petra-bridge-"));
        assert_eq!(config.bridge.queue_capacity, 1000);
        assert_eq!(config.bridge.pending_max_age_ms, 300_000);
        assert_eq!(config.backpressure.grace_period_ms, 30_000);
        assert_eq!(config.source.max_failed_keep_alives, 3);
        assert_eq!(config.bindings.len(), 2);
        assert_eq!(config.bindings[1].qos, QosLevel::AtMostOnce);
    }

    #[test]
    fn test_duplicate_bindings_rejected() {
        let yaml = r#"
source:
  endpoint_url: opc.tcp://plc.local:4840
sink:
  host: broker.local
bindings:
  - { source_node_id: "ns=2;i=1", topic: a }
  - { source_node_id: "ns=2;i=1", topic: b }
"#;
        match Config::from_yaml(yaml) {
            Err(BridgeError::Config(ConfigError::DuplicateNode(id))) => assert_eq!(id, "ns=2;i=1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.source.endpoint_url = "http://plc".into();
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.backpressure.low_watermark = Some(2000);
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.reconnect.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            ("PETRA_BRIDGE_MQTT_HOST", "10.0.0.5"),
            ("PETRA_BRIDGE_MQTT_PORT", "8883"),
            ("PETRA_BRIDGE_MQTT_CLIENT_ID", "sawmill_edge"),
            ("PETRA_BRIDGE_OPCUA_USERNAME", "bridge"),
            ("PETRA_BRIDGE_OPCUA_PASSWORD", "secret"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.sink.host, "10.0.0.5");
        assert_eq!(config.sink.port, 8883);
        assert_eq!(config.sink.client_id, "sawmill_edge");
        assert!(matches!(config.source.credentials, Credentials::UserName { .. }));
    }

    #[test]
    fn test_yaml_source_reload_fires_callbacks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "- {{ source_node_id: \"ns=2;i=1\", topic: a }}").unwrap();

        let source = YamlConfigSource::new(file.path());
        assert_eq!(source.get_bindings().unwrap().len(), 1);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        source.on_config_change(Arc::new(move |bindings| {
            counter.store(bindings.len(), Ordering::SeqCst);
        }));

        std::fs::write(
            file.path(),
            "bindings:\n  - { source_node_id: \"ns=2;i=1\", topic: a }\n  - { source_node_id: \"ns=2;i=2\", topic: b }\n",
        )
        .unwrap();
        assert_eq!(source.reload().unwrap(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_from_file_resolves_relative_bindings_file() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("bridge.yaml");
        std::fs::write(
            &main,
            "source: { endpoint_url: \"opc.tcp://plc:4840\" }\nsink: { host: broker }\nbindings_file: nodes.yaml\n",
        )
        .unwrap();
        let config = Config::from_file_with_overrides(&main, |_| None).unwrap();
        assert_eq!(config.bindings_file, Some(dir.path().join("nodes.yaml")));
    }

    #[test]
    fn test_from_file_validates_after_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("bridge.yaml");
        std::fs::write(
            &main,
            "source: { endpoint_url: \"opc.tcp://plc:4840\" }\nsink: { host: \"\" }\n",
        )
        .unwrap();

        // The broker host only arrives through the environment
        assert!(Config::from_file_with_overrides(&main, |_| None).is_err());
        let config = Config::from_file_with_overrides(&main, |key| {
            (key == "PETRA_BRIDGE_MQTT_HOST").then(|| "10.0.0.5".to_string())
        })
        .unwrap();
        assert_eq!(config.sink.host, "10.0.0.5");

        // An override can also break a valid file
        std::fs::write(
            &main,
            "source: { endpoint_url: \"opc.tcp://plc:4840\" }\nsink: { host: broker }\n",
        )
        .unwrap();
        let result = Config::from_file_with_overrides(&main, |key| {
            (key == "PETRA_BRIDGE_OPCUA_ENDPOINT").then(|| "http://plc".to_string())
        });
        assert!(matches!(result, Err(BridgeError::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn test_reconnect_and_control_limits() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.reconnect.max_delay_ms = u64::MAX;
        assert!(config.validate().is_err());
        config.reconnect.max_delay_ms = MAX_RECONNECT_DELAY_MS;
        assert!(config.validate().is_ok());

        config.sink.control_topic = Some("plant/+/control".into());
        assert!(config.validate().is_err());
        config.sink.control_topic = Some("plant/control".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_static_source_notifies() {
        let source = StaticConfigSource::new(vec![]);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        source.on_config_change(Arc::new(move |bindings| {
            counter.store(bindings.len(), Ordering::SeqCst);
        }));
        source.set_bindings(vec![NodeBinding::new("ns=2;i=1", "a")]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(source.get_bindings().unwrap().len(), 1);
    }
}
