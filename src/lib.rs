//! PETRA Bridge - OPC UA to MQTT protocol bridge
//!
//! Subscribes to data changes on an OPC UA server and republishes them on an
//! MQTT broker. Bindings map source nodes to topics and can be replaced at
//! runtime; both connections reconnect on their own with exponential backoff,
//! and QoS 1/2 messages are queued and delivered in order across outages.
//! An optional MQTT control topic accepts value writes back to the server.
//!
//! # Feature Flags
//!
//! - `mqtt` (default): rumqttc sink transport
//! - `opcua-support`: OPC UA client source transport
//! - `web`: HTTP status surface
//! - `metrics`: Prometheus export through the status surface
//! - `edge`: both transports, required by the `petra-bridge` binary
//!
//! # Examples
//!
//! ```rust,no_run
//! use petra_bridge::{BridgeEngine, Config, ConfigSource};
//! use petra_bridge::test_utils::{MockSink, MockSource};
//!
//! # async fn run() -> petra_bridge::Result<()> {
//! let config = Config::from_file("bridge.yaml")?;
//! let bindings = config.config_source().get_bindings()?;
//! let handle = BridgeEngine::new(&config, MockSource::new(), MockSink::new()).start(bindings)?;
//!
//! println!("{:?}", handle.status().health);
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// CORE MODULES (always available)
// ============================================================================

/// Error taxonomy shared by every component
pub mod error;

/// Values and data-change events delivered by the source
pub mod value;

/// Binding table with atomic snapshot replacement
pub mod node_map;

/// Exponential backoff for connection and subscription retries
pub mod reconnect;

/// OPC UA side: transport traits and the supervised connection
pub mod source;

/// MQTT side: transport traits and the supervised connection
pub mod sink;

/// Bounded queue of publishes waiting for the sink
pub mod queue;

/// Converges monitored items towards the desired bindings
pub mod reconcile;

/// Connection states, binding statuses and counters
pub mod status;

/// YAML configuration, environment overrides and binding providers
pub mod config;

/// Event routing, delivery and lifecycle
pub mod engine;

/// Write, binding and status commands over the MQTT control topic
pub mod control;

/// In-memory transports for tests and demos
pub mod test_utils;

// ============================================================================
// PROTOCOL MODULES (feature-gated)
// ============================================================================

#[cfg(feature = "mqtt")]
#[cfg_attr(docsrs, doc(cfg(feature = "mqtt")))]
pub mod mqtt;

#[cfg(feature = "opcua-support")]
#[cfg_attr(docsrs, doc(cfg(feature = "opcua-support")))]
pub mod opcua;

// ============================================================================
// WEB MODULES (feature-gated)
// ============================================================================

#[cfg(feature = "web")]
#[cfg_attr(docsrs, doc(cfg(feature = "web")))]
/// HTTP status, health and binding endpoints
pub mod status_server;

// ============================================================================
// PUBLIC RE-EXPORTS
// ============================================================================

pub use config::{Config, ConfigSource, StaticConfigSource, YamlConfigSource};
pub use control::{BindingsApplied, CommandResult, ControlCommand};
pub use engine::{BackpressureConfig, BridgeConfig, BridgeEngine, BridgeHandle};
pub use error::{
    BridgeError, ConfigError, ConnectError, OverflowError, PublishError, Result, SubscribeError, WriteError,
};
pub use node_map::{BindingDiff, NodeBinding, NodeMap, PayloadFormat, QosLevel, SamplePolicy};
pub use queue::{PendingPublish, PendingQueue};
pub use reconnect::{BackoffPolicy, ReconnectSupervisor};
pub use sink::{InboundMessage, SinkConfig, SinkConnection, SinkSession, SinkTransport};
pub use source::{Credentials, SourceConfig, SourceConnection, SourceSession, SourceTransport};
pub use status::{BindingStatus, BridgeStatus, ConnectionState, Health};
pub use value::{DataChangeEvent, Quality, Value};

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

#[cfg(feature = "opcua-support")]
pub use opcua::OpcUaTransport;

#[cfg(feature = "web")]
pub use status_server::StatusServer;

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub mod build_info {
    /// Git commit hash, `unknown` outside a checkout
    pub const GIT_HASH: &str = env!("PETRA_BRIDGE_GIT_HASH");

    /// Build timestamp
    pub const BUILD_TIMESTAMP: &str = env!("PETRA_BRIDGE_BUILD_TIMESTAMP");

    /// Rust version used for compilation
    pub const RUSTC_VERSION: &str = env!("PETRA_BRIDGE_RUSTC_VERSION");
}
