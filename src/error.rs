// src/error.rs - Error taxonomy for the bridge
use thiserror::Error;

/// Invalid binding configuration. The previous NodeMap snapshot stays active.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Two bindings share the same source node
    #[error("duplicate binding for source node '{0}'")]
    DuplicateNode(String),

    /// Binding without a source node identifier
    #[error("binding has an empty source node id")]
    EmptyNodeId,

    /// Topic is empty or not publishable
    #[error("invalid topic '{topic}' for node '{node_id}': {reason}")]
    InvalidTopic {
        node_id: String,
        topic: String,
        reason: &'static str,
    },

    /// QoS outside {0, 1, 2}
    #[error("invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),

    /// Any other rejected setting
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure to establish a protocol session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Credentials rejected; retrying is pointless until the endpoint is reconfigured
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Timeout or unreachable endpoint; retriable
    #[error("network error: {0}")]
    Network(String),
}

impl ConnectError {
    /// Whether the reconnect loop should keep trying
    pub fn is_retriable(&self) -> bool {
        matches!(self, ConnectError::Network(_))
    }
}

/// Failure to create a monitored item for a binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The node does not exist on the server; the binding is marked invalid
    #[error("node '{0}' not found on server")]
    NodeNotFound(String),

    /// Server refused for now; retry with backoff
    #[error("server busy: {0}")]
    ServerBusy(String),

    /// No active session to register the item on
    #[error("no active source session")]
    SessionUnavailable,
}

impl SubscribeError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, SubscribeError::NodeNotFound(_))
    }
}

/// Failure to write a value to a source node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// No active session to write on
    #[error("no active source session")]
    SessionUnavailable,

    /// The node does not exist on the server
    #[error("node '{0}' not found on server")]
    NodeNotFound(String),

    /// Node is not bound or its binding does not allow writes
    #[error("writes to node '{0}' are not allowed")]
    NotWritable(String),

    /// Server refused the value
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Failure to hand a message to the broker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// No active session; caller must queue
    #[error("sink not connected")]
    NotConnected,

    /// Acknowledgement not received in time
    #[error("publish acknowledgement timed out after {0} ms")]
    Timeout(u64),

    /// Transport refused the message outright
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Pending publish queue is full and the message could not be admitted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("pending queue full ({capacity} entries), dropped message for topic '{topic}'")]
pub struct OverflowError {
    pub topic: String,
    pub capacity: usize,
}

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while encoding JSON payloads
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Subscribe error: {0}")]
    Subscribe(#[from] SubscribeError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Overflow: {0}")]
    Overflow(#[from] OverflowError),

    /// The engine has already been shut down
    #[error("bridge is shut down")]
    ShutDown,
}

/// Convenient alias over [`Result`] using [`BridgeError`]
pub type Result<T> = std::result::Result<T, BridgeError>;
