// src/control.rs - Commands received on the MQTT control topic
//
// A client publishes a JSON command on `sink.control_topic`. The bridge
// answers on `<control_topic>/result` and announces every applied binding
// set on `<control_topic>/config`.

use crate::{
    engine::BridgeHandle,
    error::{BridgeError, WriteError},
    node_map::{BindingDiff, NodeBinding, QosLevel},
    sink::{InboundMessage, SinkConnection, SinkTransport},
    source::{SourceConnection, SourceTransport},
    status::{bump, StatusBoard},
    value::Value,
};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Binding-update notices buffered for the control task
pub(crate) const NOTICE_CAPACITY: usize = 16;

/// A request published on the control topic
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Write a value to a bound node whose binding is `writable`
    Write {
        node_id: String,
        value: serde_json::Value,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Replace the binding set
    Bindings {
        bindings: Vec<NodeBinding>,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Report the bridge status
    Status {
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Write { .. } => "write",
            ControlCommand::Bindings { .. } => "bindings",
            ControlCommand::Status { .. } => "status",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ControlCommand::Write { request_id, .. }
            | ControlCommand::Bindings { request_id, .. }
            | ControlCommand::Status { request_id } => request_id.as_deref(),
        }
    }
}

/// Answer published on `<control_topic>/result`
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub timestamp: String,
}

impl CommandResult {
    fn new(command: &str, request_id: Option<&str>) -> Self {
        Self {
            command: command.to_string(),
            request_id: request_id.map(str::to_string),
            success: true,
            error: None,
            detail: None,
            timestamp: now(),
        }
    }

    fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    fn failed(mut self, error: impl ToString) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

/// Announcement published on `<control_topic>/config` after a binding set is applied
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingsApplied {
    pub version: u64,
    pub bindings: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl BindingsApplied {
    pub fn new(diff: &BindingDiff, version: u64, bindings: usize) -> Self {
        let ids = |list: &[NodeBinding]| list.iter().map(|b| b.source_node_id.clone()).collect();
        Self {
            version,
            bindings,
            added: ids(&diff.added),
            removed: ids(&diff.removed),
            changed: ids(&diff.changed),
        }
    }

    fn payload(&self) -> Bytes {
        let body = serde_json::json!({
            "event": "bindings_applied",
            "version": self.version,
            "bindings": self.bindings,
            "added": self.added,
            "removed": self.removed,
            "changed": self.changed,
            "timestamp": now(),
        });
        Bytes::from(body.to_string())
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Executes control commands against the running bridge
pub(crate) struct Controller<S: SourceTransport, K: SinkTransport> {
    pub source: Arc<SourceConnection<S>>,
    pub sink: Arc<SinkConnection<K>>,
    pub handle: BridgeHandle,
    pub board: Arc<StatusBoard>,
    pub control_topic: String,
    pub command_timeout: Duration,
}

impl<S: SourceTransport, K: SinkTransport> Controller<S, K> {
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut notices: mpsc::Receiver<BindingsApplied>,
        cancel: CancellationToken,
    ) {
        info!(topic = %self.control_topic, "Control topic handler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) if message.topic == self.control_topic => {
                        let result = self.execute(&message.payload).await;
                        self.respond(&result).await;
                    }
                    Some(message) => debug!(topic = %message.topic, "Ignoring message on unexpected topic"),
                    None => break,
                },
                notice = notices.recv() => match notice {
                    Some(notice) => self.announce(&notice).await,
                    None => break,
                },
            }
        }
        debug!("Control topic handler stopped");
    }

    /// Parse and run one command
    pub async fn execute(&self, payload: &[u8]) -> CommandResult {
        let command: ControlCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(e) => {
                bump!(self.board.counters, commands_rejected);
                warn!(error = %e, "Malformed control command");
                return CommandResult::new("unknown", None).failed(format!("malformed command: {e}"));
            }
        };

        let result = CommandResult::new(command.name(), command.request_id());
        let outcome = match &command {
            ControlCommand::Write { node_id, value, .. } => self
                .write(node_id, &Value::from_json(value))
                .await
                .map(|()| result.with_detail(serde_json::json!({ "node_id": node_id, "value": value }))),
            ControlCommand::Bindings { bindings, .. } => self
                .handle
                .apply_bindings(bindings.clone())
                .map(|diff| {
                    result.with_detail(serde_json::json!({
                        "added": diff.added.len(),
                        "removed": diff.removed.len(),
                        "changed": diff.changed.len(),
                    }))
                }),
            ControlCommand::Status { .. } => serde_json::to_value(self.handle.status())
                .map(|status| result.with_detail(status))
                .map_err(BridgeError::from),
        };

        match outcome {
            Ok(result) => {
                bump!(self.board.counters, commands_executed);
                info!(command = command.name(), request_id = ?command.request_id(), "Control command executed");
                result
            }
            Err(e) => {
                bump!(self.board.counters, commands_rejected);
                warn!(command = command.name(), request_id = ?command.request_id(), error = %e, "Control command failed");
                CommandResult::new(command.name(), command.request_id()).failed(e)
            }
        }
    }

    async fn write(&self, node_id: &str, value: &Value) -> Result<(), BridgeError> {
        let snapshot = self.handle.node_map().snapshot();
        if !snapshot.resolve(node_id).is_some_and(|binding| binding.writable) {
            return Err(WriteError::NotWritable(node_id.to_string()).into());
        }
        match tokio::time::timeout(self.command_timeout, self.source.write(node_id, value)).await {
            Ok(result) => result.map_err(BridgeError::from),
            Err(_) => Err(WriteError::Rejected(format!(
                "no response within {} ms",
                self.command_timeout.as_millis()
            ))
            .into()),
        }
    }

    async fn respond(&self, result: &CommandResult) {
        let topic = format!("{}/result", self.control_topic);
        match serde_json::to_vec(result) {
            Ok(payload) => self.send(&topic, Bytes::from(payload)).await,
            Err(e) => warn!(error = %e, "Failed to encode command result"),
        }
    }

    async fn announce(&self, notice: &BindingsApplied) {
        let topic = format!("{}/config", self.control_topic);
        self.send(&topic, notice.payload()).await;
    }

    /// Replies are not queued; they are lost while the sink is down
    async fn send(&self, topic: &str, payload: Bytes) {
        if let Err(e) = self.sink.publish(topic, payload, QosLevel::AtLeastOnce, false).await {
            warn!(topic, error = %e, "Control reply not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let write: ControlCommand = serde_json::from_str(
            r#"{"command":"write","node_id":"ns=2;s=Line1.Setpoint","value":80.5,"request_id":"42"}"#,
        )
        .unwrap();
        assert_eq!(write.name(), "write");
        assert_eq!(write.request_id(), Some("42"));

        let bindings: ControlCommand = serde_json::from_str(
            r#"{"command":"bindings","bindings":[{"node":"ns=2;i=1","topic":"plant/a"}]}"#,
        )
        .unwrap();
        match bindings {
            ControlCommand::Bindings { bindings, request_id } => {
                assert_eq!(bindings.len(), 1);
                assert_eq!(request_id, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(serde_json::from_str::<ControlCommand>(r#"{"command":"emergency_stop"}"#).is_err());
        assert!(serde_json::from_str::<ControlCommand>(r#"{"node_id":"x"}"#).is_err());
    }

    #[test]
    fn test_result_serialization() {
        let ok = CommandResult::new("status", Some("7"));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["request_id"], "7");
        assert!(json.get("error").is_none());

        let failed = CommandResult::new("write", None).failed(WriteError::NotWritable("ns=2;i=1".into()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("ns=2;i=1"));
        assert!(json.get("request_id").is_none());
    }

    #[test]
    fn test_bindings_applied_payload() {
        let diff = BindingDiff {
            added: vec![NodeBinding::new("ns=2;i=2", "plant/b")],
            removed: vec![NodeBinding::new("ns=2;i=3", "plant/c")],
            changed: vec![],
            unchanged: vec!["ns=2;i=1".into()],
        };
        let notice = BindingsApplied::new(&diff, 4, 2);
        let json: serde_json::Value = serde_json::from_slice(&notice.payload()).unwrap();
        assert_eq!(json["event"], "bindings_applied");
        assert_eq!(json["version"], 4);
        assert_eq!(json["added"], serde_json::json!(["ns=2;i=2"]));
        assert_eq!(json["removed"], serde_json::json!(["ns=2;i=3"]));
    }
}
