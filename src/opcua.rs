// src/opcua.rs - OPC UA client transport for the source connection
//
// The `opcua` 0.12 client is synchronous; every session call runs on the
// blocking pool. Data-change callbacks arrive on the client's own thread and
// are forwarded through the non-blocking `EventSink`.

use crate::{
    error::{ConnectError, SubscribeError, WriteError},
    node_map::NodeBinding,
    source::{
        Credentials, EventSink, KeepAliveError, MonitoredItemId, SourceConfig, SourceEndpoint, SourceSession,
        SourceTransport,
    },
    value::{DataChangeEvent, Quality, Value},
};
use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use tracing::{debug, info, warn};

/// `Server_ServerStatus_State`, read on every keep-alive
const SERVER_STATE_NODE: u32 = 2259;

type NodeIndex = Arc<StdRwLock<HashMap<NodeId, String>>>;

/// Opens sessions with the `opcua` client library
#[derive(Debug, Clone, Default)]
pub struct OpcUaTransport;

impl OpcUaTransport {
    pub fn new() -> Self {
        Self
    }
}

fn is_auth_failure(code: StatusCode) -> bool {
    [
        StatusCode::BadUserAccessDenied,
        StatusCode::BadIdentityTokenInvalid,
        StatusCode::BadIdentityTokenRejected,
        StatusCode::BadCertificateUntrusted,
    ]
    .contains(&code)
}

fn is_session_gone(code: StatusCode) -> bool {
    [
        StatusCode::BadNotConnected,
        StatusCode::BadSessionIdInvalid,
        StatusCode::BadSessionClosed,
        StatusCode::BadConnectionClosed,
        StatusCode::BadSecureChannelClosed,
    ]
    .contains(&code)
}

fn connect_error(code: StatusCode) -> ConnectError {
    if is_auth_failure(code) {
        ConnectError::Auth(format!("{code}"))
    } else {
        ConnectError::Network(format!("{code}"))
    }
}

fn subscribe_error(code: StatusCode, node: &str) -> SubscribeError {
    if [StatusCode::BadNodeIdUnknown, StatusCode::BadNodeIdInvalid, StatusCode::BadAttributeIdInvalid].contains(&code) {
        SubscribeError::NodeNotFound(node.to_string())
    } else if is_session_gone(code) {
        SubscribeError::SessionUnavailable
    } else {
        SubscribeError::ServerBusy(format!("{code}"))
    }
}

fn write_error(code: StatusCode, node: &str) -> WriteError {
    if [StatusCode::BadNodeIdUnknown, StatusCode::BadNodeIdInvalid].contains(&code) {
        WriteError::NodeNotFound(node.to_string())
    } else if is_session_gone(code) {
        WriteError::SessionUnavailable
    } else {
        WriteError::Rejected(format!("{code}"))
    }
}

/// Collapse an OPC UA status code to a quality
pub fn quality(code: StatusCode) -> Quality {
    if code.is_good() {
        Quality::Good
    } else if code.is_uncertain() {
        Quality::Uncertain
    } else {
        Quality::Bad
    }
}

/// Convert a variant to a bridge value
pub fn convert(variant: &Variant) -> Value {
    match variant {
        Variant::Empty => Value::Empty,
        Variant::Boolean(b) => Value::Bool(*b),
        Variant::SByte(v) => Value::Int(*v as i64),
        Variant::Int16(v) => Value::Int(*v as i64),
        Variant::Int32(v) => Value::Int(*v as i64),
        Variant::Int64(v) => Value::Int(*v),
        Variant::Byte(v) => Value::UInt(*v as u64),
        Variant::UInt16(v) => Value::UInt(*v as u64),
        Variant::UInt32(v) => Value::UInt(*v as u64),
        Variant::UInt64(v) => Value::UInt(*v),
        Variant::Float(v) => Value::Float(*v as f64),
        Variant::Double(v) => Value::Float(*v),
        Variant::String(s) => Value::String(s.to_string()),
        Variant::DateTime(dt) => Value::Timestamp(dt.as_chrono()),
        Variant::ByteString(b) => Value::Bytes(b.value.clone().unwrap_or_default()),
        Variant::Array(array) => Value::Array(array.values.iter().map(convert).collect()),
        other => Value::String(other.to_string()),
    }
}

/// Variant for a written value. Arrays and structures are not writable.
pub fn to_variant(value: &Value) -> Option<Variant> {
    let variant = match value {
        Value::Empty => Variant::Empty,
        Value::Bool(b) => Variant::Boolean(*b),
        Value::Int(i) => Variant::Int64(*i),
        Value::UInt(u) => Variant::UInt64(*u),
        Value::Float(f) => Variant::Double(*f),
        Value::String(s) => Variant::String(UAString::from(s.as_str())),
        Value::Bytes(b) => Variant::from(ByteString::from(b.clone())),
        Value::Timestamp(t) => Variant::from(opcua::types::DateTime::from(*t)),
        Value::Array(_) | Value::Struct(_) => return None,
    };
    Some(variant)
}

fn data_change(source_node_id: &str, data: &DataValue) -> DataChangeEvent {
    let value = data.value.as_ref().map(convert).unwrap_or(Value::Empty);
    let mut event = DataChangeEvent::new(source_node_id, value)
        .with_quality(data.status.map(quality).unwrap_or(Quality::Good));
    if let Some(timestamp) = &data.source_timestamp {
        event = event.with_timestamp(timestamp.as_chrono());
    }
    event
}

/// Hands monitored-item notifications to the engine.
///
/// The client keeps up to `queue_size` values per item and reports the whole
/// queue on every notification. Each node remembers the last value it
/// forwarded so every value goes out once, oldest first.
struct Forwarder {
    nodes: NodeIndex,
    events: EventSink,
    forwarded: Mutex<HashMap<NodeId, DataValue>>,
}

impl Forwarder {
    fn new(nodes: NodeIndex, events: EventSink) -> Self {
        Self {
            nodes,
            events,
            forwarded: Mutex::new(HashMap::new()),
        }
    }

    fn on_data_change(&self, items: &[&MonitoredItem]) {
        for item in items {
            let values: Vec<&DataValue> = item.values().iter().collect();
            self.forward(&item.item_to_monitor().node_id, &values, item.last_value());
        }
    }

    /// Deliver the values not forwarded yet. Returns how many went out.
    fn forward(&self, node_id: &NodeId, values: &[&DataValue], last: &DataValue) -> usize {
        let source_node_id = match self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner()).get(node_id) {
            Some(id) => id.clone(),
            None => {
                debug!(node = %node_id, "Notification for unknown item");
                return 0;
            }
        };

        let mut forwarded = self.forwarded.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let marker = forwarded.get(node_id);
        let fresh: Vec<&DataValue> = if values.is_empty() {
            if marker == Some(last) { Vec::new() } else { vec![last] }
        } else {
            unseen(values, marker).to_vec()
        };

        for value in &fresh {
            self.events.deliver(data_change(&source_node_id, value));
        }
        if let Some(newest) = fresh.last() {
            forwarded.insert(node_id.clone(), (*newest).clone());
        }
        fresh.len()
    }

    fn forget(&self, node_id: &NodeId) {
        self.forwarded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(node_id);
    }
}

/// Values queued after `marker`; all of them when the marker is gone
fn unseen<'a, 'b, T: PartialEq>(values: &'a [&'b T], marker: Option<&T>) -> &'a [&'b T] {
    match marker.and_then(|m| values.iter().rposition(|v| *v == m)) {
        Some(position) => &values[position + 1..],
        None => values,
    }
}

struct Opened {
    session: Arc<RwLock<Session>>,
    subscription_id: u32,
    stop: tokio::sync::oneshot::Sender<SessionCommand>,
}

fn open_session(
    config: &SourceConfig,
    endpoint: &SourceEndpoint,
    forwarder: Arc<Forwarder>,
) -> Result<Opened, ConnectError> {
    let mut client = ClientBuilder::new()
        .application_name(config.application_name.as_str())
        .application_uri("urn:petra:bridge")
        .product_uri("urn:petra:bridge")
        .trust_server_certs(true)
        .create_sample_keypair(true)
        .session_retry_limit(0)
        .client()
        .ok_or_else(|| ConnectError::Network("invalid OPC UA client configuration".to_string()))?;

    let identity = match &endpoint.credentials {
        Credentials::Anonymous => IdentityToken::Anonymous,
        Credentials::UserName { username, password } => IdentityToken::UserName(username.clone(), password.clone()),
    };
    let session = client
        .connect_to_endpoint(
            (
                endpoint.url.as_str(),
                SecurityPolicy::None.to_str(),
                MessageSecurityMode::None,
                UserTokenPolicy::anonymous(),
            ),
            identity,
        )
        .map_err(connect_error)?;

    let subscription_id = session
        .read()
        .create_subscription(
            config.publishing_interval_ms as f64,
            60,
            10,
            0,
            0,
            true,
            DataChangeCallback::new(move |items| forwarder.on_data_change(&items)),
        )
        .map_err(|code| ConnectError::Network(format!("create subscription failed: {code}")))?;

    let stop = Session::run_async(session.clone());
    Ok(Opened {
        session,
        subscription_id,
        stop,
    })
}

#[async_trait]
impl SourceTransport for OpcUaTransport {
    type Session = OpcUaSession;

    async fn connect(
        &self,
        config: &SourceConfig,
        endpoint: &SourceEndpoint,
        events: EventSink,
    ) -> Result<Self::Session, ConnectError> {
        let nodes: NodeIndex = Arc::new(StdRwLock::new(HashMap::new()));
        let forwarder = Arc::new(Forwarder::new(nodes.clone(), events));
        let (config, endpoint, callback) = (config.clone(), endpoint.clone(), forwarder.clone());
        let opened = tokio::task::spawn_blocking(move || open_session(&config, &endpoint, callback))
            .await
            .map_err(|e| ConnectError::Network(format!("connect task failed: {e}")))??;

        info!(subscription_id = opened.subscription_id, "OPC UA subscription created");
        Ok(OpcUaSession {
            session: opened.session,
            subscription_id: opened.subscription_id,
            nodes,
            forwarder,
            items: Mutex::new(HashMap::new()),
            stop: Mutex::new(Some(opened.stop)),
        })
    }
}

/// A connected `opcua` client session with one subscription
pub struct OpcUaSession {
    session: Arc<RwLock<Session>>,
    subscription_id: u32,
    nodes: NodeIndex,
    forwarder: Arc<Forwarder>,
    items: Mutex<HashMap<u32, NodeId>>,
    stop: Mutex<Option<tokio::sync::oneshot::Sender<SessionCommand>>>,
}

impl OpcUaSession {
    fn index(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<NodeId, String>> {
        self.nodes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SourceSession for OpcUaSession {
    async fn create_monitored_item(&self, binding: &NodeBinding) -> Result<MonitoredItemId, SubscribeError> {
        let id = binding.source_node_id.clone();
        let node_id = NodeId::from_str(&id).map_err(|_| SubscribeError::NodeNotFound(id.clone()))?;
        let request = MonitoredItemCreateRequest::new(
            node_id.clone().into(),
            MonitoringMode::Reporting,
            MonitoringParameters {
                client_handle: 0,
                sampling_interval: binding.sample_policy.sampling_interval_ms as f64,
                filter: ExtensionObject::null(),
                queue_size: binding.sample_policy.queue_size,
                discard_oldest: binding.sample_policy.discard_oldest,
            },
        );

        // Registered first so the initial notification is not lost
        self.index().insert(node_id.clone(), id.clone());

        let session = self.session.clone();
        let subscription_id = self.subscription_id;
        let result = tokio::task::spawn_blocking(move || {
            session
                .read()
                .create_monitored_items(subscription_id, TimestampsToReturn::Both, &[request])
        })
        .await
        .map_err(|e| SubscribeError::ServerBusy(format!("subscribe task failed: {e}")))?;

        let created = match result {
            Ok(mut results) if !results.is_empty() => {
                let created = results.remove(0);
                if created.status_code.is_good() {
                    Ok(created.monitored_item_id)
                } else {
                    Err(subscribe_error(created.status_code, &id))
                }
            }
            Ok(_) => Err(SubscribeError::ServerBusy("empty create response".to_string())),
            Err(code) => Err(subscribe_error(code, &id)),
        };

        match created {
            Ok(monitored_item_id) => {
                self.items
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(monitored_item_id, node_id);
                Ok(MonitoredItemId {
                    subscription_id,
                    monitored_item_id,
                })
            }
            Err(e) => {
                self.index().remove(&node_id);
                Err(e)
            }
        }
    }

    async fn delete_monitored_item(&self, item: MonitoredItemId) -> Result<(), SubscribeError> {
        let node_id = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&item.monitored_item_id);
        if let Some(node_id) = &node_id {
            self.index().remove(node_id);
            self.forwarder.forget(node_id);
        }

        let session = self.session.clone();
        let result = tokio::task::spawn_blocking(move || {
            session
                .read()
                .delete_monitored_items(item.subscription_id, &[item.monitored_item_id])
        })
        .await
        .map_err(|e| SubscribeError::ServerBusy(format!("unsubscribe task failed: {e}")))?;

        match result {
            Ok(_) => Ok(()),
            Err(code) => {
                let node = node_id.map(|n| n.to_string()).unwrap_or_default();
                Err(subscribe_error(code, &node))
            }
        }
    }

    async fn write_value(&self, node_id: &str, value: &Value) -> Result<(), WriteError> {
        let id = NodeId::from_str(node_id).map_err(|_| WriteError::NodeNotFound(node_id.to_string()))?;
        let variant = to_variant(value)
            .ok_or_else(|| WriteError::Rejected(format!("{} values cannot be written", value.type_name())))?;

        let session = self.session.clone();
        let node = node_id.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = session.read();

            // The server expects the node's own data type
            let current = guard
                .read(&[ReadValueId::from(id.clone())], TimestampsToReturn::Neither, 0.0)
                .map_err(|code| write_error(code, &node))?;
            let variant = match current.first().and_then(|data| data.value.as_ref()) {
                Some(existing) if !matches!(existing, Variant::Empty) && existing.type_id() != variant.type_id() => {
                    let target = existing.type_id();
                    match variant.cast(target) {
                        Variant::Empty => {
                            return Err(WriteError::Rejected(format!("cannot convert value to {target:?}")));
                        }
                        cast => cast,
                    }
                }
                _ => variant,
            };

            let results = guard
                .write(&[WriteValue {
                    node_id: id,
                    attribute_id: AttributeId::Value as u32,
                    index_range: UAString::null(),
                    value: DataValue::value_only(variant),
                }])
                .map_err(|code| write_error(code, &node))?;
            match results.first() {
                Some(code) if code.is_good() => Ok(()),
                Some(code) => Err(write_error(*code, &node)),
                None => Err(WriteError::Rejected("empty write response".to_string())),
            }
        })
        .await
        .map_err(|e| WriteError::Rejected(format!("write task failed: {e}")))?
    }

    async fn keep_alive(&self) -> Result<(), KeepAliveError> {
        let session = self.session.clone();
        let result = tokio::task::spawn_blocking(move || {
            let guard = session.read();
            if !guard.is_connected() {
                return Err(StatusCode::BadNotConnected);
            }
            guard.read(
                &[ReadValueId::from(NodeId::new(0, SERVER_STATE_NODE))],
                TimestampsToReturn::Neither,
                0.0,
            )
        })
        .await
        .map_err(|e| KeepAliveError::Transient(format!("keep-alive task failed: {e}")))?;

        match result {
            Ok(_) => Ok(()),
            Err(code) if is_session_gone(code) => Err(KeepAliveError::Fatal(format!("{code}"))),
            Err(code) => Err(KeepAliveError::Transient(format!("{code}"))),
        }
    }

    async fn disconnect(&self) {
        if let Some(stop) = self.stop.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take() {
            let _ = stop.send(SessionCommand::Stop);
        }
        let session = self.session.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || session.read().disconnect()).await {
            warn!(error = %e, "OPC UA disconnect task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusBoard;

    fn reading(v: f64) -> DataValue {
        DataValue {
            value: Some(Variant::Double(v)),
            status: Some(StatusCode::Good),
            ..DataValue::default()
        }
    }

    fn forwarder() -> (Forwarder, NodeId, tokio::sync::mpsc::Receiver<DataChangeEvent>) {
        let node = NodeId::new(2, 100);
        let nodes: NodeIndex = Arc::new(StdRwLock::new(HashMap::from([(node.clone(), "ns=2;i=100".to_string())])));
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let events = EventSink::new(tx, Arc::new(StatusBoard::new(10)));
        (Forwarder::new(nodes, events), node, rx)
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<DataChangeEvent>) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|event| event.value).collect()
    }

    #[test]
    fn test_forwards_every_queued_value_in_order() {
        let (forwarder, node, mut rx) = forwarder();
        let (a, b, c) = (reading(21.0), reading(21.5), reading(22.0));

        assert_eq!(forwarder.forward(&node, &[&a, &b, &c], &c), 3);
        assert_eq!(drain(&mut rx), vec![Value::Float(21.0), Value::Float(21.5), Value::Float(22.0)]);

        // The next notification reports the queue again with one new value
        let d = reading(22.5);
        assert_eq!(forwarder.forward(&node, &[&b, &c, &d], &d), 1);
        assert_eq!(drain(&mut rx), vec![Value::Float(22.5)]);

        assert_eq!(forwarder.forward(&node, &[&b, &c, &d], &d), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_forward_falls_back_to_last_value() {
        let (forwarder, node, mut rx) = forwarder();
        let a = reading(1.0);
        assert_eq!(forwarder.forward(&node, &[], &a), 1);
        assert_eq!(forwarder.forward(&node, &[], &a), 0);
        assert_eq!(drain(&mut rx), vec![Value::Float(1.0)]);

        // A recreated item starts over
        forwarder.forget(&node);
        assert_eq!(forwarder.forward(&node, &[&a], &a), 1);

        assert_eq!(forwarder.forward(&NodeId::new(2, 999), &[&a], &a), 0);
    }

    #[test]
    fn test_unseen_after_marker() {
        let values = [1, 2, 3, 4];
        let refs: Vec<&i32> = values.iter().collect();
        assert_eq!(unseen(&refs, Some(&2)), &[&3, &4]);
        assert_eq!(unseen(&refs, Some(&4)).len(), 0);
        assert_eq!(unseen(&refs, Some(&9)).len(), 4);
        assert_eq!(unseen(&refs, None).len(), 4);
    }

    #[test]
    fn test_convert_scalars() {
        assert_eq!(convert(&Variant::Double(21.5)), Value::Float(21.5));
        assert_eq!(convert(&Variant::Int32(-4)), Value::Int(-4));
        assert_eq!(convert(&Variant::UInt16(7)), Value::UInt(7));
        assert_eq!(convert(&Variant::Boolean(true)), Value::Bool(true));
        assert_eq!(convert(&Variant::String(UAString::from("running"))), Value::String("running".into()));
        assert_eq!(convert(&Variant::Empty), Value::Empty);
    }

    #[test]
    fn test_quality_from_status() {
        assert_eq!(quality(StatusCode::Good), Quality::Good);
        assert_eq!(quality(StatusCode::BadNodeIdUnknown), Quality::Bad);
        assert_eq!(quality(StatusCode::UncertainLastUsableValue), Quality::Uncertain);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(connect_error(StatusCode::BadUserAccessDenied), ConnectError::Auth(_)));
        assert!(connect_error(StatusCode::BadTimeout).is_retriable());
        assert_eq!(
            subscribe_error(StatusCode::BadNodeIdUnknown, "ns=2;i=9"),
            SubscribeError::NodeNotFound("ns=2;i=9".into())
        );
        assert!(subscribe_error(StatusCode::BadTooManyMonitoredItems, "x").is_retriable());
        assert_eq!(subscribe_error(StatusCode::BadSessionIdInvalid, "x"), SubscribeError::SessionUnavailable);
    }

    #[test]
    fn test_written_values_map_to_variants() {
        assert_eq!(to_variant(&Value::Float(80.0)), Some(Variant::Double(80.0)));
        assert_eq!(to_variant(&Value::Bool(false)), Some(Variant::Boolean(false)));
        assert_eq!(to_variant(&Value::String("auto".into())), Some(Variant::String(UAString::from("auto"))));
        assert_eq!(to_variant(&Value::Array(vec![Value::Int(1)])), None);

        assert_eq!(write_error(StatusCode::BadNodeIdUnknown, "ns=2;i=9"), WriteError::NodeNotFound("ns=2;i=9".into()));
        assert_eq!(write_error(StatusCode::BadSessionClosed, "x"), WriteError::SessionUnavailable);
        assert!(matches!(write_error(StatusCode::BadTypeMismatch, "x"), WriteError::Rejected(_)));
    }

    #[test]
    fn test_data_change_uses_source_timestamp() {
        let stamp = opcua::types::DateTime::now();
        let data = DataValue {
            value: Some(Variant::Double(1.5)),
            status: Some(StatusCode::Good),
            source_timestamp: Some(stamp),
            ..DataValue::default()
        };
        let event = data_change("ns=2;i=100", &data);
        assert_eq!(event.value, Value::Float(1.5));
        assert_eq!(event.timestamp, stamp.as_chrono());
    }
}
