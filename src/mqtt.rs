// src/mqtt.rs - rumqttc transport for the sink connection
//
// rumqttc reports acknowledgements by packet id on the event loop, while
// `AsyncClient::publish` only queues a request. Requests leave the event
// loop in the order they were queued, so each publish registers a waiter in
// a FIFO; the `Outgoing::Publish(pkid)` event pops it and binds it to the
// packet id, and the matching PubAck/PubComp completes it.

use crate::{
    error::{ConnectError, PublishError},
    node_map::QosLevel,
    sink::{status_payload, InboundMessage, SinkConfig, SinkSession, SinkTransport},
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

/// How long a graceful disconnect waits for the offline announcement
const OFFLINE_TIMEOUT: Duration = Duration::from_secs(1);

fn mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn refused(code: ConnectReturnCode) -> ConnectError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ConnectError::Auth(format!("broker refused credentials: {code:?}"))
        }
        other => ConnectError::Network(format!("broker refused connection: {other:?}")),
    }
}

/// Client options for a sink configuration
pub fn mqtt_options(config: &SinkConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(config.clean_session);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    if let Some(topic) = &config.status_topic {
        options.set_last_will(LastWill::new(
            topic,
            status_payload(false).to_vec(),
            QoS::AtLeastOnce,
            true,
        ));
    }
    options
}

/// Opens rumqttc sessions
#[derive(Debug, Clone, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SinkTransport for MqttTransport {
    type Session = MqttSession;

    async fn connect(
        &self,
        config: &SinkConfig,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Self::Session, ConnectError> {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(refused(ack.code));
                    }
                    break;
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(code)),
                Err(e) => return Err(ConnectError::Network(e.to_string())),
            }
        }
        debug!(host = %config.host, port = config.port, "MQTT CONNACK received");

        let acks = Arc::new(Mutex::new(AckState::default()));
        let closed = CancellationToken::new();
        tokio::spawn(drive(eventloop, acks.clone(), inbound, closed.clone()));

        // Clean sessions lose subscriptions, so subscribe on every connect
        if let Some(topic) = &config.control_topic {
            match client.subscribe(topic, QoS::AtLeastOnce).await {
                Ok(()) => info!(topic, "Subscribed to control topic"),
                Err(e) => warn!(topic, error = %e, "Control topic subscription failed"),
            }
        }

        let session = MqttSession {
            client,
            acks,
            order: tokio::sync::Mutex::new(()),
            closed,
            status_topic: config.status_topic.clone(),
        };
        if let Some(topic) = &session.status_topic {
            // Fire and forget; the receiver is not awaited
            if let Err(e) = session.enqueue(topic, status_payload(true), QosLevel::AtLeastOnce, true).await {
                warn!(topic, error = %e, "Failed to announce online status");
            }
        }
        Ok(session)
    }
}

#[derive(Default)]
struct AckState {
    /// Queued publishes not yet written, in request order
    unsent: VecDeque<(QoS, oneshot::Sender<()>)>,
    /// Written QoS 1/2 publishes by packet id
    awaiting: HashMap<u16, oneshot::Sender<()>>,
}

fn lock(acks: &Mutex<AckState>) -> MutexGuard<'_, AckState> {
    acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn drive(
    mut eventloop: EventLoop,
    acks: Arc<Mutex<AckState>>,
    inbound: mpsc::Sender<InboundMessage>,
    closed: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let mut state = lock(&acks);
                if let Some((qos, waiter)) = state.unsent.pop_front() {
                    if qos == QoS::AtMostOnce {
                        let _ = waiter.send(());
                    } else {
                        state.awaiting.insert(pkid, waiter);
                    }
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if let Some(waiter) = lock(&acks).awaiting.remove(&ack.pkid) {
                    let _ = waiter.send(());
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                if let Some(waiter) = lock(&acks).awaiting.remove(&comp.pkid) {
                    let _ = waiter.send(());
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if let Err(e) = inbound.try_send(message) {
                    warn!(error = %e, "Control message dropped");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(pkid = ack.pkid, codes = ?ack.return_codes, "SUBACK received");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent DISCONNECT");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT event loop stopped");
                break;
            }
        }
    }

    closed.cancel();
    // Dropping the senders fails every waiting publish with NotConnected
    let mut state = lock(&acks);
    state.unsent.clear();
    state.awaiting.clear();
}

/// A connected rumqttc client and its event-loop driver
pub struct MqttSession {
    client: AsyncClient,
    acks: Arc<Mutex<AckState>>,
    /// Keeps waiter registration and request queueing in the same order
    order: tokio::sync::Mutex<()>,
    closed: CancellationToken,
    status_topic: Option<String>,
}

impl MqttSession {
    async fn enqueue(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        retain: bool,
    ) -> Result<oneshot::Receiver<()>, PublishError> {
        if self.closed.is_cancelled() {
            return Err(PublishError::NotConnected);
        }
        let qos = mqtt_qos(qos);
        let (tx, rx) = oneshot::channel();

        let _order = self.order.lock().await;
        lock(&self.acks).unsent.push_back((qos, tx));
        if let Err(e) = self.client.publish_bytes(topic, qos, retain, payload).await {
            lock(&self.acks).unsent.pop_back();
            return Err(if self.closed.is_cancelled() {
                PublishError::NotConnected
            } else {
                PublishError::Rejected(e.to_string())
            });
        }
        Ok(rx)
    }
}

#[async_trait]
impl SinkSession for MqttSession {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel, retain: bool) -> Result<(), PublishError> {
        let ack = self.enqueue(topic, payload, qos, retain).await?;
        ack.await.map_err(|_| PublishError::NotConnected)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn disconnect(&self) {
        if let Some(topic) = &self.status_topic {
            // A clean DISCONNECT suppresses the last will
            match self.enqueue(topic, status_payload(false), QosLevel::AtLeastOnce, true).await {
                Ok(ack) => {
                    if tokio::time::timeout(OFFLINE_TIMEOUT, ack).await.is_err() {
                        debug!("Offline announcement not acknowledged");
                    }
                }
                Err(e) => debug!(error = %e, "Offline announcement not sent"),
            }
        }
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }
        let _ = tokio::time::timeout(OFFLINE_TIMEOUT, self.closed.cancelled()).await;
        self.closed.cancel();
        info!("MQTT client disconnected");
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let config = SinkConfig {
            client_id: "sawmill_edge".into(),
            username: Some("bridge".into()),
            password: Some("secret".into()),
            ..SinkConfig::new("broker.local", 1883)
        };
        let options = mqtt_options(&config);
        assert_eq!(options.client_id(), "sawmill_edge");
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));

        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "petra-bridge/status");
        assert!(will.retain);
        assert_eq!(&will.message[..], br#"{"status":"offline"}"#);
    }

    #[test]
    fn test_no_last_will_without_status_topic() {
        let config = SinkConfig {
            status_topic: None,
            ..SinkConfig::new("broker.local", 1883)
        };
        assert!(mqtt_options(&config).last_will().is_none());
    }

    #[test]
    fn test_refused_classification() {
        assert!(matches!(refused(ConnectReturnCode::NotAuthorized), ConnectError::Auth(_)));
        assert!(matches!(refused(ConnectReturnCode::BadUserNamePassword), ConnectError::Auth(_)));
        assert!(refused(ConnectReturnCode::ServiceUnavailable).is_retriable());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(mqtt_qos(QosLevel::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(mqtt_qos(QosLevel::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_network_error() {
        let config = SinkConfig::new("127.0.0.1", 1);
        let (inbound, _rx) = mpsc::channel(1);
        match MqttTransport::new().connect(&config, inbound).await {
            Err(ConnectError::Network(_)) => {}
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
