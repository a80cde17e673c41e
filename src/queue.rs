// src/queue.rs - Bounded queue of publishes waiting for the sink
use crate::{
    error::OverflowError,
    node_map::{PayloadFormat, QosLevel},
    value::DataChangeEvent,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A message that could not be handed to the sink yet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPublish {
    pub source_node_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
    pub enqueued_at: Instant,
    pub attempts: u32,
    /// Intake sequence of the event this message was rendered from
    pub sequence: u64,
    /// Event and format behind `payload`, for rendering it again when the
    /// binding's format changes while the message waits
    pub rendered: Option<(PayloadFormat, Arc<DataChangeEvent>)>,
}

/// How a message was admitted
#[derive(Debug, PartialEq)]
pub enum Admission {
    Queued,
    /// Replaced an older QoS 0 message for the same topic
    Coalesced(PendingPublish),
    /// Queue was full; the oldest QoS 0 message made room
    Evicted(PendingPublish),
}

/// FIFO of pending publishes, owned by the delivery task.
///
/// - QoS 0 messages are coalesced per topic: only the newest value is kept,
///   appended at the tail so per-node order is preserved.
/// - QoS 1/2 messages are never coalesced or evicted.
/// - When full, the oldest QoS 0 message is evicted; if there is none the
///   incoming message is rejected.
///
/// The depth never exceeds the capacity.
///
/// # Examples
///
/// ```rust
/// use petra_bridge::{PendingPublish, PendingQueue, QosLevel};
///
/// let mut queue = PendingQueue::new(2);
/// let msg = |v: &str| PendingPublish::new("ns=2;i=1", "plant/temp", v.to_string().into(), QosLevel::AtMostOnce, false);
/// queue.push(msg("21.0")).unwrap();
/// queue.push(msg("21.5")).unwrap();
/// assert_eq!(queue.len(), 1);
/// assert_eq!(&queue.front().unwrap().payload[..], b"21.5");
/// ```
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingPublish>,
    capacity: usize,
}

impl PendingPublish {
    pub fn new(
        source_node_id: impl Into<String>,
        topic: impl Into<String>,
        payload: Bytes,
        qos: QosLevel,
        retain: bool,
    ) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            topic: topic.into(),
            payload,
            qos,
            retain,
            enqueued_at: Instant::now(),
            attempts: 0,
            sequence: 0,
            rendered: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_event(mut self, format: PayloadFormat, event: Arc<DataChangeEvent>) -> Self {
        self.sequence = event.sequence;
        self.rendered = Some((format, event));
        self
    }

    /// Render the payload again if `format` differs from the one it was built with.
    ///
    /// Returns true if the payload changed.
    pub fn rerender(&mut self, format: PayloadFormat, render: impl FnOnce(&DataChangeEvent) -> Bytes) -> bool {
        let event = match &self.rendered {
            Some((current, event)) if *current != format => event.clone(),
            _ => return false,
        };
        self.payload = render(&event);
        self.rendered = Some((format, event));
        true
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn front(&self) -> Option<&PendingPublish> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingPublish> {
        self.entries.pop_front()
    }

    /// Put a message back at the head after a failed attempt
    pub fn push_front(&mut self, entry: PendingPublish) {
        self.entries.push_front(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingPublish> {
        self.entries.iter()
    }

    /// Admit a message according to the coalescing and eviction rules
    pub fn push(&mut self, entry: PendingPublish) -> Result<Admission, OverflowError> {
        if entry.qos == QosLevel::AtMostOnce {
            if let Some(idx) = self
                .entries
                .iter()
                .position(|e| e.qos == QosLevel::AtMostOnce && e.topic == entry.topic)
            {
                let replaced = self.entries.remove(idx);
                self.entries.push_back(entry);
                return Ok(replaced.map_or(Admission::Queued, Admission::Coalesced));
            }
        }

        if self.entries.len() < self.capacity {
            self.entries.push_back(entry);
            return Ok(Admission::Queued);
        }

        match self.entries.iter().position(|e| e.qos == QosLevel::AtMostOnce) {
            Some(idx) => {
                let evicted = self.entries.remove(idx);
                self.entries.push_back(entry);
                Ok(evicted.map_or(Admission::Queued, Admission::Evicted))
            }
            None => Err(OverflowError {
                topic: entry.topic,
                capacity: self.capacity,
            }),
        }
    }

    /// Remove messages older than `max_age`
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> Vec<PendingPublish> {
        let mut expired = Vec::new();
        self.entries.retain(|e| {
            if e.age(now) > max_age {
                expired.push(e.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove every message for `source_node_id`
    pub fn remove_node(&mut self, source_node_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.source_node_id != source_node_id);
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn msg(node: &str, topic: &str, value: &str, qos: QosLevel) -> PendingPublish {
        PendingPublish::new(node, topic, Bytes::from(value.to_string()), qos, false)
    }

    #[test]
    fn test_qos0_coalesced_latest_wins() {
        let mut q = PendingQueue::new(10);
        for v in ["1", "2", "3", "4", "5"] {
            q.push(msg("n", "t", v, QosLevel::AtMostOnce)).unwrap();
        }
        assert_eq!(q.len(), 1);
        assert_eq!(&q.front().unwrap().payload[..], b"5");
    }

    #[test]
    fn test_qos1_never_coalesced() {
        let mut q = PendingQueue::new(10);
        for v in ["1", "2", "3"] {
            assert_eq!(q.push(msg("n", "t", v, QosLevel::AtLeastOnce)).unwrap(), Admission::Queued);
        }
        let payloads: Vec<_> = q.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![Bytes::from("1"), Bytes::from("2"), Bytes::from("3")]);
    }

    #[test]
    fn test_coalesced_entry_moves_to_tail() {
        let mut q = PendingQueue::new(10);
        q.push(msg("a", "ta", "1", QosLevel::AtMostOnce)).unwrap();
        q.push(msg("b", "tb", "1", QosLevel::AtLeastOnce)).unwrap();
        q.push(msg("a", "ta", "2", QosLevel::AtMostOnce)).unwrap();
        let topics: Vec<_> = q.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, vec!["tb", "ta"]);
    }

    #[test]
    fn test_overflow_evicts_oldest_qos0() {
        let mut q = PendingQueue::new(3);
        q.push(msg("a", "ta", "1", QosLevel::AtMostOnce)).unwrap();
        q.push(msg("b", "tb", "1", QosLevel::AtLeastOnce)).unwrap();
        q.push(msg("c", "tc", "1", QosLevel::AtMostOnce)).unwrap();

        match q.push(msg("d", "td", "1", QosLevel::AtLeastOnce)).unwrap() {
            Admission::Evicted(old) => assert_eq!(old.topic, "ta"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_overflow_rejects_when_only_qos1() {
        let mut q = PendingQueue::new(2);
        q.push(msg("a", "ta", "1", QosLevel::AtLeastOnce)).unwrap();
        q.push(msg("b", "tb", "1", QosLevel::ExactlyOnce)).unwrap();
        let err = q.push(msg("c", "tc", "1", QosLevel::AtMostOnce)).unwrap_err();
        assert_eq!(err.topic, "tc");
        assert_eq!(err.capacity, 2);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_stale_entries() {
        let mut q = PendingQueue::new(10);
        q.push(msg("a", "ta", "1", QosLevel::AtLeastOnce)).unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        q.push(msg("b", "tb", "1", QosLevel::AtLeastOnce)).unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;

        let expired = q.expire(Instant::now(), Duration::from_secs(300));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].topic, "ta");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_remove_node() {
        let mut q = PendingQueue::new(10);
        q.push(msg("a", "ta", "1", QosLevel::AtLeastOnce)).unwrap();
        q.push(msg("b", "tb", "1", QosLevel::AtLeastOnce)).unwrap();
        q.push(msg("a", "ta", "2", QosLevel::AtLeastOnce)).unwrap();
        assert_eq!(q.remove_node("a"), 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_rerender_on_format_change() {
        let event = Arc::new(DataChangeEvent::new("a", Value::Float(21.5)));
        let mut entry = msg("a", "ta", "{\"value\":21.5}", QosLevel::AtLeastOnce)
            .with_event(PayloadFormat::Json, event);

        assert!(!entry.rerender(PayloadFormat::Json, |_| Bytes::from_static(b"unused")));
        assert!(entry.rerender(PayloadFormat::Raw, |event| Bytes::from(event.value.to_string())));
        assert_eq!(&entry.payload[..], b"21.5");
        assert!(!entry.rerender(PayloadFormat::Raw, |_| Bytes::from_static(b"unused")));

        // Messages without a source event keep their payload
        let mut bare = msg("b", "tb", "1", QosLevel::AtLeastOnce);
        assert!(!bare.rerender(PayloadFormat::Raw, |_| Bytes::from_static(b"unused")));
    }
}
