use bytes::Bytes;
use petra_bridge::{PendingPublish, PendingQueue, QosLevel};
use proptest::prelude::*;
use std::collections::HashMap;

proptest! {
    #[test]
    fn queue_respects_capacity_and_keeps_latest_qos0(
        capacity in 1usize..8,
        pushes in prop::collection::vec((0u8..4, any::<bool>()), 1..60),
    ) {
        let mut queue = PendingQueue::new(capacity);
        let mut latest_qos0: HashMap<String, u64> = HashMap::new();

        for (sequence, (node, acked)) in pushes.into_iter().enumerate() {
            let sequence = sequence as u64;
            let topic = format!("plant/t{node}");
            let qos = if acked { QosLevel::AtLeastOnce } else { QosLevel::AtMostOnce };
            let entry = PendingPublish::new(format!("ns=2;i={node}"), topic.clone(), Bytes::new(), qos, false)
                .with_sequence(sequence);
            if queue.push(entry).is_ok() && !acked {
                latest_qos0.insert(topic, sequence);
            }
            prop_assert!(queue.len() <= capacity);
        }

        let mut qos0_per_topic: HashMap<&str, usize> = HashMap::new();
        let mut last_acked: HashMap<&str, u64> = HashMap::new();
        for entry in queue.iter() {
            if entry.qos == QosLevel::AtMostOnce {
                *qos0_per_topic.entry(&entry.topic).or_default() += 1;
                // Whatever QoS 0 entry survives is the newest accepted one
                prop_assert_eq!(latest_qos0.get(&entry.topic), Some(&entry.sequence));
            } else {
                if let Some(previous) = last_acked.insert(&entry.topic, entry.sequence) {
                    prop_assert!(previous < entry.sequence);
                }
            }
        }
        prop_assert!(qos0_per_topic.values().all(|count| *count == 1));
    }
}
