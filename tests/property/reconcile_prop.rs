use async_trait::async_trait;
use petra_bridge::error::SubscribeError;
use petra_bridge::reconcile::{Reconciler, Subscriber};
use petra_bridge::source::{MonitoredItemId, SubscriptionHandle};
use petra_bridge::status::StatusBoard;
use petra_bridge::{NodeBinding, QosLevel};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CountingSubscriber {
    subscribes: AtomicU32,
    unsubscribes: AtomicU32,
}

#[async_trait]
impl Subscriber for CountingSubscriber {
    async fn subscribe(&self, binding: &NodeBinding) -> Result<SubscriptionHandle, SubscribeError> {
        let id = self.subscribes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubscriptionHandle {
            epoch: 1,
            item: MonitoredItemId {
                subscription_id: 1,
                monitored_item_id: id,
            },
            source_node_id: binding.source_node_id.clone(),
        })
    }

    async fn unsubscribe(&self, _handle: &SubscriptionHandle) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
    }
}

fn desired(set: &BTreeMap<u8, (u8, bool)>) -> Vec<NodeBinding> {
    set.iter()
        .map(|(node, (topic, acked))| {
            let qos = if *acked { QosLevel::AtLeastOnce } else { QosLevel::AtMostOnce };
            NodeBinding::new(format!("ns=2;i={node}"), format!("plant/t{topic}")).with_qos(qos)
        })
        .collect()
}

proptest! {
    #[test]
    fn second_pass_with_same_inputs_is_a_noop(
        first in prop::collection::btree_map(0u8..16, (0u8..3, any::<bool>()), 0..10),
        second in prop::collection::btree_map(0u8..16, (0u8..3, any::<bool>()), 0..10),
        pause_qos0 in any::<bool>(),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let board = Arc::new(StatusBoard::new(10));
            let mut reconciler = Reconciler::new(board);
            let source = CountingSubscriber::default();

            reconciler.reconcile(&source, 1, &desired(&first), pause_qos0).await;
            let target = desired(&second);
            reconciler.reconcile(&source, 1, &target, pause_qos0).await;

            let subscribes = source.subscribes.load(Ordering::SeqCst);
            let unsubscribes = source.unsubscribes.load(Ordering::SeqCst);
            let report = reconciler.reconcile(&source, 1, &target, pause_qos0).await;

            prop_assert!(report.is_noop());
            prop_assert_eq!(source.subscribes.load(Ordering::SeqCst), subscribes);
            prop_assert_eq!(source.unsubscribes.load(Ordering::SeqCst), unsubscribes);

            let expected = target
                .iter()
                .filter(|b| !(pause_qos0 && b.qos == QosLevel::AtMostOnce))
                .count();
            prop_assert_eq!(reconciler.active_count(), expected);
            Ok(())
        })?;
    }
}
