use petra_bridge::node_map::diff_keys;
use petra_bridge::{NodeBinding, NodeMap, QosLevel};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};

fn qos(level: u8) -> QosLevel {
    match level {
        0 => QosLevel::AtMostOnce,
        1 => QosLevel::AtLeastOnce,
        _ => QosLevel::ExactlyOnce,
    }
}

fn bindings(set: &BTreeMap<u8, (u8, u8)>) -> Vec<NodeBinding> {
    set.iter()
        .map(|(node, (topic, level))| {
            NodeBinding::new(format!("ns=2;i={node}"), format!("plant/t{topic}")).with_qos(qos(*level))
        })
        .collect()
}

fn binding_set() -> impl Strategy<Value = BTreeMap<u8, (u8, u8)>> {
    prop::collection::btree_map(0u8..20, (0u8..4, 0u8..3), 0..12)
}

proptest! {
    #[test]
    fn diff_partitions_old_and_new_keys(old in binding_set(), new in binding_set()) {
        let map = NodeMap::new();
        map.apply_config(bindings(&old)).unwrap();
        let diff = map.apply_config(bindings(&new)).unwrap();
        let (added, changed, unchanged, removed) = diff_keys(&diff);

        let new_keys: HashSet<String> = new.keys().map(|n| format!("ns=2;i={n}")).collect();
        let old_keys: HashSet<String> = old.keys().map(|n| format!("ns=2;i={n}")).collect();

        let mut present = added.clone();
        present.extend(changed.iter().cloned());
        present.extend(unchanged.iter().cloned());
        prop_assert_eq!(present.len(), added.len() + changed.len() + unchanged.len());
        prop_assert_eq!(&present, &new_keys);
        prop_assert_eq!(&removed, &old_keys.difference(&new_keys).cloned().collect::<HashSet<_>>());
        prop_assert!(added.is_disjoint(&old_keys));

        // The snapshot is exactly the new set
        let snapshot = map.snapshot();
        prop_assert_eq!(snapshot.len(), new.len());
        for binding in bindings(&new) {
            prop_assert_eq!(snapshot.resolve(&binding.source_node_id), Some(&binding));
        }
    }

    #[test]
    fn reapplying_the_same_set_changes_nothing(set in binding_set()) {
        let map = NodeMap::new();
        map.apply_config(bindings(&set)).unwrap();
        let diff = map.apply_config(bindings(&set)).unwrap();
        prop_assert!(diff.is_empty());
        prop_assert_eq!(diff.unchanged.len(), set.len());
    }
}
