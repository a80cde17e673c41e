// tests/property/main.rs - Property tests for bindings, queueing, backoff and reconciliation

mod backoff_prop;
mod node_map_prop;
mod queue_prop;
mod reconcile_prop;
