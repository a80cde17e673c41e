// src/reconcile.rs - Bring the set of monitored items in line with the node map
use crate::{
    error::SubscribeError,
    node_map::{NodeBinding, QosLevel},
    source::{SourceConnection, SourceTransport, SubscriptionHandle},
    status::{BindingStatus, StatusBoard},
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The part of the source connection the reconciler needs
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, binding: &NodeBinding) -> Result<SubscriptionHandle, SubscribeError>;
    async fn unsubscribe(&self, handle: &SubscriptionHandle);
}

#[async_trait]
impl<T: SourceTransport> Subscriber for SourceConnection<T> {
    async fn subscribe(&self, binding: &NodeBinding) -> Result<SubscriptionHandle, SubscribeError> {
        SourceConnection::subscribe(self, binding).await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        SourceConnection::unsubscribe(self, handle).await
    }
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub subscribed: usize,
    pub unsubscribed: usize,
    /// Rejected with NodeNotFound in this pass
    pub invalid: usize,
    /// ServerBusy or no session; retried later
    pub retry: usize,
    pub paused: usize,
}

impl ReconcileReport {
    /// No subscription was created or deleted
    pub fn is_noop(&self) -> bool {
        self.subscribed == 0 && self.unsubscribed == 0
    }

    pub fn needs_retry(&self) -> bool {
        self.retry > 0
    }
}

struct ActiveItem {
    binding: NodeBinding,
    handle: SubscriptionHandle,
}

/// Tracks the monitored items held for the current source session.
///
/// Running [`reconcile`](Self::reconcile) twice with the same inputs does not
/// touch the source the second time.
pub struct Reconciler {
    epoch: u64,
    active: HashMap<String, ActiveItem>,
    /// Bindings the server rejected with NodeNotFound, by value
    rejected: HashMap<String, NodeBinding>,
    board: Arc<StatusBoard>,
}

impl Reconciler {
    pub fn new(board: Arc<StatusBoard>) -> Self {
        Self {
            epoch: 0,
            active: HashMap::new(),
            rejected: HashMap::new(),
            board,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, source_node_id: &str) -> bool {
        self.active.contains_key(source_node_id)
    }

    /// Diff the desired bindings against the held handles and apply the difference.
    ///
    /// A new `epoch` means the session was replaced: every held handle is
    /// already gone and rejected bindings get another chance.
    pub async fn reconcile<S: Subscriber + ?Sized>(
        &mut self,
        source: &S,
        epoch: u64,
        desired: &[NodeBinding],
        pause_qos0: bool,
    ) -> ReconcileReport {
        if epoch != self.epoch {
            if !self.active.is_empty() {
                debug!(old = self.epoch, new = epoch, handles = self.active.len(), "Dropping handles of previous session");
            }
            self.active.clear();
            self.rejected.clear();
            self.epoch = epoch;
        }

        let mut report = ReconcileReport::default();
        let paused = |b: &NodeBinding| pause_qos0 && b.qos == QosLevel::AtMostOnce;
        let wanted: HashMap<&str, &NodeBinding> = desired
            .iter()
            .filter(|b| !paused(b))
            .map(|b| (b.source_node_id.as_str(), b))
            .collect();

        // Removed, changed and paused items go first
        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|(id, item)| {
                wanted
                    .get(id.as_str())
                    .map_or(true, |w| !w.subscription_eq(&item.binding))
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(item) = self.active.remove(&id) {
                source.unsubscribe(&item.handle).await;
                report.unsubscribed += 1;
            }
        }
        for (id, item) in self.active.iter_mut() {
            if let Some(w) = wanted.get(id.as_str()) {
                item.binding = (*w).clone();
            }
        }
        self.rejected
            .retain(|id, binding| wanted.get(id.as_str()).is_some_and(|w| **w == *binding));

        for binding in desired {
            let id = binding.source_node_id.as_str();
            if paused(binding) {
                self.board.set_binding(id, BindingStatus::Paused);
                report.paused += 1;
                continue;
            }
            if self.active.contains_key(id) {
                self.board.set_binding(id, BindingStatus::Active);
                continue;
            }
            if self.rejected.contains_key(id) {
                continue;
            }

            match source.subscribe(binding).await {
                Ok(handle) => {
                    self.active.insert(
                        id.to_string(),
                        ActiveItem {
                            binding: binding.clone(),
                            handle,
                        },
                    );
                    self.board.set_binding(id, BindingStatus::Active);
                    report.subscribed += 1;
                }
                Err(e @ SubscribeError::NodeNotFound(_)) => {
                    warn!(node = id, topic = %binding.topic, "Binding rejected by server: {}", e);
                    self.rejected.insert(id.to_string(), binding.clone());
                    self.board.set_binding(id, BindingStatus::Invalid(e.to_string()));
                    report.invalid += 1;
                }
                Err(SubscribeError::SessionUnavailable) => {
                    self.board.set_binding(id, BindingStatus::Pending);
                    report.retry += 1;
                }
                Err(e) => {
                    debug!(node = id, "Subscribe deferred: {}", e);
                    self.board.set_binding(id, BindingStatus::Retrying(e.to_string()));
                    report.retry += 1;
                }
            }
        }

        let known: HashSet<&str> = desired.iter().map(|b| b.source_node_id.as_str()).collect();
        self.board.retain_bindings(|id| known.contains(id));

        if !report.is_noop() || report.invalid > 0 {
            info!(
                epoch,
                subscribed = report.subscribed,
                unsubscribed = report.unsubscribed,
                invalid = report.invalid,
                retry = report.retry,
                paused = report.paused,
                "Subscriptions reconciled"
            );
        }
        report
    }

    /// Session lost: all handles are dead, bindings wait for the next session
    pub fn invalidate_all(&mut self, desired: &[NodeBinding]) {
        if !self.active.is_empty() {
            debug!(handles = self.active.len(), "Invalidating subscription handles");
        }
        self.active.clear();
        for binding in desired {
            if !self.rejected.contains_key(&binding.source_node_id) {
                self.board.set_binding(&binding.source_node_id, BindingStatus::Pending);
            }
        }
        let known: HashSet<&str> = desired.iter().map(|b| b.source_node_id.as_str()).collect();
        self.board.retain_bindings(|id| known.contains(id));
    }
}
