//! Node liveness tracking
//!
//! Turns liveness signals into routing-table mutations: incoming messages
//! refresh (or add) a node, repeated request failures evict it, and a full
//! bucket triggers a ping of its stalest entry so a dead node can make room.

use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::kbucket::BucketInsert;
use crate::routing_table::SharedRoutingTable;
use crate::traits::{KeyOperator, MessageSender};
use dashmap::DashSet;
use kadmesh_protocol::NodeId;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Refreshes and evicts routing-table entries based on liveness
pub struct HealthTracker<N, S, O> {
    local_id: NodeId,
    table: SharedRoutingTable<N>,
    sender: Arc<S>,
    keys: Arc<O>,
    config: DhtConfig,

    /// Candidates with a probe in flight
    refreshing: DashSet<NodeId>,

    /// Consecutive request failures per node
    failures: Mutex<LruCache<NodeId, u32>>,

    /// Parent of every background probe
    shutdown: CancellationToken,
}

impl<N, S, O> HealthTracker<N, S, O>
where
    N: Clone + Send + Sync + 'static,
    S: MessageSender<N> + 'static,
    O: KeyOperator<N> + 'static,
{
    pub fn new(
        table: SharedRoutingTable<N>,
        sender: Arc<S>,
        keys: Arc<O>,
        config: DhtConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let local_id = *table.lock().local_id();
        let capacity = NonZeroUsize::new(config.failure_cache_size).unwrap_or(NonZeroUsize::MIN);
        HealthTracker {
            local_id,
            table,
            sender,
            keys,
            config,
            refreshing: DashSet::new(),
            failures: Mutex::new(LruCache::new(capacity)),
            shutdown,
        }
    }

    /// Record that `node` just talked to us
    ///
    /// Must be called from within a tokio runtime: a full bucket spawns a
    /// background probe of its stalest entry.
    pub fn on_incoming_message_from(self: &Arc<Self>, node: &N) -> BucketInsert {
        let id = self.keys.key(node);
        self.clear_failures(&id);
        self.refreshing.remove(&id);

        let result = self.table.lock().try_add_or_refresh(id, node.clone());

        if let Some((candidate_id, candidate)) = result.refresh_candidate {
            // The guard keeps one probe per candidate at a time.
            if candidate_id != self.local_id && self.refreshing.insert(candidate_id) {
                debug!(node = %id, candidate = %candidate_id, "bucket full, probing stalest entry");
                let tracker = Arc::clone(self);
                tokio::spawn(tracker.probe(candidate_id, candidate));
            }
        }

        result.outcome
    }

    /// Record a failed request to `node`
    ///
    /// Returns true when this failure evicted the node.
    pub fn on_request_failed(&self, node: &N) -> bool {
        let id = self.keys.key(node);
        if id == self.local_id {
            return false;
        }

        let count = {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            let count = failures.get(&id).copied().unwrap_or(0) + 1;
            if count >= self.config.failure_threshold {
                failures.pop(&id);
            } else {
                failures.put(id, count);
            }
            count
        };

        if count < self.config.failure_threshold {
            return false;
        }

        let removed = self.table.lock().remove(&id);
        if removed {
            debug!(node = %id, failures = count, "evicted unresponsive node");
        }
        removed
    }

    /// Current consecutive failure count for `id`
    pub fn failure_count(&self, id: &NodeId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(id)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a probe of `id` is pending
    pub fn is_refreshing(&self, id: &NodeId) -> bool {
        self.refreshing.contains(id)
    }

    fn clear_failures(&self, id: &NodeId) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(id);
    }

    /// Debounce, then ping the stalest entry of a full bucket
    async fn probe(self: Arc<Self>, id: NodeId, node: N) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.refreshing.remove(&id);
                return;
            }
            _ = tokio::time::sleep(self.config.refresh_debounce()) => {}
        }

        // Cleared when the candidate spoke to us during the debounce.
        if !self.refreshing.contains(&id) {
            debug!(candidate = %id, "candidate active during debounce, probe skipped");
            return;
        }
        let still_listed = self.table.lock().contains(&id);
        if !still_listed {
            self.refreshing.remove(&id);
            return;
        }

        let cancel = self.shutdown.child_token();
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Err(DhtError::Cancelled),
            res = tokio::time::timeout(self.config.ping_timeout(), self.sender.ping(&node, &cancel)) => {
                res.unwrap_or(Err(DhtError::Timeout))
            }
        };
        cancel.cancel();

        match outcome {
            Ok(()) => {
                self.on_incoming_message_from(&node);
            }
            Err(DhtError::Cancelled) => {
                self.refreshing.remove(&id);
            }
            Err(e) => {
                debug!(candidate = %id, error = %e, "stale entry failed probe, evicting");
                self.table.lock().remove(&id);
                self.clear_failures(&id);
                self.refreshing.remove(&id);
            }
        }
    }
}
