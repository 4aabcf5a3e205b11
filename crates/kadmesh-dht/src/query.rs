//! Single-node queries shared by the lookup engines

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::health::HealthTracker;
use crate::routing_table::SharedRoutingTable;
use crate::traits::{KeyOperator, MessageSender};
use kadmesh_protocol::NodeId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a lookup needs to contact one node
pub struct QueryContext<N, S, O> {
    local_id: NodeId,
    table: SharedRoutingTable<N>,
    health: Arc<HealthTracker<N, S, O>>,
    sender: Arc<S>,
    keys: Arc<O>,
    config: DhtConfig,
}

impl<N, S, O> QueryContext<N, S, O>
where
    N: Clone + Send + Sync + 'static,
    S: MessageSender<N> + 'static,
    O: KeyOperator<N> + 'static,
{
    pub fn new(
        table: SharedRoutingTable<N>,
        health: Arc<HealthTracker<N, S, O>>,
        sender: Arc<S>,
        keys: Arc<O>,
        config: DhtConfig,
    ) -> Self {
        let local_id = *table.lock().local_id();
        QueryContext {
            local_id,
            table,
            health,
            sender,
            keys,
            config,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn key(&self, node: &N) -> NodeId {
        self.keys.key(node)
    }

    /// Closest known entries to `target`, the local node included
    pub fn seeds(&self, target: &NodeId, count: usize) -> Vec<(NodeId, N)> {
        self.table.lock().nearest_entries(target, count, None, false)
    }

    /// Ask `node` for its neighbours of `target`
    ///
    /// The local node is answered from the routing table. Remote calls get
    /// their own deadline, linked to `cancel`. Liveness is reported to the
    /// health tracker; parent cancellation is not held against the node.
    pub async fn find_neighbours(
        &self,
        id: &NodeId,
        node: &N,
        target: &NodeId,
        cancel: &CancellationToken,
    ) -> Result<Vec<N>> {
        if *id == self.local_id {
            return Ok(self.local_neighbours(target));
        }

        let request = cancel.child_token();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DhtError::Cancelled),
            res = tokio::time::timeout(
                self.config.request_timeout(),
                self.sender.find_neighbours(node, target, &request),
            ) => res.unwrap_or(Err(DhtError::Timeout)),
        };
        request.cancel();

        match &result {
            Ok(nodes) => {
                debug!(node = %id, returned = nodes.len(), "find_neighbours answered");
                self.health.on_incoming_message_from(node);
            }
            Err(DhtError::Cancelled) if cancel.is_cancelled() => {}
            Err(e) => {
                debug!(node = %id, error = %e, "find_neighbours failed");
                self.health.on_request_failed(node);
            }
        }

        result
    }

    fn local_neighbours(&self, target: &NodeId) -> Vec<N> {
        self.table
            .lock()
            .get_k_nearest(target, self.config.k, None, false)
    }
}
