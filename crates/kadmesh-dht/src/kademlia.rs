//! Kademlia orchestrator
//!
//! Wires the routing table, health tracker and both lookup engines together
//! behind the API a value-storage layer or service host consumes.

use crate::config::DhtConfig;
use crate::discovery::Discovery;
use crate::error::{DhtError, Result};
use crate::health::HealthTracker;
use crate::kbucket::BucketInsert;
use crate::lookup::{ClosestNodesLookup, LookupOutcome};
use crate::query::QueryContext;
use crate::routing_table::{BucketInfo, RoutingTable, SharedRoutingTable};
use crate::traits::{KeyOperator, MessageSender};
use futures::future::join_all;
use futures::stream::BoxStream;
use kadmesh_protocol::NodeId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one bootstrap pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Configured boot nodes, the local node excluded
    pub boot_nodes: usize,
    /// Boot nodes that answered the ping
    pub boot_nodes_online: usize,
    /// Nodes returned by the lookup of our own identifier
    pub self_lookup_found: usize,
    /// Non-empty buckets refreshed with a random-key lookup
    pub buckets_refreshed: usize,
}

/// The routing core of one local node
pub struct Kademlia<N, S, O> {
    local: N,
    local_id: NodeId,
    boot_nodes: Vec<N>,
    table: SharedRoutingTable<N>,
    health: Arc<HealthTracker<N, S, O>>,
    lookup: ClosestNodesLookup<N, S, O>,
    discovery: Discovery<N, S, O>,
    sender: Arc<S>,
    keys: Arc<O>,
    config: DhtConfig,

    /// Cancelled on drop to stop background probes
    shutdown: CancellationToken,
}

impl<N, S, O> Kademlia<N, S, O>
where
    N: Clone + Send + Sync + 'static,
    S: MessageSender<N> + 'static,
    O: KeyOperator<N> + 'static,
{
    /// Create the routing core for `local`
    ///
    /// The local node is stored in its own table so splitting follows its
    /// identifier and lookups can start from it.
    pub fn new(
        local: N,
        boot_nodes: Vec<N>,
        sender: Arc<S>,
        keys: Arc<O>,
        config: DhtConfig,
    ) -> Result<Self> {
        config.validate()?;

        let local_id = keys.key(&local);
        let mut table = RoutingTable::with_config(local_id, &config);
        table.try_add_or_refresh(local_id, local.clone());
        let table = SharedRoutingTable::new(table);

        let shutdown = CancellationToken::new();
        let health = Arc::new(HealthTracker::new(
            table.clone(),
            sender.clone(),
            keys.clone(),
            config.clone(),
            shutdown.clone(),
        ));
        let ctx = Arc::new(QueryContext::new(
            table.clone(),
            health.clone(),
            sender.clone(),
            keys.clone(),
            config.clone(),
        ));

        let boot_nodes: Vec<N> = boot_nodes
            .into_iter()
            .filter(|node| keys.key(node) != local_id)
            .collect();

        debug!(
            local = %local_id,
            boot_nodes = boot_nodes.len(),
            k = config.k,
            "kademlia created"
        );

        Ok(Kademlia {
            local,
            local_id,
            boot_nodes,
            table,
            health,
            lookup: ClosestNodesLookup::new(ctx.clone()),
            discovery: Discovery::new(ctx),
            sender,
            keys,
            config,
            shutdown,
        })
    }

    pub fn local(&self) -> &N {
        &self.local
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Record that `node` just sent us a message
    pub fn add_or_refresh(&self, node: &N) -> BucketInsert {
        self.health.on_incoming_message_from(node)
    }

    /// Record a failed request to `node`; returns true if it was evicted
    pub fn on_request_failed(&self, node: &N) -> bool {
        self.health.on_request_failed(node)
    }

    /// Drop `node` from the routing table. The local node cannot be removed.
    pub fn remove(&self, node: &N) -> bool {
        let id = self.keys.key(node);
        if id == self.local_id {
            return false;
        }
        self.table.lock().remove(&id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.table.lock().contains(id)
    }

    /// Number of nodes in the routing table, the local node included
    pub fn node_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Up to `k` known nodes closest to `target`, without network traffic
    pub fn get_k_neighbour(
        &self,
        target: &NodeId,
        exclude: Option<&NodeId>,
        exclude_self: bool,
    ) -> Vec<N> {
        self.table
            .lock()
            .get_k_nearest(target, self.config.k, exclude, exclude_self)
    }

    /// Find the nodes closest to `key` across the network
    ///
    /// Returns at most `k` (default: the configured `k`) nodes sorted by
    /// ascending distance. A cancelled lookup returns what it found so far.
    pub async fn lookup_nodes_closest(
        &self,
        key: &NodeId,
        k: Option<usize>,
        cancel: &CancellationToken,
    ) -> Vec<N> {
        self.lookup_nodes_closest_with_stats(key, k, cancel)
            .await
            .nodes
    }

    pub async fn lookup_nodes_closest_with_stats(
        &self,
        key: &NodeId,
        k: Option<usize>,
        cancel: &CancellationToken,
    ) -> LookupOutcome<N> {
        let k = k.unwrap_or(self.config.k).max(1);
        self.lookup.run(key, k, cancel).await
    }

    /// Lazily discover nodes around `target`
    pub fn discover(&self, target: NodeId, cancel: CancellationToken) -> BoxStream<'static, N> {
        self.discovery.discover(target, cancel)
    }

    /// Populate the routing table from the network
    ///
    /// Pings every boot node, looks up our own identifier, then refreshes
    /// every non-empty bucket with a lookup for a random key inside it.
    /// Unreachable boot nodes are counted, not treated as errors.
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<BootstrapReport> {
        let mut report = BootstrapReport {
            boot_nodes: self.boot_nodes.len(),
            ..Default::default()
        };

        let pings = self.boot_nodes.iter().map(|node| self.ping(node, cancel));
        report.boot_nodes_online = join_all(pings).await.into_iter().filter(|ok| *ok).count();
        if cancel.is_cancelled() {
            return Err(DhtError::Cancelled);
        }
        if report.boot_nodes > 0 && report.boot_nodes_online == 0 {
            warn!(boot_nodes = report.boot_nodes, "no boot node reachable");
        }

        report.self_lookup_found = self
            .lookup_nodes_closest(&self.local_id, None, cancel)
            .await
            .len();
        if cancel.is_cancelled() {
            return Err(DhtError::Cancelled);
        }

        let buckets: Vec<(NodeId, usize)> = self
            .table
            .lock()
            .iterate_buckets()
            .into_iter()
            .filter(|bucket| !bucket.nodes.is_empty())
            .map(|bucket| (bucket.prefix, bucket.depth))
            .collect();

        for (prefix, depth) in buckets {
            let target = self.keys.random_key_in_bucket(&prefix, depth);
            let found = self.lookup_nodes_closest(&target, None, cancel).await;
            if cancel.is_cancelled() {
                return Err(DhtError::Cancelled);
            }
            debug!(depth, found = found.len(), "bucket refreshed");
            report.buckets_refreshed += 1;
        }

        info!(
            boot_nodes = report.boot_nodes,
            online = report.boot_nodes_online,
            found = report.self_lookup_found,
            buckets = report.buckets_refreshed,
            table = self.node_count(),
            "bootstrap complete"
        );

        Ok(report)
    }

    /// Bootstrap, then sleep for the refresh interval, until `cancel` fires
    ///
    /// Only ever returns [`DhtError::Cancelled`].
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            self.bootstrap(cancel).await?;

            tokio::select! {
                _ = cancel.cancelled() => return Err(DhtError::Cancelled),
                _ = tokio::time::sleep(self.config.refresh_interval()) => {}
            }
        }
    }

    /// Refresh bucket `distance` with a lookup for a random key at that log-distance
    pub async fn refresh_distance(&self, distance: usize, cancel: &CancellationToken) -> Vec<N> {
        let target = self
            .local_id
            .random_at_distance(distance, &mut rand::thread_rng());
        self.lookup_nodes_closest(&target, None, cancel).await
    }

    /// Every known node at log-distance `distance` from us
    pub fn nodes_at_distance(&self, distance: usize) -> Vec<N> {
        self.table.lock().get_all_at_distance(distance)
    }

    /// Snapshot of every node in the routing table
    pub fn iterate_nodes(&self) -> Vec<N> {
        self.table.lock().all_nodes()
    }

    pub fn iterate_buckets(&self) -> Vec<BucketInfo<N>> {
        self.table.lock().iterate_buckets()
    }

    /// `OnNodeAdded`: one event per node newly stored in the table
    pub fn subscribe_node_added(&self) -> broadcast::Receiver<N> {
        self.table.lock().subscribe()
    }

    async fn ping(&self, node: &N, cancel: &CancellationToken) -> bool {
        let id = self.keys.key(node);
        let request = cancel.child_token();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DhtError::Cancelled),
            res = tokio::time::timeout(
                self.config.ping_timeout(),
                self.sender.ping(node, &request),
            ) => res.unwrap_or(Err(DhtError::Timeout)),
        };
        request.cancel();

        match result {
            Ok(()) => {
                self.health.on_incoming_message_from(node);
                true
            }
            Err(e) => {
                debug!(node = %id, error = %e, "boot node ping failed");
                false
            }
        }
    }
}

impl<N, S, O> Drop for Kademlia<N, S, O> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
