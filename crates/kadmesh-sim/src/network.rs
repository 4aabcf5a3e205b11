//! In-memory message delivery between simulated nodes

use crate::node::SimNode;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use kadmesh_dht::{DhtError, KeyOperator, MessageSender, Result};
use kadmesh_protocol::NodeId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A simulated peer as seen by other nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimPeer {
    pub id: NodeId,
    pub name: String,
}

impl SimPeer {
    /// Peer whose identifier is the hash of its name
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        SimPeer {
            id: NodeId::hash(name.as_bytes()),
            name,
        }
    }
}

impl fmt::Display for SimPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Maps a peer to its identifier
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerKeys;

impl KeyOperator<SimPeer> for PeerKeys {
    fn key(&self, node: &SimPeer) -> NodeId {
        node.id
    }
}

/// Registry of live nodes plus the knobs that make delivery fail
pub struct SimNetwork {
    nodes: DashMap<NodeId, Weak<SimNode>>,
    offline: DashSet<NodeId>,
    latency: Duration,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SimNetwork {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(SimNetwork {
            nodes: DashMap::new(),
            offline: DashSet::new(),
            latency,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn register(&self, node: &Arc<SimNode>) {
        self.nodes.insert(node.peer().id, Arc::downgrade(node));
    }

    pub fn set_offline(&self, id: NodeId) {
        self.offline.insert(id);
    }

    pub fn set_online(&self, id: &NodeId) {
        self.offline.remove(id);
    }

    pub fn is_online(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id) && !self.offline.contains(id)
    }

    /// Messages that reached their destination
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages to offline or unknown nodes
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolve `to` and wait out the link latency
    async fn deliver(&self, to: &SimPeer, cancel: &CancellationToken) -> Result<Arc<SimNode>> {
        let target = self
            .nodes
            .get(&to.id)
            .and_then(|entry| entry.value().upgrade())
            .filter(|_| !self.offline.contains(&to.id));

        let Some(target) = target else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(DhtError::Unreachable(to.to_string()));
        };

        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DhtError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }

        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(target)
    }
}

/// One node's view of the network
pub struct SimTransport {
    local: SimPeer,
    network: Arc<SimNetwork>,
}

impl SimTransport {
    pub fn new(local: SimPeer, network: Arc<SimNetwork>) -> Self {
        SimTransport { local, network }
    }
}

#[async_trait]
impl MessageSender<SimPeer> for SimTransport {
    async fn ping(&self, node: &SimPeer, cancel: &CancellationToken) -> Result<()> {
        let target = self.network.deliver(node, cancel).await?;
        target.handle_message_from(&self.local);
        Ok(())
    }

    async fn find_neighbours(
        &self,
        node: &SimPeer,
        target: &NodeId,
        cancel: &CancellationToken,
    ) -> Result<Vec<SimPeer>> {
        let callee = self.network.deliver(node, cancel).await?;
        callee.handle_message_from(&self.local);
        Ok(callee.neighbours(target))
    }
}
