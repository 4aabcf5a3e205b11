use crate::network::{PeerKeys, SimNetwork, SimPeer, SimTransport};
use anyhow::{Context, Result};
use kadmesh_dht::{BootstrapReport, DhtConfig, Kademlia};
use kadmesh_protocol::NodeId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type SimKademlia = Kademlia<SimPeer, SimTransport, PeerKeys>;

/// A simulated node: a peer identity plus its routing core
pub struct SimNode {
    peer: SimPeer,
    kademlia: SimKademlia,
}

impl SimNode {
    /// Create a node and register it with `network`
    pub fn spawn(
        peer: SimPeer,
        boot_nodes: Vec<SimPeer>,
        network: Arc<SimNetwork>,
        config: DhtConfig,
    ) -> Result<Arc<Self>> {
        let transport = SimTransport::new(peer.clone(), network.clone());
        let kademlia = Kademlia::new(
            peer.clone(),
            boot_nodes,
            Arc::new(transport),
            Arc::new(PeerKeys),
            config,
        )
        .with_context(|| format!("Failed to create routing core for {}", peer))?;

        let node = Arc::new(SimNode { peer, kademlia });
        network.register(&node);
        Ok(node)
    }

    pub fn peer(&self) -> &SimPeer {
        &self.peer
    }

    pub fn kademlia(&self) -> &SimKademlia {
        &self.kademlia
    }

    /// Inbound message from `from`: the sender is alive
    pub fn handle_message_from(&self, from: &SimPeer) {
        self.kademlia.add_or_refresh(from);
    }

    /// Answer a FindNeighbours request from the routing table
    pub fn neighbours(&self, target: &NodeId) -> Vec<SimPeer> {
        self.kademlia.get_k_neighbour(target, None, false)
    }

    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<BootstrapReport> {
        let report = self
            .kademlia
            .bootstrap(cancel)
            .await
            .with_context(|| format!("Bootstrap of {} failed", self.peer))?;
        debug!(
            node = %self.peer,
            online = report.boot_nodes_online,
            table = self.kademlia.node_count(),
            "node bootstrapped"
        );
        Ok(report)
    }
}
