//! Scripted in-memory network shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use kadmesh_dht::{DhtConfig, DhtError, IdentityKeys, Kademlia, MessageSender, Result};
use kadmesh_protocol::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type TestKademlia = Kademlia<NodeId, FakeNetwork, IdentityKeys>;

/// Fixed neighbour lists per node, plus offline and hanging nodes
#[derive(Default)]
pub struct FakeNetwork {
    neighbours: Mutex<HashMap<NodeId, Vec<NodeId>>>,
    offline: Mutex<HashSet<NodeId>>,
    hanging: Mutex<HashSet<NodeId>>,
    find_calls: Mutex<Vec<NodeId>>,
    ping_calls: Mutex<Vec<NodeId>>,
    jitter: bool,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Responses are delayed by a few milliseconds derived from the node id
    pub fn with_jitter() -> Self {
        FakeNetwork {
            jitter: true,
            ..Default::default()
        }
    }

    pub fn set_neighbours(&self, node: NodeId, neighbours: Vec<NodeId>) {
        self.neighbours.lock().unwrap().insert(node, neighbours);
    }

    pub fn set_offline(&self, node: NodeId) {
        self.offline.lock().unwrap().insert(node);
    }

    pub fn set_online(&self, node: NodeId) {
        self.offline.lock().unwrap().remove(&node);
    }

    /// The node never answers; only a deadline or cancellation ends the call
    pub fn set_hanging(&self, node: NodeId) {
        self.hanging.lock().unwrap().insert(node);
    }

    pub fn find_calls(&self) -> Vec<NodeId> {
        self.find_calls.lock().unwrap().clone()
    }

    pub fn find_count(&self, node: &NodeId) -> usize {
        self.find_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == node)
            .count()
    }

    pub fn ping_count(&self, node: &NodeId) -> usize {
        self.ping_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == node)
            .count()
    }

    async fn respond(&self, node: &NodeId, cancel: &CancellationToken) -> Result<()> {
        if self.jitter {
            let delay = Duration::from_millis(u64::from(node.as_bytes()[1] % 7));
            tokio::time::sleep(delay).await;
        }
        let hanging = self.hanging.lock().unwrap().contains(node);
        if hanging {
            cancel.cancelled().await;
            return Err(DhtError::Cancelled);
        }
        let offline = self.offline.lock().unwrap().contains(node);
        if offline {
            return Err(DhtError::Unreachable(node.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSender<NodeId> for FakeNetwork {
    async fn ping(&self, node: &NodeId, cancel: &CancellationToken) -> Result<()> {
        self.ping_calls.lock().unwrap().push(*node);
        self.respond(node, cancel).await
    }

    async fn find_neighbours(
        &self,
        node: &NodeId,
        _target: &NodeId,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeId>> {
        self.find_calls.lock().unwrap().push(*node);
        self.respond(node, cancel).await?;
        Ok(self
            .neighbours
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or_default())
    }
}

/// Identifier with the given first byte and a non-zero tail
pub fn create_test_node(first: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = first;
    bytes[31] = 0xAA;
    NodeId::from_bytes(bytes)
}

/// Identifier built from two leading bytes, for larger networks
pub fn create_test_node_pair(first: u8, second: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = first;
    bytes[1] = second;
    bytes[31] = 0xAA;
    NodeId::from_bytes(bytes)
}

pub fn create_test_kademlia(
    local: NodeId,
    boot_nodes: Vec<NodeId>,
    network: Arc<FakeNetwork>,
    config: DhtConfig,
) -> TestKademlia {
    Kademlia::new(local, boot_nodes, network, Arc::new(IdentityKeys), config).unwrap()
}
