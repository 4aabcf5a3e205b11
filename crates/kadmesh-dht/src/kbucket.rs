//! K-bucket implementation for Kademlia DHT

use kadmesh_protocol::NodeId;
use std::collections::VecDeque;

/// Outcome of offering a node to a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketInsert {
    /// The node was new and has been stored
    Added,
    /// The node was already known and moved to the front
    Refreshed,
    /// The bucket is at capacity and the node was not stored
    Full,
}

/// A fixed-capacity, recency-ordered set of nodes
///
/// The front holds the most recently seen node, the back the stalest one.
#[derive(Debug, Clone)]
pub struct KBucket<N> {
    /// Nodes in this bucket (up to `capacity`)
    entries: VecDeque<(NodeId, N)>,

    capacity: usize,
}

impl<N: Clone> KBucket<N> {
    /// Create a new k-bucket
    pub fn new(capacity: usize) -> Self {
        KBucket {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Get number of nodes in bucket
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if bucket is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a node, or move it to the front if already present
    ///
    /// A refreshed entry also takes the new node value, so the bucket keeps
    /// the latest information about the peer.
    pub fn try_add_or_refresh(&mut self, id: NodeId, node: N) -> BucketInsert {
        if let Some(pos) = self.position(&id) {
            self.entries.remove(pos);
            self.entries.push_front((id, node));
            return BucketInsert::Refreshed;
        }

        if !self.is_full() {
            self.entries.push_front((id, node));
            return BucketInsert::Added;
        }

        BucketInsert::Full
    }

    /// Remove a node from the bucket
    pub fn remove(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Check whether a node is stored
    pub fn contains(&self, id: &NodeId) -> bool {
        self.position(id).is_some()
    }

    /// Find node by ID
    pub fn get(&self, id: &NodeId) -> Option<&N> {
        self.entries.iter().find(|(i, _)| i == id).map(|(_, n)| n)
    }

    /// Get all nodes, most recently seen first
    pub fn get_all(&self) -> Vec<N> {
        self.entries.iter().map(|(_, n)| n.clone()).collect()
    }

    /// Iterate over entries, most recently seen first
    pub fn entries(&self) -> impl Iterator<Item = (&NodeId, &N)> {
        self.entries.iter().map(|(id, n)| (id, n))
    }

    /// The least recently seen entry, the eviction candidate when full
    pub fn stalest(&self) -> Option<(&NodeId, &N)> {
        self.entries.back().map(|(id, n)| (id, n))
    }

    /// Take every entry out of the bucket, most recently seen first
    pub(crate) fn drain(&mut self) -> Vec<(NodeId, N)> {
        self.entries.drain(..).collect()
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|(i, _)| i == id)
    }
}
