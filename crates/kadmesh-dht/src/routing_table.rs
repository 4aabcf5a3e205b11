//! Kademlia routing table
//!
//! The table is a binary trie over the identifier space. Every leaf owns one
//! [`KBucket`]; its implicit prefix is the bit path from the root. Only
//! leaves on the local node's own path may split, so fine granularity is
//! kept near ourselves and every other region stays a single bucket.
//!
//! Trie nodes live in an arena and refer to their children by index. All
//! walks are root-to-leaf driven by an identifier's bits, so no parent links
//! are needed.

use crate::config::DhtConfig;
use crate::kbucket::{BucketInsert, KBucket};
use kadmesh_protocol::{NodeId, NODE_ID_BITS};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered `OnNodeAdded` events per subscriber
const NODE_ADDED_CHANNEL_SIZE: usize = 256;

const ROOT: usize = 0;

#[derive(Debug)]
enum TrieNode<N> {
    Leaf(KBucket<N>),
    /// Children for next bit = 0 and next bit = 1
    Branch([usize; 2]),
}

/// Result of offering a node to the routing table
#[derive(Debug, Clone)]
pub struct AddResult<N> {
    pub outcome: BucketInsert,

    /// Stalest entry of the full bucket, to be probed by the health tracker
    pub refresh_candidate: Option<(NodeId, N)>,
}

/// Snapshot of one trie leaf
#[derive(Debug, Clone)]
pub struct BucketInfo<N> {
    /// Identifier whose first `depth` bits are the leaf's prefix (rest zero)
    pub prefix: NodeId,
    pub depth: usize,
    /// Entries, most recently seen first
    pub nodes: Vec<(NodeId, N)>,
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable<N> {
    /// Our local node ID
    local_id: NodeId,

    /// Trie arena, root at index 0
    nodes: Vec<TrieNode<N>>,

    /// Bucket capacity
    k: usize,

    max_split_depth: usize,

    /// Total entries across all buckets
    len: usize,

    node_added: broadcast::Sender<N>,
}

impl<N: Clone> RoutingTable<N> {
    /// Create a new routing table with bucket capacity `k`
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self::with_limits(local_id, k, NODE_ID_BITS)
    }

    pub fn with_config(local_id: NodeId, config: &DhtConfig) -> Self {
        Self::with_limits(local_id, config.k, config.max_split_depth)
    }

    fn with_limits(local_id: NodeId, k: usize, max_split_depth: usize) -> Self {
        let (node_added, _) = broadcast::channel(NODE_ADDED_CHANNEL_SIZE);
        RoutingTable {
            local_id,
            nodes: vec![TrieNode::Leaf(KBucket::new(k))],
            k,
            max_split_depth: max_split_depth.min(NODE_ID_BITS),
            len: 0,
            node_added,
        }
    }

    /// Get our local node ID
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Get total number of nodes in routing table
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of leaves
    pub fn bucket_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, TrieNode::Leaf(_)))
            .count()
    }

    /// Depth of the deepest leaf
    pub fn depth(&self) -> usize {
        self.iterate_buckets()
            .iter()
            .map(|b| b.depth)
            .max()
            .unwrap_or(0)
    }

    /// Subscribe to `OnNodeAdded`: one event per node newly stored
    pub fn subscribe(&self) -> broadcast::Receiver<N> {
        self.node_added.subscribe()
    }

    /// Add a node, or refresh it if already known
    ///
    /// A full bucket on the local path is split and the insert retried
    /// once. Otherwise `Full` is returned along with the bucket's stalest
    /// entry as a refresh candidate.
    pub fn try_add_or_refresh(&mut self, id: NodeId, node: N) -> AddResult<N> {
        let (leaf, depth) = self.locate(&id);
        match self.bucket_mut(leaf).try_add_or_refresh(id, node.clone()) {
            BucketInsert::Added => return self.added(node),
            BucketInsert::Refreshed => return AddResult::refreshed(),
            BucketInsert::Full => {}
        }

        if !self.can_split(&id, depth) || !self.split(leaf, depth) {
            return self.full(leaf);
        }

        let (leaf, _) = self.locate(&id);
        match self.bucket_mut(leaf).try_add_or_refresh(id, node.clone()) {
            BucketInsert::Added => self.added(node),
            BucketInsert::Refreshed => AddResult::refreshed(),
            BucketInsert::Full => self.full(leaf),
        }
    }

    /// Remove a node from the routing table
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let (leaf, _) = self.locate(id);
        let removed = self.bucket_mut(leaf).remove(id);
        if removed {
            self.len -= 1;
        }
        removed
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let (leaf, _) = self.locate(id);
        self.bucket(leaf).contains(id)
    }

    /// Find a node by ID
    pub fn get(&self, id: &NodeId) -> Option<&N> {
        let (leaf, _) = self.locate(id);
        self.bucket(leaf).get(id)
    }

    /// Up to `count` known nodes closest to `target`, ascending by distance
    pub fn get_k_nearest(
        &self,
        target: &NodeId,
        count: usize,
        exclude: Option<&NodeId>,
        exclude_self: bool,
    ) -> Vec<N> {
        self.nearest_entries(target, count, exclude, exclude_self)
            .into_iter()
            .map(|(_, node)| node)
            .collect()
    }

    /// Like [`get_k_nearest`](Self::get_k_nearest), keeping identifiers
    pub fn nearest_entries(
        &self,
        target: &NodeId,
        count: usize,
        exclude: Option<&NodeId>,
        exclude_self: bool,
    ) -> Vec<(NodeId, N)> {
        let eligible = |id: &NodeId| {
            !(exclude_self && *id == self.local_id) && exclude.map_or(true, |ex| ex != id)
        };

        let mut found: Vec<(NodeId, N)> = Vec::with_capacity(count);

        // Entries sharing the target's leaf are closer than anything outside it.
        let (leaf, _) = self.locate(target);
        let bucket = self.bucket(leaf);
        if bucket.entries().filter(|(id, _)| eligible(*id)).count() == count {
            found.extend(
                bucket
                    .entries()
                    .filter(|(id, _)| eligible(*id))
                    .map(|(id, n)| (*id, n.clone())),
            );
        } else {
            self.collect_nearest(ROOT, 0, target, count, &eligible, &mut found);
        }

        found.sort_by_key(|(id, _)| target.distance(id));
        found.truncate(count);
        found
    }

    /// Every entry at exactly log-distance `distance` from the local id
    pub fn get_all_at_distance(&self, distance: usize) -> Vec<N> {
        self.leaves()
            .flat_map(|bucket| bucket.entries())
            .filter(|(id, _)| self.local_id.log_distance(id) == distance)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Get all nodes in routing table
    pub fn all_nodes(&self) -> Vec<N> {
        self.leaves().flat_map(|bucket| bucket.get_all()).collect()
    }

    /// Snapshot of every leaf, in trie order (bit 0 before bit 1)
    pub fn iterate_buckets(&self) -> Vec<BucketInfo<N>> {
        let mut out = Vec::new();
        let mut stack = vec![(ROOT, NodeId::ZERO, 0usize)];

        while let Some((idx, prefix, depth)) = stack.pop() {
            match &self.nodes[idx] {
                TrieNode::Leaf(bucket) => out.push(BucketInfo {
                    prefix,
                    depth,
                    nodes: bucket.entries().map(|(id, n)| (*id, n.clone())).collect(),
                }),
                TrieNode::Branch([zero, one]) => {
                    stack.push((*one, prefix.with_bit(depth, true), depth + 1));
                    stack.push((*zero, prefix, depth + 1));
                }
            }
        }

        out
    }

    /// Walk from the root to the leaf covering `id`
    fn locate(&self, id: &NodeId) -> (usize, usize) {
        let mut idx = ROOT;
        let mut depth = 0;
        while let TrieNode::Branch(children) = &self.nodes[idx] {
            idx = children[id.bit(depth) as usize];
            depth += 1;
        }
        (idx, depth)
    }

    /// Visit leaves nearest-first until `count` eligible entries are gathered
    fn collect_nearest<F>(
        &self,
        idx: usize,
        depth: usize,
        target: &NodeId,
        count: usize,
        eligible: &F,
        found: &mut Vec<(NodeId, N)>,
    ) where
        F: Fn(&NodeId) -> bool,
    {
        if found.len() >= count {
            return;
        }
        match &self.nodes[idx] {
            TrieNode::Leaf(bucket) => found.extend(
                bucket
                    .entries()
                    .filter(|(id, _)| eligible(*id))
                    .map(|(id, n)| (*id, n.clone())),
            ),
            TrieNode::Branch(children) => {
                let near = target.bit(depth) as usize;
                self.collect_nearest(children[near], depth + 1, target, count, eligible, found);
                self.collect_nearest(children[1 - near], depth + 1, target, count, eligible, found);
            }
        }
    }

    fn can_split(&self, id: &NodeId, depth: usize) -> bool {
        // The leaf's prefix is the first `depth` bits of `id`.
        depth < self.max_split_depth && id.has_prefix(&self.local_id, depth)
    }

    /// Split the leaf at `idx` into two children on bit `depth`
    ///
    /// Returns false, leaving the leaf untouched, when every entry would
    /// land on the same side.
    fn split(&mut self, idx: usize, depth: usize) -> bool {
        let bucket = self.bucket_mut(idx);
        let ones = bucket.entries().filter(|(id, _)| id.bit(depth)).count();
        if ones == 0 || ones == bucket.len() {
            debug!(depth, entries = bucket.len(), "split aborted: one side empty");
            return false;
        }

        let entries = bucket.drain();
        let mut children = [KBucket::new(self.k), KBucket::new(self.k)];

        // Stalest first, so each push to the front keeps the recency order.
        for (id, node) in entries.into_iter().rev() {
            children[id.bit(depth) as usize].try_add_or_refresh(id, node);
        }

        debug!(
            depth,
            zero = children[0].len(),
            one = children[1].len(),
            "split bucket"
        );

        let [zero, one] = children;
        let zero_idx = self.nodes.len();
        self.nodes.push(TrieNode::Leaf(zero));
        self.nodes.push(TrieNode::Leaf(one));
        self.nodes[idx] = TrieNode::Branch([zero_idx, zero_idx + 1]);
        true
    }

    fn added(&mut self, node: N) -> AddResult<N> {
        self.len += 1;
        // No subscribers is not an error.
        let _ = self.node_added.send(node);
        AddResult {
            outcome: BucketInsert::Added,
            refresh_candidate: None,
        }
    }

    fn full(&self, leaf: usize) -> AddResult<N> {
        AddResult {
            outcome: BucketInsert::Full,
            refresh_candidate: self
                .bucket(leaf)
                .stalest()
                .map(|(id, n)| (*id, n.clone())),
        }
    }

    fn leaves(&self) -> impl Iterator<Item = &KBucket<N>> {
        self.nodes.iter().filter_map(|n| match n {
            TrieNode::Leaf(bucket) => Some(bucket),
            TrieNode::Branch(_) => None,
        })
    }

    fn bucket(&self, idx: usize) -> &KBucket<N> {
        match &self.nodes[idx] {
            TrieNode::Leaf(bucket) => bucket,
            TrieNode::Branch(_) => panic!("trie index {} is not a leaf", idx),
        }
    }

    fn bucket_mut(&mut self, idx: usize) -> &mut KBucket<N> {
        match &mut self.nodes[idx] {
            TrieNode::Leaf(bucket) => bucket,
            TrieNode::Branch(_) => panic!("trie index {} is not a leaf", idx),
        }
    }
}

impl<N> AddResult<N> {
    fn refreshed() -> Self {
        AddResult {
            outcome: BucketInsert::Refreshed,
            refresh_candidate: None,
        }
    }
}

/// A routing table behind the single table-wide lock
pub struct SharedRoutingTable<N> {
    inner: Arc<Mutex<RoutingTable<N>>>,
}

impl<N> SharedRoutingTable<N> {
    pub fn new(table: RoutingTable<N>) -> Self {
        SharedRoutingTable {
            inner: Arc::new(Mutex::new(table)),
        }
    }

    /// Acquire the table lock
    ///
    /// Every mutation leaves the trie consistent before anything that could
    /// panic, so a poisoned lock still guards a valid table.
    pub fn lock(&self) -> MutexGuard<'_, RoutingTable<N>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<N> Clone for SharedRoutingTable<N> {
    fn clone(&self) -> Self {
        SharedRoutingTable {
            inner: Arc::clone(&self.inner),
        }
    }
}
