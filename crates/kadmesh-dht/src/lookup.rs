//! Parallel k-nearest node lookup
//!
//! A fixed pool of `alpha` workers shares one candidate queue ordered by
//! distance to the target. Each worker pops the closest unqueried
//! candidate, asks it for neighbours and feeds new nodes back into the
//! queue. Every node that has not failed a query stays in a pool ordered by
//! distance; the result is the first `k` of that pool, so a failed node is
//! replaced by the next closest live one. A worker stops once the pool
//! holds `k` nodes and the last `2 * alpha` completed queries brought
//! nothing into the top `k`, or when the queue is empty and no query is in
//! flight.

use crate::error::DhtError;
use crate::query::QueryContext;
use crate::traits::{KeyOperator, MessageSender};
use futures::future::join_all;
use kadmesh_protocol::{Distance, NodeId};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counters from one lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupStats {
    /// FindNeighbours calls issued, the local table read included
    pub queries: usize,
    pub failures: usize,
    /// Whether the lookup stopped on the convergence rule
    pub converged: bool,
}

/// Result of a lookup: nodes ascending by distance to the target
#[derive(Debug, Clone)]
pub struct LookupOutcome<N> {
    pub nodes: Vec<N>,
    pub stats: LookupStats,
}

/// A node ordered by its distance to the lookup target
pub(crate) struct Candidate<N> {
    pub(crate) distance: Distance,
    pub(crate) id: NodeId,
    pub(crate) node: N,
}

impl<N> Candidate<N> {
    pub(crate) fn new(target: &NodeId, id: NodeId, node: N) -> Self {
        Candidate {
            distance: target.distance(&id),
            id,
            node,
        }
    }
}

impl<N> PartialEq for Candidate<N> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<N> Eq for Candidate<N> {}

impl<N> PartialOrd for Candidate<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<N> Ord for Candidate<N> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

struct LookupState<N> {
    /// Closest candidate on top
    candidates: BinaryHeap<Reverse<Candidate<N>>>,
    seen: HashSet<NodeId>,
    queried: HashSet<NodeId>,
    /// Known nodes that have not failed, closest first
    found: BTreeMap<Distance, (NodeId, N)>,
    in_flight: usize,
    /// Completed queries since the result set last improved
    stale_queries: usize,
    stats: LookupStats,
}

enum Next<N> {
    Query(Candidate<N>),
    Wait,
    Stop,
}

impl<N: Clone> LookupState<N> {
    fn new() -> Self {
        LookupState {
            candidates: BinaryHeap::new(),
            seen: HashSet::new(),
            queried: HashSet::new(),
            found: BTreeMap::new(),
            in_flight: 0,
            stale_queries: 0,
            stats: LookupStats::default(),
        }
    }

    /// Record a newly seen node; returns true if it ranks among the `k` closest
    fn discover(&mut self, target: &NodeId, id: NodeId, node: N, k: usize) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        let distance = target.distance(&id);
        self.candidates.push(Reverse(Candidate {
            distance,
            id,
            node: node.clone(),
        }));
        self.found.insert(distance, (id, node));
        self.found.range(..distance).take(k).count() < k
    }

    /// Drop a node that failed its query
    fn fail(&mut self, target: &NodeId, id: &NodeId) {
        self.found.remove(&target.distance(id));
    }

    /// The `k` closest live nodes, ascending by distance
    fn closest(&self, k: usize) -> Vec<N> {
        self.found
            .values()
            .take(k)
            .map(|(_, node)| node.clone())
            .collect()
    }

    fn next(&mut self, k: usize, convergence: usize) -> Next<N> {
        if self.found.len() >= k && self.stale_queries >= convergence {
            self.stats.converged = true;
            return Next::Stop;
        }

        while let Some(Reverse(candidate)) = self.candidates.pop() {
            if self.queried.insert(candidate.id) {
                self.in_flight += 1;
                self.stats.queries += 1;
                return Next::Query(candidate);
            }
        }

        if self.in_flight == 0 {
            Next::Stop
        } else {
            Next::Wait
        }
    }
}

/// Bounded-parallelism closest-node lookup
pub struct ClosestNodesLookup<N, S, O> {
    ctx: Arc<QueryContext<N, S, O>>,
}

impl<N, S, O> ClosestNodesLookup<N, S, O>
where
    N: Clone + Send + Sync + 'static,
    S: MessageSender<N> + 'static,
    O: KeyOperator<N> + 'static,
{
    pub fn new(ctx: Arc<QueryContext<N, S, O>>) -> Self {
        ClosestNodesLookup { ctx }
    }

    /// Find the `k` nodes closest to `target`
    ///
    /// Cancellation stops every worker and returns the partial result.
    pub async fn run(
        &self,
        target: &NodeId,
        k: usize,
        cancel: &CancellationToken,
    ) -> LookupOutcome<N> {
        let state = Mutex::new(LookupState::new());
        let notify = Notify::new();

        {
            let mut st = lock(&state);
            for (id, node) in self.ctx.seeds(target, k) {
                st.discover(target, id, node, k);
            }
        }

        let alpha = self.ctx.config().alpha;
        join_all((0..alpha).map(|_| self.worker(&state, &notify, target, k, cancel))).await;

        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        let nodes = state.closest(k);

        debug!(
            target = %target,
            found = nodes.len(),
            queries = state.stats.queries,
            failures = state.stats.failures,
            converged = state.stats.converged,
            "closest-node lookup finished"
        );

        LookupOutcome {
            nodes,
            stats: state.stats,
        }
    }

    async fn worker(
        &self,
        state: &Mutex<LookupState<N>>,
        notify: &Notify,
        target: &NodeId,
        k: usize,
        cancel: &CancellationToken,
    ) {
        let convergence = self.ctx.config().convergence_rounds();
        let poll = self.ctx.config().lookup_poll_interval();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let next = lock(state).next(k, convergence);
            let candidate = match next {
                Next::Query(candidate) => candidate,
                Next::Stop => {
                    // Wake idle workers so they re-check the stop condition.
                    notify.notify_waiters();
                    return;
                }
                Next::Wait => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(poll) => {}
                        _ = cancel.cancelled() => return,
                    }
                    continue;
                }
            };

            let response = self
                .ctx
                .find_neighbours(&candidate.id, &candidate.node, target, cancel)
                .await;

            {
                let mut st = lock(state);
                st.in_flight -= 1;
                match response {
                    Ok(neighbours) => {
                        let mut improved = false;
                        for node in neighbours {
                            let id = self.ctx.key(&node);
                            improved |= st.discover(target, id, node, k);
                        }
                        if improved {
                            st.stale_queries = 0;
                        } else {
                            st.stale_queries += 1;
                        }
                    }
                    Err(DhtError::Cancelled) if cancel.is_cancelled() => {}
                    Err(_) => {
                        st.stats.failures += 1;
                        st.stale_queries += 1;
                        st.fail(target, &candidate.id);
                    }
                }
            }

            notify.notify_waiters();
        }
    }
}

fn lock<N>(state: &Mutex<LookupState<N>>) -> MutexGuard<'_, LookupState<N>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(first: u8) -> (NodeId, NodeId) {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        let id = NodeId::from_bytes(bytes);
        (id, id)
    }

    #[test]
    fn test_result_set_keeps_k_closest() {
        let target = NodeId::ZERO;
        let mut state = LookupState::new();

        for first in [0x40, 0x10, 0x80, 0x20, 0x08] {
            let (id, node) = candidate(first);
            state.discover(&target, id, node, 3);
        }

        let kept: Vec<u8> = state
            .closest(3)
            .into_iter()
            .map(|id| id.as_bytes()[0])
            .collect();
        assert_eq!(kept, vec![0x08, 0x10, 0x20]);
    }

    #[test]
    fn test_failed_node_replaced_by_next_closest() {
        let target = NodeId::ZERO;
        let mut state = LookupState::new();
        for first in [0x01, 0x02] {
            let (id, node) = candidate(first);
            assert!(state.discover(&target, id, node, 2));
        }
        // Outside the top two when it arrives.
        let (late, node) = candidate(0x04);
        assert!(!state.discover(&target, late, node, 2));

        let (failed, _) = candidate(0x01);
        state.fail(&target, &failed);

        let kept: Vec<u8> = state
            .closest(2)
            .into_iter()
            .map(|id| id.as_bytes()[0])
            .collect();
        assert_eq!(kept, vec![0x02, 0x04]);
    }

    #[test]
    fn test_discover_dedups() {
        let target = NodeId::ZERO;
        let mut state = LookupState::new();
        let (id, node) = candidate(0x01);

        assert!(state.discover(&target, id, node, 3));
        assert!(!state.discover(&target, id, node, 3));
        assert_eq!(state.candidates.len(), 1);
    }

    #[test]
    fn test_next_pops_closest_first_and_once() {
        let target = NodeId::ZERO;
        let mut state = LookupState::new();
        for first in [0x40, 0x10, 0x80] {
            let (id, node) = candidate(first);
            state.discover(&target, id, node, 20);
        }

        let mut order = Vec::new();
        while let Next::Query(c) = state.next(20, 40) {
            order.push(c.id.as_bytes()[0]);
        }
        assert_eq!(order, vec![0x10, 0x40, 0x80]);

        // Three queries in flight, nothing left to pop.
        assert!(matches!(state.next(20, 40), Next::Wait));
        state.in_flight = 0;
        assert!(matches!(state.next(20, 40), Next::Stop));
    }

    #[test]
    fn test_converges_after_stale_queries() {
        let target = NodeId::ZERO;
        let mut state = LookupState::new();
        for first in [0x01, 0x02, 0x03] {
            let (id, node) = candidate(first);
            state.discover(&target, id, node, 2);
        }

        state.stale_queries = 3;
        assert!(!matches!(state.next(2, 4), Next::Stop));
        state.stale_queries = 4;
        assert!(matches!(state.next(2, 4), Next::Stop));
        assert!(state.stats.converged);
    }
}
