//! Sequential discovery lookup
//!
//! Explores the network around a target one query at a time and yields each
//! newly discovered node as soon as it arrives. Every step queries the
//! closest unqueried candidate known at that moment. A round is a block of at
//! most `round_width` such steps; progress toward the target is judged per
//! round. Nodes that failed recently are skipped until their cool-down
//! expires.

use crate::config::DiscoveryConfig;
use crate::error::DhtError;
use crate::lookup::Candidate;
use crate::query::QueryContext;
use crate::traits::{KeyOperator, MessageSender};
use futures::stream::{self, BoxStream, StreamExt};
use kadmesh_protocol::{Distance, NodeId};
use lru::LruCache;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Nodes that recently failed a discovery query
///
/// Entries are kept in marking order, so expired ones sit at the
/// least-recent end and are swept whenever a node is marked.
#[derive(Debug)]
pub struct UnreachableCache {
    entries: Mutex<LruCache<NodeId, Instant>>,
    cooldown: Duration,
}

impl UnreachableCache {
    pub fn new(cooldown: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        UnreachableCache {
            entries: Mutex::new(LruCache::new(capacity)),
            cooldown,
        }
    }

    pub fn mark(&self, id: NodeId) {
        let mut entries = self.lock();
        loop {
            let expired = matches!(
                entries.peek_lru(),
                Some((_, since)) if since.elapsed() >= self.cooldown
            );
            if !expired {
                break;
            }
            entries.pop_lru();
        }
        entries.put(id, Instant::now());
    }

    pub fn clear(&self, id: &NodeId) {
        self.lock().pop(id);
    }

    /// Whether `id` failed within the cool-down window; expired entries are dropped
    pub fn is_cooling_down(&self, id: &NodeId) -> bool {
        let mut entries = self.lock();
        let expired = match entries.peek(id) {
            Some(since) => since.elapsed() >= self.cooldown,
            None => return false,
        };
        if expired {
            entries.pop(id);
        }
        !expired
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<NodeId, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Discovery engine; the unreachable cache outlives individual runs
pub struct Discovery<N, S, O> {
    ctx: Arc<QueryContext<N, S, O>>,
    unreachable: Arc<UnreachableCache>,
}

impl<N, S, O> Discovery<N, S, O>
where
    N: Clone + Send + Sync + 'static,
    S: MessageSender<N> + 'static,
    O: KeyOperator<N> + 'static,
{
    pub fn new(ctx: Arc<QueryContext<N, S, O>>) -> Self {
        let limits = &ctx.config().discovery;
        let unreachable =
            UnreachableCache::new(limits.unreachable_cooldown(), limits.unreachable_cache_size);
        Discovery {
            ctx,
            unreachable: Arc::new(unreachable),
        }
    }

    pub fn unreachable(&self) -> &UnreachableCache {
        &self.unreachable
    }

    /// Lazily discover nodes around `target`
    ///
    /// Nothing is queried until the stream is polled. Dropping the stream or
    /// cancelling `cancel` stops the run.
    pub fn discover(&self, target: NodeId, cancel: CancellationToken) -> BoxStream<'static, N> {
        let run = DiscoveryRun::new(
            self.ctx.clone(),
            self.unreachable.clone(),
            target,
            cancel,
        );
        stream::unfold(run, DiscoveryRun::next).boxed()
    }
}

struct DiscoveryRun<N, S, O> {
    ctx: Arc<QueryContext<N, S, O>>,
    unreachable: Arc<UnreachableCache>,
    limits: DiscoveryConfig,
    target: NodeId,
    cancel: CancellationToken,
    candidates: BinaryHeap<Reverse<Candidate<N>>>,
    seen: HashSet<NodeId>,
    queried: HashSet<NodeId>,
    /// Queries left in the current round
    round_left: usize,
    ready: VecDeque<N>,
    rounds: usize,
    stalled: usize,
    closest: Option<Distance>,
    improved: bool,
    yielded: usize,
    done: bool,
}

impl<N, S, O> DiscoveryRun<N, S, O>
where
    N: Clone + Send + Sync + 'static,
    S: MessageSender<N> + 'static,
    O: KeyOperator<N> + 'static,
{
    fn new(
        ctx: Arc<QueryContext<N, S, O>>,
        unreachable: Arc<UnreachableCache>,
        target: NodeId,
        cancel: CancellationToken,
    ) -> Self {
        let limits = ctx.config().discovery.clone();
        let mut candidates = BinaryHeap::new();
        let mut seen = HashSet::new();
        let mut closest: Option<Distance> = None;

        for (id, node) in ctx.seeds(&target, ctx.config().k) {
            seen.insert(id);
            let candidate = Candidate::new(&target, id, node);
            if closest.map_or(true, |best| candidate.distance < best) {
                closest = Some(candidate.distance);
            }
            candidates.push(Reverse(candidate));
        }

        DiscoveryRun {
            ctx,
            unreachable,
            limits,
            target,
            cancel,
            candidates,
            seen,
            queried: HashSet::new(),
            round_left: 0,
            ready: VecDeque::new(),
            rounds: 0,
            stalled: 0,
            closest,
            improved: false,
            yielded: 0,
            done: false,
        }
    }

    async fn next(mut self) -> Option<(N, Self)> {
        loop {
            if let Some(node) = self.ready.pop_front() {
                self.yielded += 1;
                return Some((node, self));
            }
            if self.done || self.cancel.is_cancelled() {
                return None;
            }
            if self.round_left == 0 && !self.start_round() {
                debug!(
                    target = %self.target,
                    rounds = self.rounds,
                    yielded = self.yielded,
                    "discovery finished"
                );
                self.done = true;
                continue;
            }
            match self.pop_candidate() {
                Some(candidate) => {
                    self.round_left -= 1;
                    self.query(candidate).await;
                }
                None => self.round_left = 0,
            }
        }
    }

    /// Close the current round and open the next; false when the run is over
    fn start_round(&mut self) -> bool {
        if self.rounds > 0 {
            if self.improved {
                self.stalled = 0;
            } else {
                self.stalled += 1;
            }
            self.improved = false;

            if self.yielded + self.ready.len() >= self.limits.min_results
                && self.stalled >= self.limits.stall_rounds
            {
                return false;
            }
        }
        if self.rounds >= self.limits.max_rounds {
            return false;
        }

        if !self.has_candidate() {
            return false;
        }

        self.rounds += 1;
        self.round_left = self.limits.round_width;
        true
    }

    /// Drop queried and cooling-down nodes from the top of the queue
    fn has_candidate(&mut self) -> bool {
        while let Some(Reverse(top)) = self.candidates.peek() {
            if !self.queried.contains(&top.id) && !self.unreachable.is_cooling_down(&top.id) {
                return true;
            }
            self.candidates.pop();
        }
        false
    }

    fn pop_candidate(&mut self) -> Option<Candidate<N>> {
        if !self.has_candidate() {
            return None;
        }
        self.candidates.pop().map(|Reverse(candidate)| candidate)
    }

    async fn query(&mut self, candidate: Candidate<N>) {
        if !self.queried.insert(candidate.id) {
            return;
        }

        let response = self
            .ctx
            .find_neighbours(&candidate.id, &candidate.node, &self.target, &self.cancel)
            .await;

        match response {
            Ok(neighbours) => {
                self.unreachable.clear(&candidate.id);
                for node in neighbours {
                    self.offer(node);
                }
            }
            Err(DhtError::Cancelled) if self.cancel.is_cancelled() => {
                self.done = true;
            }
            Err(_) => self.unreachable.mark(candidate.id),
        }
    }

    fn offer(&mut self, node: N) {
        let id = self.ctx.key(&node);
        if !self.seen.insert(id) {
            return;
        }

        let candidate = Candidate::new(&self.target, id, node.clone());
        if self.closest.map_or(true, |best| candidate.distance < best) {
            self.closest = Some(candidate.distance);
            self.improved = true;
        }
        self.candidates.push(Reverse(candidate));

        if id != *self.ctx.local_id() {
            self.ready.push_back(node);
        }
    }
}
