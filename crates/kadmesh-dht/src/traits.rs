//! Interfaces the routing core consumes from its host

use crate::error::Result;
use kadmesh_protocol::NodeId;
use tokio_util::sync::CancellationToken;

/// Network side of the routing core
///
/// Implemented by the session layer. Both calls must be safe to retry and
/// must report cancellation as [`DhtError::Cancelled`](crate::DhtError)
/// and deadlines as [`DhtError::Timeout`](crate::DhtError), distinct from
/// other failures.
#[async_trait::async_trait]
pub trait MessageSender<N>: Send + Sync {
    /// Check that `node` is alive
    async fn ping(&self, node: &N, cancel: &CancellationToken) -> Result<()>;

    /// Ask `node` for the nodes it knows closest to `target`
    async fn find_neighbours(
        &self,
        node: &N,
        target: &NodeId,
        cancel: &CancellationToken,
    ) -> Result<Vec<N>>;
}

/// Maps application nodes onto the identifier space
pub trait KeyOperator<N>: Send + Sync {
    /// Identifier of `node`
    fn key(&self, node: &N) -> NodeId;

    /// Random identifier inside the trie leaf at (`prefix`, `depth`)
    fn random_key_in_bucket(&self, prefix: &NodeId, depth: usize) -> NodeId {
        NodeId::random_with_prefix(prefix, depth, &mut rand::thread_rng())
    }
}

impl<N, F> KeyOperator<N> for F
where
    F: Fn(&N) -> NodeId + Send + Sync,
{
    fn key(&self, node: &N) -> NodeId {
        self(node)
    }
}

/// Key operator for hosts whose nodes are bare identifiers
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKeys;

impl KeyOperator<NodeId> for IdentityKeys {
    fn key(&self, node: &NodeId) -> NodeId {
        *node
    }
}
