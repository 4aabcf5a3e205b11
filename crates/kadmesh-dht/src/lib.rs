//! Kadmesh DHT routing core
//!
//! A Kademlia routing layer over 256-bit identifiers:
//! - Binary-trie routing table of k-buckets that splits only around the local node
//! - Health tracking that refreshes live nodes and evicts dead ones
//! - Parallel closest-node lookup and a lazy sequential discovery lookup
//! - An orchestrator with bootstrap and periodic refresh
//!
//! The network and the node type are supplied by the host through
//! [`MessageSender`] and [`KeyOperator`].

pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod kademlia;
pub mod kbucket;
pub mod lookup;
pub mod query;
pub mod routing_table;
pub mod traits;

pub use config::{DhtConfig, DiscoveryConfig};
pub use discovery::{Discovery, UnreachableCache};
pub use error::{DhtError, Result};
pub use health::HealthTracker;
pub use kademlia::{BootstrapReport, Kademlia};
pub use kbucket::{BucketInsert, KBucket};
pub use lookup::{ClosestNodesLookup, LookupOutcome, LookupStats};
pub use query::QueryContext;
pub use routing_table::{AddResult, BucketInfo, RoutingTable, SharedRoutingTable};
pub use traits::{IdentityKeys, KeyOperator, MessageSender};

pub use kadmesh_protocol::{Distance, NodeId};

/// Kademlia k parameter (nodes per k-bucket)
pub const K: usize = 20;

/// Alpha parameter (parallel lookup workers)
pub const ALPHA: usize = 10;
