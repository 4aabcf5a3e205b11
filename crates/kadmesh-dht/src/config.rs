//! Tunable parameters for the routing core

use crate::error::{DhtError, Result};
use crate::{ALPHA, K};
use kadmesh_protocol::NODE_ID_BITS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Routing core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bucket capacity and lookup result size
    pub k: usize,

    /// Concurrent workers in a closest-node lookup
    pub alpha: usize,

    /// Leaves at this depth never split
    pub max_split_depth: usize,

    /// Hard deadline for a single FindNeighbours call
    pub request_timeout_ms: u64,

    /// Deadline for a health-check ping
    pub ping_timeout_ms: u64,

    /// Wait before probing a refresh candidate
    pub refresh_debounce_ms: u64,

    /// Consecutive request failures before a node is evicted
    pub failure_threshold: u32,

    /// Number of nodes whose failure count is remembered
    pub failure_cache_size: usize,

    /// Back-off for lookup workers waiting on in-flight queries
    pub lookup_poll_interval_ms: u64,

    /// Sleep between bootstrap passes in `run`
    pub refresh_interval_secs: u64,

    pub discovery: DiscoveryConfig,
}

/// Parameters for the sequential discovery walk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Hard cap on discovery rounds
    pub max_rounds: usize,

    /// Yielded nodes needed before an early stop is considered
    pub min_results: usize,

    /// Rounds without a closer node that trigger an early stop
    pub stall_rounds: usize,

    /// Queries issued per round
    pub round_width: usize,

    /// How long a failed node is skipped by later walks
    pub unreachable_cooldown_secs: u64,

    /// Number of failed nodes remembered
    pub unreachable_cache_size: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            k: K,
            alpha: ALPHA,
            max_split_depth: NODE_ID_BITS,
            request_timeout_ms: 5_000,
            ping_timeout_ms: 2_000,
            refresh_debounce_ms: 200,
            failure_threshold: 5,
            failure_cache_size: 1024,
            lookup_poll_interval_ms: 20,
            refresh_interval_secs: 600,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            max_rounds: 3,
            min_results: K,
            stall_rounds: 2,
            round_width: K,
            unreachable_cooldown_secs: 5 * 60,
            unreachable_cache_size: 1024,
        }
    }
}

impl DhtConfig {
    /// Check that every parameter is usable
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::InvalidConfig("k must be at least 1".into()));
        }
        if self.alpha == 0 {
            return Err(DhtError::InvalidConfig("alpha must be at least 1".into()));
        }
        if self.max_split_depth > NODE_ID_BITS {
            return Err(DhtError::InvalidConfig(format!(
                "max_split_depth {} exceeds identifier length {}",
                self.max_split_depth, NODE_ID_BITS
            )));
        }
        if self.failure_threshold == 0 {
            return Err(DhtError::InvalidConfig(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.failure_cache_size == 0 {
            return Err(DhtError::InvalidConfig(
                "failure_cache_size must be at least 1".into(),
            ));
        }
        if self.discovery.max_rounds == 0 {
            return Err(DhtError::InvalidConfig(
                "discovery.max_rounds must be at least 1".into(),
            ));
        }
        if self.discovery.round_width == 0 {
            return Err(DhtError::InvalidConfig(
                "discovery.round_width must be at least 1".into(),
            ));
        }
        if self.discovery.unreachable_cache_size == 0 {
            return Err(DhtError::InvalidConfig(
                "discovery.unreachable_cache_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    pub fn lookup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lookup_poll_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Completed queries without improvement before a lookup converges
    pub fn convergence_rounds(&self) -> usize {
        self.alpha * 2
    }
}

impl DiscoveryConfig {
    pub fn unreachable_cooldown(&self) -> Duration {
        Duration::from_secs(self.unreachable_cooldown_secs)
    }
}
