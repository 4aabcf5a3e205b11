//! Builds a simulated network and measures lookup quality on it

use crate::config::SimConfig;
use crate::network::{SimNetwork, SimPeer};
use crate::node::SimNode;
use anyhow::{Context, Result};
use futures::future::try_join_all;
use futures::StreamExt;
use kadmesh_protocol::NodeId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapSummary {
    pub nodes: usize,
    /// Sum of reachable boot nodes over all bootstraps
    pub boot_nodes_online: usize,
    pub mean_table_size: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupSummary {
    pub lookups: usize,
    /// Lookups whose first result was the closest online node
    pub exact: usize,
    /// Mean share of the true k closest online nodes that were returned
    pub mean_overlap: f64,
    pub mean_queries: f64,
    pub failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoverySummary {
    pub walks: usize,
    pub discovered: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimReport {
    pub bootstrap: BootstrapSummary,
    pub offline: usize,
    pub lookups: LookupSummary,
    pub discovery: DiscoverySummary,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct Simulation {
    config: SimConfig,
    network: Arc<SimNetwork>,
    nodes: Vec<Arc<SimNode>>,
    rng: StdRng,
}

impl Simulation {
    /// Create every node; the first `boot_nodes` peers seed everyone's boot list
    pub fn build(config: SimConfig) -> Result<Self> {
        config.validate()?;

        let network = SimNetwork::new(Duration::from_millis(config.network.latency_ms));
        let peers: Vec<SimPeer> = (0..config.network.nodes)
            .map(|i| SimPeer::named(format!("node-{}-{}", config.network.seed, i)))
            .collect();
        let boot = peers[..config.network.boot_nodes].to_vec();

        let nodes = peers
            .into_iter()
            .map(|peer| {
                SimNode::spawn(peer, boot.clone(), network.clone(), config.dht.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            nodes = nodes.len(),
            boot_nodes = boot.len(),
            latency_ms = config.network.latency_ms,
            "simulated network built"
        );

        let rng = StdRng::seed_from_u64(config.network.seed);
        Ok(Simulation {
            config,
            network,
            nodes,
            rng,
        })
    }

    pub fn nodes(&self) -> &[Arc<SimNode>] {
        &self.nodes
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    /// Bootstrap every node concurrently
    pub async fn bootstrap_all(&self, cancel: &CancellationToken) -> Result<BootstrapSummary> {
        let reports = try_join_all(self.nodes.iter().map(|node| node.bootstrap(cancel)))
            .await
            .context("Network bootstrap failed")?;

        let total_entries: usize = self.nodes.iter().map(|n| n.kademlia().node_count()).sum();
        let summary = BootstrapSummary {
            nodes: reports.len(),
            boot_nodes_online: reports.iter().map(|r| r.boot_nodes_online).sum(),
            mean_table_size: total_entries as f64 / self.nodes.len().max(1) as f64,
        };

        info!(
            nodes = summary.nodes,
            mean_table_size = %format!("{:.1}", summary.mean_table_size),
            "all nodes bootstrapped"
        );
        Ok(summary)
    }

    /// Take `churn_percent` of the non-boot nodes offline
    pub fn apply_churn(&mut self) -> Vec<NodeId> {
        let boot = self.config.network.boot_nodes;
        let candidates = &self.nodes[boot..];
        let count = candidates.len() * usize::from(self.config.network.churn_percent) / 100;

        let offline: Vec<NodeId> = candidates
            .choose_multiple(&mut self.rng, count)
            .map(|node| node.peer().id)
            .collect();
        for id in &offline {
            self.network.set_offline(*id);
        }

        if !offline.is_empty() {
            info!(offline = offline.len(), "churn applied");
        }
        offline
    }

    /// Run closest-node lookups for random targets from random online nodes
    pub async fn run_lookups(&mut self, cancel: &CancellationToken) -> LookupSummary {
        let mut summary = LookupSummary::default();
        let mut overlap_sum = 0.0;
        let mut query_sum = 0usize;

        for _ in 0..self.config.workload.lookups {
            if cancel.is_cancelled() {
                break;
            }
            let Some(origin) = self.random_online_node() else {
                warn!("no online node left to run lookups from");
                break;
            };
            let target = NodeId::random(&mut self.rng);
            let expected = self.closest_online(&target, self.config.dht.k);

            let outcome = origin
                .kademlia()
                .lookup_nodes_closest_with_stats(&target, None, cancel)
                .await;
            let found: HashSet<NodeId> = outcome.nodes.iter().map(|p| p.id).collect();

            let hits = expected.iter().filter(|id| found.contains(id)).count();
            overlap_sum += hits as f64 / expected.len().max(1) as f64;
            query_sum += outcome.stats.queries;
            summary.failures += outcome.stats.failures;
            if outcome.nodes.first().map(|p| p.id) == expected.first().copied() {
                summary.exact += 1;
            }
            summary.lookups += 1;

            debug!(
                origin = %origin.peer(),
                target = %target,
                hits,
                queries = outcome.stats.queries,
                "lookup measured"
            );
        }

        if summary.lookups > 0 {
            summary.mean_overlap = overlap_sum / summary.lookups as f64;
            summary.mean_queries = query_sum as f64 / summary.lookups as f64;
        }
        summary
    }

    /// Run discovery walks for random targets and count what they yield
    pub async fn run_discoveries(&mut self, cancel: &CancellationToken) -> DiscoverySummary {
        let mut summary = DiscoverySummary::default();

        for _ in 0..self.config.workload.discoveries {
            if cancel.is_cancelled() {
                break;
            }
            let Some(origin) = self.random_online_node() else {
                break;
            };
            let target = NodeId::random(&mut self.rng);

            let discovered = origin
                .kademlia()
                .discover(target, cancel.clone())
                .count()
                .await;

            summary.walks += 1;
            summary.discovered += discovered;
        }
        summary
    }

    /// Bootstrap, churn, then run the configured workload
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<SimReport> {
        let bootstrap = self.bootstrap_all(cancel).await?;
        let offline = self.apply_churn().len();
        let lookups = self.run_lookups(cancel).await;
        let discovery = self.run_discoveries(cancel).await;

        let report = SimReport {
            bootstrap,
            offline,
            lookups,
            discovery,
            delivered: self.network.delivered(),
            dropped: self.network.dropped(),
        };

        info!(
            lookups = report.lookups.lookups,
            exact = report.lookups.exact,
            mean_overlap = %format!("{:.2}", report.lookups.mean_overlap),
            mean_queries = %format!("{:.1}", report.lookups.mean_queries),
            discovered = report.discovery.discovered,
            delivered = report.delivered,
            dropped = report.dropped,
            "simulation complete"
        );
        Ok(report)
    }

    fn random_online_node(&mut self) -> Option<Arc<SimNode>> {
        let online: Vec<&Arc<SimNode>> = self
            .nodes
            .iter()
            .filter(|node| self.network.is_online(&node.peer().id))
            .collect();
        online.choose(&mut self.rng).map(|node| Arc::clone(node))
    }

    /// Brute-force `count` closest online identifiers to `target`
    fn closest_online(&self, target: &NodeId, count: usize) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|node| node.peer().id)
            .filter(|id| self.network.is_online(id))
            .collect();
        ids.sort_by_key(|id| target.distance(id));
        ids.truncate(count);
        ids
    }
}
