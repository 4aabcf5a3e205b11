use anyhow::{Context, Result};
use kadmesh_dht::DhtConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub network: NetworkConfig,
    pub workload: WorkloadConfig,
    pub dht: DhtConfig,
}

/// Shape of the simulated network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Number of simulated nodes
    pub nodes: usize,

    /// The first `boot_nodes` nodes are every node's boot list
    pub boot_nodes: usize,

    /// One-way message latency
    pub latency_ms: u64,

    /// Share of nodes taken offline after bootstrap
    pub churn_percent: u8,

    /// Seed for node names, churn and lookup targets
    pub seed: u64,
}

/// What to run once the network is up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Closest-node lookups for random targets
    pub lookups: usize,

    /// Discovery walks for random targets
    pub discoveries: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            nodes: 64,
            boot_nodes: 3,
            latency_ms: 5,
            churn_percent: 0,
            seed: 1,
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            lookups: 20,
            discoveries: 5,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            network: NetworkConfig::default(),
            workload: WorkloadConfig::default(),
            dht: DhtConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }

        let contents = fs::read_to_string(path).context("Failed to read configuration file")?;
        let config: SimConfig =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as YAML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self).context("Failed to serialize configuration")?;
        fs::write(path, yaml).context("Failed to write configuration file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.nodes == 0 {
            anyhow::bail!("network.nodes must be at least 1");
        }
        if self.network.boot_nodes > self.network.nodes {
            anyhow::bail!(
                "network.boot_nodes ({}) exceeds network.nodes ({})",
                self.network.boot_nodes,
                self.network.nodes
            );
        }
        if self.network.churn_percent > 100 {
            anyhow::bail!("network.churn_percent must be at most 100");
        }
        self.dht.validate().context("Invalid dht configuration")?;
        Ok(())
    }
}
