//! Kadmesh network simulator
//!
//! Runs many routing cores in one process, connected through an in-memory
//! network with configurable latency and churn, and reports how well
//! lookups find the true closest nodes.

pub mod config;
pub mod network;
pub mod node;
pub mod simulation;

pub use config::{NetworkConfig, SimConfig, WorkloadConfig};
pub use network::{PeerKeys, SimNetwork, SimPeer, SimTransport};
pub use node::{SimKademlia, SimNode};
pub use simulation::{Simulation, SimReport};
