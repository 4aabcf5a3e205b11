//! Sequential discovery walk

mod common;

use common::{create_test_kademlia, create_test_node, FakeNetwork};
use futures::StreamExt;
use kadmesh_dht::{DhtConfig, DiscoveryConfig};
use kadmesh_protocol::NodeId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn discovery_config(max_rounds: usize, min_results: usize, stall_rounds: usize) -> DhtConfig {
    DhtConfig {
        discovery: DiscoveryConfig {
            max_rounds,
            min_results,
            stall_rounds,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// `a` knows five `b` nodes, each of which knows one `c` node
fn two_level_network(a: NodeId) -> (Arc<FakeNetwork>, Vec<NodeId>, Vec<NodeId>) {
    let network = Arc::new(FakeNetwork::new());
    let bs: Vec<NodeId> = (0..5).map(|i| create_test_node(0x40 + i)).collect();
    let cs: Vec<NodeId> = (0..5).map(|i| create_test_node(0x20 + i)).collect();

    network.set_neighbours(a, bs.clone());
    for (b, c) in bs.iter().zip(&cs) {
        network.set_neighbours(*b, vec![*c]);
    }
    (network, bs, cs)
}

#[tokio::test]
async fn test_discovery_yields_new_nodes_per_round() {
    let local = create_test_node(0xF0);
    let a = create_test_node(0x80);
    let (network, bs, cs) = two_level_network(a);

    let kad = create_test_kademlia(local, vec![], network.clone(), discovery_config(3, 100, 2));
    kad.add_or_refresh(&a);

    let found: Vec<NodeId> = kad
        .discover(create_test_node(0x00), CancellationToken::new())
        .collect()
        .await;

    let found_set: HashSet<NodeId> = found.iter().copied().collect();
    assert_eq!(found.len(), found_set.len(), "a node was yielded twice");
    let expected: HashSet<NodeId> = bs.iter().chain(&cs).copied().collect();
    assert_eq!(found_set, expected);
    // Seeds are already known and never yielded.
    assert!(!found_set.contains(&a));
    assert!(!found_set.contains(&local));
}

#[tokio::test]
async fn test_discovery_stops_at_max_rounds() {
    let local = create_test_node(0xF0);
    let a = create_test_node(0x80);
    let (network, bs, cs) = two_level_network(a);

    let mut config = discovery_config(1, 100, 2);
    config.discovery.round_width = 1;
    let kad = create_test_kademlia(local, vec![], network.clone(), config);
    kad.add_or_refresh(&a);

    let found: HashSet<NodeId> = kad
        .discover(create_test_node(0x00), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(found, bs.iter().copied().collect());
    for c in &cs {
        assert_eq!(network.find_count(c), 0);
    }
}

#[tokio::test]
async fn test_discovery_stops_early_without_progress() {
    let local = create_test_node(0x01);
    let a = create_test_node(0x80);
    let chain: Vec<NodeId> = (0..5).map(|i| create_test_node(0x90 + i)).collect();

    let network = Arc::new(FakeNetwork::new());
    network.set_neighbours(a, vec![chain[0]]);
    for pair in chain.windows(2) {
        network.set_neighbours(pair[0], vec![pair[1]]);
    }

    // Nothing can beat the local node's own distance to itself, so every
    // round stalls and the walk ends once one node was yielded. The first
    // round reads the local table and queries a.
    let mut config = discovery_config(10, 1, 1);
    config.discovery.round_width = 2;
    let kad = create_test_kademlia(local, vec![], network.clone(), config);
    kad.add_or_refresh(&a);

    let found: Vec<NodeId> = kad
        .discover(local, CancellationToken::new())
        .collect()
        .await;

    assert_eq!(found, vec![chain[0]]);
    assert_eq!(network.find_count(&chain[0]), 0);
}

#[tokio::test]
async fn test_discovery_walks_until_candidates_run_out() {
    let local = create_test_node(0x01);
    let a = create_test_node(0x80);
    let chain: Vec<NodeId> = (0..5).map(|i| create_test_node(0x90 + i)).collect();

    let network = Arc::new(FakeNetwork::new());
    network.set_neighbours(a, vec![chain[0]]);
    for pair in chain.windows(2) {
        network.set_neighbours(pair[0], vec![pair[1]]);
    }

    let kad = create_test_kademlia(local, vec![], network.clone(), discovery_config(10, 100, 2));
    kad.add_or_refresh(&a);

    let found: Vec<NodeId> = kad
        .discover(local, CancellationToken::new())
        .collect()
        .await;

    assert_eq!(found, chain);
}

#[tokio::test]
async fn test_closer_node_queried_within_round() {
    let local = create_test_node(0xF0);
    let a = create_test_node(0x80);
    let (network, bs, cs) = two_level_network(a);

    let mut config = discovery_config(1, 100, 2);
    config.discovery.round_width = 3;
    let kad = create_test_kademlia(local, vec![], network.clone(), config);
    kad.add_or_refresh(&a);

    let found: HashSet<NodeId> = kad
        .discover(create_test_node(0x00), CancellationToken::new())
        .collect()
        .await;

    // c0 comes back from b0 and is closer than the other b nodes.
    assert_eq!(network.find_calls(), vec![a, bs[0], cs[0]]);
    let expected: HashSet<NodeId> = bs.iter().chain(&cs[..1]).copied().collect();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn test_discovery_is_lazy() {
    let local = create_test_node(0xF0);
    let a = create_test_node(0x80);
    let (network, bs, _) = two_level_network(a);

    let kad = create_test_kademlia(local, vec![], network.clone(), discovery_config(3, 100, 2));
    kad.add_or_refresh(&a);

    let mut stream = kad.discover(create_test_node(0x00), CancellationToken::new());
    assert!(network.find_calls().is_empty());

    let first = stream.next().await.unwrap();
    assert!(bs.contains(&first));
    assert_eq!(network.find_calls(), vec![a]);

    drop(stream);
    assert_eq!(network.find_calls(), vec![a]);
}

#[tokio::test]
async fn test_unreachable_nodes_skipped_by_later_walks() {
    let local = create_test_node(0xF0);
    let a = create_test_node(0x80);

    let network = Arc::new(FakeNetwork::new());
    network.set_offline(a);

    let kad = create_test_kademlia(local, vec![], network.clone(), DhtConfig::default());
    kad.add_or_refresh(&a);

    let first: Vec<NodeId> = kad
        .discover(a, CancellationToken::new())
        .collect()
        .await;
    assert!(first.is_empty());
    assert_eq!(network.find_count(&a), 1);

    network.set_online(a);
    let second: Vec<NodeId> = kad
        .discover(a, CancellationToken::new())
        .collect()
        .await;
    assert!(second.is_empty());
    assert_eq!(network.find_count(&a), 1);
}

#[tokio::test]
async fn test_cancelled_discovery_yields_nothing() {
    let local = create_test_node(0xF0);
    let a = create_test_node(0x80);
    let (network, _, _) = two_level_network(a);

    let kad = create_test_kademlia(local, vec![], network.clone(), DhtConfig::default());
    kad.add_or_refresh(&a);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let found: Vec<NodeId> = kad.discover(a, cancel).collect().await;

    assert!(found.is_empty());
    assert!(network.find_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_cooldown_from_config() {
    let local = create_test_node(0xF0);
    let a = create_test_node(0x80);

    let network = Arc::new(FakeNetwork::new());
    network.set_offline(a);

    let mut config = DhtConfig::default();
    config.discovery.unreachable_cooldown_secs = 60;
    let kad = create_test_kademlia(local, vec![], network.clone(), config);
    kad.add_or_refresh(&a);

    let _: Vec<NodeId> = kad.discover(a, CancellationToken::new()).collect().await;
    assert_eq!(network.find_count(&a), 1);

    network.set_online(a);
    tokio::time::advance(Duration::from_secs(61)).await;
    let _: Vec<NodeId> = kad.discover(a, CancellationToken::new()).collect().await;
    assert_eq!(network.find_count(&a), 2);
}
