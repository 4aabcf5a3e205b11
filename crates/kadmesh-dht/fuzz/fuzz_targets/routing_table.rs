#![no_main]

use kadmesh_dht::routing_table::RoutingTable;
use kadmesh_protocol::types::{NodeId, NODE_ID_SIZE};
use libfuzzer_sys::fuzz_target;

// Each op is one tag byte followed by a node id: insert, remove or query.
// A tiny k forces splits and full buckets early.
fuzz_target!(|data: &[u8]| {
    let local = NodeId::from_bytes([0x5a; NODE_ID_SIZE]);
    let mut table: RoutingTable<NodeId> = RoutingTable::new(local, 4);

    for op in data.chunks_exact(NODE_ID_SIZE + 1) {
        let Ok(id) = NodeId::from_slice(&op[1..]) else {
            return;
        };

        match op[0] % 3 {
            0 => {
                let before = table.len();
                let result = table.try_add_or_refresh(id, id);
                assert!(table.len() <= before + 1);
                if let Some((candidate, _)) = result.refresh_candidate {
                    assert!(table.contains(&candidate));
                }
            }
            1 => {
                let had = table.contains(&id);
                assert_eq!(table.remove(&id), had);
                assert!(!table.contains(&id));
            }
            _ => {
                let nearest = table.get_k_nearest(&id, 4, None, false);
                assert!(nearest.len() <= 4);
                assert!(nearest.len() <= table.len());
            }
        }
    }

    let total: usize = table.iterate_buckets().iter().map(|b| b.nodes.len()).sum();
    assert_eq!(total, table.len());
    for bucket in table.iterate_buckets() {
        assert!(bucket.nodes.len() <= 4);
        for (id, _) in &bucket.nodes {
            assert!(id.has_prefix(&bucket.prefix, bucket.depth));
        }
    }
});
