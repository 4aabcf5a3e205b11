//! Routing-table benchmarks
//!
//! Measures insertion (including splits around the local node) and
//! closest-node queries on tables of increasing size.
//!
//! Run with: `cargo bench -p kadmesh-dht --bench routing_table`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kadmesh_dht::{RoutingTable, K};
use kadmesh_protocol::NodeId;
use rand::rngs::StdRng;
use rand::SeedableRng;

const TABLE_SIZES: [usize; 3] = [100, 1_000, 10_000];

fn random_ids(count: usize, seed: u64) -> Vec<NodeId> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| NodeId::random(&mut rng)).collect()
}

fn populated_table(local: NodeId, ids: &[NodeId]) -> RoutingTable<NodeId> {
    let mut table = RoutingTable::new(local, K);
    for id in ids {
        table.try_add_or_refresh(*id, *id);
    }
    table
}

fn bench_insert(c: &mut Criterion) {
    let local = NodeId::hash(b"bench-local");
    let mut group = c.benchmark_group("routing_table_insert");

    for size in TABLE_SIZES {
        let ids = random_ids(size, 7);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &ids, |b, ids| {
            b.iter(|| black_box(populated_table(local, ids)).len())
        });
    }

    group.finish();
}

fn bench_get_k_nearest(c: &mut Criterion) {
    let local = NodeId::hash(b"bench-local");
    let targets = random_ids(256, 11);
    let mut group = c.benchmark_group("routing_table_get_k_nearest");

    for size in TABLE_SIZES {
        let table = populated_table(local, &random_ids(size, 7));
        let mut next = 0usize;

        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                let target = &targets[next % targets.len()];
                next += 1;
                black_box(table.get_k_nearest(target, K, None, false))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_get_k_nearest);
criterion_main!(benches);
