//! Benchmarks for core SAP operations: tree construction, path generation,
//! leaf binding, ops encoding and verification.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use sap_core::{ops, verify_ops, BoundLeaf, MerkleTreeBuilder};
use sap_types::{Digest, HashFunction};

fn make_leaf(i: usize) -> BoundLeaf {
    BoundLeaf {
        hash_id: format!("hash-{}", i),
        hash: vec![(i & 0xFF) as u8; 32],
        beacon_tag: None,
    }
}

fn make_digest(i: usize) -> Digest {
    let mut bytes = [0u8; 32];
    bytes[0..8].copy_from_slice(&(i as u64).to_le_bytes());
    Digest::new(bytes)
}

fn bench_tree_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_construction");

    for size in [1, 10, 100, 1000, 10000, 25000] {
        group.bench_with_input(BenchmarkId::new("leaves", size), &size, |b, &size| {
            b.iter(|| {
                let mut builder = MerkleTreeBuilder::with_capacity(HashFunction::Sha256, size);
                builder.add_leaves((0..size).map(make_digest));
                builder.build().unwrap()
            });
        });
    }
    group.finish();
}

fn bench_path_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_generation");

    for size in [10, 100, 1000, 10000] {
        let mut builder = MerkleTreeBuilder::new(HashFunction::Sha256);
        builder.add_leaves((0..size).map(make_digest));
        let tree = builder.build().unwrap();

        group.bench_with_input(BenchmarkId::new("leaves", size), &size, |b, &size| {
            b.iter(|| tree.proof(size / 2).unwrap());
        });
    }
    group.finish();
}

fn bench_leaf_binding(c: &mut Criterion) {
    let plain = make_leaf(7);
    let bound = BoundLeaf {
        beacon_tag: Some("2024-01-01T00:00:00Z:0123abcd".to_string()),
        ..make_leaf(7)
    };

    c.bench_function("bind_core_id", |b| b.iter(|| plain.compute_hash(HashFunction::Sha256)));
    c.bench_function("bind_core_id_and_beacon", |b| {
        b.iter(|| bound.compute_hash(HashFunction::Sha256))
    });
}

fn bench_ops(c: &mut Criterion) {
    let f = HashFunction::Sha256;
    let leaves: Vec<BoundLeaf> = (0..1000).map(make_leaf).collect();
    let mut builder = MerkleTreeBuilder::new(f);
    builder.add_leaves(leaves.iter().map(|l| l.compute_hash(f)));
    let tree = builder.build().unwrap();

    let mut path = tree.proof(500).unwrap();
    leaves[500].bind_path(&mut path);
    let encoded = ops::encode(&path);

    c.bench_function("ops_encode", |b| b.iter(|| ops::encode(&path)));
    c.bench_function("ops_verify", |b| {
        b.iter(|| verify_ops(&leaves[500].hash, &encoded, tree.root()).unwrap())
    });
}

criterion_group!(
    benches,
    bench_tree_construction,
    bench_path_generation,
    bench_leaf_binding,
    bench_ops
);
criterion_main!(benches);
