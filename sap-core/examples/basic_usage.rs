//! Basic usage example for the aggregation tree
//!
//! This example demonstrates:
//! - Binding submitted hashes into leaves
//! - Building an aggregation tree
//! - Encoding and verifying per-leaf proof ops
//!
//! Run with: cargo run -p sap-core --example basic_usage

use sap_core::{ops, verify_ops, BoundLeaf, MerkleTreeBuilder};
use sap_types::HashFunction;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let hash_fn = HashFunction::Sha256;

    // Step 1: Hash the data and bind each hash to its id
    let leaves: Vec<BoundLeaf> = [
        b"Hello, world!".as_slice(),
        b"Timestamp this".as_slice(),
        b"Another one".as_slice(),
    ]
        .iter()
        .enumerate()
        .map(|(i, data)| BoundLeaf {
            hash_id: format!("hash-{}", i),
            hash: hash_fn.digest(&[*data]).as_bytes().to_vec(),
            beacon_tag: None,
        })
        .collect();

    // Step 2: Build the tree
    let mut builder = MerkleTreeBuilder::new(hash_fn);
    builder.add_leaves(leaves.iter().map(|l| l.compute_hash(hash_fn)));
    let tree = builder.build()?;
    println!("Aggregation root: {}", tree.root());
    println!("Leaves: {}\n", tree.leaf_count());

    // Step 3: Encode and verify each proof
    for (i, leaf) in leaves.iter().enumerate() {
        let mut path = tree.proof(i).ok_or("missing proof")?;
        leaf.bind_path(&mut path);
        let encoded = ops::encode(&path);

        verify_ops(&leaf.hash, &encoded, tree.root())?;
        println!("{}: {} ops, verified", leaf.hash_id, encoded.len());
        println!("  {}", format_ops(&encoded));
    }

    Ok(())
}

fn format_ops(ops: &[sap_types::ProofOp]) -> String {
    ops.iter()
        .map(|op| match op {
            sap_types::ProofOp::Left(v) => format!("l:{}", v),
            sap_types::ProofOp::Right(v) => format!("r:{}", v),
            sap_types::ProofOp::Op(tag) => format!("op:{}", tag),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
