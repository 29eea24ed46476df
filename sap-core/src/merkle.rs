//! Binary Merkle tree construction with per-leaf inclusion proofs

use sap_types::{Digest, HashFunction, ProofPath, ProofStep, StepValue};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    #[error("Invalid input: cannot build a tree from zero leaves")]
    NoLeaves,
}

/// A built Merkle tree
#[derive(Debug, Clone)]
pub struct MerkleTree {
    hash_fn: HashFunction,
    /// Nodes organized by level
    /// levels[0] is the leaves, the last level holds only the root
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Get the root hash
    pub fn root(&self) -> &Digest {
        // Safe: build() never produces an empty level
        &self.levels[self.levels.len() - 1][0]
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_fn
    }

    /// Get the number of leaves
    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Get a specific leaf
    pub fn leaf(&self, index: usize) -> Option<&Digest> {
        self.levels[0].get(index)
    }

    /// Generate the inclusion proof for a specific leaf
    pub fn proof(&self, leaf_index: usize) -> Option<ProofPath> {
        if leaf_index >= self.leaf_count() {
            return None;
        }

        let mut path = ProofPath::new(self.hash_fn);
        let mut index = leaf_index;

        // Walk up the tree from leaf to root
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };

            // A promoted node has no sibling at this level
            if let Some(sibling) = level.get(sibling_index) {
                let value = StepValue::Node(*sibling);
                path.push(if sibling_index < index {
                    ProofStep::left(value)
                } else {
                    ProofStep::right(value)
                });
            }

            index /= 2;
        }

        Some(path)
    }

    /// Inclusion proofs for every leaf, in leaf order
    pub fn proofs(&self) -> Vec<ProofPath> {
        (0..self.leaf_count())
            .filter_map(|i| self.proof(i))
            .collect()
    }
}

/// Builder for Merkle trees over an ordered sequence of leaf digests
pub struct MerkleTreeBuilder {
    hash_fn: HashFunction,
    leaves: Vec<Digest>,
}

impl MerkleTreeBuilder {
    pub fn new(hash_fn: HashFunction) -> Self {
        Self {
            hash_fn,
            leaves: Vec::new(),
        }
    }

    pub fn with_capacity(hash_fn: HashFunction, capacity: usize) -> Self {
        Self {
            hash_fn,
            leaves: Vec::with_capacity(capacity),
        }
    }

    /// Add a leaf to the tree
    pub fn add_leaf(&mut self, leaf: Digest) {
        self.leaves.push(leaf);
    }

    pub fn add_leaves(&mut self, leaves: impl IntoIterator<Item = Digest>) {
        self.leaves.extend(leaves);
    }

    /// Build the tree.
    ///
    /// When a level has an odd number of nodes the last one is promoted
    /// unchanged to the next level.
    pub fn build(self) -> Result<MerkleTree, TreeError> {
        if self.leaves.is_empty() {
            return Err(TreeError::NoLeaves);
        }

        let hash_fn = self.hash_fn;
        let mut levels = vec![self.leaves];

        while let Some(prev_level) = levels.last() {
            if prev_level.len() <= 1 {
                break;
            }

            let next_level: Vec<Digest> = prev_level
                .chunks(2)
                .map(|pair| match pair.get(1) {
                    Some(right) => hash_fn.hash_pair(&pair[0], right),
                    None => pair[0],
                })
                .collect();

            levels.push(next_level);
        }

        Ok(MerkleTree { hash_fn, levels })
    }
}
