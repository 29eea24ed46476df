//! Core tree functionality for the Stamp Aggregation Pipeline
//!
//! This crate provides:
//! - Merkle tree construction with per-leaf inclusion proofs
//! - Proof ops array encoding and decoding
//! - Core-id and beacon binding of submitted hashes into leaves
//! - Proof ops verification

pub mod binding;
pub mod merkle;
pub mod ops;
pub mod verify;

pub use binding::BoundLeaf;
pub use merkle::{MerkleTree, MerkleTreeBuilder, TreeError};
pub use verify::{compute_root, verify_ops, VerificationError};
