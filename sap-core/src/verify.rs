//! Proof ops verification

use sap_types::{Digest, ProofOp};
use thiserror::Error;

use crate::ops;

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Malformed proof ops: {0}")]
    MalformedOps(#[from] sap_types::Error),

    #[error("Computed root {computed} does not match expected root {expected}")]
    RootMismatch { expected: Digest, computed: Digest },
}

/// Replay an ops array from a starting value and return the root it reaches
pub fn compute_root(start: &[u8], proof_ops: &[ProofOp]) -> Result<Digest, VerificationError> {
    let segments = ops::decode(proof_ops)?;

    let mut segments = segments.iter();
    let mut current = match segments.next() {
        Some(segment) => segment.evaluate(start)?,
        None => Digest::from_slice(start)?,
    };
    for segment in segments {
        current = segment.evaluate(current.as_bytes())?;
    }

    Ok(current)
}

/// Verify that an ops array carries `start` to `expected_root`
///
/// This performs the following checks:
/// 1. The ops array is well formed (sibling/op pairs, known digest functions)
/// 2. Replaying it from `start` reproduces `expected_root` exactly
pub fn verify_ops(
    start: &[u8],
    proof_ops: &[ProofOp],
    expected_root: &Digest,
) -> Result<(), VerificationError> {
    let computed = compute_root(start, proof_ops)?;
    if &computed != expected_root {
        return Err(VerificationError::RootMismatch {
            expected: *expected_root,
            computed,
        });
    }
    Ok(())
}
