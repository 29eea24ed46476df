//! Proof ops array encoding
//!
//! A path is encoded step by step, leaf to root: every step becomes a sibling
//! element (`{"l": v}` or `{"r": v}`) followed by an `{"op": tag}` element
//! naming the digest function applied after the concatenation.

use sap_types::{Error, HashFunction, ProofOp, ProofPath, ProofStep, Side};

/// Encode a proof path as an ops array
pub fn encode(path: &ProofPath) -> Vec<ProofOp> {
    let tag = path.hash_fn.tag();
    let mut ops = Vec::with_capacity(path.steps.len() * 2);

    for step in &path.steps {
        let value = step.value.to_wire();
        ops.push(match step.side {
            Side::Left => ProofOp::Left(value),
            Side::Right => ProofOp::Right(value),
        });
        ops.push(ProofOp::Op(tag.to_string()));
    }

    ops
}

/// Encode several consecutive paths (for example an aggregation path followed
/// by a calendar path) into a single ops array
pub fn encode_all<'a>(paths: impl IntoIterator<Item = &'a ProofPath>) -> Vec<ProofOp> {
    paths.into_iter().flat_map(encode).collect()
}

/// Decode an ops array into path segments.
///
/// Consecutive steps sharing a digest function form one segment, so the
/// output can be evaluated segment by segment from the starting value.
pub fn decode(ops: &[ProofOp]) -> Result<Vec<ProofPath>, Error> {
    if ops.len() % 2 != 0 {
        return Err(Error::InvalidProofOps(format!(
            "odd number of elements: {}",
            ops.len()
        )));
    }

    let mut segments: Vec<ProofPath> = Vec::new();

    for pair in ops.chunks(2) {
        let step = ProofStep::try_from(&pair[0])?;
        let hash_fn: HashFunction = pair[1].hash_function()?.ok_or_else(|| {
            Error::InvalidProofOps("sibling op must be followed by an op element".to_string())
        })?;

        match segments.last_mut() {
            Some(segment) if segment.hash_fn == hash_fn => segment.push(step),
            _ => {
                let mut segment = ProofPath::new(hash_fn);
                segment.push(step);
                segments.push(segment);
            }
        }
    }

    Ok(segments)
}
