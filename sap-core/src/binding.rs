//! Binding of submitted hashes into aggregation leaves
//!
//! A leaf never commits to the bare submitted hash. The hash id is always
//! bound first (`H("core_id:" ++ hash_id ++ hash)`), and when a beacon tag is
//! available it is folded over the result (`H("nist:" ++ tag ++ previous)`).
//! Both bindings are ordinary left steps, so a proof that starts from the
//! submitted hash replays them before the tree siblings.

use sap_types::{Digest, HashFunction, ProofPath, ProofStep, StepValue};

pub const CORE_ID_PREFIX: &str = "core_id:";
pub const BEACON_PREFIX: &str = "nist:";

/// Step binding a hash id
pub fn core_id_step(hash_id: &str) -> ProofStep {
    ProofStep::left(StepValue::Label(format!("{}{}", CORE_ID_PREFIX, hash_id)))
}

/// Step binding a beacon tag
pub fn beacon_step(tag: &str) -> ProofStep {
    ProofStep::left(StepValue::Label(format!("{}{}", BEACON_PREFIX, tag)))
}

/// Data for a single leaf of an aggregation tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundLeaf {
    pub hash_id: String,
    /// The submitted content hash
    pub hash: Vec<u8>,
    /// Beacon tag bound into this leaf, if any
    pub beacon_tag: Option<String>,
}

impl BoundLeaf {
    /// Binding steps in leaf-to-root order: core id, then beacon
    pub fn binding_steps(&self) -> Vec<ProofStep> {
        let mut steps = vec![core_id_step(&self.hash_id)];
        if let Some(tag) = &self.beacon_tag {
            steps.push(beacon_step(tag));
        }
        steps
    }

    /// Compute the leaf digest entered into the tree
    pub fn compute_hash(&self, hash_fn: HashFunction) -> Digest {
        let mut current = hash_fn.digest(&[
            CORE_ID_PREFIX.as_bytes(),
            self.hash_id.as_bytes(),
            &self.hash,
        ]);
        if let Some(tag) = &self.beacon_tag {
            current = hash_fn.digest(&[
                BEACON_PREFIX.as_bytes(),
                tag.as_bytes(),
                current.as_bytes(),
            ]);
        }
        current
    }

    /// Extend a tree path so that it starts from the submitted hash
    pub fn bind_path(&self, path: &mut ProofPath) {
        for step in self.binding_steps().into_iter().rev() {
            path.prepend(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(beacon_tag: Option<&str>) -> BoundLeaf {
        BoundLeaf {
            hash_id: "a".to_string(),
            hash: vec![0xab; 32],
            beacon_tag: beacon_tag.map(str::to_string),
        }
    }

    #[test]
    fn test_core_id_preimage() {
        let f = HashFunction::Sha256;
        let mut preimage = b"core_id:a".to_vec();
        preimage.extend_from_slice(&[0xab; 32]);
        assert_eq!(leaf(None).compute_hash(f), f.digest(&[&preimage]));
    }

    #[test]
    fn test_beacon_changes_leaf() {
        let f = HashFunction::Sha256;
        let plain = leaf(None).compute_hash(f);
        let bound = leaf(Some("2024-01-01T00:00:00Z:0123")).compute_hash(f);
        assert_ne!(plain, bound);
        assert_eq!(
            bound,
            f.digest(&[b"nist:2024-01-01T00:00:00Z:0123", plain.as_bytes()])
        );
    }

    #[test]
    fn test_binding_steps_replay_leaf() {
        let f = HashFunction::Sha256;
        for l in [leaf(None), leaf(Some("2024-01-01T00:00:00Z:0123"))] {
            let mut path = ProofPath::new(f);
            l.bind_path(&mut path);
            assert_eq!(path.evaluate(&l.hash).unwrap(), l.compute_hash(f));
        }
    }

    #[test]
    fn test_bind_path_precedes_siblings() {
        let f = HashFunction::Sha256;
        let sibling = ProofStep::right(StepValue::Node(Digest::new([1u8; 32])));
        let mut path = ProofPath::new(f);
        path.push(sibling.clone());

        leaf(Some("t:00")).bind_path(&mut path);
        assert_eq!(path.steps.len(), 3);
        assert_eq!(path.steps[0], core_id_step("a"));
        assert_eq!(path.steps[1], beacon_step("t:00"));
        assert_eq!(path.steps[2], sibling);
    }
}
