//! Proof paths and their ops-array wire form
//!
//! A proof path is the ordered list of steps that carries a starting value
//! (a submitted hash, or an aggregation root) up to a tree root. Each step
//! concatenates a value on one side of the running digest and hashes the
//! result.

use crate::error::{Error, Result};
use crate::primitives::{Digest, HashFunction};
use serde::{Deserialize, Serialize};

/// Which side of the running digest a step value is concatenated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

/// The value carried by a step
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepValue {
    /// A sibling node in a Merkle tree
    Node(Digest),
    /// A binding label such as `core_id:<hash_id>`, hashed as UTF-8
    Label(String),
}

impl StepValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            StepValue::Node(d) => d.as_bytes(),
            StepValue::Label(s) => s.as_bytes(),
        }
    }

    /// Wire form: nodes as hex, labels verbatim
    pub fn to_wire(&self) -> String {
        match self {
            StepValue::Node(d) => d.to_hex(),
            StepValue::Label(s) => s.clone(),
        }
    }

    /// Parse the wire form. A 64-character hex string is a node, anything
    /// else a label.
    pub fn from_wire(s: &str) -> Self {
        match Digest::from_hex(s) {
            Ok(d) => StepValue::Node(d),
            Err(_) => StepValue::Label(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProofStep {
    pub side: Side,
    pub value: StepValue,
}

impl ProofStep {
    pub fn left(value: StepValue) -> Self {
        Self { side: Side::Left, value }
    }

    pub fn right(value: StepValue) -> Self {
        Self { side: Side::Right, value }
    }

    /// Apply this step to the running value
    pub fn apply(&self, hash_fn: HashFunction, current: &[u8]) -> Digest {
        match self.side {
            Side::Left => hash_fn.digest(&[self.value.as_bytes(), current]),
            Side::Right => hash_fn.digest(&[current, self.value.as_bytes()]),
        }
    }
}

/// Ordered steps from a starting value to a root, leaf-to-root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofPath {
    pub hash_fn: HashFunction,
    pub steps: Vec<ProofStep>,
}

impl ProofPath {
    pub fn new(hash_fn: HashFunction) -> Self {
        Self {
            hash_fn,
            steps: Vec::new(),
        }
    }

    /// Insert a step ahead of all existing steps
    pub fn prepend(&mut self, step: ProofStep) {
        self.steps.insert(0, step);
    }

    pub fn push(&mut self, step: ProofStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Compute the root reached from `start`.
    ///
    /// An empty path returns `start` itself, which must then be a digest.
    pub fn evaluate(&self, start: &[u8]) -> Result<Digest> {
        let mut steps = self.steps.iter();
        let mut current = match steps.next() {
            Some(step) => step.apply(self.hash_fn, start),
            None => return Digest::from_slice(start),
        };
        for step in steps {
            current = step.apply(self.hash_fn, current.as_bytes());
        }
        Ok(current)
    }
}

/// One element of a proof ops array: `{"l": v}`, `{"r": v}` or `{"op": tag}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofOp {
    #[serde(rename = "l")]
    Left(String),
    #[serde(rename = "r")]
    Right(String),
    #[serde(rename = "op")]
    Op(String),
}

impl ProofOp {
    /// The digest function named by an `op` element
    pub fn hash_function(&self) -> Result<Option<HashFunction>> {
        match self {
            ProofOp::Op(tag) => tag.parse().map(Some),
            _ => Ok(None),
        }
    }
}

impl TryFrom<&ProofOp> for ProofStep {
    type Error = Error;

    fn try_from(op: &ProofOp) -> Result<Self> {
        match op {
            ProofOp::Left(v) => Ok(ProofStep::left(StepValue::from_wire(v))),
            ProofOp::Right(v) => Ok(ProofStep::right(StepValue::from_wire(v))),
            ProofOp::Op(tag) => Err(Error::InvalidProofOps(format!(
                "expected a sibling op, found op {}",
                tag
            ))),
        }
    }
}
