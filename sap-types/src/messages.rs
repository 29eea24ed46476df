//! JSON payloads exchanged between the pipeline tiers

use crate::error::{Error, Result};
use crate::primitives::Digest;
use crate::proof::ProofOp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shortest accepted submitted hash, in bytes (SHA-1 / RIPEMD-160)
pub const MIN_HASH_LEN: usize = 20;
/// Longest accepted submitted hash, in bytes (SHA-512)
pub const MAX_HASH_LEN: usize = 64;

/// Inbound hash submission as it arrives on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub hash_id: String,
    /// Hex encoded content hash
    pub hash: String,
    /// Beacon tag captured by the submitting service, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nist: Option<String>,
}

/// A validated hash submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSubmission {
    pub hash_id: String,
    pub hash: Vec<u8>,
    /// The hash exactly as submitted, echoed back in proof states
    pub hash_text: String,
    pub nist: Option<String>,
}

impl HashSubmission {
    /// Parse and validate a raw submission payload
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let payload: SubmissionPayload = serde_json::from_slice(bytes)?;
        Self::try_from(payload)
    }

    /// Build a submission from raw bytes, as if they had been sent as
    /// lowercase hex
    pub fn from_bytes(hash_id: impl Into<String>, hash: Vec<u8>, nist: Option<String>) -> Self {
        Self {
            hash_id: hash_id.into(),
            hash_text: hex::encode(&hash),
            hash,
            nist,
        }
    }
}

impl TryFrom<SubmissionPayload> for HashSubmission {
    type Error = Error;

    fn try_from(payload: SubmissionPayload) -> Result<Self> {
        if payload.hash_id.is_empty() {
            return Err(Error::EmptyHashId);
        }
        let hash = hex::decode(&payload.hash)?;
        if !(MIN_HASH_LEN..=MAX_HASH_LEN).contains(&hash.len()) {
            return Err(Error::InvalidHashLength(hash.len()));
        }
        Ok(Self {
            hash_id: payload.hash_id,
            hash,
            hash_text: payload.hash,
            nist: payload.nist.filter(|n| !n.is_empty()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggState {
    pub ops: Vec<ProofOp>,
}

/// Tier-1 proof state for one submitted hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationStateMessage {
    pub hash_id: String,
    pub hash: String,
    pub agg_id: Uuid,
    pub agg_state: AggState,
}

/// Root of one aggregation tree, bound for the calendar tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRootMessage {
    pub agg_id: Uuid,
    pub agg_root: Digest,
    pub agg_hash_count: usize,
}

/// Where the calendar entry for a tree will be anchored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReference {
    pub anchor_id: String,
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalState {
    pub ops: Vec<ProofOp>,
    pub anchor: AnchorReference,
}

/// Tier-2 proof state for one aggregation root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarStateMessage {
    pub agg_id: Uuid,
    pub agg_root: Digest,
    pub agg_hash_count: usize,
    pub cal_id: Uuid,
    pub cal_root: Digest,
    pub cal_state: CalState,
}

/// Commitment over a window of calendar blocks, bound for the anchoring service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRequest {
    pub anchor_agg_id: Uuid,
    pub anchor_agg_root: Digest,
    pub anchor_agg_cal_record_count: usize,
}
