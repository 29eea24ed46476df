//! Core types and wire formats for SAP (Stamp Aggregation Pipeline)
//!
//! This crate defines the digests, proof paths, proof ops arrays and the JSON
//! payloads exchanged between the aggregation tiers.

pub mod beacon;
pub mod error;
pub mod messages;
pub mod primitives;
pub mod proof;

pub use beacon::NistBeaconValue;
pub use error::{Error, Result};
pub use messages::{
    AggState, AggregateRootMessage, AggregationStateMessage, AnchorReference, AnchorRequest,
    CalState, CalendarStateMessage, HashSubmission, SubmissionPayload,
};
pub use primitives::{Digest, HashFunction};
pub use proof::{ProofOp, ProofPath, ProofStep, Side, StepValue};
