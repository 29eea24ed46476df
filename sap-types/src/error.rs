//! Error types for sap-types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid digest length: expected {expected}, got {actual}")]
    InvalidDigestLength { expected: usize, actual: usize },

    #[error("Invalid hash length: {0} bytes (expected 20 to 64)")]
    InvalidHashLength(usize),

    #[error("Empty hash id")]
    EmptyHashId,

    #[error("Unsupported hash function: {0}")]
    UnsupportedHashFunction(String),

    #[error("Invalid proof ops: {0}")]
    InvalidProofOps(String),

    #[error("Invalid beacon value: {0}")]
    InvalidBeacon(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hex encoding error: {0}")]
    HexEncoding(#[from] hex::FromHexError),
}
