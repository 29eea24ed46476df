//! Pipeline error type

use sap_core::TreeError;
use thiserror::Error;

use crate::beacon::BeaconError;
use crate::broker::BrokerError;
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Tree construction failed: {0}")]
    Tree(#[from] TreeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] sap_types::Error),

    #[error("Unknown message kind: {0:?}")]
    UnknownKind(Option<String>),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Beacon error: {0}")]
    Beacon(#[from] BeaconError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
