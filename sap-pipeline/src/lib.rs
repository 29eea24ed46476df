//! SAP Pipeline
//!
//! The broker-driven services of the Stamp Aggregation Pipeline: tier-1
//! hash aggregation, tier-2 calendar chaining and anchor scheduling.
//!
//! Brokers plug in through the [`Broker`] trait. The only implementation
//! shipped is [`MemoryBroker`], which lives inside one process: the binary
//! runs both tiers against it, but nothing outside the process can submit
//! hashes or read proof states.

pub mod aggregator;
pub mod anchor;
pub mod batch;
pub mod beacon;
pub mod broker;
pub mod calendar;
pub mod config;
pub mod error;
pub mod memory;
pub mod server;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use aggregator::{AggregationJob, AggregationTree, HashAggregator};
pub use anchor::{AnchorOutcome, AnchorScheduler, CalendarBlock};
pub use batch::BatchOutcome;
pub use beacon::{BeaconBinder, BeaconSource, FileBeaconSource};
pub use broker::{Broker, BrokerError, BrokerLink, Channel, SharedChannel};
pub use calendar::{CalendarChainer, CalendarInbound, CalendarTree, TreeState};
pub use config::{ConfigError, PipelineConfig};
pub use error::PipelineError;
pub use memory::MemoryBroker;
pub use server::Pipeline;
