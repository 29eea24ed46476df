//! Pipeline configuration

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use sap_types::HashFunction;

use crate::broker::LinkSettings;

/// Environment variable overriding `broker.uri`
pub const BROKER_URI_ENV: &str = "SAP_BROKER_URI";

pub const TICK_INTERVAL_RANGE_MS: RangeInclusive<u64> = 250..=10_000;
pub const BATCH_SIZE_RANGE: RangeInclusive<usize> = 100..=25_000;
pub const ANCHOR_INTERVAL_RANGE_SECS: RangeInclusive<u64> = 60..=86_400;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("{field} = {value} is outside the accepted range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

fn check_range(
    field: &'static str,
    value: u64,
    range: &RangeInclusive<u64>,
) -> Result<(), ConfigError> {
    if !range.contains(&value) {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        });
    }
    Ok(())
}

fn check_batch_size(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if !BATCH_SIZE_RANGE.contains(&value) {
        return Err(ConfigError::OutOfRange {
            field,
            value: value as u64,
            min: *BATCH_SIZE_RANGE.start() as u64,
            max: *BATCH_SIZE_RANGE.end() as u64,
        });
    }
    Ok(())
}

fn check_not_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Empty(field));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Broker connection
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Queue names
    #[serde(default)]
    pub queues: QueueConfig,

    /// Tier-1 aggregation
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Tier-2 calendar chaining
    #[serde(default)]
    pub calendar: CalendarConfig,

    /// Anchor scheduling
    #[serde(default)]
    pub anchor: AnchorConfig,

    /// Beacon source
    #[serde(default)]
    pub beacon: BeaconConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Connection URI, `memory://` selects the in-process broker
    pub uri: String,

    /// Unacknowledged deliveries per consumer, 0 = unlimited
    pub prefetch: u16,

    /// Fixed delay between connection attempts (milliseconds)
    pub reconnect_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: "memory://localhost".to_string(),
            prefetch: 0,
            reconnect_delay_ms: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_not_empty("broker.uri", &self.uri)?;
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "broker.reconnect_delay_ms",
                value: 0,
                min: 1,
                max: u64::MAX,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Inbound hash submissions
    pub aggregator_in: String,

    /// Aggregate roots and ledger feedback for the calendar tier
    pub calendar_in: String,

    /// Proof state messages of both tiers
    pub state_out: String,

    /// Anchor requests
    pub anchor_out: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            aggregator_in: "work.agg".to_string(),
            calendar_in: "work.cal".to_string(),
            state_out: "work.state".to_string(),
            anchor_out: "work.btctx".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_not_empty("queues.aggregator_in", &self.aggregator_in)?;
        check_not_empty("queues.calendar_in", &self.calendar_in)?;
        check_not_empty("queues.state_out", &self.state_out)?;
        check_not_empty("queues.anchor_out", &self.anchor_out)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// How often pending submissions are built into a tree (milliseconds)
    pub aggregation_interval_ms: u64,

    /// Maximum submissions per tree
    pub max_batch_size: usize,

    /// Digest function for leaves, nodes and binding steps
    pub hash_function: HashFunction,

    /// Bind the latest beacon value into leaves submitted without one
    pub bind_beacon: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            aggregation_interval_ms: 1000,
            max_batch_size: 25_000,
            hash_function: HashFunction::Sha256,
            bind_beacon: false,
        }
    }
}

impl AggregatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.aggregation_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "aggregator.aggregation_interval_ms",
            self.aggregation_interval_ms,
            &TICK_INTERVAL_RANGE_MS,
        )?;
        check_batch_size("aggregator.max_batch_size", self.max_batch_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// How often pending aggregate roots are built into a tree (milliseconds)
    pub calendar_interval_ms: u64,

    /// How often built trees are finalized (milliseconds)
    pub finalize_interval_ms: u64,

    /// Maximum aggregate roots per tree
    pub max_batch_size: usize,

    /// Digest function for calendar trees
    pub hash_function: HashFunction,

    /// Public base URI of this calendar, used in anchor references
    pub base_uri: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            calendar_interval_ms: 1000,
            finalize_interval_ms: 1000,
            max_batch_size: 25_000,
            hash_function: HashFunction::Sha256,
            base_uri: "http://127.0.0.1:8080".to_string(),
        }
    }
}

impl CalendarConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.calendar_interval_ms)
    }

    pub fn finalize_interval(&self) -> Duration {
        Duration::from_millis(self.finalize_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "calendar.calendar_interval_ms",
            self.calendar_interval_ms,
            &TICK_INTERVAL_RANGE_MS,
        )?;
        check_range(
            "calendar.finalize_interval_ms",
            self.finalize_interval_ms,
            &TICK_INTERVAL_RANGE_MS,
        )?;
        check_batch_size("calendar.max_batch_size", self.max_batch_size)?;
        check_not_empty("calendar.base_uri", &self.base_uri)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Seconds between anchor requests
    pub interval_secs: u64,

    /// Digest function for anchor trees
    pub hash_function: HashFunction,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            hash_function: HashFunction::Sha256,
        }
    }
}

impl AnchorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "anchor.interval_secs",
            self.interval_secs,
            &ANCHOR_INTERVAL_RANGE_SECS,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Key identifying the beacon value to fetch
    pub key: String,

    /// How often the beacon value is refreshed (milliseconds)
    pub refresh_interval_ms: u64,

    /// Directory holding `<key>.json` beacon files; no beacon when unset
    pub source_dir: Option<PathBuf>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            key: "nist_latest".to_string(),
            refresh_interval_ms: 60_000,
            source_dir: None,
        }
    }
}

impl BeaconConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_not_empty("beacon.key", &self.key)?;
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "beacon.refresh_interval_ms",
                value: 0,
                min: 1,
                max: u64::MAX,
            });
        }
        Ok(())
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: PipelineConfig = toml::from_str(&contents)?;

        // The broker URI may carry credentials, prefer the environment
        if let Ok(uri) = std::env::var(BROKER_URI_ENV) {
            config.broker.uri = uri;
        }

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check every interval and batch size against its accepted range
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.queues.validate()?;
        self.aggregator.validate()?;
        self.calendar.validate()?;
        self.anchor.validate()?;
        self.beacon.validate()?;
        Ok(())
    }

    /// Link settings for the aggregation service
    pub fn aggregator_link(&self) -> LinkSettings {
        LinkSettings {
            uri: self.broker.uri.clone(),
            prefetch: self.broker.prefetch,
            consume_queue: self.queues.aggregator_in.clone(),
            declare_queues: vec![self.queues.state_out.clone(), self.queues.calendar_in.clone()],
            reconnect_delay: self.broker.reconnect_delay(),
        }
    }

    /// Link settings for the calendar service
    pub fn calendar_link(&self) -> LinkSettings {
        LinkSettings {
            uri: self.broker.uri.clone(),
            prefetch: self.broker.prefetch,
            consume_queue: self.queues.calendar_in.clone(),
            declare_queues: vec![self.queues.state_out.clone(), self.queues.anchor_out.clone()],
            reconnect_delay: self.broker.reconnect_delay(),
        }
    }
}
