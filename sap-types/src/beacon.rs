//! External randomness beacon values

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A published beacon pulse: when it was produced and its output value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NistBeaconValue {
    pub timestamp: DateTime<Utc>,
    /// Hex encoded output value
    pub value: String,
}

impl NistBeaconValue {
    pub fn new(timestamp: DateTime<Utc>, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() || hex::decode(&value).is_err() {
            return Err(Error::InvalidBeacon(format!("value is not hex: {:?}", value)));
        }
        Ok(Self { timestamp, value })
    }

    /// The tag bound into leaves: `<rfc3339 timestamp>:<value>`
    pub fn tag(&self) -> String {
        format!(
            "{}:{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.value
        )
    }

    /// Parse a tag produced by [`NistBeaconValue::tag`]
    pub fn from_tag(tag: &str) -> Result<Self> {
        let (ts, value) = tag
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidBeacon(format!("missing separator: {:?}", tag)))?;
        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| Error::InvalidBeacon(e.to_string()))?
            .with_timezone(&Utc);
        Self::new(timestamp, value)
    }
}

impl fmt::Display for NistBeaconValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}
