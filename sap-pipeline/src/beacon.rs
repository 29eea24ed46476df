//! Beacon values bound into aggregation leaves
//!
//! A refresher task polls a [`BeaconSource`] and publishes the latest value
//! into a watch channel. The aggregator holds the receiving end as a
//! [`BeaconBinder`] and snapshots it once per tick without waiting.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sap_types::NistBeaconValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("Failed to read beacon: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse beacon: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid beacon value: {0}")]
    Invalid(#[from] sap_types::Error),

    #[error("Invalid beacon key: {0:?}")]
    InvalidKey(String),
}

/// Where beacon values come from
#[async_trait]
pub trait BeaconSource: Send + Sync {
    /// Latest value stored under `key`, `None` if there is none yet
    async fn latest(&self, key: &str) -> Result<Option<NistBeaconValue>, BeaconError>;
}

/// Reads beacon values from `<dir>/<key>.json`, kept current by an external
/// fetcher
pub struct FileBeaconSource {
    dir: PathBuf,
}

impl FileBeaconSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl BeaconSource for FileBeaconSource {
    async fn latest(&self, key: &str) -> Result<Option<NistBeaconValue>, BeaconError> {
        if key.is_empty() || key.contains("..") || key.contains('/') || key.contains('\\') {
            return Err(BeaconError::InvalidKey(key.to_string()));
        }

        let path = self.dir.join(format!("{}.json", key));
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let raw: NistBeaconValue = serde_json::from_slice(&contents)?;
        Ok(Some(NistBeaconValue::new(raw.timestamp, raw.value)?))
    }
}

/// Read side of the beacon channel
#[derive(Clone)]
pub struct BeaconBinder {
    rx: watch::Receiver<Option<NistBeaconValue>>,
}

impl BeaconBinder {
    /// A binder that never yields a value
    pub fn disabled() -> Self {
        let (_feed, binder) = beacon_channel();
        binder
    }

    /// Tag of the most recent beacon value, if any
    pub fn snapshot(&self) -> Option<String> {
        self.rx.borrow().as_ref().map(NistBeaconValue::tag)
    }
}

/// Write side of the beacon channel
pub struct BeaconFeed {
    tx: watch::Sender<Option<NistBeaconValue>>,
}

impl BeaconFeed {
    /// Replace the current value, returning whether it changed
    pub fn publish(&self, value: NistBeaconValue) -> bool {
        let previous = self.tx.send_replace(Some(value.clone()));
        previous.as_ref() != Some(&value)
    }
}

pub fn beacon_channel() -> (BeaconFeed, BeaconBinder) {
    let (tx, rx) = watch::channel(None);
    (BeaconFeed { tx }, BeaconBinder { rx })
}

/// Poll `source` every `interval` and feed new values to the binder
pub fn spawn_refresher(
    source: Arc<dyn BeaconSource>,
    key: String,
    interval: Duration,
    feed: BeaconFeed,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Beacon refresher started for key {}", key);
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            match source.latest(&key).await {
                Ok(Some(value)) => {
                    if feed.publish(value.clone()) {
                        debug!("Beacon value updated: {}", value);
                    }
                }
                Ok(None) => debug!("No beacon value available for {}", key),
                Err(e) => warn!("Failed to refresh beacon value: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn value() -> NistBeaconValue {
        NistBeaconValue::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), "abcd").unwrap()
    }

    #[test]
    fn test_disabled_binder_has_no_snapshot() {
        assert_eq!(BeaconBinder::disabled().snapshot(), None);
    }

    #[test]
    fn test_snapshot_follows_feed() {
        let (feed, binder) = beacon_channel();
        assert!(feed.publish(value()));
        assert!(!feed.publish(value()));
        assert_eq!(binder.snapshot().as_deref(), Some("2024-01-01T00:00:00Z:abcd"));
    }

    #[tokio::test]
    async fn test_file_source_reads_key() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("nist_latest.json"),
            serde_json::to_vec(&value()).unwrap(),
        )
        .unwrap();

        let source = FileBeaconSource::new(dir.path());
        assert_eq!(source.latest("nist_latest").await.unwrap(), Some(value()));
        assert_eq!(source.latest("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_source_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            br#"{"timestamp":"2024-01-01T00:00:00Z","value":"not hex"}"#,
        )
        .unwrap();

        let source = FileBeaconSource::new(dir.path());
        assert!(matches!(source.latest("bad").await, Err(BeaconError::Invalid(_))));
        assert!(matches!(
            source.latest("../etc").await,
            Err(BeaconError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_refresher_publishes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("nist_latest.json"),
            serde_json::to_vec(&value()).unwrap(),
        )
        .unwrap();

        let (feed, binder) = beacon_channel();
        let task = spawn_refresher(
            Arc::new(FileBeaconSource::new(dir.path())),
            "nist_latest".to_string(),
            Duration::from_millis(10),
            feed,
        );

        let mut rx = binder.rx.clone();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binder.snapshot(), Some(value().tag()));
        task.abort();
    }
}
