//! Test utilities for driving pipeline components against the in-process
//! broker.
//!
//! Components are wired exactly as the services wire them, but ticks and
//! deliveries are stepped by hand so tests control every interleaving.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::aggregator::HashAggregator;
use crate::anchor::{block_channel, AnchorScheduler, BlockReceiver};
use crate::beacon::BeaconBinder;
use crate::broker::{BrokerLink, Consumer, KIND_AGGREGATOR};
use crate::calendar::CalendarChainer;
use crate::config::PipelineConfig;
use crate::memory::{MemoryBroker, StoredMessage};

/// A memory broker plus a configuration tuned for fast tests
pub struct TestHarness {
    pub broker: MemoryBroker,
    pub config: PipelineConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        let mut config = PipelineConfig::default();
        config.broker.reconnect_delay_ms = 20;
        config.aggregator.aggregation_interval_ms = 250;
        config.calendar.calendar_interval_ms = 250;
        config.calendar.finalize_interval_ms = 250;
        config.calendar.base_uri = "http://calendar.test".to_string();

        Self {
            broker: MemoryBroker::new(),
            config,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.config.broker.reconnect_delay()
    }

    /// Enqueue a well-formed submission for the aggregation tier
    pub fn submit(&self, hash_id: &str, hash: &[u8], nist: Option<&str>) {
        let payload = serde_json::json!({
            "hash_id": hash_id,
            "hash": hex::encode(hash),
            "nist": nist,
        });
        self.submit_raw(payload.to_string().as_bytes());
    }

    pub fn submit_raw(&self, payload: &[u8]) {
        self.broker
            .inject(&self.config.queues.aggregator_in, None, payload.to_vec());
    }

    /// Enqueue a message for the calendar tier
    pub fn send_calendar<T: Serialize>(&self, kind: Option<&str>, body: &T) {
        let payload = serde_json::to_vec(body).expect("serializable body");
        self.broker
            .inject(&self.config.queues.calendar_in, kind, payload);
    }

    pub fn send_root<T: Serialize>(&self, root: &T) {
        self.send_calendar(Some(KIND_AGGREGATOR), root);
    }

    /// A connected aggregator, its link and its consumer
    pub async fn aggregator(
        &self,
        beacon: BeaconBinder,
    ) -> (HashAggregator, BrokerLink, Consumer) {
        let broker = Arc::new(self.broker.clone());
        let mut link = BrokerLink::new(broker, self.config.aggregator_link());
        let consumer = link.connect().await;
        let aggregator = HashAggregator::new(
            self.config.aggregator.clone(),
            self.config.queues.clone(),
            link.channel(),
            beacon,
        );
        (aggregator, link, consumer)
    }

    /// A connected calendar chainer, its anchor scheduler, link, consumer
    /// and the receiving end of its block channel
    pub async fn calendar(&self) -> CalendarParts {
        let mut link = BrokerLink::new(Arc::new(self.broker.clone()), self.config.calendar_link());
        let consumer = link.connect().await;
        let (block_tx, blocks) = block_channel();
        let chainer = CalendarChainer::new(
            self.config.calendar.clone(),
            self.config.queues.clone(),
            link.channel(),
            block_tx,
        );
        let anchor = AnchorScheduler::new(
            self.config.anchor.clone(),
            self.config.queues.anchor_out.clone(),
            link.channel(),
        );

        CalendarParts {
            chainer,
            anchor,
            link,
            consumer,
            blocks,
        }
    }

    /// Remove every message from `queue` and decode the ones of `kind`
    pub fn take_json<T: DeserializeOwned>(&self, queue: &str, kind: Option<&str>) -> Vec<T> {
        self.broker
            .take(queue)
            .into_iter()
            .filter(|m| m.kind.as_deref() == kind)
            .map(|m| serde_json::from_slice(&m.payload).expect("valid JSON message"))
            .collect()
    }

    pub fn take(&self, queue: &str) -> Vec<StoredMessage> {
        self.broker.take(queue)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CalendarParts {
    pub chainer: CalendarChainer,
    pub anchor: AnchorScheduler,
    pub link: BrokerLink,
    pub consumer: Consumer,
    pub blocks: BlockReceiver,
}

/// Pull `count` deliveries from `consumer` and hand each to `ingest`
#[macro_export]
macro_rules! deliver {
    ($consumer:expr, $target:expr, $count:expr) => {
        for _ in 0..$count {
            let incoming = $consumer.next().await.expect("delivery");
            $target.ingest(incoming).await;
        }
    };
}
