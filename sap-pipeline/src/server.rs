//! Pipeline services
//!
//! Each service owns one broker link and runs a single select loop over its
//! deliveries and interval ticks. Publish-and-settle work is spawned so that
//! ticks never wait on broker confirmations. When the connection closes the
//! service drops its buffered work, waits the reconnect delay and starts
//! over; the broker redelivers everything that was not acknowledged.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::aggregator::HashAggregator;
use crate::anchor::{block_channel, AnchorScheduler, BlockReceiver};
use crate::beacon::{beacon_channel, spawn_refresher, BeaconBinder, FileBeaconSource};
use crate::broker::{Broker, BrokerLink};
use crate::calendar::CalendarChainer;
use crate::config::PipelineConfig;
use crate::error::PipelineError;

/// Tier-1 service: consumes submissions, publishes proof states and roots
pub struct AggregatorService {
    link: BrokerLink,
    aggregator: HashAggregator,
    interval: Duration,
}

impl AggregatorService {
    pub fn new(broker: Arc<dyn Broker>, config: &PipelineConfig, beacon: BeaconBinder) -> Self {
        let link = BrokerLink::new(broker, config.aggregator_link());
        let aggregator = HashAggregator::new(
            config.aggregator.clone(),
            config.queues.clone(),
            link.channel(),
            beacon,
        );

        Self {
            link,
            aggregator,
            interval: config.aggregator.interval(),
        }
    }

    pub async fn run(mut self) {
        info!("Aggregator service started");

        loop {
            let mut consumer = self.link.connect().await;
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    incoming = consumer.next() => match incoming {
                        Some(incoming) => self.aggregator.ingest(incoming).await,
                        None => break,
                    },

                    _ = ticker.tick() => {
                        if let Some(job) = self.aggregator.run_aggregation_tick() {
                            tokio::spawn(job.commit());
                        }
                    }
                }
            }

            warn!(
                "Broker connection closed, reconnecting in {:?}",
                self.link.reconnect_delay()
            );
            self.link.close();
            self.aggregator.detach();
            tokio::time::sleep(self.link.reconnect_delay()).await;
        }
    }
}

/// Tier-2 service: consumes aggregate roots, publishes calendar proof
/// states and anchor requests
pub struct CalendarService {
    link: BrokerLink,
    chainer: CalendarChainer,
    anchor: AnchorScheduler,
    blocks: BlockReceiver,
    calendar_interval: Duration,
    finalize_interval: Duration,
    anchor_interval: Duration,
}

impl CalendarService {
    pub fn new(broker: Arc<dyn Broker>, config: &PipelineConfig) -> Self {
        let link = BrokerLink::new(broker, config.calendar_link());
        let (block_tx, blocks) = block_channel();
        let chainer = CalendarChainer::new(
            config.calendar.clone(),
            config.queues.clone(),
            link.channel(),
            block_tx,
        );
        let anchor = AnchorScheduler::new(
            config.anchor.clone(),
            config.queues.anchor_out.clone(),
            link.channel(),
        );

        Self {
            link,
            chainer,
            anchor,
            blocks,
            calendar_interval: config.calendar.interval(),
            finalize_interval: config.calendar.finalize_interval(),
            anchor_interval: config.anchor.interval(),
        }
    }

    pub async fn run(mut self) {
        info!("Calendar service started");

        // The anchor window outlives connections, and so does its cadence
        let first_anchor = Instant::now() + self.anchor_interval;
        let mut anchor_ticker = interval_at(first_anchor, self.anchor_interval);
        anchor_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut consumer = self.link.connect().await;
            let mut calendar_ticker = interval(self.calendar_interval);
            calendar_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut finalize_ticker = interval(self.finalize_interval);
            finalize_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    incoming = consumer.next() => match incoming {
                        Some(incoming) => self.chainer.ingest(incoming).await,
                        None => break,
                    },

                    _ = calendar_ticker.tick() => {
                        self.chainer.run_aggregation_tick().await;
                    }

                    _ = finalize_ticker.tick() => {
                        for job in self.chainer.finalize() {
                            tokio::spawn(job.run());
                        }
                    }

                    Some(block) = self.blocks.recv() => {
                        self.anchor.record_block(block);
                    }

                    _ = anchor_ticker.tick() => {
                        self.anchor.run_anchor_tick().await;
                    }
                }
            }

            warn!(
                "Broker connection closed, reconnecting in {:?}",
                self.link.reconnect_delay()
            );
            self.link.close();
            self.chainer.detach();
            tokio::time::sleep(self.link.reconnect_delay()).await;
        }
    }
}

/// The whole pipeline: both tiers and the beacon refresher on one broker
pub struct Pipeline {
    config: PipelineConfig,
    broker: Arc<dyn Broker>,
}

impl Pipeline {
    /// Create a pipeline after validating its configuration
    pub fn new(config: PipelineConfig, broker: Arc<dyn Broker>) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config, broker })
    }

    /// Spawn every task, returning their handles
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let beacon = match (&self.config.beacon.source_dir, self.config.aggregator.bind_beacon) {
            (Some(dir), true) => {
                let (feed, binder) = beacon_channel();
                tasks.push(spawn_refresher(
                    Arc::new(FileBeaconSource::new(dir.clone())),
                    self.config.beacon.key.clone(),
                    self.config.beacon.refresh_interval(),
                    feed,
                ));
                binder
            }
            (None, true) => {
                warn!("Beacon binding enabled without a beacon source, leaves carry no beacon");
                BeaconBinder::disabled()
            }
            _ => BeaconBinder::disabled(),
        };

        let aggregator = AggregatorService::new(self.broker.clone(), &self.config, beacon);
        tasks.push(tokio::spawn(aggregator.run()));

        let calendar = CalendarService::new(self.broker.clone(), &self.config);
        tasks.push(tokio::spawn(calendar.run()));

        tasks
    }

    /// Run until Ctrl-C
    pub async fn run(&self) -> Result<(), PipelineError> {
        info!("Starting pipeline on {}", self.config.broker.uri);
        let tasks = self.start();

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down pipeline");

        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}
