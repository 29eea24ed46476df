//! Broker connection lifecycle
//!
//! The broker is a reliable, at-least-once, manually acknowledged delivery
//! substrate. [`Broker`] and [`Channel`] describe the operations the pipeline
//! needs from it; [`BrokerLink`] owns the connect/reconnect cycle for one
//! component and the shared channel handle its producers publish through.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub type DeliveryTag = u64;

/// Message kind carried by aggregation-root messages
pub const KIND_AGGREGATOR: &str = "aggregator";
/// Message kind carried by calendar proof-state messages
pub const KIND_CALENDAR: &str = "cal";
/// Message kind carried by anchoring transaction feedback
pub const KIND_ANCHOR_TX: &str = "btctx";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Publish to {queue} rejected: {reason}")]
    PublishRejected { queue: String, reason: String },

    #[error("Queue not declared: {0}")]
    UnknownQueue(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("Unsupported broker URI {0}: only memory:// is built in")]
    UnsupportedUri(String),
}

/// A message handed to a consumer, unacknowledged until acked or nacked
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub kind: Option<String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// A channel on an open broker connection
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries per consumer, 0 = no limit
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start consuming a queue. The receiver ends when the connection closes.
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;

    /// Publish a persistent message and wait for the broker to confirm it
    async fn publish(
        &self,
        queue: &str,
        kind: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}

/// Opens channels to a broker
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_channel(&self, uri: &str) -> Result<Arc<dyn Channel>, BrokerError>;
}

/// Acknowledgment handle for one delivery, bound to the channel it arrived on.
///
/// Settling a handle whose channel has since closed fails; the broker
/// redelivers the message on the next connection.
#[derive(Clone)]
pub struct MessageHandle {
    tag: DeliveryTag,
    channel: Arc<dyn Channel>,
}

impl MessageHandle {
    pub fn new(tag: DeliveryTag, channel: Arc<dyn Channel>) -> Self {
        Self { tag, channel }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.channel.ack(self.tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.channel.nack(self.tag, requeue).await
    }
}

impl fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageHandle({})", self.tag)
    }
}

/// An inbound message together with its acknowledgment handle
#[derive(Debug, Clone)]
pub struct Incoming {
    pub handle: MessageHandle,
    pub kind: Option<String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// Deliveries from the consumed queue of one connection
pub struct Consumer {
    channel: Arc<dyn Channel>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    /// Next inbound message, `None` once the connection has closed
    pub async fn next(&mut self) -> Option<Incoming> {
        let delivery = self.deliveries.recv().await?;
        Some(Incoming {
            handle: MessageHandle::new(delivery.tag, self.channel.clone()),
            kind: delivery.kind,
            payload: delivery.payload,
            redelivered: delivery.redelivered,
        })
    }
}

/// Channel handle shared between a link and the producers publishing on it.
///
/// Empty while disconnected; producers must then defer their work.
#[derive(Clone, Default)]
pub struct SharedChannel(Arc<RwLock<Option<Arc<dyn Channel>>>>);

impl SharedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current channel, or `ChannelClosed` while disconnected
    pub fn get(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.0.read().clone().ok_or(BrokerError::ChannelClosed)
    }

    pub fn is_open(&self) -> bool {
        self.0.read().is_some()
    }

    pub fn set(&self, channel: Arc<dyn Channel>) {
        *self.0.write() = Some(channel);
    }

    pub fn clear(&self) {
        *self.0.write() = None;
    }
}

/// What a link declares and consumes once connected
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub uri: String,
    pub prefetch: u16,
    pub consume_queue: String,
    pub declare_queues: Vec<String>,
    pub reconnect_delay: Duration,
}

/// Connection lifecycle manager for one component
pub struct BrokerLink {
    broker: Arc<dyn Broker>,
    settings: LinkSettings,
    channel: SharedChannel,
}

impl BrokerLink {
    pub fn new(broker: Arc<dyn Broker>, settings: LinkSettings) -> Self {
        Self {
            broker,
            settings,
            channel: SharedChannel::new(),
        }
    }

    /// Handle to the channel this link maintains
    pub fn channel(&self) -> SharedChannel {
        self.channel.clone()
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.settings.reconnect_delay
    }

    /// Connect, retrying with a fixed delay until the broker accepts
    pub async fn connect(&mut self) -> Consumer {
        loop {
            match self.try_connect().await {
                Ok(consumer) => {
                    info!(
                        "Broker connection established, consuming {}",
                        self.settings.consume_queue
                    );
                    return consumer;
                }
                Err(e) => {
                    warn!(
                        "Cannot establish broker connection: {}. Retrying in {:?}",
                        e, self.settings.reconnect_delay
                    );
                    tokio::time::sleep(self.settings.reconnect_delay).await;
                }
            }
        }
    }

    async fn try_connect(&mut self) -> Result<Consumer, BrokerError> {
        let channel = self.broker.open_channel(&self.settings.uri).await?;

        channel.declare_queue(&self.settings.consume_queue).await?;
        for queue in &self.settings.declare_queues {
            channel.declare_queue(queue).await?;
        }
        channel.set_prefetch(self.settings.prefetch).await?;

        // Publishers see the channel before the first delivery arrives
        self.channel.set(channel.clone());
        let deliveries = match channel.consume(&self.settings.consume_queue).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.channel.clear();
                return Err(e);
            }
        };

        Ok(Consumer { channel, deliveries })
    }

    /// Drop the channel after the connection closed
    pub fn close(&mut self) {
        self.channel.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn settings() -> LinkSettings {
        LinkSettings {
            uri: "memory://test".to_string(),
            prefetch: 0,
            consume_queue: "work.in".to_string(),
            declare_queues: vec!["work.out".to_string()],
            reconnect_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_shared_channel_fails_closed() {
        let shared = SharedChannel::new();
        assert!(!shared.is_open());
        assert_eq!(shared.get().err(), Some(BrokerError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_connect_declares_and_consumes() {
        let broker = Arc::new(MemoryBroker::new());
        let mut link = BrokerLink::new(broker.clone(), settings());
        let mut consumer = link.connect().await;
        assert!(link.channel().is_open());

        broker.inject("work.in", None, b"hello".to_vec());
        let incoming = consumer.next().await.unwrap();
        assert_eq!(incoming.payload, b"hello");

        link.channel()
            .get()
            .unwrap()
            .publish("work.out", None, b"out".to_vec())
            .await
            .unwrap();
        assert_eq!(broker.ready_len("work.out"), 1);
    }

    #[tokio::test]
    async fn test_connect_retries_until_reachable() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_reachable(false);

        let flip = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flip.set_reachable(true);
        });

        let mut link = BrokerLink::new(broker.clone(), settings());
        let _consumer = link.connect().await;
        assert!(link.channel().is_open());
    }

    #[tokio::test]
    async fn test_consumer_ends_on_close() {
        let broker = Arc::new(MemoryBroker::new());
        let mut link = BrokerLink::new(broker.clone(), settings());
        let mut consumer = link.connect().await;

        broker.close_connection();
        assert!(consumer.next().await.is_none());

        link.close();
        assert!(!link.channel().is_open());
    }
}
