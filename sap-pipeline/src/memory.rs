//! In-process broker
//!
//! Durable queues, per-connection delivery tags, manual acknowledgment,
//! publisher confirms and redelivery of unacknowledged messages when the
//! connection closes. Backs `memory://` URIs and the test suites, which use
//! the fault controls (`close_connection`, `close_after_publishes`,
//! `set_reachable`, `reject_publishes_after`) to drive reconnect and
//! batch-rejection paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, Channel, Delivery, DeliveryTag};

/// A message sitting in a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub kind: Option<String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

struct ConsumerSlot {
    generation: u64,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
    consumer: Option<ConsumerSlot>,
}

struct Unacked {
    queue: String,
    generation: u64,
    message: StoredMessage,
}

struct State {
    /// Incremented every time the connection is closed
    generation: u64,
    reachable: bool,
    /// Publishes still allowed before rejection starts, `None` = unlimited
    publish_budget: Option<usize>,
    /// Confirmed publishes left before the connection drops
    close_after: Option<usize>,
    next_tag: DeliveryTag,
    queues: HashMap<String, Queue>,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

impl State {
    fn check_open(&self, generation: u64) -> Result<(), BrokerError> {
        if !self.reachable || generation != self.generation {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }

    fn in_flight(&self, queue: &str, generation: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.queue == queue && u.generation == generation)
            .count()
    }

    /// Hand ready messages to the queue's consumer, honouring its prefetch
    fn dispatch(&mut self, queue_name: &str) {
        let consumer = self.queues.get(queue_name).and_then(|q| q.consumer.as_ref());
        let (generation, prefetch) = match consumer {
            Some(consumer) => (consumer.generation, consumer.prefetch),
            None => return,
        };
        let mut in_flight = if prefetch > 0 {
            self.in_flight(queue_name, generation)
        } else {
            0
        };

        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while prefetch == 0 || in_flight < prefetch as usize {
            let Some(consumer) = queue.consumer.as_ref() else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            let tag = self.next_tag;
            self.next_tag += 1;

            let delivery = Delivery {
                tag,
                kind: message.kind.clone(),
                payload: message.payload.clone(),
                redelivered: message.redelivered,
            };
            if consumer.tx.send(delivery).is_err() {
                // Consumer went away without the connection closing
                queue.ready.push_front(message);
                queue.consumer = None;
                return;
            }

            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    generation,
                    message,
                },
            );
            in_flight += 1;
        }
    }

    /// Consumers end, channels die and every unacknowledged message returns
    /// to the head of its queue
    fn close(&mut self) {
        self.generation += 1;
        self.close_after = None;
        for queue in self.queues.values_mut() {
            queue.consumer = None;
        }

        let unacked = std::mem::take(&mut self.unacked);
        debug!("Closing memory connection, requeueing {} messages", unacked.len());
        for (_, entry) in unacked.into_iter().rev() {
            self.requeue(entry);
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        let mut message = unacked.message;
        message.redelivered = true;
        self.queues
            .entry(unacked.queue)
            .or_default()
            .ready
            .push_front(message);
    }
}

/// In-process broker shared by every component of one process
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                generation: 0,
                reachable: true,
                publish_budget: None,
                close_after: None,
                next_tag: 1,
                queues: HashMap::new(),
                unacked: BTreeMap::new(),
            })),
        }
    }

    /// The broker the binary runs on for `uri`.
    ///
    /// Only `memory://` URIs are served. Queues live inside this process, so
    /// external producers and consumers cannot reach them.
    pub fn for_uri(uri: &str) -> Result<Self, BrokerError> {
        if !uri.starts_with("memory://") {
            return Err(BrokerError::UnsupportedUri(uri.to_string()));
        }
        warn!(
            "Using in-process broker {}: queues are not reachable from other processes",
            uri
        );
        Ok(Self::new())
    }

    /// Enqueue a message from outside the pipeline (the submitting service)
    pub fn inject(&self, queue: &str, kind: Option<&str>, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                kind: kind.map(str::to_string),
                payload,
                redelivered: false,
            });
        state.dispatch(queue);
    }

    /// Remove and return every ready message of a queue (the downstream consumer)
    pub fn take(&self, queue: &str) -> Vec<StoredMessage> {
        let mut state = self.state.lock();
        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_len(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Drop the connection now
    pub fn close_connection(&self) {
        self.state.lock().close();
    }

    /// Drop the connection right after `count` more publishes are confirmed
    pub fn close_after_publishes(&self, count: usize) {
        let mut state = self.state.lock();
        if count == 0 {
            state.close();
        } else {
            state.close_after = Some(count);
        }
    }

    /// While unreachable, opening channels fails
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Confirm `count` more publishes, then reject every following one
    pub fn reject_publishes_after(&self, count: usize) {
        self.state.lock().publish_budget = Some(count);
    }

    pub fn accept_publishes(&self) {
        self.state.lock().publish_budget = None;
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self, uri: &str) -> Result<Arc<dyn Channel>, BrokerError> {
        let state = self.state.lock();
        if !state.reachable {
            return Err(BrokerError::Unreachable(uri.to_string()));
        }
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            generation: state.generation,
            prefetch: AtomicU16::new(0),
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<State>>,
    generation: u64,
    prefetch: AtomicU16,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.check_open(self.generation)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.state.lock().check_open(self.generation)?;
        self.prefetch.store(count, Ordering::Relaxed);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let mut state = self.state.lock();
        state.check_open(self.generation)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let slot = ConsumerSlot {
            generation: self.generation,
            prefetch: self.prefetch.load(Ordering::Relaxed),
            tx,
        };
        state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?
            .consumer = Some(slot);
        state.dispatch(queue);

        Ok(rx)
    }

    async fn publish(
        &self,
        queue: &str,
        kind: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.check_open(self.generation)?;

        if let Some(remaining) = state.publish_budget.as_mut() {
            if *remaining == 0 {
                return Err(BrokerError::PublishRejected {
                    queue: queue.to_string(),
                    reason: "nacked by broker".to_string(),
                });
            }
            *remaining -= 1;
        }

        state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?
            .ready
            .push_back(StoredMessage {
                kind: kind.map(str::to_string),
                payload,
                redelivered: false,
            });
        state.dispatch(queue);

        let closing = match state.close_after.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if closing {
            state.close();
        }

        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.check_open(self.generation)?;

        let queue = match state.unacked.remove(&tag) {
            Some(entry) if entry.generation == self.generation => entry.queue,
            Some(entry) => {
                state.unacked.insert(tag, entry);
                return Err(BrokerError::UnknownDeliveryTag(tag));
            }
            None => return Err(BrokerError::UnknownDeliveryTag(tag)),
        };
        state.dispatch(&queue);

        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.check_open(self.generation)?;

        let entry = match state.unacked.remove(&tag) {
            Some(entry) if entry.generation == self.generation => entry,
            Some(entry) => {
                state.unacked.insert(tag, entry);
                return Err(BrokerError::UnknownDeliveryTag(tag));
            }
            None => return Err(BrokerError::UnknownDeliveryTag(tag)),
        };

        let queue = entry.queue.clone();
        if requeue {
            state.requeue(entry);
        }
        state.dispatch(&queue);

        Ok(())
    }
}
