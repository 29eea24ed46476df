//! Batch bookkeeping shared by the aggregation and calendar tiers
//!
//! Work accumulates in a [`PendingBuffer`] until a tick splices a batch from
//! its head. The batch's outbound messages are published together and its
//! originating deliveries are settled together: all acked when every publish
//! was confirmed, all requeued otherwise.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::broker::{BrokerError, Channel, MessageHandle};
use crate::error::PipelineError;

/// FIFO buffer of work waiting for the next tick
#[derive(Debug)]
pub struct PendingBuffer<T> {
    items: VecDeque<T>,
}

impl<T> PendingBuffer<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove up to `max` items from the head, in arrival order
    pub fn splice(&mut self, max: usize) -> Vec<T> {
        let count = self.items.len().min(max);
        self.items.drain(..count).collect()
    }

    /// Put previously spliced items back at the head, keeping their order
    pub fn restore(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    /// Drop everything, returning how many items were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }
}

impl<T> Default for PendingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A serialized message waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub queue: String,
    pub kind: Option<&'static str>,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn json<T: Serialize>(
        queue: &str,
        kind: Option<&'static str>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            queue: queue.to_string(),
            kind,
            payload: serde_json::to_vec(body)?,
        })
    }
}

/// Publish every message concurrently, failing on the first rejection
pub async fn publish_all(
    channel: &Arc<dyn Channel>,
    messages: Vec<OutboundMessage>,
) -> Result<(), BrokerError> {
    try_join_all(messages.into_iter().map(|message| async move {
        channel
            .publish(&message.queue, message.kind, message.payload)
            .await
    }))
    .await?;
    Ok(())
}

/// How a batch's originating deliveries were settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every delivery acknowledged
    Acked(usize),
    /// Every delivery returned to its queue
    Rejected(usize),
    /// Published, but the channel died before every ack went through; the
    /// broker redelivers the `unacked` remainder
    Abandoned { acked: usize, unacked: usize },
}

impl BatchOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, BatchOutcome::Acked(_))
    }
}

/// Ack every handle after a successful batch, requeue every handle otherwise.
///
/// Settlement failures mean the channel is gone; the broker redelivers
/// whatever was not settled.
pub async fn settle(
    handles: &[MessageHandle],
    result: Result<(), PipelineError>,
) -> BatchOutcome {
    match result {
        Ok(()) => {
            let mut acked = 0;
            for handle in handles {
                match handle.ack().await {
                    Ok(()) => acked += 1,
                    Err(e) => warn!("Failed to ack delivery {}: {}", handle.tag(), e),
                }
            }

            if acked == handles.len() {
                debug!("Acked {} deliveries", acked);
                BatchOutcome::Acked(acked)
            } else {
                warn!(
                    "Batch published but only {} of {} deliveries acked",
                    acked,
                    handles.len()
                );
                BatchOutcome::Abandoned {
                    acked,
                    unacked: handles.len() - acked,
                }
            }
        }
        Err(e) => {
            warn!("Batch of {} failed, requeueing: {}", handles.len(), e);
            for handle in handles {
                if let Err(e) = handle.nack(true).await {
                    debug!("Failed to nack delivery {}: {}", handle.tag(), e);
                }
            }
            BatchOutcome::Rejected(handles.len())
        }
    }
}
