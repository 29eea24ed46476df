//! Anchor scheduling
//!
//! Finalized calendar blocks collect in a window. Each anchor tick commits
//! to the whole window with one more Merkle tree and asks the anchoring
//! service to anchor its root.

use sap_core::MerkleTreeBuilder;
use sap_types::{AnchorRequest, Digest};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{OutboundMessage, PendingBuffer};
use crate::broker::SharedChannel;
use crate::config::AnchorConfig;
use crate::error::PipelineError;

/// Candidate calendar block produced by a finalized calendar tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarBlock {
    pub cal_id: Uuid,
    pub cal_root: Digest,
    pub agg_count: usize,
}

pub type BlockSender = mpsc::UnboundedSender<CalendarBlock>;
pub type BlockReceiver = mpsc::UnboundedReceiver<CalendarBlock>;

pub fn block_channel() -> (BlockSender, BlockReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorOutcome {
    /// The window was committed and the request confirmed
    Published(AnchorRequest),
    /// Publishing failed; this many blocks stay in the window
    Deferred(usize),
}

pub struct AnchorScheduler {
    config: AnchorConfig,
    queue: String,
    channel: SharedChannel,
    window: PendingBuffer<CalendarBlock>,
}

impl AnchorScheduler {
    pub fn new(config: AnchorConfig, queue: impl Into<String>, channel: SharedChannel) -> Self {
        Self {
            config,
            queue: queue.into(),
            channel,
            window: PendingBuffer::new(),
        }
    }

    pub fn record_block(&mut self, block: CalendarBlock) {
        debug!("Calendar block {} queued for anchoring", block.cal_id);
        self.window.push(block);
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Commit to every block since the previous anchor.
    ///
    /// The window survives a failed publish and is retried on the next tick.
    pub async fn run_anchor_tick(&mut self) -> Option<AnchorOutcome> {
        if self.window.is_empty() {
            return None;
        }

        let blocks = self.window.splice(usize::MAX);
        match self.publish_window(&blocks).await {
            Ok(request) => {
                info!(
                    "Anchor request {} published over {} calendar blocks, root {}",
                    request.anchor_agg_id,
                    request.anchor_agg_cal_record_count,
                    request.anchor_agg_root
                );
                Some(AnchorOutcome::Published(request))
            }
            Err(e) => {
                warn!("Anchor request deferred: {}", e);
                let count = blocks.len();
                self.window.restore(blocks);
                Some(AnchorOutcome::Deferred(count))
            }
        }
    }

    async fn publish_window(
        &self,
        blocks: &[CalendarBlock],
    ) -> Result<AnchorRequest, PipelineError> {
        let channel = self.channel.get()?;

        let mut builder = MerkleTreeBuilder::with_capacity(self.config.hash_function, blocks.len());
        builder.add_leaves(blocks.iter().map(|b| b.cal_root));
        let tree = builder.build()?;

        let request = AnchorRequest {
            anchor_agg_id: Uuid::new_v4(),
            anchor_agg_root: *tree.root(),
            anchor_agg_cal_record_count: blocks.len(),
        };
        let message = OutboundMessage::json(&self.queue, None, &request)?;
        channel
            .publish(&message.queue, message.kind, message.payload)
            .await?;

        Ok(request)
    }
}
