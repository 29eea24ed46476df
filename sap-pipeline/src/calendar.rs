//! Tier-2 calendar chaining
//!
//! Aggregate roots from the aggregation tier are buffered, built into
//! calendar trees on the calendar tick and finalized on the finalize tick.
//! Finalizing a tree publishes one proof-state message per aggregate root,
//! settles the originating deliveries and hands the tree's root to the
//! anchor scheduler as a [`CalendarBlock`].

use std::collections::VecDeque;
use std::sync::Arc;

use sap_core::{ops, MerkleTreeBuilder, TreeError};
use sap_types::{
    AggregateRootMessage, AnchorReference, CalState, CalendarStateMessage, Digest, HashFunction,
    ProofPath,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anchor::{BlockSender, CalendarBlock};
use crate::batch::{publish_all, settle, BatchOutcome, OutboundMessage, PendingBuffer};
use crate::broker::{
    Channel, Incoming, MessageHandle, SharedChannel, KIND_AGGREGATOR, KIND_ANCHOR_TX, KIND_CALENDAR,
};
use crate::config::{CalendarConfig, QueueConfig};
use crate::error::PipelineError;

/// Everything the calendar queue carries
#[derive(Debug, Clone, PartialEq)]
pub enum CalendarInbound {
    AggregateRoot(AggregateRootMessage),
    /// Ledger feedback for a previously requested anchor
    AnchorTx(serde_json::Value),
}

impl CalendarInbound {
    pub fn parse(kind: Option<&str>, payload: &[u8]) -> Result<Self, PipelineError> {
        match kind {
            Some(KIND_AGGREGATOR) => Ok(Self::AggregateRoot(serde_json::from_slice(payload)?)),
            Some(KIND_ANCHOR_TX) => Ok(Self::AnchorTx(serde_json::from_slice(payload)?)),
            other => Err(PipelineError::UnknownKind(other.map(str::to_string))),
        }
    }
}

/// A buffered aggregate root and the delivery it arrived in
#[derive(Debug)]
pub struct AggregateRootRecord {
    pub message: AggregateRootMessage,
    pub handle: MessageHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Built,
    Finalizing,
    Finalized,
    Failed,
}

/// One calendar tree over a batch of aggregate roots
#[derive(Debug, Clone)]
pub struct CalendarTree {
    pub cal_id: Uuid,
    pub cal_root: Digest,
    /// Per-root paths from `agg_root` to `cal_root`
    pub proofs: Vec<ProofPath>,
    pub state: TreeState,
}

impl CalendarTree {
    pub fn build(roots: &[AggregateRootMessage], hash_fn: HashFunction) -> Result<Self, TreeError> {
        let mut builder = MerkleTreeBuilder::with_capacity(hash_fn, roots.len());
        builder.add_leaves(roots.iter().map(|r| r.agg_root));
        let tree = builder.build()?;

        Ok(Self {
            cal_id: Uuid::new_v4(),
            cal_root: *tree.root(),
            proofs: tree.proofs(),
            state: TreeState::Built,
        })
    }

    /// Where this tree's calendar entry can be looked up once anchored
    pub fn anchor_reference(&self, base_uri: &str) -> AnchorReference {
        AnchorReference {
            anchor_id: self.cal_id.to_string(),
            uris: vec![format!(
                "{}/calendar/{}/root",
                base_uri.trim_end_matches('/'),
                self.cal_id
            )],
        }
    }

    /// Proof-state messages for `roots`, the tree's input in order
    pub fn messages(
        &self,
        roots: &[AggregateRootMessage],
        queue: &str,
        base_uri: &str,
    ) -> Result<Vec<OutboundMessage>, serde_json::Error> {
        let anchor = self.anchor_reference(base_uri);

        roots
            .iter()
            .zip(&self.proofs)
            .map(|(root, path)| {
                let state = CalendarStateMessage {
                    agg_id: root.agg_id,
                    agg_root: root.agg_root,
                    agg_hash_count: root.agg_hash_count,
                    cal_id: self.cal_id,
                    cal_root: self.cal_root,
                    cal_state: CalState {
                        ops: ops::encode(path),
                        anchor: anchor.clone(),
                    },
                };
                OutboundMessage::json(queue, Some(KIND_CALENDAR), &state)
            })
            .collect()
    }

    pub fn block(&self) -> CalendarBlock {
        CalendarBlock {
            cal_id: self.cal_id,
            cal_root: self.cal_root,
            agg_count: self.proofs.len(),
        }
    }
}

struct BuiltTree {
    tree: CalendarTree,
    records: Vec<AggregateRootRecord>,
}

/// Result of finalizing one calendar tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOutcome {
    pub cal_id: Uuid,
    pub state: TreeState,
    pub settled: BatchOutcome,
}

/// Publish-and-settle work for one calendar tree
pub struct FinalizeJob {
    channel: Arc<dyn Channel>,
    tree: CalendarTree,
    handles: Vec<MessageHandle>,
    messages: Result<Vec<OutboundMessage>, PipelineError>,
    blocks: BlockSender,
}

impl FinalizeJob {
    pub fn tree(&self) -> &CalendarTree {
        &self.tree
    }

    /// Publish every proof state, then ack the tree's roots and emit its
    /// block, or requeue every root
    pub async fn run(mut self) -> TreeOutcome {
        let result = match self.messages {
            Ok(messages) => publish_all(&self.channel, messages)
                .await
                .map_err(PipelineError::from),
            Err(e) => Err(e),
        };
        let settled = settle(&self.handles, result).await;

        // A tree only counts once every root it covers is acknowledged;
        // redelivered roots would otherwise be anchored twice
        if settled.is_acked() {
            self.tree.state = TreeState::Finalized;
            info!(
                "Calendar tree {} finalized: {} aggregate roots, root {}",
                self.tree.cal_id,
                self.handles.len(),
                self.tree.cal_root
            );
            if self.blocks.send(self.tree.block()).is_err() {
                debug!("Anchor scheduler gone, block {} not recorded", self.tree.cal_id);
            }
        } else {
            self.tree.state = TreeState::Failed;
        }

        TreeOutcome {
            cal_id: self.tree.cal_id,
            state: self.tree.state,
            settled,
        }
    }
}

/// Tier-2 calendar state for one connection-managed service
pub struct CalendarChainer {
    config: CalendarConfig,
    queues: QueueConfig,
    channel: SharedChannel,
    blocks: BlockSender,
    pending: PendingBuffer<AggregateRootRecord>,
    built: VecDeque<BuiltTree>,
}

impl CalendarChainer {
    pub fn new(
        config: CalendarConfig,
        queues: QueueConfig,
        channel: SharedChannel,
        blocks: BlockSender,
    ) -> Self {
        Self {
            config,
            queues,
            channel,
            blocks,
            pending: PendingBuffer::new(),
            built: VecDeque::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Trees built and waiting for the finalize tick
    pub fn built_len(&self) -> usize {
        self.built.len()
    }

    pub async fn ingest(&mut self, incoming: Incoming) {
        match CalendarInbound::parse(incoming.kind.as_deref(), &incoming.payload) {
            Ok(CalendarInbound::AggregateRoot(message)) => self.pending.push(AggregateRootRecord {
                message,
                handle: incoming.handle,
            }),
            Ok(CalendarInbound::AnchorTx(body)) => {
                info!("Anchor transaction feedback: {}", body);
                if let Err(e) = incoming.handle.ack().await {
                    warn!("Failed to ack anchor feedback {}: {}", incoming.handle.tag(), e);
                }
            }
            Err(e) => {
                warn!("Rejecting calendar message: {}", e);
                if let Err(e) = incoming.handle.nack(false).await {
                    debug!("Failed to reject delivery {}: {}", incoming.handle.tag(), e);
                }
            }
        }
    }

    /// Build the next calendar tree from the head of the buffer
    pub async fn run_aggregation_tick(&mut self) -> Option<Uuid> {
        if self.pending.is_empty() {
            return None;
        }

        let records = self.pending.splice(self.config.max_batch_size);
        let roots: Vec<AggregateRootMessage> = records.iter().map(|r| r.message.clone()).collect();

        match CalendarTree::build(&roots, self.config.hash_function) {
            Ok(tree) => {
                let cal_id = tree.cal_id;
                debug!("Calendar tree {} built over {} roots", cal_id, records.len());
                self.built.push_back(BuiltTree { tree, records });
                Some(cal_id)
            }
            Err(e) => {
                let handles: Vec<MessageHandle> = records.into_iter().map(|r| r.handle).collect();
                settle(&handles, Err(e.into())).await;
                None
            }
        }
    }

    /// Take every built tree for finalization; nothing happens without a
    /// channel
    pub fn finalize(&mut self) -> Vec<FinalizeJob> {
        if self.built.is_empty() {
            return Vec::new();
        }
        let channel = match self.channel.get() {
            Ok(channel) => channel,
            Err(_) => {
                debug!("No broker channel, deferring {} calendar trees", self.built.len());
                return Vec::new();
            }
        };

        self.built
            .drain(..)
            .map(|BuiltTree { mut tree, records }| {
                tree.state = TreeState::Finalizing;
                let (roots, handles): (Vec<_>, Vec<_>) =
                    records.into_iter().map(|r| (r.message, r.handle)).unzip();
                let messages = tree
                    .messages(&roots, &self.queues.state_out, &self.config.base_uri)
                    .map_err(PipelineError::from);

                FinalizeJob {
                    channel: channel.clone(),
                    tree,
                    handles,
                    messages,
                    blocks: self.blocks.clone(),
                }
            })
            .collect()
    }

    /// Forget buffered roots and unfinalized trees after the connection
    /// closed; the broker redelivers them
    pub fn detach(&mut self) {
        let roots = self.pending.clear();
        let trees = self.built.len();
        self.built.clear();
        if roots > 0 || trees > 0 {
            info!(
                "Connection lost, dropped {} pending roots and {} unfinalized trees",
                roots, trees
            );
        }
    }
}
