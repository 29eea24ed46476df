//! Tier-1 hash aggregation
//!
//! Submitted hashes are buffered as they arrive. Every aggregation tick
//! splices a batch from the head of the buffer, binds each hash to its id
//! (and a beacon value, when one is available), builds a Merkle tree and
//! prepares one proof-state message per submission plus one aggregate-root
//! message for the calendar tier. Publishing and settlement happen in an
//! [`AggregationJob`] so the tick itself never waits on the broker.

use std::sync::Arc;

use sap_core::{ops, BoundLeaf, MerkleTreeBuilder, TreeError};
use sap_types::{
    AggState, AggregateRootMessage, AggregationStateMessage, Digest, HashFunction, HashSubmission,
    ProofPath,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{publish_all, settle, BatchOutcome, OutboundMessage, PendingBuffer};
use crate::beacon::BeaconBinder;
use crate::broker::{Channel, Incoming, MessageHandle, SharedChannel, KIND_AGGREGATOR};
use crate::config::{AggregatorConfig, QueueConfig};
use crate::error::PipelineError;

/// A validated submission waiting for the next tick
#[derive(Debug)]
pub struct PendingSubmission {
    pub submission: HashSubmission,
    pub handle: MessageHandle,
}

/// One built aggregation tree
#[derive(Debug, Clone)]
pub struct AggregationTree {
    pub agg_id: Uuid,
    pub agg_root: Digest,
    pub leaf_count: usize,
    /// Per-submission paths from the submitted hash to `agg_root`
    pub proofs: Vec<ProofPath>,
}

impl AggregationTree {
    /// Bind and aggregate `submissions` in order.
    ///
    /// A submission's own beacon tag wins over the batch-wide `beacon`.
    pub fn build(
        submissions: &[HashSubmission],
        hash_fn: HashFunction,
        beacon: Option<&str>,
    ) -> Result<Self, TreeError> {
        let leaves: Vec<BoundLeaf> = submissions
            .iter()
            .map(|s| BoundLeaf {
                hash_id: s.hash_id.clone(),
                hash: s.hash.clone(),
                beacon_tag: s.nist.clone().or_else(|| beacon.map(str::to_string)),
            })
            .collect();

        let mut builder = MerkleTreeBuilder::with_capacity(hash_fn, leaves.len());
        builder.add_leaves(leaves.iter().map(|leaf| leaf.compute_hash(hash_fn)));
        let tree = builder.build()?;

        let mut proofs = tree.proofs();
        for (leaf, path) in leaves.iter().zip(proofs.iter_mut()) {
            leaf.bind_path(path);
        }

        Ok(Self {
            agg_id: Uuid::new_v4(),
            agg_root: *tree.root(),
            leaf_count: tree.leaf_count(),
            proofs,
        })
    }

    pub fn root_message(&self) -> AggregateRootMessage {
        AggregateRootMessage {
            agg_id: self.agg_id,
            agg_root: self.agg_root,
            agg_hash_count: self.leaf_count,
        }
    }

    /// Proof-state messages for `submissions` (the tree's input, in order)
    /// followed by the aggregate-root message
    pub fn messages(
        &self,
        submissions: &[HashSubmission],
        queues: &QueueConfig,
    ) -> Result<Vec<OutboundMessage>, serde_json::Error> {
        let mut messages = Vec::with_capacity(submissions.len() + 1);

        for (submission, path) in submissions.iter().zip(&self.proofs) {
            let state = AggregationStateMessage {
                hash_id: submission.hash_id.clone(),
                hash: submission.hash_text.clone(),
                agg_id: self.agg_id,
                agg_state: AggState {
                    ops: ops::encode(path),
                },
            };
            messages.push(OutboundMessage::json(
                &queues.state_out,
                Some(KIND_AGGREGATOR),
                &state,
            )?);
        }

        messages.push(OutboundMessage::json(
            &queues.calendar_in,
            Some(KIND_AGGREGATOR),
            &self.root_message(),
        )?);

        Ok(messages)
    }
}

/// Publish-and-settle work for one spliced batch
pub struct AggregationJob {
    channel: Arc<dyn Channel>,
    handles: Vec<MessageHandle>,
    prepared: Result<(AggregationTree, Vec<OutboundMessage>), PipelineError>,
}

impl AggregationJob {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// The built tree, unless building or serializing failed
    pub fn tree(&self) -> Option<&AggregationTree> {
        self.prepared.as_ref().ok().map(|(tree, _)| tree)
    }

    /// Publish every message, then ack the whole batch or requeue it
    pub async fn commit(self) -> BatchOutcome {
        let result = match self.prepared {
            Ok((tree, messages)) => publish_all(&self.channel, messages)
                .await
                .map(|()| {
                    info!(
                        "Aggregation tree {} published: {} hashes, root {}",
                        tree.agg_id, tree.leaf_count, tree.agg_root
                    )
                })
                .map_err(PipelineError::from),
            Err(e) => Err(e),
        };

        settle(&self.handles, result).await
    }
}

/// Tier-1 aggregation state for one connection-managed service
pub struct HashAggregator {
    config: AggregatorConfig,
    queues: QueueConfig,
    channel: SharedChannel,
    beacon: BeaconBinder,
    pending: PendingBuffer<PendingSubmission>,
}

impl HashAggregator {
    pub fn new(
        config: AggregatorConfig,
        queues: QueueConfig,
        channel: SharedChannel,
        beacon: BeaconBinder,
    ) -> Self {
        Self {
            config,
            queues,
            channel,
            beacon,
            pending: PendingBuffer::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffer an inbound submission; malformed ones are dropped for good
    pub async fn ingest(&mut self, incoming: Incoming) {
        match HashSubmission::from_json(&incoming.payload) {
            Ok(submission) => self.pending.push(PendingSubmission {
                submission,
                handle: incoming.handle,
            }),
            Err(e) => {
                warn!("Rejecting malformed submission: {}", e);
                if let Err(e) = incoming.handle.nack(false).await {
                    debug!("Failed to reject delivery {}: {}", incoming.handle.tag(), e);
                }
            }
        }
    }

    /// Splice the next batch and prepare its tree and messages.
    ///
    /// Returns `None` when there is nothing to do or no channel to publish
    /// on; the buffer is left untouched in the latter case.
    pub fn run_aggregation_tick(&mut self) -> Option<AggregationJob> {
        if self.pending.is_empty() {
            return None;
        }
        let channel = match self.channel.get() {
            Ok(channel) => channel,
            Err(_) => {
                debug!("No broker channel, deferring {} submissions", self.pending.len());
                return None;
            }
        };

        let batch = self.pending.splice(self.config.max_batch_size);
        let (submissions, handles): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|p| (p.submission, p.handle))
            .unzip();

        let beacon = if self.config.bind_beacon {
            self.beacon.snapshot()
        } else {
            None
        };

        let prepared = AggregationTree::build(
            &submissions,
            self.config.hash_function,
            beacon.as_deref(),
        )
        .map_err(PipelineError::from)
        .and_then(|tree| {
            let messages = tree.messages(&submissions, &self.queues)?;
            Ok((tree, messages))
        });

        debug!("Spliced {} submissions for aggregation", handles.len());
        Some(AggregationJob {
            channel,
            handles,
            prepared,
        })
    }

    /// Forget buffered work after the connection closed; the broker
    /// redelivers it
    pub fn detach(&mut self) {
        let dropped = self.pending.clear();
        if dropped > 0 {
            info!("Connection lost, dropped {} pending submissions", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sap_core::verify_ops;

    fn submissions(n: usize) -> Vec<HashSubmission> {
        (0..n)
            .map(|i| HashSubmission::from_bytes(format!("id-{}", i), vec![i as u8; 32], None))
            .collect()
    }

    #[test]
    fn test_every_proof_reaches_root() {
        let subs = submissions(5);
        let tree = AggregationTree::build(&subs, HashFunction::Sha256, None).unwrap();
        assert_eq!(tree.leaf_count, 5);
        for (sub, path) in subs.iter().zip(&tree.proofs) {
            verify_ops(&sub.hash, &ops::encode(path), &tree.agg_root).unwrap();
        }
    }

    #[test]
    fn test_own_beacon_tag_wins() {
        let mut subs = submissions(2);
        subs[0].nist = Some("own:00".to_string());
        let tree = AggregationTree::build(&subs, HashFunction::Sha256, Some("batch:11")).unwrap();

        let labels: Vec<String> = tree
            .proofs
            .iter()
            .map(|p| p.steps[1].value.to_wire())
            .collect();
        assert_eq!(labels, vec!["nist:own:00", "nist:batch:11"]);
    }

    #[test]
    fn test_empty_batch_fails() {
        assert_eq!(
            AggregationTree::build(&[], HashFunction::Sha256, None).unwrap_err(),
            TreeError::NoLeaves
        );
    }

    #[test]
    fn test_messages_layout() {
        let subs = submissions(3);
        let tree = AggregationTree::build(&subs, HashFunction::Sha256, None).unwrap();
        let queues = QueueConfig::default();
        let messages = tree.messages(&subs, &queues).unwrap();

        assert_eq!(messages.len(), 4);
        assert!(messages[..3].iter().all(|m| m.queue == "work.state"));
        assert_eq!(messages[3].queue, "work.cal");
        assert!(messages.iter().all(|m| m.kind == Some(KIND_AGGREGATOR)));

        let root: AggregateRootMessage = serde_json::from_slice(&messages[3].payload).unwrap();
        assert_eq!(root, tree.root_message());
    }
}
