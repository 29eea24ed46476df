//! Tier-1 aggregation against the in-process broker

use std::time::Duration;

use chrono::{TimeZone, Utc};
use sap_core::verify_ops;
use sap_pipeline::beacon::beacon_channel;
use sap_pipeline::deliver;
use sap_pipeline::testutil::TestHarness;
use sap_pipeline::{BatchOutcome, BeaconBinder};
use sap_types::{AggregateRootMessage, AggregationStateMessage, NistBeaconValue, ProofOp};

fn hash(n: u8) -> Vec<u8> {
    vec![n; 32]
}

#[tokio::test]
async fn test_three_submissions_one_tree() {
    let harness = TestHarness::new();
    let (mut aggregator, _link, mut consumer) = harness.aggregator(BeaconBinder::disabled()).await;

    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        harness.submit(id, &hash(i as u8), None);
    }
    deliver!(consumer, aggregator, 3);
    assert_eq!(aggregator.pending_len(), 3);

    let job = aggregator.run_aggregation_tick().expect("job");
    assert_eq!(job.len(), 3);
    assert_eq!(job.commit().await, BatchOutcome::Acked(3));
    assert_eq!(harness.broker.unacked_len(), 0);
    assert_eq!(aggregator.pending_len(), 0);

    let roots: Vec<AggregateRootMessage> = harness.take_json("work.cal", Some("aggregator"));
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].agg_hash_count, 3);

    let states: Vec<AggregationStateMessage> = harness.take_json("work.state", Some("aggregator"));
    assert_eq!(states.len(), 3);
    for (i, state) in states.iter().enumerate() {
        assert_eq!(state.hash_id, ["a", "b", "c"][i]);
        assert_eq!(state.agg_id, roots[0].agg_id);
        let start = hex::decode(&state.hash).unwrap();
        verify_ops(&start, &state.agg_state.ops, &roots[0].agg_root).unwrap();
    }
}

#[tokio::test]
async fn test_submitted_beacon_is_bound_after_core_id() {
    let harness = TestHarness::new();
    let (mut aggregator, _link, mut consumer) = harness.aggregator(BeaconBinder::disabled()).await;
    let tag = "2024-01-01T00:00:00Z:0123abcd";

    harness.submit("a", &hash(7), None);
    deliver!(consumer, aggregator, 1);
    aggregator.run_aggregation_tick().unwrap().commit().await;
    let plain: Vec<AggregateRootMessage> = harness.take_json("work.cal", Some("aggregator"));

    harness.submit("a", &hash(7), Some(tag));
    deliver!(consumer, aggregator, 1);
    aggregator.run_aggregation_tick().unwrap().commit().await;
    let bound: Vec<AggregateRootMessage> = harness.take_json("work.cal", Some("aggregator"));

    // A single leaf is its own root, so this compares the leaf pre-images
    assert_ne!(plain[0].agg_root, bound[0].agg_root);

    let states: Vec<AggregationStateMessage> = harness.take_json("work.state", Some("aggregator"));
    let ops = &states[1].agg_state.ops;
    assert_eq!(
        ops,
        &vec![
            ProofOp::Left("core_id:a".to_string()),
            ProofOp::Op("sha-256".to_string()),
            ProofOp::Left(format!("nist:{}", tag)),
            ProofOp::Op("sha-256".to_string()),
        ]
    );
    verify_ops(&hash(7), ops, &bound[0].agg_root).unwrap();
}

#[tokio::test]
async fn test_binder_snapshot_binds_whole_batch() {
    let mut harness = TestHarness::new();
    harness.config.aggregator.bind_beacon = true;

    let (feed, binder) = beacon_channel();
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let value = NistBeaconValue::new(at, "ff00").unwrap();
    feed.publish(value.clone());

    let (mut aggregator, _link, mut consumer) = harness.aggregator(binder).await;
    harness.submit("a", &hash(1), None);
    harness.submit("b", &hash(2), None);
    deliver!(consumer, aggregator, 2);
    aggregator.run_aggregation_tick().unwrap().commit().await;

    let states: Vec<AggregationStateMessage> = harness.take_json("work.state", Some("aggregator"));
    let expected = ProofOp::Left(format!("nist:{}", value.tag()));
    assert!(states.iter().all(|s| s.agg_state.ops[2] == expected));
}

#[tokio::test]
async fn test_batch_size_limit_rolls_over() {
    let harness = TestHarness::new();
    let (mut aggregator, _link, mut consumer) = harness.aggregator(BeaconBinder::disabled()).await;

    for i in 0..30_000u32 {
        harness.submit(&format!("id-{}", i), &[(i % 251) as u8; 32], None);
    }
    deliver!(consumer, aggregator, 30_000);

    let first = aggregator.run_aggregation_tick().unwrap();
    assert_eq!(first.len(), 25_000);
    assert_eq!(first.tree().unwrap().leaf_count, 25_000);
    assert_eq!(aggregator.pending_len(), 5_000);

    let second = aggregator.run_aggregation_tick().unwrap();
    assert_eq!(second.len(), 5_000);
    assert_ne!(first.tree().unwrap().agg_id, second.tree().unwrap().agg_id);
    assert!(aggregator.run_aggregation_tick().is_none());

    assert_eq!(first.commit().await, BatchOutcome::Acked(25_000));
    assert_eq!(second.commit().await, BatchOutcome::Acked(5_000));
    assert_eq!(harness.broker.ready_len("work.cal"), 2);
    assert_eq!(harness.broker.ready_len("work.state"), 30_000);
}

#[tokio::test]
async fn test_empty_tick_is_noop() {
    let harness = TestHarness::new();
    let (mut aggregator, _link, _consumer) = harness.aggregator(BeaconBinder::disabled()).await;

    assert!(aggregator.run_aggregation_tick().is_none());
    assert_eq!(harness.broker.ready_len("work.state"), 0);
    assert_eq!(harness.broker.ready_len("work.cal"), 0);
}

#[tokio::test]
async fn test_failed_publish_rejects_whole_batch() {
    let harness = TestHarness::new();
    let (mut aggregator, _link, mut consumer) = harness.aggregator(BeaconBinder::disabled()).await;

    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        harness.submit(id, &hash(i as u8), None);
    }
    deliver!(consumer, aggregator, 3);

    harness.broker.reject_publishes_after(2);
    let job = aggregator.run_aggregation_tick().unwrap();
    let failed_id = job.tree().unwrap().agg_id;
    assert_eq!(job.commit().await, BatchOutcome::Rejected(3));
    assert_eq!(harness.broker.unacked_len(), 3);
    harness.take("work.state");
    harness.take("work.cal");

    // Every submission comes back and lands in a fresh tree
    harness.broker.accept_publishes();
    for _ in 0..3 {
        let incoming = consumer.next().await.unwrap();
        assert!(incoming.redelivered);
        aggregator.ingest(incoming).await;
    }
    let job = aggregator.run_aggregation_tick().unwrap();
    assert_ne!(job.tree().unwrap().agg_id, failed_id);
    assert_eq!(job.commit().await, BatchOutcome::Acked(3));
    assert_eq!(harness.broker.unacked_len(), 0);
}

#[tokio::test]
async fn test_malformed_submission_is_dropped() {
    let harness = TestHarness::new();
    let (mut aggregator, _link, mut consumer) = harness.aggregator(BeaconBinder::disabled()).await;

    harness.submit_raw(b"not json");
    harness.submit_raw(br#"{"hash_id":"a","hash":"zz"}"#);
    harness.submit_raw(br#"{"hash_id":"a","hash":"abcd"}"#);
    harness.submit_raw(br#"{"hash_id":"","hash":"00000000000000000000000000000000"}"#);
    deliver!(consumer, aggregator, 4);

    assert_eq!(aggregator.pending_len(), 0);
    assert_eq!(harness.broker.unacked_len(), 0);
    assert_eq!(harness.broker.ready_len("work.agg"), 0);
    assert!(aggregator.run_aggregation_tick().is_none());
}

#[tokio::test]
async fn test_tick_defers_without_channel() {
    let harness = TestHarness::new();
    let (mut aggregator, mut link, mut consumer) =
        harness.aggregator(BeaconBinder::disabled()).await;

    harness.submit("a", &hash(1), None);
    deliver!(consumer, aggregator, 1);

    link.close();
    assert!(aggregator.run_aggregation_tick().is_none());
    assert_eq!(aggregator.pending_len(), 1);
}

#[tokio::test]
async fn test_overlapping_batches_settle_independently() {
    let harness = TestHarness::new();
    let (mut aggregator, _link, mut consumer) = harness.aggregator(BeaconBinder::disabled()).await;

    harness.submit("a", &hash(1), None);
    deliver!(consumer, aggregator, 1);
    let first = aggregator.run_aggregation_tick().unwrap();

    harness.submit("b", &hash(2), None);
    deliver!(consumer, aggregator, 1);
    let second = aggregator.run_aggregation_tick().unwrap();

    // Both batches are in flight; only the first one's publishes fail
    harness.broker.reject_publishes_after(0);
    assert_eq!(first.commit().await, BatchOutcome::Rejected(1));
    harness.broker.accept_publishes();
    assert_eq!(second.commit().await, BatchOutcome::Acked(1));

    let states: Vec<AggregationStateMessage> = harness.take_json("work.state", Some("aggregator"));
    let ids: Vec<&str> = states.iter().map(|s| s.hash_id.as_str()).collect();
    assert_eq!(ids, vec!["b"]);
    let roots: Vec<AggregateRootMessage> = harness.take_json("work.cal", Some("aggregator"));
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].agg_hash_count, 1);

    // Only the rejected submission comes back
    let again = consumer.next().await.unwrap();
    assert!(again.redelivered);
    let payload: serde_json::Value = serde_json::from_slice(&again.payload).unwrap();
    assert_eq!(payload["hash_id"], "a");
    assert!(tokio::time::timeout(Duration::from_millis(50), consumer.next())
        .await
        .is_err());
    assert_eq!(harness.broker.unacked_len(), 1);
}

#[tokio::test]
async fn test_state_echoes_submitted_hash_text() {
    let harness = TestHarness::new();
    let (mut aggregator, _link, mut consumer) = harness.aggregator(BeaconBinder::disabled()).await;
    let upper = "AB".repeat(32);

    let payload = serde_json::json!({"hash_id": "a", "hash": upper});
    harness.submit_raw(payload.to_string().as_bytes());
    deliver!(consumer, aggregator, 1);
    assert_eq!(
        aggregator.run_aggregation_tick().unwrap().commit().await,
        BatchOutcome::Acked(1)
    );

    let roots: Vec<AggregateRootMessage> = harness.take_json("work.cal", Some("aggregator"));
    let states: Vec<AggregationStateMessage> = harness.take_json("work.state", Some("aggregator"));
    assert_eq!(states[0].hash, upper);
    let start = hex::decode(&states[0].hash).unwrap();
    assert_eq!(start, vec![0xab; 32]);
    verify_ops(&start, &states[0].agg_state.ops, &roots[0].agg_root).unwrap();
}
