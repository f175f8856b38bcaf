//! Crash-recovery tests
//!
//! Rebuilds engines from manifest + WAL after simulated crashes, exercises
//! torn WAL tails, and verifies that out-of-order flush completions can
//! never resurrect stale locations.

mod common;

use common::{entry, open_engine, test_config};
use silt::hash::identity_hash;
use silt::latest::{LatestByIdMap, SegmentAssignment};
use silt::segment::mock::{MockEncoderConfig, MockSegmentEncoder};
use silt::segment::SegmentEncoder;
use silt::types::{now_micros, VectorLocation};
use silt::{Message, OpKind, VectorEntry, VectorId};
use std::sync::Arc;

// ============================================================================
// MANIFEST + WAL RECOVERY
// ============================================================================

/// 500 writes, 300 flushed into a committed segment, crash: the rebuilt
/// engine reports 300 segment-resident and 200 buffer-resident identities
#[tokio::test]
async fn test_partial_flush_recovery() {
    let mut config = test_config(8);
    // Single shard and a capped batch make the flush take exactly the 300
    // oldest messages
    config.buffer.shard_count = 1;
    config.btree.max_flush_batch = 300;

    let dir = tempfile::tempdir().unwrap();
    {
        let (engine, _encoder) = open_engine(dir.path(), config.clone()).await;
        for i in 0..500 {
            engine.upsert(entry(&format!("id-{i}"), 8)).await.unwrap();
        }

        let outcome = engine.flush(false).await.unwrap();
        assert_eq!(outcome.messages_flushed, 300);
        // Crash: engine dropped without draining the rest
    }

    let (engine, _encoder) = open_engine(dir.path(), config).await;
    let stats = engine.stats();
    assert_eq!(stats.map.segment_entries, 300);
    assert_eq!(stats.map.buffer_entries, 200);
    assert_eq!(stats.buffer.message_count, 200);
    assert_eq!(stats.wal_epoch, 500);

    // The replayed 200 are exactly the ones with epochs above the flush
    for i in 0..500 {
        let location = engine
            .get_latest(&VectorId::from(format!("id-{i}").as_str()))
            .unwrap();
        if i < 300 {
            assert!(location.is_segment(), "id-{i} should be segment-resident");
        } else {
            assert!(location.is_buffer(), "id-{i} should be buffer-resident");
        }
    }
}

#[tokio::test]
async fn test_recovery_is_idempotent() {
    let config = test_config(8);
    let dir = tempfile::tempdir().unwrap();

    {
        let (engine, _encoder) = open_engine(dir.path(), config.clone()).await;
        for i in 0..40 {
            engine.upsert(entry(&format!("id-{i}"), 8)).await.unwrap();
        }
        engine.flush(true).await.unwrap();
    }

    // Two successive recoveries converge to the same state
    for _ in 0..2 {
        let (engine, _encoder) = open_engine(dir.path(), config.clone()).await;
        let stats = engine.stats();
        assert_eq!(stats.map.segment_entries, 40);
        assert_eq!(stats.map.buffer_entries, 0);
        assert_eq!(stats.buffer.message_count, 0);
    }
}

#[tokio::test]
async fn test_tombstones_survive_recovery() {
    let config = test_config(8);
    let dir = tempfile::tempdir().unwrap();
    let id = VectorId::from("doomed");

    {
        let (engine, _encoder) = open_engine(dir.path(), config.clone()).await;
        engine.upsert(entry("doomed", 8)).await.unwrap();
        engine.delete(id.clone()).await.unwrap();
        // Crash with the tombstone still buffered
    }

    let (engine, _encoder) = open_engine(dir.path(), config).await;
    assert!(!engine.exists(&id));
    assert!(engine.get_latest(&id).unwrap().tombstone);
}

#[tokio::test]
async fn test_torn_wal_tail_is_tolerated() {
    let config = test_config(8);
    let dir = tempfile::tempdir().unwrap();

    {
        let (engine, _encoder) = open_engine(dir.path(), config.clone()).await;
        for i in 0..10 {
            engine.upsert(entry(&format!("id-{i}"), 8)).await.unwrap();
        }
    }

    // Simulate a crash mid-append: garbage at the end of the log
    let wal_path = dir.path().join("wal.log");
    let mut data = std::fs::read(&wal_path).unwrap();
    data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02]);
    std::fs::write(&wal_path, &data).unwrap();

    {
        let (engine, _encoder) = open_engine(dir.path(), config.clone()).await;
        let stats = engine.stats();
        assert_eq!(stats.buffer.message_count, 10);
        assert_eq!(stats.wal_epoch, 10);

        // The engine keeps accepting writes past the repaired tail
        engine.upsert(entry("after-crash", 8)).await.unwrap();
    }

    // The post-repair write survives another recovery
    let (engine, _encoder) = open_engine(dir.path(), config).await;
    assert_eq!(engine.stats().buffer.message_count, 11);
    assert!(engine.exists(&VectorId::from("after-crash")));
}

#[tokio::test]
async fn test_manifest_generation_monotone_across_restarts() {
    let config = test_config(8);
    let dir = tempfile::tempdir().unwrap();

    let generation_after_first = {
        let (engine, _encoder) = open_engine(dir.path(), config.clone()).await;
        for i in 0..20 {
            engine.upsert(entry(&format!("a-{i}"), 8)).await.unwrap();
        }
        engine.flush(true).await.unwrap();
        engine.manifest().generation
    };
    assert!(generation_after_first > 0);

    let (engine, _encoder) = open_engine(dir.path(), config).await;
    assert_eq!(engine.manifest().generation, generation_after_first);

    for i in 0..20 {
        engine.upsert(entry(&format!("b-{i}"), 8)).await.unwrap();
    }
    engine.flush(true).await.unwrap();
    assert!(engine.manifest().generation > generation_after_first);
}

// ============================================================================
// OUT-OF-ORDER FLUSH COMPLETION
// ============================================================================

fn overlap_message(name: &str, epoch: u64) -> Message {
    Message {
        op: OpKind::Upsert,
        entry: VectorEntry::new(VectorId::from(name), vec![0.1; 8], "t", "n", vec![]),
        epoch,
        timestamp: now_micros(),
    }
}

/// Two overlapping flushes for the same identities complete in reverse
/// order; every identity ends up referencing the higher-epoch segment
#[tokio::test]
async fn test_out_of_order_flush_completion() {
    let dir = tempfile::tempdir().unwrap();
    let encoder = Arc::new(
        MockSegmentEncoder::new(dir.path(), MockEncoderConfig::fast()).unwrap(),
    );
    let map = Arc::new(LatestByIdMap::new());

    // F1 carries epochs 1..=10, F2 re-writes the same identities at 101..=110
    let f1: Vec<Message> = (0..10)
        .map(|i| overlap_message(&format!("id-{i}"), i + 1))
        .collect();
    let f2: Vec<Message> = (0..10)
        .map(|i| overlap_message(&format!("id-{i}"), i + 101))
        .collect();

    for msg in f1.iter().chain(f2.iter()) {
        map.upsert(
            msg.entry.id.clone(),
            msg.entry.id_hash,
            VectorLocation::buffer(msg.timestamp, msg.epoch),
        );
    }

    let assignments = |batch: &[Message]| -> Vec<SegmentAssignment> {
        batch
            .iter()
            .enumerate()
            .map(|(i, m)| SegmentAssignment {
                id_hash: m.entry.id_hash,
                local_row: i as u32,
                epoch: m.epoch,
            })
            .collect()
    };

    // F2 completes first...
    let seg_f2 = encoder.encode_segment(&f2).await.unwrap();
    map.move_to_segment(&assignments(&f2), &seg_f2.segment_id);
    // ...then F1 lands late
    let seg_f1 = encoder.encode_segment(&f1).await.unwrap();
    map.move_to_segment(&assignments(&f1), &seg_f1.segment_id);

    for i in 0..10 {
        let hash = identity_hash(format!("id-{i}").as_bytes());
        let location = map.get_latest_by_hash(hash).unwrap();
        assert_eq!(
            location.segment_id(),
            Some(seg_f2.segment_id.as_str()),
            "id-{i} must reference the higher-epoch segment"
        );
        assert_eq!(location.epoch, i + 101);
    }
}
