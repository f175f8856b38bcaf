//! Write-path tests
//!
//! Covers the ingest surface end to end: flush draining, dedup visibility,
//! tombstone shadowing, and buffer backpressure.

mod common;

use common::{entry, entry_in, open_engine, test_config};
use silt::{QueryFilter, SiltError, VectorId};
use std::time::Duration;

// ============================================================================
// FLUSH
// ============================================================================

/// 1,000 distinct upserts, forced flush: buffer drains, every identity is
/// segment-resident, and the encoder received each message exactly once
#[tokio::test]
async fn test_basic_flush_drains_everything() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), test_config(8)).await;

    for i in 0..1000 {
        let epoch = engine.upsert(entry(&format!("id-{i}"), 8)).await.unwrap();
        assert_eq!(epoch, i + 1);
    }

    let outcome = engine.flush(true).await.unwrap();
    assert_eq!(outcome.messages_flushed, 1000);
    assert_eq!(outcome.failed, 0);

    let stats = engine.stats();
    assert_eq!(stats.buffer.message_count, 0);
    assert_eq!(stats.buffer.bytes_used, 0);
    assert_eq!(stats.map.segment_entries, 1000);
    assert_eq!(stats.map.buffer_entries, 0);

    // Exactly 1,000 rows across all encoded segments, none duplicated
    let manifest = engine.manifest();
    let total_rows: u64 = manifest.segments.iter().map(|s| s.num_vectors).sum();
    assert_eq!(total_rows, 1000);
}

#[tokio::test]
async fn test_flush_failure_is_absorbed_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, encoder) = open_engine(dir.path(), test_config(8)).await;

    for i in 0..100 {
        engine.upsert(entry(&format!("id-{i}"), 8)).await.unwrap();
    }

    encoder.inject_failures(1);
    let outcome = engine.flush(true).await.unwrap();
    assert_eq!(outcome.failed, 1);
    // Buffer and map untouched by the failed attempt
    assert_eq!(engine.stats().buffer.message_count, 100);
    assert_eq!(engine.stats().map.buffer_entries, 100);

    let outcome = engine.flush(true).await.unwrap();
    assert_eq!(outcome.failed, 0);
    assert_eq!(engine.stats().buffer.message_count, 0);
    assert_eq!(engine.stats().map.segment_entries, 100);
}

// ============================================================================
// DEDUP
// ============================================================================

/// Ten upserts of one identity: scans see only the last, and the buffer
/// counted nine shadowed versions
#[tokio::test]
async fn test_dedup_within_burst() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), test_config(8)).await;

    for _ in 0..10 {
        engine.upsert(entry("x", 8)).await.unwrap();
    }

    let results = engine.scan("tenant-a", "ns-a", &[], 10_000);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, VectorId::from("x"));

    let stats = engine.stats();
    assert_eq!(stats.buffer.message_count, 10);
    assert_eq!(stats.buffer.dedupe_count, 9);

    // The surviving scan row reflects the newest epoch
    assert_eq!(engine.get_latest(&VectorId::from("x")).unwrap().epoch, 10);
}

#[tokio::test]
async fn test_dedup_survives_flush_with_latest_winner() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), test_config(8)).await;

    for _ in 0..5 {
        engine.upsert(entry("hot", 8)).await.unwrap();
    }
    engine.flush(true).await.unwrap();

    let location = engine.get_latest(&VectorId::from("hot")).unwrap();
    assert!(location.is_segment());
    assert_eq!(location.epoch, 5);
}

// ============================================================================
// TOMBSTONES
// ============================================================================

/// Upsert at epoch 5, delete at 6, upsert at 7: the identity is live again
/// and reflects the final epoch; stopping after the delete leaves it dead
#[tokio::test]
async fn test_tombstone_shadows_and_resurrection() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), test_config(8)).await;
    let id = VectorId::from("y");

    // Burn epochs 1-4 so the interesting writes land on 5/6/7
    for i in 0..4 {
        engine.upsert(entry(&format!("filler-{i}"), 8)).await.unwrap();
    }

    engine.upsert(entry("y", 8)).await.unwrap();
    assert!(engine.exists(&id));

    engine.delete(id.clone()).await.unwrap();
    assert!(!engine.exists(&id));
    let dead = engine.get_latest(&id).unwrap();
    assert!(dead.tombstone);
    assert_eq!(dead.epoch, 6);

    engine.upsert(entry("y", 8)).await.unwrap();
    assert!(engine.exists(&id));
    let live = engine.get_latest(&id).unwrap();
    assert!(!live.tombstone);
    assert_eq!(live.epoch, 7);
}

#[tokio::test]
async fn test_tombstones_are_flushed_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), test_config(8)).await;
    let id = VectorId::from("gone");

    engine.upsert(entry("gone", 8)).await.unwrap();
    engine.delete(id.clone()).await.unwrap();
    engine.flush(true).await.unwrap();

    // The persisted tombstone still shadows the identity
    let location = engine.get_latest(&id).unwrap();
    assert!(location.is_segment());
    assert!(location.tombstone);
    assert!(!engine.exists(&id));

    // Deletes never appear in scans
    assert!(engine.scan("", "", &[], 10_000).is_empty());
}

// ============================================================================
// FILTERS
// ============================================================================

#[tokio::test]
async fn test_scan_filters_compose() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), test_config(8)).await;

    engine
        .upsert(entry_in("a", 8, "t1", "ns1", vec![1, 2]))
        .await
        .unwrap();
    engine
        .upsert(entry_in("b", 8, "t1", "ns2", vec![3]))
        .await
        .unwrap();
    engine
        .upsert(entry_in("c", 8, "t2", "ns1", vec![1]))
        .await
        .unwrap();

    // Empty filter matches everything
    assert_eq!(engine.scan("", "", &[], 10_000).len(), 3);
    // Tenant only
    assert_eq!(engine.scan("t1", "", &[], 10_000).len(), 2);
    // Tenant + namespace
    assert_eq!(engine.scan("t1", "ns1", &[], 10_000).len(), 1);
    // Any-of tags across tenants
    assert_eq!(engine.scan("", "", &[1], 10_000).len(), 2);
    assert_eq!(engine.scan("", "", &[2, 3], 10_000).len(), 2);
    // No overlap
    assert_eq!(engine.scan("", "", &[9], 10_000).len(), 0);
}

#[tokio::test]
async fn test_scan_respects_max_scan_budget() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), test_config(8)).await;

    for i in 0..100 {
        engine.upsert(entry(&format!("id-{i}"), 8)).await.unwrap();
    }

    let limited = engine.scan_buffer(&QueryFilter::default(), 10);
    assert!(limited.len() <= 10);
}

// ============================================================================
// BACKPRESSURE
// ============================================================================

/// With a 1 MiB cap the buffer eventually rejects appends; a concurrent
/// flush releases space and the next append succeeds
#[tokio::test]
async fn test_backpressure_and_release() {
    let mut config = test_config(64);
    config.buffer.max_bytes = 1024 * 1024;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), config).await;
    let engine = std::sync::Arc::new(engine);

    // Fill until the cap pushes back
    let mut accepted = 0u64;
    loop {
        match engine.upsert(entry(&format!("fill-{accepted}"), 64)).await {
            Ok(_) => accepted += 1,
            Err(SiltError::BufferFull) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(accepted < 100_000, "cap never engaged");
    }
    assert!(accepted > 0);

    // A flush in flight frees space for the blocked writer
    let flusher = {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.flush(true).await.unwrap();
        })
    };

    let mut retried = false;
    for _ in 0..50 {
        match engine.upsert(entry("late-arrival", 64)).await {
            Ok(_) => {
                retried = true;
                break;
            }
            Err(SiltError::BufferFull) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    flusher.await.unwrap();
    assert!(retried, "append never succeeded after space was released");
}

// ============================================================================
// INPUT VALIDATION
// ============================================================================

#[tokio::test]
async fn test_rejects_invalid_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _encoder) = open_engine(dir.path(), test_config(8)).await;

    let err = engine.delete(VectorId::from("")).await.unwrap_err();
    assert!(matches!(err, SiltError::InvalidInput(_)));

    let mut too_many_tags = entry("tagged", 8);
    too_many_tags.tags = (0..17).collect();
    let err = engine.upsert(too_many_tags).await.unwrap_err();
    assert!(matches!(err, SiltError::InvalidInput(_)));

    let err = engine.upsert(entry("short", 4)).await.unwrap_err();
    assert!(matches!(err, SiltError::DimensionMismatch { .. }));

    // Nothing reached the WAL
    assert_eq!(engine.stats().wal_epoch, 0);
}
