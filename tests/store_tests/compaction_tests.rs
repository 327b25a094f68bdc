//! Tests for compaction
//!
//! These tests verify:
//! - Segments holding only orphaned records are deleted
//! - Live records are moved and stay readable
//! - Compacted stores reopen intact
//! - Deleted keys stay deleted after their tombstone's segment is compacted
//! - The active segment and well-populated segments are left alone

use std::path::Path;
use std::sync::Arc;
use std::thread;

use segkv::segment::segment_path;
use segkv::{Config, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &Path, segment_capacity: u32) -> Config {
    Config::builder()
        .home_dir(dir)
        .segment_capacity(segment_capacity)
        .initial_capacity(1_000)
        .build()
}

fn setup_temp_store(segment_capacity: u32) -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(config(temp_dir.path(), segment_capacity)).unwrap();
    (temp_dir, store)
}

fn versioned_value(i: usize, round: usize) -> String {
    format!("round {} value for key.{}", round, i)
}

/// Overwrite keys `0..keys` for `rounds` rounds
fn overwrite_rounds(store: &Store, keys: usize, rounds: usize) {
    for round in 0..rounds {
        for i in 0..keys {
            store
                .put(
                    format!("key.{}", i).as_bytes(),
                    versioned_value(i, round).as_bytes(),
                )
                .unwrap();
        }
    }
}

fn assert_latest_round(store: &Store, keys: usize, round: usize) {
    for i in 0..keys {
        assert_eq!(
            store.get(format!("key.{}", i).as_bytes()).unwrap(),
            Some(versioned_value(i, round).into_bytes()),
            "key.{}",
            i
        );
    }
}

// =============================================================================
// Basic Compaction Tests
// =============================================================================

#[test]
fn test_compact_empty_store() {
    let (_dir, store) = setup_temp_store(1024);

    let stats = store.compact().unwrap();
    assert_eq!(stats.segments_compacted, 0);
    assert_eq!(stats.records_moved, 0);
}

#[test]
fn test_compact_reclaims_overwritten_segments() {
    let (dir, store) = setup_temp_store(1024);

    overwrite_rounds(&store, 20, 10);
    let before = store.segment_count().unwrap();

    let stats = store.compact().unwrap();

    assert!(stats.segments_compacted > 0);
    assert!(stats.bytes_reclaimed > 0);
    assert!(store.segment_count().unwrap() < before);
    assert!(!segment_path(dir.path(), 1).exists());
    assert_eq!(store.len().unwrap(), 20);
    assert_latest_round(&store, 20, 9);
}

#[test]
fn test_compact_moves_live_records() {
    let (_dir, store) = setup_temp_store(512);

    // Long-lived keys written first, then churn on a separate key set
    for i in 0..5 {
        store
            .put(format!("stable.{}", i).as_bytes(), b"kept across compaction")
            .unwrap();
    }
    overwrite_rounds(&store, 5, 12);

    let stats = store.compact().unwrap();
    assert!(stats.records_moved > 0);

    for i in 0..5 {
        assert_eq!(
            store.get(format!("stable.{}", i).as_bytes()).unwrap(),
            Some(b"kept across compaction".to_vec())
        );
    }
    assert_latest_round(&store, 5, 11);
}

#[test]
fn test_compact_is_repeatable() {
    let (_dir, store) = setup_temp_store(1024);

    overwrite_rounds(&store, 20, 6);
    store.compact().unwrap();
    store.compact().unwrap();

    assert_eq!(store.len().unwrap(), 20);
    assert_latest_round(&store, 20, 5);
}

#[test]
fn test_active_segment_is_never_compacted() {
    let (_dir, store) = setup_temp_store(64 * 1024);

    // Everything fits in the one active segment
    overwrite_rounds(&store, 10, 5);
    let stats = store.compact().unwrap();

    assert_eq!(stats.segments_compacted, 0);
    assert_eq!(store.segment_count().unwrap(), 1);
}

// =============================================================================
// Durability Tests
// =============================================================================

#[test]
fn test_compacted_store_reopens() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(temp_dir.path(), 1024);

    {
        let store = Store::open(config.clone()).unwrap();
        overwrite_rounds(&store, 20, 8);
        store.compact().unwrap();
        store.close().unwrap();
    }

    let store = Store::open(config.clone()).unwrap();
    assert!(store.recovery_result().unwrap().snapshot_loaded);
    assert_eq!(store.len().unwrap(), 20);
    assert_latest_round(&store, 20, 7);
    store.close().unwrap();

    // Full replay over the compacted segments agrees
    std::fs::remove_file(temp_dir.path().join("index.snapshot")).unwrap();
    let store = Store::open(config).unwrap();
    assert!(!store.recovery_result().unwrap().snapshot_loaded);
    assert_latest_round(&store, 20, 7);
}

#[test]
fn test_deleted_keys_stay_deleted() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(temp_dir.path(), 512);

    {
        let store = Store::open(config.clone()).unwrap();
        // First segment: the keys to delete plus long-lived filler, so it
        // stays well populated and survives compaction
        overwrite_rounds(&store, 5, 1);
        for i in 0..8 {
            store
                .put(format!("filler.{}", i).as_bytes(), b"long lived filler")
                .unwrap();
        }
        // Tombstones land in the next segment, which churn then orphans
        for i in 0..5 {
            assert!(store.delete(format!("key.{}", i).as_bytes()).unwrap());
        }
        for i in 0..40 {
            store
                .put(b"churn", format!("churn {}", i).as_bytes())
                .unwrap();
        }

        let stats = store.compact().unwrap();
        assert!(stats.segments_compacted > 0);
        assert_eq!(stats.tombstones_carried, 5);
        for i in 0..5 {
            assert_eq!(store.get(format!("key.{}", i).as_bytes()).unwrap(), None);
        }
        store.close().unwrap();
    }

    // Full replay still sees the puts in the first segment
    std::fs::remove_file(temp_dir.path().join("index.snapshot")).unwrap();
    let store = Store::open(config).unwrap();
    for i in 0..5 {
        assert_eq!(store.get(format!("key.{}", i).as_bytes()).unwrap(), None);
    }
    for i in 0..8 {
        assert_eq!(
            store.get(format!("filler.{}", i).as_bytes()).unwrap(),
            Some(b"long lived filler".to_vec())
        );
    }
    assert_eq!(store.get(b"churn").unwrap(), Some(b"churn 39".to_vec()));
    assert_eq!(store.len().unwrap(), 9);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_compact_during_writes() {
    let (_dir, store) = setup_temp_store(1024);
    overwrite_rounds(&store, 20, 5);
    let store = Arc::new(store);

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..20 {
                store
                    .put(
                        format!("key.{}", i).as_bytes(),
                        versioned_value(i, 5).as_bytes(),
                    )
                    .unwrap();
            }
        })
    };
    let compactor = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            store.compact().unwrap();
        })
    };

    writer.join().unwrap();
    compactor.join().unwrap();

    assert_eq!(store.len().unwrap(), 20);
    assert_latest_round(&store, 20, 5);
}
