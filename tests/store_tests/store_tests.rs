//! Tests for the Store
//!
//! These tests verify:
//! - Basic put/get/delete operations
//! - Lifecycle (open, close, reopen, operations on a closed store)
//! - Segment rollover through the public API
//! - Both segment backings
//! - Sync policy and configuration checks
//! - Concurrent access

use std::sync::Arc;
use std::thread;

use segkv::{ChannelSegmentFactory, Config, SegKvError, Store, SyncPolicy};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open_path(temp_dir.path(), 1_000).unwrap();
    (temp_dir, store)
}

fn setup_small_segment_store(segment_capacity: u32) -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .home_dir(temp_dir.path())
        .segment_capacity(segment_capacity)
        .initial_capacity(1_000)
        .build();
    let store = Store::open(config).unwrap();
    (temp_dir, store)
}

fn value_for(i: usize) -> String {
    format!("Here is your data for key.{}", i)
}

// =============================================================================
// Basic Operation Tests
// =============================================================================

#[test]
fn test_put_and_get() {
    let (_dir, store) = setup_temp_store();

    store.put(b"key1", b"value1").unwrap();

    assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn test_get_missing_key() {
    let (_dir, store) = setup_temp_store();

    assert_eq!(store.get(b"never-written").unwrap(), None);
    assert!(store.is_empty().unwrap());
}

#[test]
fn test_overwrite_returns_latest() {
    let (_dir, store) = setup_temp_store();

    store.put(b"key", b"v1").unwrap();
    store.put(b"key", b"v2").unwrap();
    store.put(b"key", b"v3").unwrap();

    assert_eq!(store.get(b"key").unwrap(), Some(b"v3".to_vec()));
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn test_delete() {
    let (_dir, store) = setup_temp_store();

    store.put(b"key", b"value").unwrap();
    assert!(store.delete(b"key").unwrap());
    assert_eq!(store.get(b"key").unwrap(), None);
    assert!(store.is_empty().unwrap());

    // Deleting again (or a key never written) reports absence
    assert!(!store.delete(b"key").unwrap());
    assert!(!store.delete(b"other").unwrap());
}

#[test]
fn test_put_after_delete() {
    let (_dir, store) = setup_temp_store();

    store.put(b"key", b"first").unwrap();
    store.delete(b"key").unwrap();
    store.put(b"key", b"second").unwrap();

    assert_eq!(store.get(b"key").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn test_empty_key_and_value() {
    let (_dir, store) = setup_temp_store();

    store.put(b"", b"empty key").unwrap();
    store.put(b"empty value", b"").unwrap();

    assert_eq!(store.get(b"").unwrap(), Some(b"empty key".to_vec()));
    assert_eq!(store.get(b"empty value").unwrap(), Some(Vec::new()));
}

#[test]
fn test_binary_data() {
    let (_dir, store) = setup_temp_store();

    let key: Vec<u8> = (0..=255).collect();
    let value: Vec<u8> = (0..4096).map(|i| (i * 7 % 256) as u8).collect();
    store.put(&key, &value).unwrap();

    assert_eq!(store.get(&key).unwrap(), Some(value));
}

#[test]
fn test_many_keys() {
    let (_dir, store) = setup_temp_store();

    for i in 0..1000 {
        store
            .put(format!("key.{}", i).as_bytes(), value_for(i).as_bytes())
            .unwrap();
    }

    assert_eq!(store.len().unwrap(), 1000);
    for i in (0..1000).step_by(37) {
        assert_eq!(
            store.get(format!("key.{}", i).as_bytes()).unwrap(),
            Some(value_for(i).into_bytes())
        );
    }
}

// =============================================================================
// Segment Rollover Tests
// =============================================================================

#[test]
fn test_rollover_spans_segments() {
    let (_dir, store) = setup_small_segment_store(1024);

    for i in 0..200 {
        store
            .put(format!("key.{}", i).as_bytes(), value_for(i).as_bytes())
            .unwrap();
    }

    assert!(store.segment_count().unwrap() > 1);
    for i in 0..200 {
        assert_eq!(
            store.get(format!("key.{}", i).as_bytes()).unwrap(),
            Some(value_for(i).into_bytes())
        );
    }
}

#[test]
fn test_record_larger_than_segment() {
    let (_dir, store) = setup_small_segment_store(64);

    let result = store.put(b"key", &[0u8; 128]);
    assert!(matches!(result, Err(SegKvError::InvalidRecord(_))));
    assert_eq!(store.get(b"key").unwrap(), None);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_operations_on_closed_store() {
    let (_dir, store) = setup_temp_store();
    store.put(b"key", b"value").unwrap();

    store.close().unwrap();
    assert!(!store.is_open());

    assert!(matches!(store.put(b"k", b"v"), Err(SegKvError::StoreClosed)));
    assert!(matches!(store.get(b"key"), Err(SegKvError::StoreClosed)));
    assert!(matches!(store.delete(b"key"), Err(SegKvError::StoreClosed)));
    assert!(matches!(store.sync(), Err(SegKvError::StoreClosed)));
    assert!(matches!(store.len(), Err(SegKvError::StoreClosed)));
    assert!(matches!(store.compact(), Err(SegKvError::StoreClosed)));
}

#[test]
fn test_close_is_idempotent() {
    let (_dir, store) = setup_temp_store();

    store.close().unwrap();
    store.close().unwrap();
    assert!(!store.is_open());
}

#[test]
fn test_reopen_after_close() {
    let (_dir, store) = setup_temp_store();
    store.put(b"key", b"value").unwrap();

    store.close().unwrap();
    store.reopen().unwrap();

    assert!(store.is_open());
    assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));
}

#[test]
fn test_reopen_while_open_is_noop() {
    let (_dir, store) = setup_temp_store();
    store.put(b"key", b"value").unwrap();

    store.reopen().unwrap();
    assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));
}

#[test]
fn test_persistence_across_instances() {
    let temp_dir = TempDir::new().unwrap();

    {
        let store = Store::open_path(temp_dir.path(), 100).unwrap();
        store.put(b"persistent_key", b"persistent_value").unwrap();
        store.close().unwrap();
    }

    let store = Store::open_path(temp_dir.path(), 100).unwrap();
    assert_eq!(
        store.get(b"persistent_key").unwrap(),
        Some(b"persistent_value".to_vec())
    );
    assert!(store.recovery_result().unwrap().snapshot_loaded);
}

// =============================================================================
// Backing Strategy Tests
// =============================================================================

#[test]
fn test_channel_segments() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .home_dir(temp_dir.path())
        .segment_capacity(2048)
        .segment_factory(ChannelSegmentFactory)
        .initial_capacity(100)
        .build();

    {
        let store = Store::open(config.clone()).unwrap();
        for i in 0..100 {
            store
                .put(format!("key.{}", i).as_bytes(), value_for(i).as_bytes())
                .unwrap();
        }
        // Reads see unflushed appends
        assert_eq!(
            store.get(b"key.99").unwrap(),
            Some(value_for(99).into_bytes())
        );
        store.close().unwrap();
    }

    let store = Store::open(config).unwrap();
    assert_eq!(store.len().unwrap(), 100);
    assert_eq!(store.get(b"key.42").unwrap(), Some(value_for(42).into_bytes()));
}

#[test]
fn test_switch_backing_between_opens() {
    let temp_dir = TempDir::new().unwrap();

    {
        let store = Store::open_path(temp_dir.path(), 100).unwrap();
        store.put(b"key", b"from memory segments").unwrap();
        store.close().unwrap();
    }

    let config = Config::builder()
        .home_dir(temp_dir.path())
        .segment_factory(ChannelSegmentFactory)
        .initial_capacity(100)
        .build();
    let store = Store::open(config).unwrap();
    assert_eq!(
        store.get(b"key").unwrap(),
        Some(b"from memory segments".to_vec())
    );
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_invalid_config_is_rejected() {
    let temp_dir = TempDir::new().unwrap();

    let config = Config::builder()
        .home_dir(temp_dir.path())
        .segment_capacity(0)
        .build();
    assert!(matches!(Store::open(config), Err(SegKvError::Config(_))));

    let config = Config::builder()
        .home_dir(temp_dir.path())
        .index_shards(3)
        .build();
    assert!(matches!(Store::open(config), Err(SegKvError::Config(_))));

    let config = Config::builder()
        .home_dir(temp_dir.path())
        .compaction_threshold(1.5)
        .build();
    assert!(matches!(Store::open(config), Err(SegKvError::Config(_))));

    let config = Config::builder()
        .home_dir(temp_dir.path())
        .sync_policy(SyncPolicy::EveryNWrites { count: 0 })
        .build();
    assert!(matches!(Store::open(config), Err(SegKvError::Config(_))));
}

#[test]
fn test_segment_capacity_mismatch() {
    let temp_dir = TempDir::new().unwrap();

    {
        let config = Config::builder()
            .home_dir(temp_dir.path())
            .segment_capacity(4096)
            .initial_capacity(100)
            .build();
        let store = Store::open(config).unwrap();
        store.put(b"key", b"value").unwrap();
        store.close().unwrap();
    }

    let config = Config::builder()
        .home_dir(temp_dir.path())
        .segment_capacity(8192)
        .initial_capacity(100)
        .build();
    assert!(matches!(Store::open(config), Err(SegKvError::Config(_))));
}

#[test]
fn test_every_n_writes_syncs() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .home_dir(temp_dir.path())
        .sync_policy(SyncPolicy::EveryNWrites { count: 10 })
        .initial_capacity(100)
        .build();

    let store = Store::open(config.clone()).unwrap();
    for i in 0..25 {
        store
            .put(format!("key.{}", i).as_bytes(), value_for(i).as_bytes())
            .unwrap();
    }
    // Simulate a crash: no close, no final sync
    drop(store);

    let store = Store::open(config).unwrap();
    let recovery = store.recovery_result().unwrap();
    assert!(recovery.snapshot_loaded);
    assert_eq!(recovery.snapshot_entries, 20);
    // Writes after the last automatic checkpoint were never flushed
    assert_eq!(store.len().unwrap(), 20);
    assert_eq!(
        store.get(b"key.19").unwrap(),
        Some(value_for(19).into_bytes())
    );
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_puts() {
    let (_dir, store) = setup_temp_store();
    let store = Arc::new(store);
    let mut handles = vec![];

    for t in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..250 {
                let key = format!("thread{}_key{}", t, i);
                let value = format!("thread{}_value{}", t, i);
                store.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.len().unwrap(), 1000);
    for t in 0..4 {
        for i in (0..250).step_by(25) {
            let key = format!("thread{}_key{}", t, i);
            let value = format!("thread{}_value{}", t, i);
            assert_eq!(store.get(key.as_bytes()).unwrap(), Some(value.into_bytes()));
        }
    }
}

#[test]
fn test_concurrent_puts_same_key() {
    let (_dir, store) = setup_small_segment_store(4096);
    let store = Arc::new(store);
    let mut handles = vec![];

    for t in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..200 {
                store
                    .put(b"shared", format!("thread{}_value{}", t, i).as_bytes())
                    .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.len().unwrap(), 1);
    let live = store.get(b"shared").unwrap().unwrap();
    store.close().unwrap();

    // Replay resolves the key to the same record the live index held
    std::fs::remove_file(store.home_dir().join("index.snapshot")).unwrap();
    store.reopen().unwrap();
    assert!(!store.recovery_result().unwrap().snapshot_loaded);
    assert_eq!(store.get(b"shared").unwrap(), Some(live));
}

#[test]
fn test_concurrent_reads_during_sync() {
    let (_dir, store) = setup_temp_store();
    for i in 0..100 {
        store
            .put(format!("key.{}", i).as_bytes(), value_for(i).as_bytes())
            .unwrap();
    }
    let store = Arc::new(store);
    let mut handles = vec![];

    for _ in 0..3 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for round in 0..20 {
                let i = round * 5;
                assert_eq!(
                    store.get(format!("key.{}", i).as_bytes()).unwrap(),
                    Some(value_for(i).into_bytes())
                );
            }
        }));
    }
    {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for _ in 0..5 {
                store.sync().unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}
