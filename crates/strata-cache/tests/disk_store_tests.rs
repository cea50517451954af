//! Integration tests for the disk tier

use std::{sync::Arc, time::Duration};

use strata_cache::{config::DiskSettings, DiskBackedStore, PerformanceMonitor};
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(3600);

fn open(dir: &TempDir, budget: u64) -> DiskBackedStore {
    DiskBackedStore::open(
        dir.path().join("store"),
        budget,
        &DiskSettings::default(),
        Arc::new(PerformanceMonitor::default()),
    )
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir, 1024 * 1024);
        store.store("overall_average", b"14.25".to_vec(), HOUR).await.unwrap();
        store.flush().await;
    }

    let store = open(&dir, 1024 * 1024);
    assert_eq!(
        store.retrieve("overall_average").await.as_deref(),
        Some(&b"14.25"[..])
    );
}

#[tokio::test]
async fn test_program_order_across_clones() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, 1024 * 1024);
    let other = store.clone();

    store.store("deck", b"v1".to_vec(), HOUR).await.unwrap();
    other.store("deck", b"v2".to_vec(), HOUR).await.unwrap();
    store.remove("deck").await.unwrap();
    other.store("deck", b"v3".to_vec(), HOUR).await.unwrap();

    assert_eq!(store.retrieve("deck").await.as_deref(), Some(&b"v3"[..]));
}

#[tokio::test]
async fn test_budget_enforced_after_writes() {
    let dir = TempDir::new().unwrap();
    let budget = 8 * 1024;
    let store = open(&dir, budget);

    for i in 0..32 {
        store
            .store(&format!("blob_{}", i), vec![7u8; 1024], HOUR)
            .await
            .unwrap();
    }
    store.flush().await;

    let size = store.current_size().await;
    assert!(size <= budget);
    assert!(size > 0);
}

#[tokio::test]
async fn test_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, 1024 * 1024);

    let mut handles = Vec::new();
    for writer in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                store
                    .store(&format!("w{}_{}", writer, i), vec![writer as u8; 16], HOUR)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for writer in 0..8u8 {
        let bytes = store.retrieve(&format!("w{}_9", writer)).await.unwrap();
        assert_eq!(bytes, vec![writer; 16]);
    }
}

#[tokio::test]
async fn test_expired_entries_are_misses_and_swept() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, 1024 * 1024);

    store.store("short", b"x".to_vec(), Duration::ZERO).await.unwrap();
    store.store("long", b"y".to_vec(), HOUR).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(store.cleanup_expired().await, 1);
    assert!(store.retrieve("short").await.is_none());
    assert!(store.retrieve("long").await.is_some());
}
