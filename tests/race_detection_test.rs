// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for webimg
//!
//! These tests hammer the shared structures of the loader from many tasks at
//! once. They are designed to detect data races when run with ThreadSanitizer
//! (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! # On Linux with nightly Rust:
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//!
//! # Or use cargo-careful for additional checks:
//! cargo install cargo-careful
//! cargo careful test --test race_detection_test
//! ```
//!
//! # Test Categories
//!
//! - Memory cache concurrent access
//! - Disk-backed cache concurrent store/lookup
//! - Negative cache and operation registry
//! - Manager deduplication under load
//! - Cancellation storms
//! - Deadlock detection

mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use tempfile::TempDir;
use tokio::time::timeout;

use common::{harness, png, url};
use webimg::cache::{FileDiskStore, ImageCache, MemoryCache};
use webimg::download::FailedLocators;
use webimg::{FetchOptions, Image, ImageFormat, OperationRegistry, OperationState};

// Test configuration
const CONCURRENCY_LEVEL: usize = 100;
const ITERATIONS_PER_TASK: usize = 50;
const TEST_TIMEOUT_SECS: u64 = 30;

fn tiny(side: u32) -> Arc<Image> {
    Arc::new(Image::still(ImageFormat::Png, RgbaImage::new(side, side)))
}

// =============================================================================
// MEMORY CACHE TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_cache_concurrent_read_write() {
    // 10x10 RGBA costs 400 bytes; room for 25 entries.
    let cache = Arc::new(MemoryCache::new(400 * 25, 0));
    let hits = Arc::new(AtomicU64::new(0));
    let mut handles = vec![];

    for task_id in 0..CONCURRENCY_LEVEL {
        let cache = Arc::clone(&cache);
        let hits = Arc::clone(&hits);
        handles.push(tokio::spawn(async move {
            for i in 0..ITERATIONS_PER_TASK {
                let key = format!("key_{}", (task_id + i) % 40);
                if i % 3 == 0 {
                    cache.insert(key, tiny(10));
                } else if cache.get(&key).is_some() {
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    assert!(cache.total_cost() <= cache.cost_limit());
    assert!(cache.len() <= 25);
    assert!(hits.load(Ordering::Relaxed) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_cache_heavy_read_contention() {
    let cache = Arc::new(MemoryCache::new(0, 0));
    let shared = tiny(4);
    cache.insert("hot", Arc::clone(&shared));

    let mut handles = vec![];
    for _ in 0..CONCURRENCY_LEVEL {
        let cache = Arc::clone(&cache);
        let shared = Arc::clone(&shared);
        handles.push(tokio::spawn(async move {
            for _ in 0..ITERATIONS_PER_TASK {
                let image = cache.get("hot").expect("hot entry evicted");
                assert!(Arc::ptr_eq(&image, &shared));
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");
    assert_eq!(cache.len(), 1);
}

// =============================================================================
// DISK CACHE TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_image_cache_concurrent_store_lookup() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(ImageCache::new(
        MemoryCache::new(0, 0),
        Arc::new(FileDiskStore::new(dir.path()).unwrap()),
        0,
        Duration::ZERO,
    ));
    let body = png(2, 2);
    let mut handles = vec![];

    for task_id in 0..CONCURRENCY_LEVEL / 5 {
        let cache = Arc::clone(&cache);
        let body = body.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let key = format!("https://img.test/{}.png", (task_id * 7 + i) % 15);
                cache
                    .store(&key, tiny(2), Some(body.clone()), true)
                    .await
                    .expect("store failed");
                let entry = cache.lookup(&key).await;
                assert!(entry.is_some(), "stored entry not found");
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    assert_eq!(cache.disk_count().await, 15);
    cache.clear_memory();
    let data = cache.disk_data("https://img.test/3.png").await;
    assert_eq!(data, Some(body));
}

// =============================================================================
// NEGATIVE CACHE AND REGISTRY TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_locators_single_winner() {
    let failed = Arc::new(FailedLocators::new());
    let winners = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for _ in 0..CONCURRENCY_LEVEL {
        let failed = Arc::clone(&failed);
        let winners = Arc::clone(&winners);
        handles.push(tokio::spawn(async move {
            for i in 0..ITERATIONS_PER_TASK {
                if failed.insert(&format!("https://img.test/{}.png", i)) {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    // Each locator is newly inserted exactly once.
    assert_eq!(winners.load(Ordering::Relaxed), ITERATIONS_PER_TASK);
    assert_eq!(failed.len(), ITERATIONS_PER_TASK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operation_registry_concurrent_access() {
    let h = harness(Duration::from_millis(500));
    let registry = Arc::new(OperationRegistry::new());
    let mut handles = vec![];

    for task_id in 0..CONCURRENCY_LEVEL / 2 {
        let registry = Arc::clone(&registry);
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            let slot = format!("slot_{}", task_id);
            for i in 0..5 {
                let handle = manager.load(
                    &url(&format!("/registry-{}-{}.png", task_id, i)),
                    FetchOptions::empty(),
                    None,
                    |_| {},
                );
                registry.set_operation(&handle, &slot);
                if i % 2 == 0 {
                    registry.cancel_operation(&slot);
                    assert_eq!(handle.state(), OperationState::Cancelled);
                }
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    assert!(registry.len() <= CONCURRENCY_LEVEL / 2);
    registry.cancel_all();
    h.manager.cancel_all();
    assert!(!h.manager.is_running());
}

// =============================================================================
// MANAGER DEDUPLICATION TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manager_concurrent_loads() {
    let h = harness(Duration::from_millis(100));
    for i in 0..10 {
        h.transport.serve(&format!("/dedup-{}.png", i), png(3, 3));
    }
    let successes = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for task_id in 0..CONCURRENCY_LEVEL {
        let manager = h.manager.clone();
        let successes = Arc::clone(&successes);
        handles.push(tokio::spawn(async move {
            let locator = url(&format!("/dedup-{}.png", task_id % 10));
            let loaded = manager
                .load_image(&locator, FetchOptions::empty())
                .await
                .expect("load failed");
            assert_eq!(loaded.image.width(), 3);
            successes.fetch_add(1, Ordering::Relaxed);
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    assert_eq!(successes.load(Ordering::Relaxed), CONCURRENCY_LEVEL);
    for i in 0..10 {
        assert!(h.transport.requests_for(&format!("/dedup-{}.png", i)) >= 1);
    }
    assert!(h.transport.request_count() < CONCURRENCY_LEVEL);
    assert!(!h.manager.is_running());
}

// =============================================================================
// CANCELLATION STORM TESTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_completion() {
    let h = harness(Duration::from_millis(5));
    for i in 0..5 {
        h.transport.serve(&format!("/storm-{}.png", i), png(2, 2));
    }
    let mut handles = vec![];

    for task_id in 0..CONCURRENCY_LEVEL {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let handle = manager.load(
                &url(&format!("/storm-{}.png", task_id % 5)),
                FetchOptions::IGNORE_CACHE,
                None,
                move |response| {
                    if response.finished {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                },
            );
            tokio::time::sleep(Duration::from_millis((task_id % 10) as u64)).await;
            handle.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;

            let delivered = calls.load(Ordering::SeqCst);
            assert!(delivered <= 1, "terminal delivered {} times", delivered);
            match handle.state() {
                OperationState::Cancelled => assert_eq!(delivered, 0),
                OperationState::Completed => assert_eq!(delivered, 1),
                other => panic!("unexpected state {:?}", other),
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");
    assert!(!h.manager.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cancel_of_one_handle() {
    let h = harness(Duration::from_millis(300));
    h.transport.serve("/contested.png", png(2, 2));
    let handle = h
        .manager
        .load(&url("/contested.png"), FetchOptions::empty(), None, |_| {});
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut handles = vec![];
    for _ in 0..CONCURRENCY_LEVEL {
        let handle = handle.clone();
        handles.push(tokio::spawn(async move { handle.cancel() }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    assert_eq!(handle.state(), OperationState::Cancelled);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.manager.downloader().current_download_count(), 0);
}

// =============================================================================
// DEADLOCK DETECTION TEST
// =============================================================================

/// Loads, cache maintenance, scheduler reconfiguration and cancellation all
/// take different locks; interleave them and require forward progress.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_deadlock_with_multiple_locks() {
    let h = harness(Duration::from_millis(2));
    for i in 0..20 {
        h.transport.serve(&format!("/mixed-{}.png", i), png(2, 2));
    }
    let mut handles = vec![];

    for task_id in 0..CONCURRENCY_LEVEL / 4 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let locator = url(&format!("/mixed-{}.png", (task_id + i) % 20));
                match (task_id + i) % 5 {
                    0 => manager.cache().clear_memory(),
                    1 => manager.downloader().set_max_concurrent_downloads(1 + i % 4),
                    2 => manager.cancel_all(),
                    3 => {
                        let _ = manager.cached_image_exists(&locator).await;
                    }
                    _ => {
                        // Cancel-all from a sibling may legitimately interrupt this.
                        let _ = manager.load_image(&locator, FetchOptions::empty()).await;
                    }
                }
            }
        }));
    }

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    h.manager.cancel_all();
    assert!(!h.manager.is_running());
}
