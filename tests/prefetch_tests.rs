// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Prefetcher session tests.
//!
//! Run with: cargo test --test prefetch_tests

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{harness, png, url, Harness};
use webimg::config::PrefetchConfig;
use webimg::{FetchOptions, Prefetcher};

fn prefetcher(h: &Harness, max_concurrent: usize) -> Prefetcher {
    Prefetcher::new(
        h.manager.clone(),
        &PrefetchConfig {
            max_concurrent,
            ..Default::default()
        },
    )
}

fn locators(h: &Harness, prefix: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let path = format!("/{}-{}.png", prefix, i);
            h.transport.serve(&path, png(2, 2));
            url(&path)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_window_bounds_concurrency() {
    let h = harness(Duration::from_millis(50));
    let mut urls = locators(&h, "window", 7);
    for i in 0..3 {
        let path = format!("/missing-{}.png", i);
        h.transport.fail(&path, 404);
        urls.push(url(&path));
    }
    let prefetcher = prefetcher(&h, 3);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        prefetcher.prefetch_and_wait(
            urls,
            Some(Arc::new(move |finished: usize, total: usize| {
                sink.lock().unwrap().push((finished, total));
            })),
        ),
    )
    .await
    .expect("prefetch timed out");

    assert_eq!(outcome, Some((10, 3)));
    assert!(h.transport.peak() <= 3, "peak was {}", h.transport.peak());
    assert_eq!(h.transport.request_count(), 10);

    let progress = progress.lock().unwrap();
    assert_eq!(progress.len(), 10);
    assert_eq!(progress.last(), Some(&(10, 10)));
    assert!(!prefetcher.is_prefetching());
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Report {
    Progress(usize),
    Done(usize, usize),
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_reports_arrive_in_order_under_parallel_hits() {
    const SESSIONS: usize = 200;
    const LOCATORS: usize = 64;

    let h = harness(Duration::ZERO);
    let urls = locators(&h, "ordered", LOCATORS);
    let warm = tokio::time::timeout(
        Duration::from_secs(10),
        prefetcher(&h, 16).prefetch_and_wait(urls.clone(), None),
    )
    .await
    .expect("warm-up timed out");
    assert_eq!(warm, Some((LOCATORS, 0)));

    let mut sessions = Vec::with_capacity(SESSIONS);
    for _ in 0..SESSIONS {
        let prefetcher = prefetcher(&h, 16);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let progress_sink = Arc::clone(&reports);
        let completion_sink = Arc::clone(&reports);
        prefetcher.prefetch(
            urls.clone(),
            Some(Arc::new(move |finished: usize, _total: usize| {
                progress_sink.lock().unwrap().push(Report::Progress(finished));
            })),
            Some(Box::new(move |finished, skipped| {
                completion_sink.lock().unwrap().push(Report::Done(finished, skipped));
                let _ = tx.send(());
            })),
        );
        sessions.push((prefetcher, reports, rx));
    }

    for (_prefetcher, reports, rx) in sessions {
        tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("session timed out")
            .expect("session dropped its completion");
        // Let any straggling report land before inspecting.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reports = reports.lock().unwrap();
        let expected: Vec<Report> = (1..=LOCATORS)
            .map(Report::Progress)
            .chain(std::iter::once(Report::Done(LOCATORS, 0)))
            .collect();
        assert_eq!(*reports, expected);
    }
    assert_eq!(h.transport.request_count(), LOCATORS);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_completion_fires_exactly_once() {
    let h = harness(Duration::from_millis(10));
    let urls = locators(&h, "once", 5);
    let prefetcher = prefetcher(&h, 2);

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let counter = Arc::clone(&calls);
    prefetcher.prefetch(
        urls,
        None,
        Some(Box::new(move |finished, skipped| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send((finished, skipped));
        })),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap();
    assert_eq!(outcome.unwrap(), (5, 0));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cached_locators_need_no_downloads() {
    let h = harness(Duration::ZERO);
    let urls = locators(&h, "warm", 4);
    let prefetcher = prefetcher(&h, 2);

    assert_eq!(prefetcher.prefetch_and_wait(urls.clone(), None).await, Some((4, 0)));
    assert_eq!(h.transport.request_count(), 4);
    for locator in &urls {
        assert!(h.manager.cached_image_exists(locator).await);
    }

    assert_eq!(prefetcher.prefetch_and_wait(urls, None).await, Some((4, 0)));
    assert_eq!(h.transport.request_count(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_session_supersedes_old() {
    let h = harness(Duration::from_millis(200));
    let slow = locators(&h, "old", 6);
    let fresh = locators(&h, "new", 2);
    let prefetcher = prefetcher(&h, 3);

    let superseded = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&superseded);
    prefetcher.prefetch(
        slow,
        None,
        Some(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), prefetcher.prefetch_and_wait(fresh, None))
        .await
        .unwrap();
    assert_eq!(outcome, Some((2, 0)));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(superseded.load(Ordering::SeqCst), 0);
    // The old session never got past its first window.
    assert!(h.transport.request_count() <= 3 + 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_reports_nothing() {
    let h = harness(Duration::from_millis(200));
    let urls = locators(&h, "cancel", 5);
    let prefetcher = prefetcher(&h, 2);

    let calls = Arc::new(AtomicUsize::new(0));
    let progress = Arc::clone(&calls);
    let completion = Arc::clone(&calls);
    prefetcher.prefetch(
        urls,
        Some(Arc::new(move |_: usize, _: usize| {
            progress.fetch_add(1, Ordering::SeqCst);
        })),
        Some(Box::new(move |_, _| {
            completion.fetch_add(1, Ordering::SeqCst);
        })),
    );
    assert!(prefetcher.is_prefetching());
    tokio::time::sleep(Duration::from_millis(20)).await;

    prefetcher.cancel_prefetching();
    assert!(!prefetcher.is_prefetching());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!h.manager.is_running());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_list_completes_immediately() {
    let h = harness(Duration::ZERO);
    let prefetcher = prefetcher(&h, 3);

    let outcome = prefetcher.prefetch_and_wait(Vec::<String>::new(), None).await;
    assert_eq!(outcome, Some((0, 0)));
    assert!(!prefetcher.is_prefetching());
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_settings() {
    let h = harness(Duration::ZERO);
    let prefetcher = prefetcher(&h, 3);

    assert_eq!(prefetcher.options(), FetchOptions::LOW_PRIORITY);
    prefetcher.set_options(FetchOptions::HIGH_PRIORITY | FetchOptions::CACHE_MEMORY_ONLY);
    assert!(prefetcher.options().contains(FetchOptions::CACHE_MEMORY_ONLY));

    prefetcher.set_max_concurrent(0);
    assert_eq!(prefetcher.max_concurrent(), 1);
}
