// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download coordinator: priority lanes, a concurrency bound, cancellation,
//! timeouts and the negative cache.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use indexmap::IndexMap;
use tokio::sync::{mpsc, Notify};
use url::Url;

use super::blacklist::FailedLocators;
use super::transport::{HttpTransport, Transport, TransportRequest};
use super::types::{DownloadEvent, DownloadStatus};
use crate::config::DownloadConfig;
use crate::error::{WebImageError, WebImageResult};
use crate::options::FetchOptions;
use crate::sync::{resilient_lock, resilient_read, resilient_write};

/// Cap on buffer preallocation from an announced content length.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELLED: u8 = 3;

struct Job {
    id: u64,
    locator: Url,
    options: FetchOptions,
    state: AtomicU8,
    cancelled: Notify,
    events: mpsc::UnboundedSender<DownloadEvent>,
}

impl Job {
    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn status(&self) -> DownloadStatus {
        match self.state.load(Ordering::Acquire) {
            QUEUED => DownloadStatus::Queued,
            RUNNING => DownloadStatus::Running,
            COMPLETED => DownloadStatus::Completed,
            _ => DownloadStatus::Cancelled,
        }
    }

    fn send(&self, event: DownloadEvent) {
        // The receiver may already be gone; nobody is listening then.
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct Queue {
    lanes: [VecDeque<Arc<Job>>; 3],
    running: HashMap<u64, Arc<Job>>,
}

impl Queue {
    fn pop_next(&mut self) -> Option<Arc<Job>> {
        self.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    fn remove_queued(&mut self, id: u64) {
        for lane in self.lanes.iter_mut() {
            lane.retain(|job| job.id != id);
        }
    }

    fn queued_len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn all_jobs(&self) -> Vec<Arc<Job>> {
        self.lanes
            .iter()
            .flatten()
            .chain(self.running.values())
            .cloned()
            .collect()
    }
}

struct CoordinatorInner {
    transport: Arc<dyn Transport>,
    failed: FailedLocators,
    queue: Mutex<Queue>,
    headers: RwLock<IndexMap<String, String>>,
    timeout_ms: AtomicU64,
    max_concurrent: AtomicUsize,
    next_id: AtomicU64,
}

impl CoordinatorInner {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Start queued jobs while under the concurrency bound.
    fn pump(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut queue = resilient_lock(&self.queue);
            let max = self.max_concurrent.load(Ordering::Relaxed).max(1);
            while queue.running.len() < max {
                let Some(job) = queue.pop_next() else {
                    break;
                };
                // Lost to a concurrent cancel.
                if !job.transition(QUEUED, RUNNING) {
                    continue;
                }
                queue.running.insert(job.id, Arc::clone(&job));
                started.push(job);
            }
        }

        for job in started {
            tracing::debug!(
                "Starting download #{} {} ({:?})",
                job.id,
                job.locator,
                job.options.priority()
            );
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run(job).await });
        }
    }

    async fn run(self: Arc<Self>, job: Arc<Job>) {
        let timeout = self.timeout();
        let outcome = tokio::select! {
            biased;
            _ = job.cancelled.notified() => Err(WebImageError::Cancelled),
            result = tokio::time::timeout(timeout, self.transfer(&job)) => {
                result.unwrap_or_else(|_| Err(WebImageError::timeout(timeout)))
            }
        };

        let outcome = if job.transition(RUNNING, COMPLETED) {
            outcome
        } else {
            Err(WebImageError::Cancelled)
        };

        match &outcome {
            Ok(data) => {
                self.failed.remove(job.locator.as_str());
                tracing::info!("Downloaded {} ({} bytes)", job.locator, data.len());
            }
            Err(e) if e.is_cancelled() => {
                tracing::debug!("Download #{} {} cancelled", job.id, job.locator);
            }
            Err(e) => {
                tracing::warn!("Download of {} failed: {}", job.locator, e);
                if e.should_blacklist() && !job.options.contains(FetchOptions::RETRY_FAILED) {
                    self.failed.insert(job.locator.as_str());
                }
            }
        }

        job.send(DownloadEvent::Finished(outcome));
        resilient_lock(&self.queue).running.remove(&job.id);
        self.pump();
    }

    async fn transfer(&self, job: &Job) -> WebImageResult<Bytes> {
        let request = TransportRequest {
            locator: job.locator.clone(),
            headers: resilient_read(&self.headers).clone(),
            options: job.options,
        };
        let response = self.transport.request(&request).await?;
        let expected = response.expected_len;
        let mut body = response.body;

        job.send(DownloadEvent::Progress {
            received: 0,
            expected,
            chunk: Bytes::new(),
        });

        let mut buffer = BytesMut::with_capacity(expected.unwrap_or(0).min(MAX_PREALLOC) as usize);
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if job.is_cancelled() {
                return Err(WebImageError::Cancelled);
            }
            buffer.extend_from_slice(&chunk);
            job.send(DownloadEvent::Progress {
                received: buffer.len() as u64,
                expected,
                chunk,
            });
        }
        Ok(buffer.freeze())
    }

    fn cancel(&self, job: &Arc<Job>) {
        if job.transition(QUEUED, CANCELLED) {
            resilient_lock(&self.queue).remove_queued(job.id);
            job.send(DownloadEvent::Finished(Err(WebImageError::Cancelled)));
            tracing::debug!("Cancelled queued download #{} {}", job.id, job.locator);
        } else if job.transition(RUNNING, CANCELLED) {
            job.cancelled.notify_one();
        }
    }
}

/// Cancels one download. Cheap to clone; outlives the coordinator safely.
#[derive(Clone)]
pub struct DownloadCanceller {
    job: Arc<Job>,
    coordinator: Weak<CoordinatorInner>,
}

impl DownloadCanceller {
    /// Stop the download. A no-op once it has finished.
    pub fn cancel(&self) {
        if let Some(inner) = self.coordinator.upgrade() {
            inner.cancel(&self.job);
        } else if self.job.transition(RUNNING, CANCELLED) {
            self.job.cancelled.notify_one();
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.job.status()
    }
}

impl std::fmt::Debug for DownloadCanceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCanceller")
            .field("id", &self.job.id)
            .field("locator", &self.job.locator.as_str())
            .finish()
    }
}

/// A scheduled download and its event stream.
#[derive(Debug)]
pub struct DownloadOperation {
    canceller: DownloadCanceller,
    events: mpsc::UnboundedReceiver<DownloadEvent>,
    done: bool,
}

impl DownloadOperation {
    pub fn id(&self) -> u64 {
        self.canceller.job.id
    }

    pub fn locator(&self) -> &Url {
        &self.canceller.job.locator
    }

    pub fn status(&self) -> DownloadStatus {
        self.canceller.status()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> DownloadCanceller {
        self.canceller.clone()
    }

    /// Next event; `None` after the terminal event has been taken.
    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        if self.done {
            return None;
        }
        let event = self.events.recv().await?;
        self.done = event.is_finished();
        Some(event)
    }

    /// Skip progress and wait for the terminal result.
    pub async fn finish(mut self) -> WebImageResult<Bytes> {
        while let Some(event) = self.next_event().await {
            if let DownloadEvent::Finished(result) = event {
                return result;
            }
        }
        Err(WebImageError::Cancelled)
    }
}

/// Schedules downloads over a [`Transport`].
///
/// Jobs wait in three FIFO lanes (high, normal, low) and at most
/// `max_concurrent_downloads` run at once. Must be used from inside a tokio
/// runtime.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DownloadCoordinator {
    pub fn new(transport: Arc<dyn Transport>, config: &DownloadConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                transport,
                failed: FailedLocators::new(),
                queue: Mutex::new(Queue::default()),
                headers: RwLock::new(config.headers.clone()),
                timeout_ms: AtomicU64::new(config.timeout_secs.saturating_mul(1000)),
                max_concurrent: AtomicUsize::new(config.max_concurrent_downloads.max(1)),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Coordinator over [`HttpTransport`].
    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.user_agent)?;
        Ok(Self::new(Arc::new(transport), config))
    }

    /// Schedule a fetch.
    ///
    /// A blacklisted locator without `RETRY_FAILED` finishes immediately with
    /// [`WebImageError::BlacklistedLocator`] and never reaches the transport.
    pub fn fetch(&self, locator: Url, options: FetchOptions) -> DownloadOperation {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = Arc::new(Job {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            locator,
            options,
            state: AtomicU8::new(QUEUED),
            cancelled: Notify::new(),
            events: tx,
        });
        let operation = DownloadOperation {
            canceller: DownloadCanceller {
                job: Arc::clone(&job),
                coordinator: Arc::downgrade(&self.inner),
            },
            events: rx,
            done: false,
        };

        if !options.contains(FetchOptions::RETRY_FAILED)
            && self.inner.failed.contains(job.locator.as_str())
        {
            job.state.store(COMPLETED, Ordering::Release);
            job.send(DownloadEvent::Finished(Err(WebImageError::BlacklistedLocator(
                job.locator.to_string(),
            ))));
            return operation;
        }

        let priority = options.priority();
        tracing::debug!("Queued download #{} {} ({:?})", job.id, job.locator, priority);
        resilient_lock(&self.inner.queue).lanes[priority.lane()].push_back(job);
        self.inner.pump();
        operation
    }

    /// Cancel every queued or running download.
    pub fn cancel_all(&self) {
        let jobs = resilient_lock(&self.inner.queue).all_jobs();
        for job in &jobs {
            self.inner.cancel(job);
        }
    }

    /// Cancel every download not marked `CONTINUE_IN_BACKGROUND`.
    ///
    /// Returns how many were cancelled.
    pub fn enter_background(&self) -> usize {
        let jobs = resilient_lock(&self.inner.queue).all_jobs();
        let mut cancelled = 0;
        for job in jobs
            .iter()
            .filter(|job| !job.options.contains(FetchOptions::CONTINUE_IN_BACKGROUND))
        {
            self.inner.cancel(job);
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::info!("Entering background: cancelled {} downloads", cancelled);
        }
        cancelled
    }

    pub fn failed_locators(&self) -> &FailedLocators {
        &self.inner.failed
    }

    /// Set (or with `None`, remove) a header sent with every request.
    pub fn set_header(&self, name: &str, value: Option<&str>) {
        let mut headers = resilient_write(&self.inner.headers);
        match value {
            Some(value) => {
                headers.insert(name.to_string(), value.to_string());
            }
            None => {
                headers.shift_remove(name);
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        resilient_read(&self.inner.headers).get(name).cloned()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::Relaxed)
    }

    pub fn set_max_concurrent_downloads(&self, max: usize) {
        self.inner.max_concurrent.store(max.max(1), Ordering::Relaxed);
        self.inner.pump();
    }

    /// Downloads currently in flight.
    pub fn current_download_count(&self) -> usize {
        resilient_lock(&self.inner.queue).running.len()
    }

    /// Downloads waiting for a slot.
    pub fn queued_download_count(&self) -> usize {
        resilient_lock(&self.inner.queue).queued_len()
    }
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("max_concurrent", &self.max_concurrent_downloads())
            .field("timeout", &self.timeout())
            .finish_non_exhaustive()
    }
}
