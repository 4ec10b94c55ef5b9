// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded-concurrency prefetching into the cache.
//!
//! A session walks its locators in order, keeping at most `max_concurrent`
//! loads outstanding. A new `prefetch` call cancels the current session.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;
use tokio::sync::oneshot;

use crate::config::{load_config, PrefetchConfig};
use crate::manager::{OperationHandle, WebImageManager};
use crate::options::FetchOptions;
use crate::sync::resilient_lock;

/// `(finished, total)` after each locator resolves.
pub type PrefetchProgress = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// `(finished, skipped)` once the whole session has resolved.
pub type PrefetchCompletion = Box<dyn FnOnce(usize, usize) + Send>;

static SHARED: OnceCell<Prefetcher> = OnceCell::new();

#[derive(Default)]
struct SessionState {
    next: usize,
    finished: usize,
    skipped: usize,
    in_flight: HashMap<usize, OperationHandle>,
    /// Loads that resolved before their handle was recorded.
    resolved_early: HashSet<usize>,
}

struct Session {
    id: u64,
    locators: Vec<String>,
    options: FetchOptions,
    cancelled: AtomicBool,
    state: Mutex<SessionState>,
    /// Held across counting and reporting so callbacks see counts in order.
    delivery: Mutex<()>,
    on_progress: Option<PrefetchProgress>,
    on_completion: Mutex<Option<PrefetchCompletion>>,
}

impl Session {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<OperationHandle> = {
            let mut state = resilient_lock(&self.state);
            state.in_flight.drain().map(|(_, handle)| handle).collect()
        };
        resilient_lock(&self.on_completion).take();
        tracing::debug!(
            "Cancelled prefetch session #{} ({} loads in flight)",
            self.id,
            handles.len()
        );
        for handle in handles {
            handle.cancel();
        }
    }
}

struct PrefetcherInner {
    manager: WebImageManager,
    max_concurrent: AtomicUsize,
    options: Mutex<FetchOptions>,
    session: Mutex<Option<Arc<Session>>>,
    next_session: AtomicU64,
}

/// Warms the cache with a list of locators.
#[derive(Clone)]
pub struct Prefetcher {
    inner: Arc<PrefetcherInner>,
}

impl Prefetcher {
    pub fn new(manager: WebImageManager, config: &PrefetchConfig) -> Self {
        Self {
            inner: Arc::new(PrefetcherInner {
                manager,
                max_concurrent: AtomicUsize::new(config.max_concurrent.max(1)),
                options: Mutex::new(config.options),
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Process-wide prefetcher over [`WebImageManager::shared`].
    pub fn shared() -> anyhow::Result<&'static Prefetcher> {
        SHARED.get_or_try_init(|| {
            let config = load_config()?;
            let manager = WebImageManager::shared()?.clone();
            Ok(Self::new(manager, &config.prefetch))
        })
    }

    pub fn manager(&self) -> &WebImageManager {
        &self.inner.manager
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::Relaxed)
    }

    /// Applies to sessions started afterwards.
    pub fn set_max_concurrent(&self, max: usize) {
        self.inner.max_concurrent.store(max.max(1), Ordering::Relaxed);
    }

    pub fn options(&self) -> FetchOptions {
        *resilient_lock(&self.inner.options)
    }

    pub fn set_options(&self, options: FetchOptions) {
        *resilient_lock(&self.inner.options) = options;
    }

    pub fn is_prefetching(&self) -> bool {
        resilient_lock(&self.inner.session).is_some()
    }

    /// Start a session, cancelling the current one.
    ///
    /// Failed loads count as finished and as skipped. `on_completion` fires
    /// once, unless the session is cancelled or superseded first.
    pub fn prefetch<I, S>(
        &self,
        locators: I,
        on_progress: Option<PrefetchProgress>,
        on_completion: Option<PrefetchCompletion>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let session = Arc::new(Session {
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            locators: locators.into_iter().map(Into::into).collect(),
            options: self.options(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
            delivery: Mutex::new(()),
            on_progress,
            on_completion: Mutex::new(on_completion),
        });

        let previous = resilient_lock(&self.inner.session).replace(Arc::clone(&session));
        if let Some(previous) = previous {
            tracing::debug!("Prefetch session #{} superseded by #{}", previous.id, session.id);
            previous.cancel();
        }

        tracing::info!(
            "Prefetching {} images (session #{}, window {})",
            session.locators.len(),
            session.id,
            self.max_concurrent()
        );

        if session.locators.is_empty() {
            self.inner.clear_session(&session);
            let completion = resilient_lock(&session.on_completion).take();
            if let Some(completion) = completion {
                tokio::spawn(async move { completion(0, 0) });
            }
            return;
        }

        PrefetcherInner::dispatch(&self.inner, &session);
    }

    /// Prefetch and wait for `(finished, skipped)`.
    ///
    /// Returns `None` if the session was cancelled or superseded.
    pub async fn prefetch_and_wait<I, S>(
        &self,
        locators: I,
        on_progress: Option<PrefetchProgress>,
    ) -> Option<(usize, usize)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = oneshot::channel();
        self.prefetch(
            locators,
            on_progress,
            Some(Box::new(move |finished, skipped| {
                let _ = tx.send((finished, skipped));
            })),
        );
        rx.await.ok()
    }

    /// Cancel the current session and its loads. Nothing is reported.
    pub fn cancel_prefetching(&self) {
        let session = resilient_lock(&self.inner.session).take();
        if let Some(session) = session {
            session.cancel();
        }
    }
}

impl PrefetcherInner {
    fn clear_session(&self, session: &Arc<Session>) {
        let mut current = resilient_lock(&self.session);
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *current = None;
        }
    }

    /// Fill the window.
    fn dispatch(inner: &Arc<Self>, session: &Arc<Session>) {
        let max = inner.max_concurrent.load(Ordering::Relaxed);
        let to_start: Vec<usize> = {
            let mut state = resilient_lock(&session.state);
            let mut batch = Vec::new();
            while state.next < session.locators.len() && state.next - state.finished < max {
                batch.push(state.next);
                state.next += 1;
            }
            batch
        };

        for index in to_start {
            if session.is_cancelled() {
                return;
            }
            let weak_inner = Arc::downgrade(inner);
            let weak_session = Arc::downgrade(session);
            let handle = inner.manager.load(
                &session.locators[index],
                session.options,
                None,
                move |response| {
                    if response.finished {
                        Self::resolved(&weak_inner, &weak_session, index, response.result.is_ok());
                    }
                },
            );

            let mut state = resilient_lock(&session.state);
            if !state.resolved_early.remove(&index) && !session.is_cancelled() {
                state.in_flight.insert(index, handle);
            }
        }
    }

    fn resolved(inner: &Weak<Self>, session: &Weak<Session>, index: usize, ok: bool) {
        let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) else {
            return;
        };

        let delivery = resilient_lock(&session.delivery);
        if session.is_cancelled() {
            return;
        }

        let (finished, skipped, total) = {
            let mut state = resilient_lock(&session.state);
            if state.in_flight.remove(&index).is_none() {
                state.resolved_early.insert(index);
            }
            state.finished += 1;
            if !ok {
                state.skipped += 1;
            }
            (state.finished, state.skipped, session.locators.len())
        };

        if let Some(on_progress) = &session.on_progress {
            on_progress(finished, total);
        }

        if finished < total {
            drop(delivery);
            Self::dispatch(&inner, &session);
            return;
        }

        inner.clear_session(&session);
        let completion = resilient_lock(&session.on_completion).take();
        if let Some(completion) = completion {
            tracing::info!(
                "Prefetch session #{} done: {} finished, {} skipped",
                session.id,
                finished,
                skipped
            );
            completion(finished, skipped);
        }
    }
}

impl std::fmt::Debug for Prefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefetcher")
            .field("max_concurrent", &self.max_concurrent())
            .field("options", &self.options())
            .field("prefetching", &self.is_prefetching())
            .finish()
    }
}
