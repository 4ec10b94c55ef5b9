// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Load operation handles.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::sync::resilient_lock;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Cancelled | OperationState::Failed
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => OperationState::Created,
            1 => OperationState::Running,
            2 => OperationState::Completed,
            3 => OperationState::Cancelled,
            _ => OperationState::Failed,
        }
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct OperationInner {
    id: u64,
    locator: String,
    state: AtomicU8,
    on_cancel: Mutex<Option<CancelHook>>,
}

/// Handle to a load started by the manager.
///
/// Every state change is a compare-and-swap, so exactly one terminal state is
/// ever reached. Cancelling after that is a no-op.
#[derive(Clone)]
pub struct OperationHandle {
    inner: Arc<OperationInner>,
}

impl OperationHandle {
    pub(crate) fn new(locator: &str) -> Self {
        Self {
            inner: Arc::new(OperationInner {
                id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
                locator: locator.to_string(),
                state: AtomicU8::new(OperationState::Created as u8),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn locator(&self) -> &str {
        &self.inner.locator
    }

    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Created or running.
    pub fn is_active(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == OperationState::Cancelled
    }

    /// Created → Running.
    pub(crate) fn start(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                OperationState::Created as u8,
                OperationState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to a terminal state. Returns false if another terminal state won.
    pub(crate) fn finish(&self, state: OperationState) -> bool {
        debug_assert!(state.is_terminal());
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if OperationState::from_u8(current).is_terminal() {
                return false;
            }
            match self.inner.state.compare_exchange_weak(
                current,
                state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // The hook only matters for cancellation.
                    resilient_lock(&self.inner.on_cancel).take();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Install what runs on cancel. Replaces any previous hook.
    pub(crate) fn set_cancel_hook(&self, hook: CancelHook) {
        *resilient_lock(&self.inner.on_cancel) = Some(hook);
    }

    /// Cancel the load. No callback fires for it afterwards.
    pub fn cancel(&self) {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if OperationState::from_u8(current).is_terminal() {
                return;
            }
            match self.inner.state.compare_exchange_weak(
                current,
                OperationState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        tracing::debug!("Cancelled operation #{} for {}", self.inner.id, self.inner.locator);
        let hook = resilient_lock(&self.inner.on_cancel).take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn downgrade(&self) -> WeakOperation {
        WeakOperation {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl PartialEq for OperationHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for OperationHandle {}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.inner.id)
            .field("locator", &self.inner.locator)
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning reference to an operation.
#[derive(Clone, Debug, Default)]
pub struct WeakOperation {
    inner: Weak<OperationInner>,
}

impl WeakOperation {
    pub fn upgrade(&self) -> Option<OperationHandle> {
        self.inner.upgrade().map(|inner| OperationHandle { inner })
    }

    /// Cancel if the operation is still alive.
    pub fn cancel(&self) {
        if let Some(handle) = self.upgrade() {
            handle.cancel();
        }
    }
}
