// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-owner registry of in-flight operations.
//!
//! Embed an [`OperationRegistry`] in whatever owns a set of loads (a view, a
//! list row, a session). It only holds weak references, so dropping the
//! owner drops the associations and never keeps an operation alive.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::manager::{OperationHandle, WeakOperation};
use crate::sync::resilient_lock;

#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: Mutex<HashMap<String, WeakOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `handle` with `key`. A previous handle under the same key is
    /// replaced, not cancelled.
    pub fn set_operation(&self, handle: &OperationHandle, key: &str) {
        resilient_lock(&self.operations).insert(key.to_string(), handle.downgrade());
    }

    /// Cancel and forget the operation under `key`.
    pub fn cancel_operation(&self, key: &str) {
        let weak = resilient_lock(&self.operations).remove(key);
        if let Some(weak) = weak {
            weak.cancel();
        }
    }

    /// Forget the operation under `key` without cancelling it.
    pub fn remove_operation(&self, key: &str) {
        resilient_lock(&self.operations).remove(key);
    }

    /// The live operation under `key`, if any.
    pub fn operation(&self, key: &str) -> Option<OperationHandle> {
        resilient_lock(&self.operations)
            .get(key)
            .and_then(WeakOperation::upgrade)
    }

    /// Cancel and forget everything.
    pub fn cancel_all(&self) {
        let all: Vec<WeakOperation> = resilient_lock(&self.operations)
            .drain()
            .map(|(_, weak)| weak)
            .collect();
        for weak in all {
            weak.cancel();
        }
    }

    /// Number of associations, including ones whose operation is gone.
    pub fn len(&self) -> usize {
        resilient_lock(&self.operations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
