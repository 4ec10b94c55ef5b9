// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Negative cache of locators whose fetch failed.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::sync::resilient_lock;

/// Locators that failed and should not be retried without `RETRY_FAILED`.
#[derive(Debug, Default)]
pub struct FailedLocators {
    inner: Mutex<HashSet<String>>,
}

impl FailedLocators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, locator: &str) -> bool {
        resilient_lock(&self.inner).contains(locator)
    }

    /// Returns true if the locator was not already recorded.
    pub fn insert(&self, locator: &str) -> bool {
        let added = resilient_lock(&self.inner).insert(locator.to_string());
        if added {
            tracing::debug!("Blacklisted {}", locator);
        }
        added
    }

    pub fn remove(&self, locator: &str) -> bool {
        resilient_lock(&self.inner).remove(locator)
    }

    pub fn clear(&self) {
        resilient_lock(&self.inner).clear();
    }

    pub fn len(&self) -> usize {
        resilient_lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
