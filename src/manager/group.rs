// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Callers joined onto one in-flight download.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use super::operation::{OperationHandle, OperationState};
use crate::download::DownloadCanceller;
use crate::options::FetchOptions;
use crate::types::{CacheOrigin, Image, ImageResponse};

/// `(received, expected)` byte counts.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Receives every result for a load; the last one has `finished == true`.
pub type CompletionCallback = Arc<dyn Fn(ImageResponse) + Send + Sync>;

/// What a `REFRESH_CACHED` load already delivered from the cache.
#[derive(Clone)]
pub(crate) struct CachedBaseline {
    pub image: Arc<Image>,
    pub data: Option<Bytes>,
    pub origin: CacheOrigin,
}

#[derive(Clone)]
pub(crate) struct Member {
    pub handle: OperationHandle,
    pub options: FetchOptions,
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: CompletionCallback,
    pub baseline: Option<CachedBaseline>,
}

impl Member {
    pub fn wants_progressive(&self) -> bool {
        self.options.contains(FetchOptions::PROGRESSIVE_DOWNLOAD)
    }

    pub fn progress(&self, received: u64, expected: Option<u64>) {
        if let (Some(on_progress), true) = (&self.on_progress, self.handle.is_active()) {
            on_progress(received, expected);
        }
    }

    /// Deliver a response. Terminal responses win the handle's terminal
    /// state first, so nothing reaches a cancelled caller.
    pub fn deliver(&self, response: ImageResponse) -> bool {
        if response.finished {
            let state = match &response.result {
                Ok(_) => OperationState::Completed,
                Err(e) if e.is_cancelled() => OperationState::Cancelled,
                Err(_) => OperationState::Failed,
            };
            if !self.handle.finish(state) {
                return false;
            }
        } else if !self.handle.is_active() {
            return false;
        }
        (self.on_complete)(response);
        true
    }
}

/// One download shared by every caller of the same cache key.
pub(crate) struct PendingGroup {
    pub id: u64,
    pub locator: Url,
    /// The creator's options drive priority, caching and decoding.
    pub options: FetchOptions,
    pub members: Vec<Member>,
    pub download: DownloadCanceller,
}

impl PendingGroup {
    pub fn retry_failed(&self) -> bool {
        self.members
            .iter()
            .any(|m| m.options.contains(FetchOptions::RETRY_FAILED))
    }

    /// Remove the member owning `handle_id`. Returns true if it was present.
    pub fn leave(&mut self, handle_id: u64) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.handle.id() != handle_id);
        self.members.len() != before
    }
}

/// Pending groups by cache key.
pub(crate) type GroupTable = HashMap<String, PendingGroup>;
