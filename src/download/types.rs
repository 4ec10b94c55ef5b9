// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by the coordinator and its callers.

use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::WebImageResult;

/// Status of a single download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Waiting in a priority lane
    Queued,
    /// Transfer in flight
    Running,
    /// Finished, successfully or not
    Completed,
    /// Cancelled before it finished
    Cancelled,
}

impl DownloadStatus {
    /// Returns true once no further events will be produced.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Cancelled)
    }

    /// Returns true if the download is actively running.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Running)
    }
}

/// Priority lane for downloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DownloadPriority {
    /// Served after everything else
    Low = 0,
    /// Normal priority
    Normal = 1,
    /// Served first
    High = 2,
}

impl Default for DownloadPriority {
    fn default() -> Self {
        DownloadPriority::Normal
    }
}

impl DownloadPriority {
    /// Lanes in the order they are served.
    pub const SERVICE_ORDER: [DownloadPriority; 3] =
        [DownloadPriority::High, DownloadPriority::Normal, DownloadPriority::Low];

    pub(crate) fn lane(self) -> usize {
        match self {
            DownloadPriority::High => 0,
            DownloadPriority::Normal => 1,
            DownloadPriority::Low => 2,
        }
    }
}

/// Event produced by a download.
///
/// Zero or more `Progress` events are followed by exactly one `Finished`.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress {
        /// Bytes received so far
        received: u64,
        /// Content length announced by the server, if any
        expected: Option<u64>,
        /// The chunk just received (empty for the initial event)
        chunk: Bytes,
    },
    Finished(WebImageResult<Bytes>),
}

impl DownloadEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, DownloadEvent::Finished(_))
    }
}

/// Transfer rate tracking for progress display.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes received so far
    pub received: u64,
    /// Total size if the server announced it
    pub expected: Option<u64>,
    started: Instant,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            received: 0,
            expected: None,
            started: Instant::now(),
        }
    }

    /// Record a progress event.
    pub fn update(&mut self, received: u64, expected: Option<u64>) {
        self.received = received;
        if expected.is_some() {
            self.expected = expected;
        }
    }

    /// Progress percentage (0-100) if the total size is known.
    pub fn percent(&self) -> Option<f64> {
        self.expected.map(|total| {
            if total == 0 {
                0.0
            } else {
                (self.received as f64 / total as f64 * 100.0).min(100.0)
            }
        })
    }

    /// Average speed since the download started.
    pub fn speed_bps(&self) -> Option<u64> {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            Some((self.received as f64 / elapsed) as u64)
        } else {
            None
        }
    }

    /// Estimated seconds remaining.
    pub fn eta_seconds(&self) -> Option<u64> {
        let total = self.expected?;
        let speed = self.speed_bps().filter(|s| *s > 0)?;
        Some(total.saturating_sub(self.received) / speed)
    }

    /// Get formatted speed string.
    pub fn speed_string(&self) -> Option<String> {
        self.speed_bps().map(|bps| {
            if bps >= 1_048_576 {
                format!("{:.1} MB/s", bps as f64 / 1_048_576.0)
            } else if bps >= 1024 {
                format!("{:.1} KB/s", bps as f64 / 1024.0)
            } else {
                format!("{} B/s", bps)
            }
        })
    }

    /// Get formatted ETA string.
    pub fn eta_string(&self) -> Option<String> {
        self.eta_seconds().map(|secs| {
            if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        })
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
