// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for image loading.
//!
//! Every failure a caller can observe through a completion callback is a
//! [`WebImageError`]. Errors are `Clone` because a single download failure is
//! delivered, unchanged, to every caller joined on the same cache key.

use std::fmt;
use std::time::Duration;

/// Result alias used throughout the library.
pub type WebImageResult<T> = std::result::Result<T, WebImageError>;

/// Why a transport-level fetch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The fetch did not finish within the configured duration.
    Timeout(Duration),
    /// The server answered with a non-success status code.
    HttpStatus(u16),
    /// The connection could not be established or was reset.
    Connection(String),
    /// The body stream broke off mid-transfer.
    Body(String),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "timed out after {:.1}s", after.as_secs_f64()),
            Self::HttpStatus(code) => write!(f, "HTTP status {}", code),
            Self::Connection(msg) => write!(f, "connection failed: {}", msg),
            Self::Body(msg) => write!(f, "body read failed: {}", msg),
        }
    }
}

/// Errors surfaced to load callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebImageError {
    /// No registered codec recognised the bytes, or decoding failed.
    UnsupportedFormat(String),
    /// Connection, timeout or HTTP status error.
    TransportFailure(TransportFailure),
    /// The operation was cancelled before it produced a result.
    Cancelled,
    /// A previous failure for this locator suppresses new attempts.
    BlacklistedLocator(String),
    /// The locator could not be parsed.
    InvalidLocator(String),
    /// The cache-miss gate declined to download this locator.
    DownloadSkipped(String),
    /// Disk cache I/O failed.
    Cache(String),
}

impl WebImageError {
    /// Returns true for caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this failure belongs in the negative cache.
    ///
    /// Only failures that say something about the resource itself qualify.
    pub fn should_blacklist(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::UnsupportedFormat(_))
    }

    pub(crate) fn timeout(after: Duration) -> Self {
        Self::TransportFailure(TransportFailure::Timeout(after))
    }
}

impl fmt::Display for WebImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFormat(msg) => write!(f, "Unsupported image format: {}", msg),
            Self::TransportFailure(failure) => write!(f, "Download failed: {}", failure),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::BlacklistedLocator(locator) => {
                write!(f, "Locator previously failed and is blacklisted: {}", locator)
            }
            Self::InvalidLocator(msg) => write!(f, "Invalid image locator: {}", msg),
            Self::DownloadSkipped(locator) => write!(f, "Download declined for: {}", locator),
            Self::Cache(msg) => write!(f, "Cache error: {}", msg),
        }
    }
}

impl std::error::Error for WebImageError {}

impl From<TransportFailure> for WebImageError {
    fn from(failure: TransportFailure) -> Self {
        Self::TransportFailure(failure)
    }
}

impl From<reqwest::Error> for WebImageError {
    fn from(e: reqwest::Error) -> Self {
        let failure = if let Some(status) = e.status() {
            TransportFailure::HttpStatus(status.as_u16())
        } else if e.is_timeout() {
            TransportFailure::Timeout(Duration::ZERO)
        } else if e.is_body() || e.is_decode() {
            TransportFailure::Body(e.to_string())
        } else {
            TransportFailure::Connection(e.to_string())
        };
        Self::TransportFailure(failure)
    }
}

impl From<image::ImageError> for WebImageError {
    fn from(e: image::ImageError) -> Self {
        Self::UnsupportedFormat(e.to_string())
    }
}
