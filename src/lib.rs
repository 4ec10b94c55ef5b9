// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! webimg - asynchronous image loading library
//!
//! Memory first, disk next, network last.
//!
//! webimg fetches images by locator, decodes them through a pluggable codec
//! registry and keeps them in a two-tier cache:
//!
//! **Memory (LRU)** -> **Disk** -> **Network**
//!
//! Concurrent requests for the same cache key share one download.
//!
//! # Core Modules
//!
//! - [`manager`] - Load orchestration, cache keys, operation handles
//! - [`cache`] - Memory and disk tiers
//! - [`download`] - Priority download scheduling and the HTTP transport
//! - [`codec`] - Format sniffing and image codecs
//! - [`prefetch`] - Bounded-concurrency cache warming
//! - [`operations`] - Weak per-owner operation registry
//! - [`options`] - Per-load option flags
//! - [`config`] - Configuration file and defaults
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use webimg::{FetchOptions, WebImageManager};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = WebImageManager::shared()?;
//! let loaded = manager
//!     .load_image("https://example.com/cat.png", FetchOptions::empty())
//!     .await?;
//! println!("{}x{} from {}", loaded.image.width(), loaded.image.height(), loaded.origin.as_str());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod manager;
pub mod operations;
pub mod options;
pub mod prefetch;
pub mod sync;
pub mod types;

// Re-export commonly used types
pub use cache::{CacheStats, ImageCache};
pub use codec::{Codec, CodecRegistry, ImageFormat};
pub use config::WebImageConfig;
pub use download::{DownloadCoordinator, DownloadPriority, Transport};
pub use error::{TransportFailure, WebImageError, WebImageResult};
pub use manager::{
    strip_query_filter, CacheKeyFilter, DownloadGate, ImageTransform, OperationHandle,
    OperationState, WebImageManager,
};
pub use operations::OperationRegistry;
pub use options::FetchOptions;
pub use prefetch::Prefetcher;
pub use types::{CacheOrigin, Image, ImageFrame, ImageResponse, LoadedImage};
