// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Two-tier image cache.
//!
//! ```text
//! ┌─────────────────┐  miss  ┌─────────────────┐
//! │ MemoryCache     │───────▶│ DiskStore       │
//! │ (LRU, by cost)  │        │ (file per key)  │
//! └─────────────────┘        └────────┬────────┘
//!                                     │ background
//!                                     ▼
//!                            ┌─────────────────┐
//!                            │ evict(size,age) │
//!                            └─────────────────┘
//! ```
//!
//! The memory tier is the latency accelerator; the disk tier is the durable
//! record. [`ImageCache`] presents both behind one key space.

pub mod disk;
pub mod memory;
pub mod store;

pub use disk::{DiskStore, EvictionReport, FileDiskStore};
pub use memory::MemoryCache;
pub use store::{CacheStats, CachedEntry, ImageCache};
