// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Image downloads.
//!
//! This module provides network retrieval with:
//! - Three priority lanes served high, normal, low (FIFO within a lane)
//! - A bound on concurrent transfers
//! - Cooperative cancellation and a per-fetch timeout
//! - A negative cache of locators that failed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐     ┌─────────────────┐
//! │ DownloadCoordinator │────▶│ run task (tokio)│
//! │ lanes: H | N | L    │     │ per download    │
//! └──────────┬──────────┘     └────────┬────────┘
//!            │                         │
//!            ▼                         ▼
//! ┌─────────────────────┐     ┌─────────────────┐
//! │ FailedLocators      │     │ Transport       │
//! │ (negative cache)    │     │ (HttpTransport) │
//! └─────────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use webimg::config::DownloadConfig;
//! use webimg::download::DownloadCoordinator;
//! use webimg::FetchOptions;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let coordinator = DownloadCoordinator::from_config(&DownloadConfig::default())?;
//! let url = url::Url::parse("https://example.com/cat.png")?;
//! let bytes = coordinator.fetch(url, FetchOptions::HIGH_PRIORITY).finish().await?;
//! println!("{} bytes", bytes.len());
//! # Ok(())
//! # }
//! ```

pub mod blacklist;
pub mod coordinator;
pub mod transport;
pub mod types;

pub use blacklist::FailedLocators;
pub use coordinator::{DownloadCanceller, DownloadCoordinator, DownloadOperation};
pub use transport::{HttpTransport, Transport, TransportRequest, TransportResponse};
pub use types::{DownloadEvent, DownloadPriority, DownloadProgress, DownloadStatus};
