// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Two-tier image cache facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::disk::{DiskStore, EvictionReport, FileDiskStore};
use super::memory::MemoryCache;
use crate::config::CacheConfig;
use crate::error::{WebImageError, WebImageResult};
use crate::types::{CacheOrigin, Image};

/// A cache hit. Memory hits carry the image, disk hits carry the bytes.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub image: Option<Arc<Image>>,
    pub data: Option<Bytes>,
    pub origin: CacheOrigin,
}

/// Hit/miss counters and memory tier occupancy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub memory_cost: u64,
    pub memory_cost_limit: u64,
}

impl CacheStats {
    /// Fraction of lookups served from either tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Memory tier in front of a durable disk tier.
///
/// Disk work runs on the blocking pool, off the async workers that drive
/// network transfers.
pub struct ImageCache {
    memory: MemoryCache,
    disk: Arc<dyn DiskStore>,
    disk_max_size: u64,
    disk_max_age: Duration,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

impl ImageCache {
    pub fn new(
        memory: MemoryCache,
        disk: Arc<dyn DiskStore>,
        disk_max_size: u64,
        disk_max_age: Duration,
    ) -> Self {
        Self {
            memory,
            disk,
            disk_max_size,
            disk_max_age,
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build from configuration, opening a [`FileDiskStore`].
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let path = config
            .disk_path
            .clone()
            .unwrap_or_else(FileDiskStore::default_path);
        let disk = FileDiskStore::new(path)?;
        Ok(Self::new(
            MemoryCache::new(config.memory_cost_limit, config.memory_count_limit),
            Arc::new(disk),
            config.disk_max_size,
            Duration::from_secs(config.disk_max_age_secs),
        ))
    }

    async fn run_disk<T, F>(&self, op: F) -> WebImageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DiskStore) -> Result<T> + Send + 'static,
    {
        let disk = Arc::clone(&self.disk);
        tokio::task::spawn_blocking(move || op(disk.as_ref()))
            .await
            .map_err(|e| WebImageError::Cache(format!("disk task failed: {}", e)))?
            .map_err(|e| WebImageError::Cache(format!("{:#}", e)))
    }

    /// Memory first, then disk. Never waits on an eviction sweep.
    pub async fn lookup(&self, key: &str) -> Option<CachedEntry> {
        if let Some(image) = self.memory.get(key) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Memory cache hit for {}", key);
            return Some(CachedEntry {
                image: Some(image),
                data: None,
                origin: CacheOrigin::Memory,
            });
        }

        match self.disk_data(key).await {
            Some(data) => {
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Disk cache hit for {} ({} bytes)", key, data.len());
                Some(CachedEntry {
                    image: None,
                    data: Some(data),
                    origin: CacheOrigin::Disk,
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache miss for {}", key);
                None
            }
        }
    }

    /// Raw bytes from the disk tier. Read errors count as a miss.
    pub async fn disk_data(&self, key: &str) -> Option<Bytes> {
        let owned = key.to_string();
        match self.run_disk(move |disk| disk.get(&owned)).await {
            Ok(data) => data.map(Bytes::from),
            Err(e) => {
                tracing::warn!("Disk cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Store into memory and, when `to_disk` and bytes are given, into disk.
    pub async fn store(
        &self,
        key: &str,
        image: Arc<Image>,
        data: Option<Bytes>,
        to_disk: bool,
    ) -> WebImageResult<()> {
        self.memory.insert(key, image);
        match data {
            Some(data) if to_disk => self.store_data(key, data).await,
            _ => Ok(()),
        }
    }

    pub fn store_memory(&self, key: &str, image: Arc<Image>) {
        self.memory.insert(key, image);
    }

    /// Write encoded bytes to the disk tier only.
    pub async fn store_data(&self, key: &str, data: Bytes) -> WebImageResult<()> {
        let owned = key.to_string();
        self.run_disk(move |disk| disk.put(&owned, &data)).await
    }

    /// Remove from both tiers.
    pub async fn remove(&self, key: &str) -> WebImageResult<()> {
        self.memory.remove(key);
        let owned = key.to_string();
        self.run_disk(move |disk| disk.remove(&owned)).await
    }

    /// Whether the disk tier holds `key`, without reading or decoding it.
    pub async fn contains_disk(&self, key: &str) -> bool {
        let owned = key.to_string();
        self.run_disk(move |disk| Ok(disk.contains(&owned)))
            .await
            .unwrap_or(false)
    }

    pub fn contains_memory(&self, key: &str) -> bool {
        self.memory.contains(key)
    }

    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    pub async fn clear_disk(&self) -> WebImageResult<()> {
        self.run_disk(|disk| disk.clear()).await
    }

    /// Run one eviction sweep with the configured size and age bounds.
    pub async fn sweep_disk(&self) -> WebImageResult<EvictionReport> {
        let (max_size, max_age) = (self.disk_max_size, self.disk_max_age);
        let report = self.run_disk(move |disk| disk.evict(max_size, max_age)).await?;
        tracing::info!(
            "Disk sweep removed {} expired and {} oversize entries ({} bytes freed, {} remaining)",
            report.expired_removed,
            report.oversize_removed,
            report.bytes_freed,
            report.bytes_remaining
        );
        Ok(report)
    }

    /// Sweep the disk tier every `interval` in the background.
    ///
    /// The task holds only a weak reference and exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = cache.sweep_disk().await {
                    tracing::warn!("Background disk sweep failed: {}", e);
                }
            }
        })
    }

    pub async fn disk_size(&self) -> u64 {
        self.run_disk(|disk| Ok(disk.total_size())).await.unwrap_or(0)
    }

    pub async fn disk_count(&self) -> usize {
        self.run_disk(|disk| Ok(disk.count())).await.unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
            memory_cost: self.memory.total_cost(),
            memory_cost_limit: self.memory.cost_limit(),
        }
    }
}
