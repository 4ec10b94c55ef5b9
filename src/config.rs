// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for the cache, downloader, prefetcher and decoders.
//!
//! Read from `~/.webimg/config.json` when present; every field has a default
//! so a partial file is fine.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::options::FetchOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebImageConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory tier budget in bytes of decoded pixels (0 = unbounded)
    #[serde(default = "default_memory_cost_limit")]
    pub memory_cost_limit: u64,
    /// Maximum memory tier entries (0 = unbounded)
    #[serde(default)]
    pub memory_count_limit: usize,
    /// Disk tier directory (defaults to the system cache dir)
    #[serde(default)]
    pub disk_path: Option<PathBuf>,
    /// Disk tier budget in bytes (0 = unbounded)
    #[serde(default)]
    pub disk_max_size: u64,
    /// Entries older than this are swept (0 = never expire)
    #[serde(default = "default_disk_max_age_secs")]
    pub disk_max_age_secs: u64,
    /// Background sweep period (0 = no background sweeps)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_memory_cost_limit() -> u64 {
    128 * 1024 * 1024
}

fn default_disk_max_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cost_limit: default_memory_cost_limit(),
            memory_count_limit: 0,
            disk_path: None,
            disk_max_size: 0,
            disk_max_age_secs: default_disk_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Extra request headers, sent in order
    #[serde(default = "default_headers")]
    pub headers: IndexMap<String, String>,
}

fn default_max_concurrent_downloads() -> usize {
    6
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    format!("webimg/{}", env!("CARGO_PKG_VERSION"))
}

fn default_headers() -> IndexMap<String, String> {
    let mut headers = IndexMap::new();
    headers.insert("Accept".to_string(), "image/*,*/*;q=0.8".to_string());
    headers
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            headers: default_headers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    #[serde(default = "default_prefetch_concurrency")]
    pub max_concurrent: usize,
    #[serde(default = "default_prefetch_options")]
    pub options: FetchOptions,
}

fn default_prefetch_concurrency() -> usize {
    3
}

fn default_prefetch_options() -> FetchOptions {
    FetchOptions::LOW_PRIORITY
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_prefetch_concurrency(),
            options: default_prefetch_options(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Register the animated GIF codec ahead of the still-image codec
    #[serde(default = "default_animated_gif")]
    pub animated_gif: bool,
    /// Pixel budget applied by `SCALE_DOWN_LARGE_IMAGES`
    #[serde(default = "default_scale_down_max_pixels")]
    pub scale_down_max_pixels: u64,
}

fn default_animated_gif() -> bool {
    true
}

fn default_scale_down_max_pixels() -> u64 {
    // 60 MB of RGBA
    60 * 1024 * 1024 / 4
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            animated_gif: default_animated_gif(),
            scale_down_max_pixels: default_scale_down_max_pixels(),
        }
    }
}

/// `~/.webimg`, created on demand.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(".webimg");
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
    }
    Ok(dir)
}

/// Load `~/.webimg/config.json`, or defaults if it does not exist.
pub fn load_config() -> Result<WebImageConfig> {
    load_config_from(&config_dir()?.join("config.json"))
}

pub fn load_config_from(path: &Path) -> Result<WebImageConfig> {
    if !path.exists() {
        return Ok(WebImageConfig::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
}

pub fn save_config(config: &WebImageConfig) -> Result<()> {
    save_config_to(config, &config_dir()?.join("config.json"))
}

pub fn save_config_to(config: &WebImageConfig, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: WebImageConfig =
            serde_json::from_str(r#"{ "download": { "timeout_secs": 3 } }"#).unwrap();
        assert_eq!(config.download.timeout_secs, 3);
        assert_eq!(config.download.max_concurrent_downloads, 6);
        assert_eq!(config.prefetch.max_concurrent, 3);
        assert_eq!(config.prefetch.options, FetchOptions::LOW_PRIORITY);
        assert!(config.decode.animated_gif);
        assert_eq!(config.download.headers.get("Accept").map(String::as_str), Some("image/*,*/*;q=0.8"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.cache.disk_max_age_secs, 7 * 24 * 60 * 60);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = WebImageConfig::default();
        config.cache.disk_max_size = 1024;
        config.prefetch.options = FetchOptions::LOW_PRIORITY | FetchOptions::RETRY_FAILED;
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.cache.disk_max_size, 1024);
        assert_eq!(loaded.prefetch.options, config.prefetch.options);
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
