// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Web image manager: the fetch/cache orchestration engine.
//!
//! ```text
//! load(locator) ──▶ key ──▶ ImageCache::lookup ──hit──▶ on_complete
//!                                │ miss
//!                                ▼
//!                     pending group for key ──exists──▶ join
//!                                │ new
//!                                ▼
//!                  DownloadCoordinator::fetch ──▶ driver task
//!                                                  │ decode, transform, store
//!                                                  ▼
//!                                      every member's on_complete
//! ```
//!
//! At most one download is in flight per cache key. Everyone who asks for
//! that key meanwhile joins its group and receives the same result.

pub mod group;
pub mod key;
pub mod operation;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::sync::oneshot;
use url::Url;

pub use group::{CompletionCallback, ProgressCallback};
pub use key::{cache_key, parse_locator, strip_query_filter, CacheKeyFilter};
pub use operation::{OperationHandle, OperationState, WeakOperation};

use self::group::{CachedBaseline, GroupTable, Member, PendingGroup};
use crate::cache::ImageCache;
use crate::codec::{CodecRegistry, IncrementalDecoder};
use crate::config::{load_config, WebImageConfig};
use crate::download::{DownloadCoordinator, DownloadEvent, DownloadOperation};
use crate::error::{WebImageError, WebImageResult};
use crate::options::FetchOptions;
use crate::sync::{resilient_lock, resilient_read, resilient_write};
use crate::types::{CacheOrigin, Image, ImageResponse, LoadedImage};

/// Bytes needed before a progressive decoder can be chosen.
const SNIFF_LEN: usize = 16;

/// Cache-miss gate: return false to skip the download.
pub type DownloadGate = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// Applied to freshly downloaded images before they are cached.
pub type ImageTransform = Arc<dyn Fn(Image, &Url) -> Image + Send + Sync>;

static SHARED: OnceCell<WebImageManager> = OnceCell::new();

async fn blocking<T, F>(work: F) -> WebImageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> WebImageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WebImageError::Cache(format!("blocking task failed: {}", e)))?
}

struct ManagerInner {
    cache: Arc<ImageCache>,
    downloader: DownloadCoordinator,
    codecs: Arc<CodecRegistry>,
    scale_down_max_pixels: AtomicU64,
    key_filter: RwLock<Option<CacheKeyFilter>>,
    gate: RwLock<Option<DownloadGate>>,
    transform: RwLock<Option<ImageTransform>>,
    groups: Mutex<GroupTable>,
    active: Mutex<HashMap<u64, OperationHandle>>,
    next_group_id: AtomicU64,
}

/// Loads images through the cache and the downloader.
///
/// Cheap to clone. Loads must be started from inside a tokio runtime.
#[derive(Clone)]
pub struct WebImageManager {
    inner: Arc<ManagerInner>,
}

impl WebImageManager {
    /// Manager with the default codecs.
    pub fn new(cache: Arc<ImageCache>, downloader: DownloadCoordinator) -> Self {
        Self::with_codecs(cache, downloader, Arc::new(CodecRegistry::default()))
    }

    pub fn with_codecs(
        cache: Arc<ImageCache>,
        downloader: DownloadCoordinator,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                downloader,
                codecs,
                scale_down_max_pixels: AtomicU64::new(
                    crate::config::DecodeConfig::default().scale_down_max_pixels,
                ),
                key_filter: RwLock::new(None),
                gate: RwLock::new(None),
                transform: RwLock::new(None),
                groups: Mutex::new(GroupTable::new()),
                active: Mutex::new(HashMap::new()),
                next_group_id: AtomicU64::new(1),
            }),
        }
    }

    /// Build everything from configuration.
    ///
    /// Starts the background disk sweeper when called inside a runtime.
    pub fn from_config(config: &WebImageConfig) -> anyhow::Result<Self> {
        let cache = Arc::new(ImageCache::from_config(&config.cache)?);
        if config.cache.sweep_interval_secs > 0 && tokio::runtime::Handle::try_current().is_ok() {
            cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));
        }
        let downloader = DownloadCoordinator::from_config(&config.download)?;
        let codecs = Arc::new(CodecRegistry::with_defaults(config.decode.animated_gif));
        let manager = Self::with_codecs(cache, downloader, codecs);
        manager.set_scale_down_max_pixels(config.decode.scale_down_max_pixels);
        Ok(manager)
    }

    /// Process-wide instance built from `~/.webimg/config.json` on first use.
    pub fn shared() -> anyhow::Result<&'static WebImageManager> {
        SHARED.get_or_try_init(|| {
            let config = load_config()?;
            Self::from_config(&config)
        })
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.inner.cache
    }

    pub fn downloader(&self) -> &DownloadCoordinator {
        &self.inner.downloader
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    pub fn set_cache_key_filter(&self, filter: Option<CacheKeyFilter>) {
        *resilient_write(&self.inner.key_filter) = filter;
    }

    pub fn set_download_gate(&self, gate: Option<DownloadGate>) {
        *resilient_write(&self.inner.gate) = gate;
    }

    pub fn set_transform(&self, transform: Option<ImageTransform>) {
        *resilient_write(&self.inner.transform) = transform;
    }

    /// Pixel budget for `SCALE_DOWN_LARGE_IMAGES`.
    pub fn set_scale_down_max_pixels(&self, max_pixels: u64) {
        self.inner
            .scale_down_max_pixels
            .store(max_pixels, Ordering::Relaxed);
    }

    pub fn cache_key_for(&self, locator: &str) -> String {
        self.inner.cache_key(locator)
    }

    /// Start a load.
    ///
    /// `on_complete` receives every result: an interim cached hit under
    /// `REFRESH_CACHED`, partial images under `PROGRESSIVE_DOWNLOAD`, and
    /// exactly one response with `finished == true` unless the handle is
    /// cancelled first. Callbacks run on runtime tasks, never under a lock.
    pub fn load<C>(
        &self,
        locator: &str,
        options: FetchOptions,
        on_progress: Option<ProgressCallback>,
        on_complete: C,
    ) -> OperationHandle
    where
        C: Fn(ImageResponse) + Send + Sync + 'static,
    {
        let handle = OperationHandle::new(locator);
        let member = Member {
            handle: handle.clone(),
            options,
            on_progress,
            on_complete: Arc::new(on_complete),
            baseline: None,
        };

        let url = match parse_locator(locator) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Rejected locator {:?}: {}", locator, e);
                tokio::spawn(async move {
                    member.handle.start();
                    ManagerInner::deliver_terminal(&member, Err(e));
                });
                return handle;
            }
        };
        let key = self.inner.cache_key(locator);

        resilient_lock(&self.inner.active).insert(handle.id(), handle.clone());
        let weak = Arc::downgrade(&self.inner);
        let hook_key = key.clone();
        let id = handle.id();
        handle.set_cancel_hook(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.leave(&hook_key, id);
            }
        }));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.start(url, key, member).await });
        handle
    }

    /// Load and wait for the final result.
    pub async fn load_image(&self, locator: &str, options: FetchOptions) -> WebImageResult<LoadedImage> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _handle = self.load(locator, options, None, move |response: ImageResponse| {
            if response.finished {
                if let Some(tx) = resilient_lock(&tx).take() {
                    let _ = tx.send(response.result);
                }
            }
        });
        rx.await.unwrap_or(Err(WebImageError::Cancelled))
    }

    /// Cancel every outstanding load.
    pub fn cancel_all(&self) {
        let handles: Vec<OperationHandle> =
            resilient_lock(&self.inner.active).values().cloned().collect();
        if !handles.is_empty() {
            tracing::info!("Cancelling {} loads", handles.len());
        }
        for handle in handles {
            handle.cancel();
        }
    }

    /// Whether any load is still outstanding.
    pub fn is_running(&self) -> bool {
        !resilient_lock(&self.inner.active).is_empty()
    }

    pub fn running_count(&self) -> usize {
        resilient_lock(&self.inner.active).len()
    }

    /// Encode `image` and store it under `locator`'s key in both tiers.
    pub async fn save_image_to_cache(&self, image: Arc<Image>, locator: &str) -> WebImageResult<()> {
        let key = self.cache_key_for(locator);
        let codecs = Arc::clone(&self.inner.codecs);
        let source = Arc::clone(&image);
        let data = blocking(move || codecs.encode(&source, source.format())).await?;
        self.inner.cache.store(&key, image, Some(data), true).await
    }

    /// In memory or on disk, without decoding.
    pub async fn cached_image_exists(&self, locator: &str) -> bool {
        let key = self.cache_key_for(locator);
        self.inner.cache.contains_memory(&key) || self.inner.cache.contains_disk(&key).await
    }

    pub async fn disk_image_exists(&self, locator: &str) -> bool {
        let key = self.cache_key_for(locator);
        self.inner.cache.contains_disk(&key).await
    }
}

impl std::fmt::Debug for WebImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebImageManager")
            .field("running", &self.running_count())
            .field("codecs", &self.inner.codecs)
            .field("downloader", &self.inner.downloader)
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    fn cache_key(&self, locator: &str) -> String {
        let filter = resilient_read(&self.key_filter).clone();
        cache_key(locator, filter.as_ref())
    }

    fn forget(&self, handle_id: u64) {
        resilient_lock(&self.active).remove(&handle_id);
    }

    fn deliver_terminal(member: &Member, result: WebImageResult<LoadedImage>) {
        member.deliver(ImageResponse {
            locator: member.handle.locator().to_string(),
            result,
            finished: true,
        });
    }

    fn finish_member(&self, member: &Member, result: WebImageResult<LoadedImage>) {
        Self::deliver_terminal(member, result);
        self.forget(member.handle.id());
    }

    /// Cancel hook: drop the caller from its group, and the download with
    /// the last caller.
    fn leave(&self, key: &str, handle_id: u64) {
        self.forget(handle_id);
        let orphaned = {
            let mut groups = resilient_lock(&self.groups);
            let emptied = match groups.get_mut(key) {
                Some(group) => group.leave(handle_id) && group.members.is_empty(),
                None => false,
            };
            if emptied {
                groups.remove(key)
            } else {
                None
            }
        };
        if let Some(group) = orphaned {
            tracing::debug!("Last caller left {}; cancelling download", key);
            group.download.cancel();
        }
    }

    async fn start(self: Arc<Self>, url: Url, key: String, mut member: Member) {
        if !member.handle.start() {
            return;
        }
        let options = member.options;

        if !options.contains(FetchOptions::RETRY_FAILED)
            && self.downloader.failed_locators().contains(url.as_str())
        {
            tracing::debug!("Skipping blacklisted {}", url);
            self.finish_member(&member, Err(WebImageError::BlacklistedLocator(url.to_string())));
            return;
        }

        if !options.contains(FetchOptions::IGNORE_CACHE) {
            if let Some(hit) = self.cached(&key, options).await {
                let loaded = LoadedImage {
                    image: Arc::clone(&hit.image),
                    data: hit.data.clone(),
                    origin: hit.origin,
                };
                if !options.contains(FetchOptions::REFRESH_CACHED) {
                    self.finish_member(&member, Ok(loaded));
                    return;
                }
                member.deliver(ImageResponse {
                    locator: member.handle.locator().to_string(),
                    result: Ok(loaded),
                    finished: false,
                });
                member.baseline = Some(hit);
            }
        }

        if member.handle.is_cancelled() {
            return;
        }

        let gate = resilient_read(&self.gate).clone();
        if let Some(gate) = gate {
            if !gate(&url) {
                tracing::debug!("Download gate declined {}", url);
                let result = match member.baseline.take() {
                    Some(hit) => Ok(LoadedImage {
                        image: hit.image,
                        data: hit.data,
                        origin: hit.origin,
                    }),
                    None => Err(WebImageError::DownloadSkipped(url.to_string())),
                };
                self.finish_member(&member, result);
                return;
            }
        }

        self.join_or_fetch(url, key, member);
    }

    /// Cache lookup, decoding disk hits off the async workers.
    async fn cached(&self, key: &str, options: FetchOptions) -> Option<CachedBaseline> {
        let entry = self.cache.lookup(key).await?;
        if let Some(image) = entry.image {
            // Refreshes compare against the stored bytes.
            let data = if options.contains(FetchOptions::REFRESH_CACHED) {
                self.cache.disk_data(key).await
            } else {
                None
            };
            return Some(CachedBaseline {
                image,
                data,
                origin: entry.origin,
            });
        }

        let data = entry.data?;
        match self.decode(data.clone(), options).await {
            Ok(image) => {
                let image = Arc::new(image);
                self.cache.store_memory(key, Arc::clone(&image));
                Some(CachedBaseline {
                    image,
                    data: Some(data),
                    origin: entry.origin,
                })
            }
            Err(e) => {
                tracing::warn!("Discarding undecodable disk entry for {}: {}", key, e);
                if let Err(e) = self.cache.remove(key).await {
                    tracing::warn!("Failed to remove {} from cache: {}", key, e);
                }
                None
            }
        }
    }

    async fn decode(&self, data: Bytes, options: FetchOptions) -> WebImageResult<Image> {
        let codecs = Arc::clone(&self.codecs);
        let scale_down = options.contains(FetchOptions::SCALE_DOWN_LARGE_IMAGES)
            && !options.contains(FetchOptions::PROGRESSIVE_DOWNLOAD);
        let max_pixels = self.scale_down_max_pixels.load(Ordering::Relaxed);
        blocking(move || {
            let image = codecs.decode(&data)?;
            Ok(if scale_down { image.scale_down(max_pixels) } else { image })
        })
        .await
    }

    fn join_or_fetch(self: &Arc<Self>, url: Url, key: String, member: Member) {
        let mut groups = resilient_lock(&self.groups);
        // Checked under the table lock so the cancel hook cannot miss us.
        if member.handle.is_cancelled() {
            return;
        }
        if let Some(group) = groups.get_mut(&key) {
            tracing::debug!("Joining in-flight download for {}", key);
            group.members.push(member);
            return;
        }

        let options = member.options;
        let download = self.downloader.fetch(url.clone(), options);
        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        groups.insert(
            key.clone(),
            PendingGroup {
                id,
                locator: url,
                options,
                members: vec![member],
                download: download.canceller(),
            },
        );
        drop(groups);

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drive(key, id, download).await });
    }

    fn members_of(&self, key: &str, group_id: u64) -> Vec<Member> {
        match resilient_lock(&self.groups).get(key) {
            Some(group) if group.id == group_id => group.members.clone(),
            _ => Vec::new(),
        }
    }

    /// One driver per group, so every member sees the same event order.
    async fn drive(self: Arc<Self>, key: String, group_id: u64, mut download: DownloadOperation) {
        let mut progressive = ProgressiveDecode::default();
        while let Some(event) = download.next_event().await {
            match event {
                DownloadEvent::Progress {
                    received,
                    expected,
                    chunk,
                } => {
                    let members = self.members_of(&key, group_id);
                    for member in &members {
                        member.progress(received, expected);
                    }
                    if chunk.is_empty() || !members.iter().any(Member::wants_progressive) {
                        continue;
                    }
                    if let Some(partial) = progressive.feed(&self.codecs, chunk).await {
                        let partial = Arc::new(partial);
                        for member in members.iter().filter(|m| m.wants_progressive()) {
                            member.deliver(ImageResponse {
                                locator: member.handle.locator().to_string(),
                                result: Ok(LoadedImage {
                                    image: Arc::clone(&partial),
                                    data: None,
                                    origin: CacheOrigin::Network,
                                }),
                                finished: false,
                            });
                        }
                    }
                }
                DownloadEvent::Finished(result) => {
                    self.complete(&key, group_id, result).await;
                    return;
                }
            }
        }
    }

    async fn complete(&self, key: &str, group_id: u64, result: WebImageResult<Bytes>) {
        let context = match resilient_lock(&self.groups).get(key) {
            Some(group) if group.id == group_id => Some((group.locator.clone(), group.options)),
            _ => None,
        };
        // Every caller left; nobody to tell.
        let Some((locator, options)) = context else {
            return;
        };

        let outcome = match result {
            Ok(data) => self.process(key, &locator, options, data).await,
            Err(e) => Err(e),
        };

        let group = {
            let mut groups = resilient_lock(&self.groups);
            if groups.get(key).is_some_and(|g| g.id == group_id) {
                groups.remove(key)
            } else {
                None
            }
        };
        let Some(group) = group else {
            return;
        };

        if let Err(e) = &outcome {
            let failed = self.downloader.failed_locators();
            if group.options.contains(FetchOptions::RETRY_FAILED) || group.retry_failed() {
                failed.remove(locator.as_str());
            } else if matches!(e, WebImageError::UnsupportedFormat(_)) {
                failed.insert(locator.as_str());
            }
        }

        for member in &group.members {
            let result = match &outcome {
                Ok((image, data)) => Ok(Self::network_result(member, image, data)),
                Err(e) => Err(e.clone()),
            };
            self.finish_member(member, result);
        }
    }

    /// A refresh that fetched the bytes already cached reports the cached hit.
    fn network_result(member: &Member, image: &Arc<Image>, data: &Bytes) -> LoadedImage {
        match &member.baseline {
            Some(hit) if hit.data.as_ref() == Some(data) => LoadedImage {
                image: Arc::clone(&hit.image),
                data: hit.data.clone(),
                origin: hit.origin,
            },
            _ => LoadedImage {
                image: Arc::clone(image),
                data: Some(data.clone()),
                origin: CacheOrigin::Network,
            },
        }
    }

    /// Decode, transform and store a download.
    async fn process(
        &self,
        key: &str,
        locator: &Url,
        options: FetchOptions,
        data: Bytes,
    ) -> WebImageResult<(Arc<Image>, Bytes)> {
        let image = self.decode(data.clone(), options).await?;

        let transform = resilient_read(&self.transform).clone();
        let (image, data) = match transform {
            Some(transform)
                if !image.is_animated() || options.contains(FetchOptions::TRANSFORM_ANIMATED_IMAGE) =>
            {
                let codecs = Arc::clone(&self.codecs);
                let locator = locator.clone();
                let original = data;
                blocking(move || {
                    let transformed = transform(image, &locator);
                    match codecs.encode(&transformed, transformed.format()) {
                        Ok(encoded) => Ok((transformed, encoded)),
                        Err(e) => {
                            tracing::warn!("Could not encode transformed {}: {}", locator, e);
                            Ok((transformed, original))
                        }
                    }
                })
                .await?
            }
            _ => (image, data),
        };

        let image = Arc::new(image);
        let to_disk = !options.contains(FetchOptions::CACHE_MEMORY_ONLY);
        if let Err(e) = self
            .cache
            .store(key, Arc::clone(&image), Some(data.clone()), to_disk)
            .await
        {
            tracing::warn!("Failed to cache {}: {}", key, e);
        }
        Ok((image, data))
    }
}

/// Incremental decode state for one download.
#[derive(Default)]
struct ProgressiveDecode {
    head: Vec<u8>,
    decoder: Option<Box<dyn IncrementalDecoder>>,
    unsupported: bool,
}

impl ProgressiveDecode {
    async fn feed(&mut self, codecs: &CodecRegistry, chunk: Bytes) -> Option<Image> {
        if self.unsupported {
            return None;
        }
        let (mut decoder, input) = match self.decoder.take() {
            Some(decoder) => (decoder, chunk.to_vec()),
            None => {
                self.head.extend_from_slice(&chunk);
                if self.head.len() < SNIFF_LEN {
                    return None;
                }
                match codecs.incremental_decoder_for(&self.head) {
                    Some(decoder) => (decoder, std::mem::take(&mut self.head)),
                    None => {
                        self.unsupported = true;
                        return None;
                    }
                }
            }
        };

        let decoded = tokio::task::spawn_blocking(move || {
            let partial = decoder.append(&input, false);
            (decoder, partial)
        })
        .await;
        match decoded {
            Ok((decoder, partial)) => {
                self.decoder = Some(decoder);
                partial
            }
            Err(_) => {
                self.unsupported = true;
                None
            }
        }
    }
}
