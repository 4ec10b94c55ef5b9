// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: an in-process transport and a manager wired to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use image::codecs::gif::GifEncoder;
use image::{Delay, DynamicImage, Frame, RgbImage, RgbaImage};
use tempfile::TempDir;
use tokio::sync::mpsc;

use webimg::cache::{FileDiskStore, ImageCache, MemoryCache};
use webimg::config::DownloadConfig;
use webimg::download::{DownloadCoordinator, Transport, TransportRequest, TransportResponse};
use webimg::{ImageResponse, TransportFailure, WebImageManager, WebImageResult};

pub const BASE: &str = "https://img.test";

pub fn url(path: &str) -> String {
    format!("{}{}", BASE, path)
}

#[derive(Clone)]
enum Route {
    /// Body split into this many chunks.
    Body(Bytes, usize),
    Status(u16),
    Hang,
}

/// Serves registered paths after a fixed delay. Unknown paths answer 404.
pub struct MockTransport {
    delay: Duration,
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockTransport {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn serve(&self, path: &str, body: Bytes) {
        self.serve_chunked(path, body, 2);
    }

    pub fn serve_chunked(&self, path: &str, body: Bytes, chunks: usize) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Route::Body(body, chunks.max(1)));
    }

    pub fn fail(&self, path: &str, status: u16) {
        self.routes.lock().unwrap().insert(path.to_string(), Route::Status(status));
    }

    pub fn hang(&self, path: &str) {
        self.routes.lock().unwrap().insert(path.to_string(), Route::Hang);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests_for(&self, path: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|p| *p == path).count()
    }

    /// Highest number of requests in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, request: &TransportRequest) -> WebImageResult<TransportResponse> {
        let path = request.locator.path().to_string();
        self.requests.lock().unwrap().push(path.clone());
        let route = self.routes.lock().unwrap().get(&path).cloned();

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = match route {
            Some(Route::Hang) => Duration::from_secs(60),
            _ => self.delay,
        };
        tokio::time::sleep(delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        match route {
            Some(Route::Body(body, count)) => {
                let size = body.len().div_ceil(count).max(1);
                let chunks: Vec<WebImageResult<Bytes>> = (0..body.len())
                    .step_by(size)
                    .map(|start| Ok(body.slice(start..(start + size).min(body.len()))))
                    .collect();
                Ok(TransportResponse {
                    expected_len: Some(body.len() as u64),
                    body: stream::iter(chunks).boxed(),
                })
            }
            Some(Route::Status(code)) => Err(TransportFailure::HttpStatus(code).into()),
            Some(Route::Hang) | None => Err(TransportFailure::HttpStatus(404).into()),
        }
    }
}

pub struct Harness {
    pub manager: WebImageManager,
    pub transport: Arc<MockTransport>,
    pub dir: TempDir,
}

pub fn harness(delay: Duration) -> Harness {
    harness_with(delay, DownloadConfig::default())
}

pub fn harness_with(delay: Duration, download: DownloadConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let disk = FileDiskStore::new(dir.path()).unwrap();
    let cache = Arc::new(ImageCache::new(
        MemoryCache::new(0, 0),
        Arc::new(disk),
        0,
        Duration::ZERO,
    ));
    let transport = MockTransport::new(delay);
    let downloader = DownloadCoordinator::new(transport.clone(), &download);
    Harness {
        manager: WebImageManager::new(cache, downloader),
        transport,
        dir,
    }
}

fn encode(image: DynamicImage, format: image::ImageFormat) -> Bytes {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, format).unwrap();
    Bytes::from(buffer.into_inner())
}

pub fn png(width: u32, height: u32) -> Bytes {
    let pixels = RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 255]));
    encode(DynamicImage::ImageRgba8(pixels), image::ImageFormat::Png)
}

/// Pixel noise, so the encoded size tracks the pixel count.
pub fn noisy_png(width: u32, height: u32) -> Bytes {
    let mut seed: u32 = 0x2545_f491;
    let pixels = RgbaImage::from_fn(width, height, |_, _| {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let [r, g, b, _] = seed.to_le_bytes();
        image::Rgba([r, g, b, 255])
    });
    encode(DynamicImage::ImageRgba8(pixels), image::ImageFormat::Png)
}

pub fn jpeg(width: u32, height: u32) -> Bytes {
    let pixels = RgbImage::from_pixel(width, height, image::Rgb([40, 200, 40]));
    encode(DynamicImage::ImageRgb8(pixels), image::ImageFormat::Jpeg)
}

pub fn gif(width: u32, height: u32) -> Bytes {
    let pixels = RgbaImage::from_pixel(width, height, image::Rgba([40, 40, 200, 255]));
    encode(DynamicImage::ImageRgba8(pixels), image::ImageFormat::Gif)
}

/// Two-frame GIF with 100 ms frames.
pub fn animated_gif(width: u32, height: u32) -> Bytes {
    let colors = [image::Rgba([200, 40, 40, 255]), image::Rgba([40, 40, 200, 255])];
    let frames = colors.into_iter().map(|color| {
        Frame::from_parts(
            RgbaImage::from_pixel(width, height, color),
            0,
            0,
            Delay::from_numer_denom_ms(100, 1),
        )
    });
    let mut buffer = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buffer);
        encoder.encode_frames(frames).unwrap();
    }
    Bytes::from(buffer)
}

pub fn tiff(width: u32, height: u32) -> Bytes {
    let pixels = RgbaImage::from_pixel(width, height, image::Rgba([90, 90, 90, 255]));
    encode(DynamicImage::ImageRgba8(pixels), image::ImageFormat::Tiff)
}

/// A completion callback that forwards every response to a channel.
pub fn collector() -> (
    impl Fn(ImageResponse) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<ImageResponse>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |response: ImageResponse| {
            let _ = tx.send(response);
        },
        rx,
    )
}

/// Wait for the next response, failing the test after five seconds.
pub async fn next_response(rx: &mut mpsc::UnboundedReceiver<ImageResponse>) -> ImageResponse {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("callback dropped without a final response")
}
