// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types shared across the cache, codecs and manager.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::codec::ImageFormat;
use crate::error::WebImageError;

/// One frame of a decoded image.
#[derive(Debug, Clone)]
pub struct ImageFrame {
    pub pixels: RgbaImage,
    /// Display duration; zero for still images.
    pub delay: Duration,
}

/// A decoded image, still or animated.
#[derive(Debug, Clone)]
pub struct Image {
    format: ImageFormat,
    frames: Arc<Vec<ImageFrame>>,
}

impl Image {
    /// Wrap a single still frame.
    pub fn still(format: ImageFormat, pixels: RgbaImage) -> Self {
        Self {
            format,
            frames: Arc::new(vec![ImageFrame {
                pixels,
                delay: Duration::ZERO,
            }]),
        }
    }

    /// Build from decoded frames. Returns `None` for an empty frame list.
    pub fn animated(format: ImageFormat, frames: Vec<ImageFrame>) -> Option<Self> {
        if frames.is_empty() {
            return None;
        }
        Some(Self {
            format,
            frames: Arc::new(frames),
        })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn frames(&self) -> &[ImageFrame] {
        &self.frames
    }

    /// The first frame, used as the poster for animated images.
    pub fn first_frame(&self) -> &RgbaImage {
        &self.frames[0].pixels
    }

    pub fn width(&self) -> u32 {
        self.first_frame().width()
    }

    pub fn height(&self) -> u32 {
        self.first_frame().height()
    }

    pub fn is_animated(&self) -> bool {
        self.frames.len() > 1
    }

    /// Whether any pixel of the first frame is not fully opaque.
    pub fn has_alpha(&self) -> bool {
        self.first_frame().pixels().any(|p| p.0[3] != u8::MAX)
    }

    /// Total animation length.
    pub fn duration(&self) -> Duration {
        self.frames.iter().map(|f| f.delay).sum()
    }

    /// Memory cost in bytes of the decoded pixels across all frames.
    pub fn cost(&self) -> u64 {
        self.frames
            .iter()
            .map(|f| f.pixels.width() as u64 * f.pixels.height() as u64 * 4)
            .sum()
    }

    /// Shrink every frame so width*height stays within `max_pixels`.
    ///
    /// Returns the image unchanged when it already fits.
    pub fn scale_down(self, max_pixels: u64) -> Self {
        let (w, h) = (self.width() as u64, self.height() as u64);
        if max_pixels == 0 || w * h <= max_pixels {
            return self;
        }
        let ratio = (max_pixels as f64 / (w * h) as f64).sqrt();
        let new_w = ((w as f64 * ratio).floor() as u32).max(1);
        let new_h = ((h as f64 * ratio).floor() as u32).max(1);
        tracing::debug!("Scaling image down from {}x{} to {}x{}", w, h, new_w, new_h);

        let frames = self
            .frames
            .iter()
            .map(|f| ImageFrame {
                pixels: imageops::resize(&f.pixels, new_w, new_h, FilterType::Triangle),
                delay: f.delay,
            })
            .collect();
        Self {
            format: self.format,
            frames: Arc::new(frames),
        }
    }
}

/// Where a load result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheOrigin {
    /// Not cached (failures, or results not originating anywhere).
    None,
    /// Memory tier
    Memory,
    /// Disk tier
    Disk,
    /// Fresh download
    Network,
}

impl CacheOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
        }
    }
}

/// A successfully loaded image.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub image: Arc<Image>,
    /// Raw encoded bytes, when they were at hand (disk hits and downloads).
    pub data: Option<Bytes>,
    pub origin: CacheOrigin,
}

/// What a completion callback receives.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub locator: String,
    pub result: Result<LoadedImage, WebImageError>,
    /// False for interim deliveries (progressive partials, refresh-cached hits).
    pub finished: bool,
}

impl ImageResponse {
    pub fn image(&self) -> Option<&Arc<Image>> {
        self.result.as_ref().ok().map(|loaded| &loaded.image)
    }

    pub fn error(&self) -> Option<&WebImageError> {
        self.result.as_ref().err()
    }

    /// Origin of the image, `CacheOrigin::None` on failure.
    pub fn origin(&self) -> CacheOrigin {
        self.result
            .as_ref()
            .map(|loaded| loaded.origin)
            .unwrap_or(CacheOrigin::None)
    }
}
