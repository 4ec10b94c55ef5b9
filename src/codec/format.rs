// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Image format detection from magic numbers.
//!
//! The format of a resource is always sniffed from its leading bytes, never
//! from the extension of the locator it was fetched from.

use serde::{Deserialize, Serialize};

/// Container formats the library can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Undefined,
    Jpeg,
    Png,
    Gif,
    Tiff,
    WebP,
    Heic,
}

impl ImageFormat {
    /// Detect the format from a byte-signature prefix.
    pub fn sniff(data: &[u8]) -> Self {
        let Some(&first) = data.first() else {
            return Self::Undefined;
        };
        match first {
            0xFF => Self::Jpeg,
            0x89 => Self::Png,
            0x47 => Self::Gif,
            0x49 | 0x4D => Self::Tiff,
            // RIFF....WEBP
            0x52 if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" => {
                Self::WebP
            }
            // ....ftypheic / heix / hevc / hevx
            0x00 if data.len() >= 12 && &data[4..8] == b"ftyp" => match &data[8..12] {
                b"heic" | b"heix" | b"hevc" | b"hevx" => Self::Heic,
                _ => Self::Undefined,
            },
            _ => Self::Undefined,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Tiff => "image/tiff",
            Self::WebP => "image/webp",
            Self::Heic => "image/heic",
            Self::Undefined => "application/octet-stream",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
            Self::WebP => "webp",
            Self::Heic => "heic",
            Self::Undefined => "bin",
        }
    }

    /// The matching `image` crate format, when that crate can handle it.
    pub(crate) fn raster(&self) -> Option<image::ImageFormat> {
        match self {
            Self::Jpeg => Some(image::ImageFormat::Jpeg),
            Self::Png => Some(image::ImageFormat::Png),
            Self::Gif => Some(image::ImageFormat::Gif),
            Self::Tiff => Some(image::ImageFormat::Tiff),
            Self::WebP => Some(image::ImageFormat::WebP),
            Self::Heic | Self::Undefined => None,
        }
    }
}
