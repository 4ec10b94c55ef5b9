// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! General purpose still-image codec on top of the `image` crate.
//!
//! Handles PNG, JPEG, TIFF and WebP, plus GIF as a still image (first frame
//! only; register [`GifCodec`](super::GifCodec) ahead of this one for
//! animation). HEIC is recognised by the sniffer but not decodable here.

use std::io::Cursor;

use bytes::Bytes;
use image::DynamicImage;

use super::{Codec, ImageFormat, IncrementalDecoder};
use crate::error::{WebImageError, WebImageResult};
use crate::types::Image;

/// Partial downloads are re-decoded only after this many new bytes.
const MIN_PROGRESS_BYTES: usize = 8 * 1024;

/// Codec for still images.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageIoCodec;

impl ImageIoCodec {
    pub fn new() -> Self {
        Self
    }

    fn supports(format: ImageFormat) -> bool {
        matches!(
            format,
            ImageFormat::Jpeg
                | ImageFormat::Png
                | ImageFormat::Gif
                | ImageFormat::Tiff
                | ImageFormat::WebP
        )
    }
}

impl Codec for ImageIoCodec {
    fn name(&self) -> &'static str {
        "image-io"
    }

    fn can_decode(&self, data: &[u8]) -> bool {
        Self::supports(ImageFormat::sniff(data))
    }

    fn decode(&self, data: &[u8]) -> WebImageResult<Image> {
        let format = ImageFormat::sniff(data);
        let raster = format
            .raster()
            .filter(|_| Self::supports(format))
            .ok_or_else(|| {
                WebImageError::UnsupportedFormat(format!("{:?} is not decodable", format))
            })?;
        let decoded = image::load_from_memory_with_format(data, raster)?;
        Ok(Image::still(format, decoded.to_rgba8()))
    }

    fn can_encode(&self, format: ImageFormat) -> bool {
        Self::supports(format)
    }

    fn encode(&self, image: &Image, format: ImageFormat) -> WebImageResult<Bytes> {
        encode_still(image, format)
    }

    fn incremental_decoder(&self) -> Option<Box<dyn IncrementalDecoder>> {
        Some(Box::new(BufferedDecoder::default()))
    }
}

/// Encode the first frame of `image` as a still image.
pub(crate) fn encode_still(image: &Image, format: ImageFormat) -> WebImageResult<Bytes> {
    let raster = format.raster().ok_or_else(|| {
        WebImageError::UnsupportedFormat(format!("cannot encode {:?}", format))
    })?;

    let pixels = image.first_frame().clone();
    // JPEG has no alpha channel.
    let dynamic = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(pixels).to_rgb8())
    } else {
        DynamicImage::ImageRgba8(pixels)
    };

    let mut out = Cursor::new(Vec::new());
    dynamic.write_to(&mut out, raster)?;
    Ok(Bytes::from(out.into_inner()))
}

/// Re-decodes the accumulated buffer whenever enough new data has arrived.
#[derive(Default)]
struct BufferedDecoder {
    buffer: Vec<u8>,
    attempted_at: usize,
}

impl IncrementalDecoder for BufferedDecoder {
    fn append(&mut self, chunk: &[u8], is_final: bool) -> Option<Image> {
        self.buffer.extend_from_slice(chunk);
        if !is_final && self.buffer.len() - self.attempted_at < MIN_PROGRESS_BYTES {
            return None;
        }
        self.attempted_at = self.buffer.len();

        let format = ImageFormat::sniff(&self.buffer);
        let raster = format.raster()?;
        image::load_from_memory_with_format(&self.buffer, raster)
            .ok()
            .map(|decoded| Image::still(format, decoded.to_rgba8()))
    }
}
