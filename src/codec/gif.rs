// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Animated GIF codec.

use std::io::Cursor;
use std::time::Duration;

use bytes::Bytes;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::{AnimationDecoder, Delay, Frame};

use super::{Codec, ImageFormat};
use crate::error::{WebImageError, WebImageResult};
use crate::types::{Image, ImageFrame};

/// Decodes every frame of a GIF, keeping per-frame delays.
#[derive(Debug, Default, Clone, Copy)]
pub struct GifCodec;

impl GifCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for GifCodec {
    fn name(&self) -> &'static str {
        "gif"
    }

    fn can_decode(&self, data: &[u8]) -> bool {
        ImageFormat::sniff(data) == ImageFormat::Gif
    }

    fn decode(&self, data: &[u8]) -> WebImageResult<Image> {
        if !self.can_decode(data) {
            return Err(WebImageError::UnsupportedFormat("not a GIF".to_string()));
        }
        let decoder = GifDecoder::new(Cursor::new(data))?;
        let frames = decoder
            .into_frames()
            .collect_frames()?
            .into_iter()
            .map(|frame| {
                let (numer, denom) = frame.delay().numer_denom_ms();
                let delay_ms = if denom == 0 { 0 } else { numer / denom };
                ImageFrame {
                    delay: Duration::from_millis(delay_ms as u64),
                    pixels: frame.into_buffer(),
                }
            })
            .collect();
        Image::animated(ImageFormat::Gif, frames)
            .ok_or_else(|| WebImageError::UnsupportedFormat("GIF has no frames".to_string()))
    }

    fn can_encode(&self, format: ImageFormat) -> bool {
        format == ImageFormat::Gif
    }

    fn encode(&self, image: &Image, format: ImageFormat) -> WebImageResult<Bytes> {
        if format != ImageFormat::Gif {
            return Err(WebImageError::UnsupportedFormat(format!(
                "gif codec cannot encode {:?}",
                format
            )));
        }

        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            if image.is_animated() {
                encoder.set_repeat(Repeat::Infinite)?;
            }
            let frames = image.frames().iter().map(|f| {
                let delay = Delay::from_numer_denom_ms(f.delay.as_millis() as u32, 1);
                Frame::from_parts(f.pixels.clone(), 0, 0, delay)
            });
            encoder.encode_frames(frames)?;
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn two_frame_gif() -> Image {
        let frames = vec![
            ImageFrame {
                pixels: RgbaImage::from_pixel(3, 3, Rgba([255, 0, 0, 255])),
                delay: Duration::from_millis(100),
            },
            ImageFrame {
                pixels: RgbaImage::from_pixel(3, 3, Rgba([0, 0, 255, 255])),
                delay: Duration::from_millis(100),
            },
        ];
        Image::animated(ImageFormat::Gif, frames).unwrap()
    }

    #[test]
    fn test_animated_round_trip() {
        let codec = GifCodec::new();
        let bytes = codec.encode(&two_frame_gif(), ImageFormat::Gif).unwrap();
        assert_eq!(ImageFormat::sniff(&bytes), ImageFormat::Gif);

        let decoded = codec.decode(&bytes).unwrap();
        assert!(decoded.is_animated());
        assert_eq!(decoded.frames().len(), 2);
        assert_eq!(decoded.frames()[0].delay, Duration::from_millis(100));
    }

    #[test]
    fn test_only_gif() {
        let codec = GifCodec::new();
        assert!(!codec.can_decode(b"\x89PNG\r\n\x1a\n"));
        assert!(!codec.can_encode(ImageFormat::Png));
        assert!(codec.incremental_decoder().is_none());
    }
}
