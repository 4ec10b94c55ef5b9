// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ordered codec registry.

use std::sync::{Arc, RwLock};

use bytes::Bytes;

use super::{Codec, GifCodec, ImageFormat, ImageIoCodec, IncrementalDecoder};
use crate::error::{WebImageError, WebImageResult};
use crate::sync::{resilient_read, resilient_write};
use crate::types::Image;

/// Codecs in priority order; the first match wins.
pub struct CodecRegistry {
    codecs: RwLock<Vec<Arc<dyn Codec>>>,
}

impl CodecRegistry {
    /// An empty registry. Nothing decodes until codecs are added.
    pub fn new() -> Self {
        Self {
            codecs: RwLock::new(Vec::new()),
        }
    }

    /// The built-in codecs: the animated GIF codec (optional) ahead of the
    /// general still-image codec.
    pub fn with_defaults(animated_gif: bool) -> Self {
        let registry = Self::new();
        registry.add_codec(Arc::new(ImageIoCodec::new()));
        if animated_gif {
            registry.add_codec(Arc::new(GifCodec::new()));
        }
        registry
    }

    /// Register a codec with the highest priority.
    pub fn add_codec(&self, codec: Arc<dyn Codec>) {
        resilient_write(&self.codecs).insert(0, codec);
    }

    /// Remove every codec registered under `name`. Returns true if any was removed.
    pub fn remove_codec(&self, name: &str) -> bool {
        let mut codecs = resilient_write(&self.codecs);
        let before = codecs.len();
        codecs.retain(|c| c.name() != name);
        codecs.len() != before
    }

    /// Codec names in priority order.
    pub fn codec_names(&self) -> Vec<&'static str> {
        resilient_read(&self.codecs).iter().map(|c| c.name()).collect()
    }

    fn find_decoder(&self, data: &[u8]) -> Option<Arc<dyn Codec>> {
        resilient_read(&self.codecs)
            .iter()
            .find(|c| c.can_decode(data))
            .cloned()
    }

    pub fn can_decode(&self, data: &[u8]) -> bool {
        self.find_decoder(data).is_some()
    }

    pub fn can_encode(&self, format: ImageFormat) -> bool {
        resilient_read(&self.codecs).iter().any(|c| c.can_encode(format))
    }

    /// Decode with the first codec that recognises the bytes.
    pub fn decode(&self, data: &[u8]) -> WebImageResult<Image> {
        let codec = self.find_decoder(data).ok_or_else(|| {
            WebImageError::UnsupportedFormat(format!(
                "no codec recognises data ({:?} signature, {} bytes)",
                ImageFormat::sniff(data),
                data.len()
            ))
        })?;
        tracing::debug!("Decoding {} bytes with codec '{}'", data.len(), codec.name());
        codec.decode(data)
    }

    /// Encode `image`. `ImageFormat::Undefined` picks the image's own format,
    /// falling back to PNG for images with alpha and JPEG otherwise.
    pub fn encode(&self, image: &Image, format: ImageFormat) -> WebImageResult<Bytes> {
        let format = match format {
            ImageFormat::Undefined => Self::preferred_format(image, |f| self.can_encode(f)),
            other => other,
        };
        let codec = resilient_read(&self.codecs)
            .iter()
            .find(|c| c.can_encode(format))
            .cloned()
            .ok_or_else(|| {
                WebImageError::UnsupportedFormat(format!("no codec can encode {:?}", format))
            })?;
        codec.encode(image, format)
    }

    fn preferred_format(image: &Image, can_encode: impl Fn(ImageFormat) -> bool) -> ImageFormat {
        let own = image.format();
        if own != ImageFormat::Undefined && can_encode(own) {
            own
        } else if image.has_alpha() {
            ImageFormat::Png
        } else {
            ImageFormat::Jpeg
        }
    }

    /// An incremental decoder from the first codec that both recognises the
    /// leading bytes and supports progressive decoding.
    pub fn incremental_decoder_for(&self, head: &[u8]) -> Option<Box<dyn IncrementalDecoder>> {
        resilient_read(&self.codecs)
            .iter()
            .filter(|c| c.can_decode(head))
            .find_map(|c| c.incremental_decoder())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults(true)
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.codec_names())
            .finish()
    }
}
