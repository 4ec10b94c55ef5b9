// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pluggable image codecs.
//!
//! A [`CodecRegistry`] holds an ordered list of [`Codec`]s. Decoding asks
//! each codec in turn whether it recognises the bytes and hands them to the
//! first one that does. Codecs that can reconstruct an image from a partial
//! download also hand out an [`IncrementalDecoder`].
//!
//! ```no_run
//! use webimg::codec::CodecRegistry;
//!
//! let registry = CodecRegistry::with_defaults(true);
//! let bytes = std::fs::read("photo.png").unwrap();
//! let image = registry.decode(&bytes).unwrap();
//! println!("{}x{}", image.width(), image.height());
//! ```

pub mod format;
pub mod gif;
pub mod image_io;
pub mod registry;

use bytes::Bytes;

use crate::error::WebImageResult;
use crate::types::Image;

pub use format::ImageFormat;
pub use gif::GifCodec;
pub use image_io::ImageIoCodec;
pub use registry::CodecRegistry;

/// A format codec.
pub trait Codec: Send + Sync {
    /// Short identifier, used for removal and logging.
    fn name(&self) -> &'static str;

    /// Whether this codec recognises the bytes.
    fn can_decode(&self, data: &[u8]) -> bool;

    fn decode(&self, data: &[u8]) -> WebImageResult<Image>;

    fn can_encode(&self, format: ImageFormat) -> bool;

    fn encode(&self, image: &Image, format: ImageFormat) -> WebImageResult<Bytes>;

    /// A fresh decoder for progressive display, if supported.
    fn incremental_decoder(&self) -> Option<Box<dyn IncrementalDecoder>> {
        None
    }
}

/// Reconstructs an image from a growing byte buffer.
pub trait IncrementalDecoder: Send {
    /// Feed the next chunk. Returns a partial (or, with `is_final`, complete)
    /// image once enough bytes have arrived, `None` while still incomplete.
    fn append(&mut self, chunk: &[u8], is_final: bool) -> Option<Image>;
}
