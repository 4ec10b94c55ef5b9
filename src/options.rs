// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-request fetch options.
//!
//! Options are an immutable bitset. Flags are independent; the only
//! documented interaction is that `HIGH_PRIORITY` wins when both priority
//! flags are set.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::download::DownloadPriority;

/// Bitset of toggles controlling a single load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchOptions(u32);

impl FetchOptions {
    /// Keep retrying locators that failed before instead of blacklisting them.
    pub const RETRY_FAILED: Self = Self(1 << 0);
    /// Schedule at the back of the download queue.
    pub const LOW_PRIORITY: Self = Self(1 << 1);
    /// Never write the result to the disk tier.
    pub const CACHE_MEMORY_ONLY: Self = Self(1 << 2);
    /// Deliver partial images while bytes arrive.
    pub const PROGRESSIVE_DOWNLOAD: Self = Self(1 << 3);
    /// Deliver the cached image, then revalidate against the network.
    pub const REFRESH_CACHED: Self = Self(1 << 4);
    /// Keep downloading when the host enters the background.
    pub const CONTINUE_IN_BACKGROUND: Self = Self(1 << 5);
    /// Send and store cookies for this request.
    pub const HANDLE_COOKIES: Self = Self(1 << 6);
    /// Accept untrusted TLS certificates.
    pub const ALLOW_INVALID_SSL_CERTIFICATES: Self = Self(1 << 7);
    /// Schedule at the front of the download queue.
    pub const HIGH_PRIORITY: Self = Self(1 << 8);
    /// Presentation hint: show the placeholder only after loading ends.
    pub const DELAY_PLACEHOLDER: Self = Self(1 << 9);
    /// Run the transform hook on animated images as well.
    pub const TRANSFORM_ANIMATED_IMAGE: Self = Self(1 << 10);
    /// Presentation hint: the caller applies the image itself.
    pub const AVOID_AUTO_SET_IMAGE: Self = Self(1 << 11);
    /// Downscale images above the configured pixel budget.
    pub const SCALE_DOWN_LARGE_IMAGES: Self = Self(1 << 12);
    /// Skip the cache lookup and always hit the network.
    pub const IGNORE_CACHE: Self = Self(1 << 13);

    const ALL_BITS: u32 = (1 << 14) - 1;

    const NAMES: [(&'static str, Self); 14] = [
        ("retry-failed", Self::RETRY_FAILED),
        ("low-priority", Self::LOW_PRIORITY),
        ("cache-memory-only", Self::CACHE_MEMORY_ONLY),
        ("progressive-download", Self::PROGRESSIVE_DOWNLOAD),
        ("refresh-cached", Self::REFRESH_CACHED),
        ("continue-in-background", Self::CONTINUE_IN_BACKGROUND),
        ("handle-cookies", Self::HANDLE_COOKIES),
        ("allow-invalid-ssl-certificates", Self::ALLOW_INVALID_SSL_CERTIFICATES),
        ("high-priority", Self::HIGH_PRIORITY),
        ("delay-placeholder", Self::DELAY_PLACEHOLDER),
        ("transform-animated-image", Self::TRANSFORM_ANIMATED_IMAGE),
        ("avoid-auto-set-image", Self::AVOID_AUTO_SET_IMAGE),
        ("scale-down-large-images", Self::SCALE_DOWN_LARGE_IMAGES),
        ("ignore-cache", Self::IGNORE_CACHE),
    ];

    /// No options set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from raw bits, rejecting unknown flags.
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL_BITS == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if every flag in `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Queue lane for the download. High wins over Low.
    pub fn priority(&self) -> DownloadPriority {
        if self.contains(Self::HIGH_PRIORITY) {
            DownloadPriority::High
        } else if self.contains(Self::LOW_PRIORITY) {
            DownloadPriority::Low
        } else {
            DownloadPriority::Normal
        }
    }

    /// Names of the set flags, in bit order.
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl BitOr for FetchOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for FetchOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}

impl FromStr for FetchOptions {
    type Err = String;

    /// Parse a comma separated list such as `low-priority,retry-failed`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = Self::empty();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let flag = Self::NAMES
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(part))
                .map(|(_, flag)| *flag)
                .ok_or_else(|| format!("unknown fetch option '{}'", part))?;
            options |= flag;
        }
        Ok(options)
    }
}
