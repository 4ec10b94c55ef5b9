// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache key derivation.

use std::sync::Arc;

use url::Url;

use crate::error::{WebImageError, WebImageResult};

/// Maps a locator to the key used in both cache tiers.
pub type CacheKeyFilter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Parse a locator. Only absolute `http`, `https` and `file` URLs are fetchable.
pub fn parse_locator(locator: &str) -> WebImageResult<Url> {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return Err(WebImageError::InvalidLocator("empty locator".to_string()));
    }
    let url = Url::parse(trimmed)
        .map_err(|e| WebImageError::InvalidLocator(format!("{}: {}", locator, e)))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        "file" => Ok(url),
        scheme => Err(WebImageError::InvalidLocator(format!(
            "{}: unsupported scheme '{}'",
            locator, scheme
        ))),
    }
}

/// The key for `locator`, through `filter` when one is installed.
///
/// Surrounding whitespace is ignored, as in [`parse_locator`].
pub fn cache_key(locator: &str, filter: Option<&CacheKeyFilter>) -> String {
    let locator = locator.trim();
    match filter {
        Some(filter) => filter(locator),
        None => locator.to_string(),
    }
}

/// Drops the query string and fragment, so signed or cache-busting URLs
/// share one entry.
pub fn strip_query_filter() -> CacheKeyFilter {
    Arc::new(|locator: &str| match Url::parse(locator) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => locator
            .split(['?', '#'])
            .next()
            .unwrap_or(locator)
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCATOR: &str = "https://cdn.test/a/cat.png?sig=123#frag";

    #[test]
    fn test_key_is_pure_for_each_filter() {
        let lowercase: CacheKeyFilter = Arc::new(|l: &str| l.to_lowercase());
        let strip = strip_query_filter();
        let filters: Vec<Option<CacheKeyFilter>> = vec![None, Some(strip), Some(lowercase)];

        for filter in &filters {
            let first = cache_key(LOCATOR, filter.as_ref());
            let second = cache_key(LOCATOR, filter.as_ref());
            assert_eq!(first, second);
        }

        assert_eq!(cache_key(LOCATOR, None), LOCATOR);
        assert_eq!(cache_key(LOCATOR, filters[1].as_ref()), "https://cdn.test/a/cat.png");
        assert_eq!(
            cache_key("HTTPS://CDN.TEST/X.PNG", filters[2].as_ref()),
            "https://cdn.test/x.png"
        );
    }

    #[test]
    fn test_key_ignores_surrounding_whitespace() {
        let padded = format!("  {}\n", LOCATOR);
        assert_eq!(cache_key(&padded, None), LOCATOR);
        assert_eq!(
            cache_key(&padded, Some(&strip_query_filter())),
            "https://cdn.test/a/cat.png"
        );
    }

    #[test]
    fn test_strip_query_on_unparseable() {
        let strip = strip_query_filter();
        assert_eq!(strip("not a url?x=1"), "not a url");
    }

    #[test]
    fn test_parse_locator() {
        assert!(parse_locator("https://cdn.test/a.png").is_ok());
        assert!(parse_locator("file:///tmp/a.png").is_ok());
        for bad in ["", "   ", "cat.png", "mailto:someone@test", "http://"] {
            assert!(
                matches!(parse_locator(bad), Err(WebImageError::InvalidLocator(_))),
                "{:?} should be invalid",
                bad
            );
        }
    }
}
