// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Network transport seam.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use indexmap::IndexMap;
use url::Url;

use crate::error::{TransportFailure, WebImageError, WebImageResult};
use crate::options::FetchOptions;

/// Connect timeout for the HTTP clients. The overall fetch deadline is
/// enforced by the coordinator.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// One fetch as the transport sees it.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub locator: Url,
    pub headers: IndexMap<String, String>,
    pub options: FetchOptions,
}

/// Response head plus a streaming body.
pub struct TransportResponse {
    /// Announced content length
    pub expected_len: Option<u64>,
    pub body: BoxStream<'static, WebImageResult<Bytes>>,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("expected_len", &self.expected_len)
            .finish_non_exhaustive()
    }
}

/// Retrieves bytes for a locator.
///
/// Failures should be reported as [`WebImageError::TransportFailure`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: &TransportRequest) -> WebImageResult<TransportResponse>;
}

/// HTTP(S) transport on `reqwest`.
///
/// One client per combination of cookie handling and certificate checking,
/// so per-request options never mutate shared client state.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    plain: reqwest::Client,
    cookies: reqwest::Client,
    insecure: reqwest::Client,
    insecure_cookies: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let build = |cookies: bool, insecure: bool| {
            reqwest::Client::builder()
                .user_agent(user_agent)
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .cookie_store(cookies)
                .danger_accept_invalid_certs(insecure)
                .build()
                .context("Failed to create HTTP client")
        };
        Ok(Self {
            plain: build(false, false)?,
            cookies: build(true, false)?,
            insecure: build(false, true)?,
            insecure_cookies: build(true, true)?,
        })
    }

    fn client_for(&self, options: FetchOptions) -> &reqwest::Client {
        let cookies = options.contains(FetchOptions::HANDLE_COOKIES);
        let insecure = options.contains(FetchOptions::ALLOW_INVALID_SSL_CERTIFICATES);
        match (cookies, insecure) {
            (false, false) => &self.plain,
            (true, false) => &self.cookies,
            (false, true) => &self.insecure,
            (true, true) => &self.insecure_cookies,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: &TransportRequest) -> WebImageResult<TransportResponse> {
        if request.locator.scheme() == "file" {
            return read_file(&request.locator).await;
        }

        let mut builder = self.client_for(request.options).get(request.locator.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportFailure::HttpStatus(status.as_u16()).into());
        }

        let expected_len = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| WebImageError::from(TransportFailure::Body(e.to_string())))
            })
            .boxed();

        Ok(TransportResponse { expected_len, body })
    }
}

/// `file://` locators are served from the local filesystem as a single chunk.
async fn read_file(locator: &Url) -> WebImageResult<TransportResponse> {
    let path = locator.to_file_path().map_err(|_| {
        WebImageError::InvalidLocator(format!("{}: not a local path", locator))
    })?;
    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| TransportFailure::Connection(format!("{}: {}", path.display(), e)))?;
    let data = Bytes::from(data);
    Ok(TransportResponse {
        expected_len: Some(data.len() as u64),
        body: futures_util::stream::once(async move { Ok(data) }).boxed(),
    })
}
