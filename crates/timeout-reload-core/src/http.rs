// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP clients for the configuration and quotation services.
//!
//! [`HttpClient`] wraps a reusable `reqwest::Client`, classifies HTTP statuses
//! into [`HttpError`], and decodes JSON bodies. [`RemoteConfigClient`] builds
//! the fail-open configuration fetch on top of it, and [`QuotationClient`]
//! covers the quoted-value endpoint that applications call through the
//! pipeline executor.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DEFAULT_FETCH_TIMEOUT;
use crate::model::{QuotationValue, TimeoutConfiguration};
use crate::pipeline::Transient;
use crate::store::{ConfigSource, FetchError};

/// Endpoint returning the current timeout configuration.
const CONFIG_ENDPOINT: &str = "/config";
/// Endpoint returning the quoted value of a ticker.
const QUOTATION_ENDPOINT: &str = "/quotations";
/// User agent attached to every request.
const USER_AGENT: &str = concat!("timeout-reload/", env!("CARGO_PKG_VERSION"));

/// Error taxonomy of the HTTP layer.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Request rejected by the server or redirected unexpectedly (3xx/4xx).
    #[error("request rejected: status {0}")]
    Rejected(u16),
    /// Server reported a temporary failure (5xx).
    #[error("transient backend error: status {0}")]
    Retryable(u16),
    /// The configured base URL cannot be parsed.
    #[error("invalid base url: {0}")]
    InvalidUrl(String),
    /// Transport-level issue (DNS, TLS, socket, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Response body is not the expected JSON document.
    #[error("failed to decode json payload: {0}")]
    Decode(#[from] serde_json::Error),
    /// Response carried no body at all.
    #[error("empty response body")]
    EmptyBody,
    /// The caller cancelled the request before it completed.
    #[error("request cancelled")]
    Cancelled,
}

impl Transient for HttpError {
    /// Transport failures and 5xx responses may succeed on a later attempt.
    fn is_transient(&self) -> bool {
        matches!(self, HttpError::Transport(_) | HttpError::Retryable(_))
    }
}

/// Options governing how the HTTP client is constructed.
#[derive(Debug, Clone, Copy)]
pub struct HttpClientOptions {
    /// Total timeout applied by `reqwest` to each request; `None` disables it.
    pub request_timeout: Option<Duration>,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_FETCH_TIMEOUT),
        }
    }
}

/// Thin JSON client bound to a base URL.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    /// Builds a client for `base_url` (scheme + host, optional path prefix).
    pub fn new(base_url: impl Into<String>, options: HttpClientOptions) -> Result<Self, HttpError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|_| HttpError::InvalidUrl(base_url.clone()))?;

        let mut builder = Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(HttpError::Transport)?;

        Ok(Self { client, base_url })
    }

    /// Returns the base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends a GET request and decodes the JSON response body.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, HttpError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %Method::GET, url = %url, "timeout-reload HTTP request");

        let response = self
            .client
            .request(Method::GET, url.as_str())
            .query(query)
            .send()
            .await?;
        let status = response.status();
        debug!(
            method = %Method::GET,
            url = %url,
            status = %status,
            "timeout-reload HTTP response"
        );
        classify_status(status)?;

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(HttpError::EmptyBody);
        }
        serde_json::from_slice(&bytes).map_err(HttpError::Decode)
    }
}

/// Maps HTTP status codes to the error taxonomy.
fn classify_status(status: StatusCode) -> Result<(), HttpError> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error() {
        return Err(HttpError::Retryable(status.as_u16()));
    }
    Err(HttpError::Rejected(status.as_u16()))
}

/// Client of the remote configuration endpoint.
///
/// The public [`fetch`](Self::fetch) never fails: errors are logged and the
/// fallback configuration is returned. The store goes through
/// [`ConfigSource`] instead so that a failed fetch can keep the last known
/// good value rather than downgrading to the fallback. No retries happen here;
/// the pipeline layer is deliberately not used to read its own configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfigClient {
    http: HttpClient,
    fallback: TimeoutConfiguration,
}

impl RemoteConfigClient {
    /// Creates a client returning `fallback` whenever the endpoint misbehaves.
    pub fn new(http: HttpClient, fallback: TimeoutConfiguration) -> Self {
        Self { http, fallback }
    }

    /// Fallback returned on failure.
    pub fn fallback(&self) -> TimeoutConfiguration {
        self.fallback
    }

    /// Fetches the configuration, surfacing every failure.
    pub async fn try_fetch(&self) -> Result<TimeoutConfiguration, HttpError> {
        let config: TimeoutConfiguration = self.http.get_json(CONFIG_ENDPOINT, &[]).await?;
        debug!(
            timeout_seconds = config.timeout_seconds(),
            "timeout-reload: configuration retrieved"
        );
        Ok(config)
    }

    /// Fetches the configuration, substituting the fallback on failure or cancellation.
    pub async fn fetch(&self, cancel: &CancellationToken) -> TimeoutConfiguration {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("timeout-reload: configuration fetch cancelled; using fallback");
                self.fallback
            }
            result = self.try_fetch() => match result {
                Ok(config) => config,
                Err(err) => {
                    warn!(%err, fallback = %self.fallback, "timeout-reload: failed to fetch timeout configuration; using fallback");
                    self.fallback
                }
            }
        }
    }
}

#[async_trait]
impl ConfigSource for RemoteConfigClient {
    async fn fetch_configuration(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TimeoutConfiguration, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.try_fetch() => result.map_err(FetchError::Http),
        }
    }
}

/// Client of the quoted-value endpoint.
#[derive(Debug, Clone)]
pub struct QuotationClient {
    http: HttpClient,
}

impl QuotationClient {
    /// Wraps an HTTP client pointed at the quotation service.
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Returns the current value of `ticker`.
    ///
    /// The in-flight request is dropped as soon as `cancel` fires, so a
    /// pipeline timeout also releases the connection.
    pub async fn fetch_quotation(
        &self,
        ticker: &str,
        cancel: &CancellationToken,
    ) -> Result<QuotationValue, HttpError> {
        let query = [("ticker", ticker)];
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(ticker, "timeout-reload: quotation request cancelled");
                Err(HttpError::Cancelled)
            }
            result = self.http.get_json(QUOTATION_ENDPOINT, &query) => result,
        }
    }
}
