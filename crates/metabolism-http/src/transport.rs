//! HTTP transport seam
//!
//! The caching layer only needs to send one request and get back status,
//! headers and the full body. [`Transport`] captures exactly that, so tests
//! and embedders can substitute their own implementation for
//! [`ReqwestTransport`].

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use std::time::Duration;
use tracing::trace;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// A single outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::HEAD, url)
    }

    /// Add a header, rejecting values that are not valid header text
    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader {
            name: "request",
            value: value.to_string(),
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

/// A fully buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Header value as text, if present and valid
    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Sends requests to an origin
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and buffer the whole response.
    ///
    /// Any status is a successful return; only failures to get a response at
    /// all are errors.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] backed by a pooled [`reqwest::Client`]
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    user_agent: HeaderValue,
}

impl ReqwestTransport {
    /// Build a client using the timeouts and user agent from `config`
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let user_agent = HeaderValue::from_str(&config.user_agent).map_err(|_| {
            Error::InvalidConfig(format!("invalid user agent '{}'", config.user_agent))
        })?;

        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(config.max_concurrent_requests.max(1))
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self { client, user_agent })
    }

    /// Wrap an existing client; `user_agent` is sent with every request
    pub fn from_client(client: Client, user_agent: &str) -> Result<Self> {
        let user_agent = HeaderValue::from_str(user_agent)
            .map_err(|_| Error::InvalidConfig(format!("invalid user agent '{user_agent}'")))?;
        Ok(Self { client, user_agent })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        trace!("{} {}", request.method, request.url);

        let mut headers = request.headers;
        headers
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());

        let response = self
            .client
            .request(request.method, &request.url)
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        trace!("{} for {} ({} bytes)", status, request.url, body.len());

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
