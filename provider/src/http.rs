// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::io::{self, Cursor};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use futures_util::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Body, Client, Method, StatusCode, Url};
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use crate::idle::{with_idle_timeout, ActivityClock, IdleReader};
use crate::strategy::{DownloadStream, UploadStream};
use crate::util::scrub_presigned_url;

/// Hook applied to every outgoing request before it is sent.
/// Used to attach proxy, tracing or session headers the engine knows nothing about.
pub trait HeaderCustomizer: Send + Sync + fmt::Debug {
    fn customize(&self, request: &mut HttpRequest);
}

/// A fully formed GET or PUT with headers and an optional streaming body.
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    body: Option<UploadStream>,
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &scrub_presigned_url(self.url.as_str()))
            .field("headers", &self.headers)
            .field("body", &self.body.is_some())
            .finish()
    }
}

impl HttpRequest {
    pub fn new(method: Method, url: &str) -> anyhow::Result<Self> {
        let url = Url::parse(url)
            .with_context(|| format!("invalid URL {}", scrub_presigned_url(url)))?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn get(url: &str) -> anyhow::Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn put(url: &str, body: UploadStream) -> anyhow::Result<Self> {
        Ok(Self::new(Method::PUT, url)?.with_body(body))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: UploadStream) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Takes the body, leaving the request without one.
    pub fn take_body(&mut self) -> Option<UploadStream> {
        self.body.take()
    }
}

/// Timeouts and retry flags for a single [`HttpExecutor::execute`] call.
#[derive(Clone, Debug)]
pub struct ExecuteOptions {
    /// Total time budget across executor-level retries.
    pub network_timeout: Duration,
    /// Longest time an attempt may go without bytes moving. Zero disables it.
    pub socket_timeout: Duration,
    /// Maximum executor-level retries.
    pub max_retries: u32,
    /// Retry HTTP 403 responses (presigned URLs can be briefly rejected right after issue).
    pub retry_on_forbidden: bool,
    /// Send exactly once.
    pub no_retry: bool,
    /// Customizers applied in order to the request.
    pub header_customizers: Vec<Arc<dyn HeaderCustomizer>>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(300),
            socket_timeout: Duration::from_secs(300),
            max_retries: 7,
            retry_on_forbidden: false,
            no_retry: false,
            header_customizers: Vec::new(),
        }
    }
}

impl ExecuteOptions {
    fn is_retryable_status(&self, status: StatusCode) -> bool {
        status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || (self.retry_on_forbidden && status == StatusCode::FORBIDDEN)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_interval(Duration::from_secs(16))
            .with_max_elapsed_time(Some(self.network_timeout))
            .build()
    }
}

/// Response status, headers and a streaming body.
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: DownloadStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: DownloadStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Builds a response around an in-memory body.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self::new(status, headers, Box::new(Cursor::new(body.into())))
    }

    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let stream = response.bytes_stream().map_err(body_error);
        Self::new(status, headers, Box::new(StreamReader::new(Box::pin(stream))))
    }

    /// Fails body reads that stall for `timeout`, sharing `clock` with the request.
    pub fn with_idle_timeout(mut self, clock: ActivityClock, timeout: Duration) -> Self {
        self.body = Box::new(IdleReader::new(self.body, clock, timeout));
        self
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn into_body(self) -> DownloadStream {
        self.body
    }

    pub async fn text(mut self) -> anyhow::Result<String> {
        let mut text = String::new();
        self.body.read_to_string(&mut text).await?;
        Ok(text)
    }

    /// Consumes a non-2xx response into a [`StatusError`] carrying the body.
    pub async fn into_status_error(self) -> StatusError {
        let status = self.status;
        let body = self.text().await.unwrap_or_default();
        StatusError { status, body }
    }
}

/// Keeps reqwest timeouts recognizable once the body is read through `AsyncRead`.
fn body_error(err: reqwest::Error) -> io::Error {
    let kind = if err.is_timeout() {
        io::ErrorKind::TimedOut
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, err)
}

/// A non-2xx HTTP status with its response body.
#[derive(Debug, Clone, thiserror::Error)]
#[error("HTTP status {status}: {body}")]
pub struct StatusError {
    pub status: StatusCode,
    pub body: String,
}

/// Issues one fully-formed HTTP request with bounded retry and timeout semantics.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(
        &self,
        request: HttpRequest,
        options: &ExecuteOptions,
    ) -> anyhow::Result<HttpResponse>;
}

/// [`HttpExecutor`] over a pooled reqwest [`Client`].
#[derive(Clone, Debug, Default)]
pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ReqwestExecutor {
    /// Builds one reqwest attempt. A streaming body moves into the first attempt.
    fn build(
        &self,
        request: &mut HttpRequest,
        clock: &ActivityClock,
    ) -> reqwest::Result<reqwest::Request> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = request.take_body() {
            let body = IdleReader::tracking(body, clock.clone());
            builder = builder.body(Body::wrap_stream(ReaderStream::new(body)));
        }
        builder.build()
    }

    /// Sends one attempt. The socket timeout bounds idle time, not the whole transfer.
    async fn send(
        &self,
        request: &mut HttpRequest,
        options: &ExecuteOptions,
    ) -> anyhow::Result<HttpResponse> {
        let clock = ActivityClock::new();
        let attempt = self.build(request, &clock)?;
        let response =
            with_idle_timeout(self.client.execute(attempt), &clock, options.socket_timeout).await?;
        Ok(HttpResponse::from_reqwest(response).with_idle_timeout(clock, options.socket_timeout))
    }
}

/// Connect failures and timeouts, including idle timeouts.
fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            return e.is_timeout() || e.is_connect();
        }
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::TimedOut)
    })
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(
        &self,
        mut request: HttpRequest,
        options: &ExecuteOptions,
    ) -> anyhow::Result<HttpResponse> {
        for customizer in &options.header_customizers {
            customizer.customize(&mut request);
        }

        let url = scrub_presigned_url(request.url.as_str()).to_string();
        // Streaming bodies cannot be replayed, so they only ever get one shot.
        if options.no_retry || request.has_body() {
            return self.send(&mut request, options).await;
        }

        let mut backoff = options.backoff();
        let mut retries = 0;
        loop {
            let result = self.send(&mut request, options).await;
            let retryable = match &result {
                Ok(response) => options.is_retryable_status(response.status),
                Err(err) => is_transient(err),
            };
            let delay = if retryable && retries < options.max_retries {
                backoff.next_backoff()
            } else {
                None
            };
            let Some(delay) = delay else {
                return result;
            };

            retries += 1;
            match &result {
                Ok(response) => debug!(
                    "{} {} returned {}, retry {} in {:?}",
                    request.method, url, response.status, retries, delay
                ),
                Err(err) => debug!(
                    "{} {} failed: {:#}, retry {} in {:?}",
                    request.method, url, err, retries, delay
                ),
            }
            tokio::time::sleep(delay).await;
        }
    }
}
