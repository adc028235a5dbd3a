// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::http::{HttpResponse, StatusError};
use crate::idle::{with_idle_timeout, ActivityClock, IdleReader};
use crate::stage::{split_location, CredentialRefresher, StageCredentials, StageLocation};
use crate::util::{metadata_from_headers, metadata_headers, transport_content_encoding};

mod rest;
mod virtual_host;

pub use rest::DefaultAccessStrategy;
pub use virtual_host::VirtualHostAccessStrategy;

/// Prefix GCS puts in front of every user metadata key on the wire.
pub const METADATA_PREFIX: &str = "x-goog-meta-";

/// User metadata, ordered by key.
pub type UserMetadata = BTreeMap<String, String>;

/// Byte stream handed to an upload. Reqwest requires streaming bodies to be `Sync`.
pub type UploadStream = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Byte stream returned from a download.
pub type DownloadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Transfer direction, used for error reporting and strategy-level recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upload => "upload",
            Operation::Download => "download",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One listed object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub location: String,
    pub key: String,
    pub size: u64,
    pub md5: Option<String>,
}

/// Object metadata as reported by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObjectMetadata {
    pub content_length: u64,
    pub content_encoding: Option<String>,
    pub user_metadata: UserMetadata,
}

/// Arguments to [`AccessStrategy::upload_with_token`].
#[derive(Clone, Copy, Debug)]
pub struct TokenUploadRequest<'a> {
    /// Upload parallelism hint; GCS uploads are single stream.
    pub parallelism: usize,
    pub location: &'a str,
    pub key: &'a str,
    pub content_encoding: Option<&'a str>,
    pub user_metadata: &'a UserMetadata,
    pub content_length: u64,
}

/// Backend-specific list/get/put against one storage variant.
#[async_trait]
pub trait AccessStrategy: Send + Sync {
    /// List objects in `location` under `prefix`.
    async fn list_objects(&self, location: &str, prefix: &str)
        -> anyhow::Result<Vec<ObjectSummary>>;

    /// Fetch metadata for one object.
    async fn object_metadata(&self, location: &str, key: &str)
        -> anyhow::Result<RemoteObjectMetadata>;

    /// Upload using the stage access token.
    async fn upload_with_token(
        &self,
        request: TokenUploadRequest<'_>,
        body: UploadStream,
    ) -> anyhow::Result<()>;

    /// Download an object into `dest`, returning its user metadata.
    async fn download(
        &self,
        parallelism: usize,
        location: &str,
        key: &str,
        dest: &Path,
    ) -> anyhow::Result<UserMetadata>;

    /// Open an object for streaming. When `decrypting`, the raw stored bytes are requested.
    async fn download_to_stream(
        &self,
        location: &str,
        key: &str,
        decrypting: bool,
    ) -> anyhow::Result<(DownloadStream, UserMetadata)>;

    /// Gives the strategy a chance to recover from `err` (e.g. by refreshing an expired token).
    /// Returns true if the caller should simply try again.
    async fn handle_storage_error(
        &self,
        err: &anyhow::Error,
        retry_count: u32,
        operation: Operation,
    ) -> bool;

    /// Release pooled resources. Later calls fail.
    async fn shutdown(&self);
}

/// State and HTTP plumbing shared by the GCS strategies.
pub(crate) struct GcsTransport {
    client: Client,
    endpoint: String,
    token: RwLock<Option<String>>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    max_retries: u32,
    socket_timeout: Duration,
    closed: AtomicBool,
}

impl GcsTransport {
    pub(crate) fn new(
        stage: &StageLocation,
        client: Client,
        refresher: Option<Arc<dyn CredentialRefresher>>,
        max_retries: u32,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: stage.endpoint().trim_end_matches('/').to_string(),
            token: RwLock::new(stage.credentials.access_token().map(str::to_string)),
            refresher,
            max_retries,
            socket_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("access strategy has been shut down"));
        }
        Ok(())
    }

    /// Builds a request with the bearer token attached.
    pub(crate) fn request(
        &self,
        method: reqwest::Method,
        url: &str,
    ) -> anyhow::Result<RequestBuilder> {
        self.ensure_open()?;
        let builder = self.client.request(method, url);
        let token = self
            .token
            .read()
            .map_err(|_| anyhow!("access token lock poisoned"))?
            .clone();
        Ok(match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    /// Sends the request and turns non-2xx statuses into [`StatusError`].
    pub(crate) async fn send(&self, builder: RequestBuilder) -> anyhow::Result<HttpResponse> {
        self.send_tracked(builder, ActivityClock::new()).await
    }

    /// Like [`Self::send`], failing once `clock` sees no progress for the socket timeout.
    async fn send_tracked(
        &self,
        builder: RequestBuilder,
        clock: ActivityClock,
    ) -> anyhow::Result<HttpResponse> {
        let response = with_idle_timeout(builder.send(), &clock, self.socket_timeout).await?;
        let response =
            HttpResponse::from_reqwest(response).with_idle_timeout(clock, self.socket_timeout);
        if !response.is_success() {
            return Err(response.into_status_error().await.into());
        }
        Ok(response)
    }

    pub(crate) async fn put_object(
        &self,
        url: &str,
        request: TokenUploadRequest<'_>,
        body: UploadStream,
    ) -> anyhow::Result<()> {
        let clock = ActivityClock::new();
        let body = IdleReader::tracking(body, clock.clone());
        let mut builder = self
            .request(reqwest::Method::PUT, url)?
            .headers(metadata_headers(request.user_metadata)?)
            .header(header::CONTENT_LENGTH, request.content_length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)));
        if let Some(encoding) = request.content_encoding {
            builder = builder.header(
                header::CONTENT_ENCODING,
                transport_content_encoding(encoding),
            );
        }
        self.send_tracked(builder, clock).await?;
        Ok(())
    }

    pub(crate) async fn get_object(
        &self,
        url: &str,
        raw: bool,
    ) -> anyhow::Result<(DownloadStream, UserMetadata)> {
        let mut builder = self.request(reqwest::Method::GET, url)?;
        if raw {
            builder = builder.header(header::ACCEPT_ENCODING, "gzip");
        }
        let response = self.send(builder).await?;
        let metadata = metadata_from_headers(&response.headers);
        Ok((response.into_body(), metadata))
    }

    pub(crate) async fn get_object_to_file(
        &self,
        url: &str,
        dest: &Path,
    ) -> anyhow::Result<UserMetadata> {
        let (mut body, metadata) = self.get_object(url, true).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        tokio::io::copy(&mut body, &mut file).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(metadata)
    }

    /// Lists through the JSON API, following page tokens.
    pub(crate) async fn list_json(
        &self,
        location: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<ObjectSummary>> {
        let (bucket, prefix) = object_name(location, prefix);
        let url = format!(
            "{}/storage/v1/b/{}/o",
            self.endpoint,
            urlencoding::encode(bucket)
        );
        let mut summaries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut builder = self
                .request(reqwest::Method::GET, &url)?
                .query(&[("prefix", prefix.as_str())]);
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token.as_str())]);
            }
            let page: ListPage = serde_json::from_str(&self.send(builder).await?.text().await?)
                .context("failed to parse object listing")?;
            for item in page.items {
                summaries.push(ObjectSummary {
                    location: bucket.to_string(),
                    size: parse_size(&item.size)
                        .with_context(|| format!("bad size for {}", item.name))?,
                    key: item.name,
                    md5: item.md5_hash,
                });
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(summaries)
    }

    /// Shared recovery: refresh on 401, ask for another attempt on throttling and server errors.
    pub(crate) async fn handle_storage_error(
        &self,
        err: &anyhow::Error,
        retry_count: u32,
        operation: Operation,
    ) -> bool {
        let Some(status) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<StatusError>())
            .map(|e| e.status)
        else {
            return false;
        };

        if status == StatusCode::UNAUTHORIZED {
            let Some(refresher) = &self.refresher else {
                return false;
            };
            return match refresher.refresh().await {
                Ok(credentials) => {
                    debug!("refreshed access token during {}", operation);
                    self.set_credentials(&credentials);
                    true
                }
                Err(e) => {
                    warn!("failed to refresh access token during {}: {}", operation, e);
                    false
                }
            };
        }

        let transient = matches!(
            status,
            StatusCode::FORBIDDEN
                | StatusCode::REQUEST_TIMEOUT
                | StatusCode::TOO_MANY_REQUESTS
                | StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        );
        if transient && retry_count <= self.max_retries {
            debug!(
                "{} returned {}, retry count: {}",
                operation, status, retry_count
            );
            return true;
        }
        false
    }

    fn set_credentials(&self, credentials: &StageCredentials) {
        if let Ok(mut token) = self.token.write() {
            *token = credentials.access_token().map(str::to_string);
        }
    }

    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<ListItem>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListItem {
    name: String,
    size: String,
    md5_hash: Option<String>,
}

/// Parses an object size, which the JSON API sends as a decimal string.
pub(crate) fn parse_size(size: &str) -> anyhow::Result<u64> {
    size.trim()
        .parse()
        .with_context(|| format!("invalid object size {:?}", size))
}

/// Splits a stage location and a key into the bucket and the full object name.
pub(crate) fn object_name<'a>(location: &'a str, key: &str) -> (&'a str, String) {
    let (bucket, prefix) = split_location(location);
    if prefix.is_empty() {
        (bucket, key.to_string())
    } else if prefix.ends_with('/') {
        (bucket, format!("{}{}", prefix, key))
    } else {
        (bucket, format!("{}/{}", prefix, key))
    }
}

/// Percent-encodes an object key for use in a URL path, keeping `/` separators.
pub(crate) fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRefresher;

    #[async_trait]
    impl CredentialRefresher for StaticRefresher {
        async fn refresh(&self) -> anyhow::Result<StageCredentials> {
            Ok(StageCredentials::with_access_token("fresh"))
        }
    }

    fn transport(refresher: Option<Arc<dyn CredentialRefresher>>) -> GcsTransport {
        let mut stage = StageLocation::new("bucket");
        stage.credentials = StageCredentials::with_access_token("stale");
        GcsTransport::new(&stage, Client::new(), refresher, 2, Duration::from_secs(5))
    }

    fn status(code: StatusCode) -> anyhow::Error {
        anyhow::Error::new(StatusError {
            status: code,
            body: String::new(),
        })
        .context("request failed")
    }

    #[tokio::test]
    async fn test_handle_unauthorized_refreshes_token() {
        let transport = transport(Some(Arc::new(StaticRefresher)));
        let handled = transport
            .handle_storage_error(&status(StatusCode::UNAUTHORIZED), 1, Operation::Upload)
            .await;
        assert!(handled);
        assert_eq!(
            transport.token.read().unwrap().as_deref(),
            Some("fresh")
        );
    }

    #[tokio::test]
    async fn test_handle_unauthorized_without_refresher() {
        let transport = transport(None);
        assert!(
            !transport
                .handle_storage_error(&status(StatusCode::UNAUTHORIZED), 1, Operation::Upload)
                .await
        );
    }

    #[tokio::test]
    async fn test_handle_transient_status_bounded() {
        let transport = transport(None);
        let err = status(StatusCode::SERVICE_UNAVAILABLE);
        assert!(
            transport
                .handle_storage_error(&err, 2, Operation::Download)
                .await
        );
        assert!(
            !transport
                .handle_storage_error(&err, 3, Operation::Download)
                .await
        );
        assert!(
            !transport
                .handle_storage_error(&status(StatusCode::NOT_FOUND), 1, Operation::Download)
                .await
        );
        assert!(
            !transport
                .handle_storage_error(&anyhow!("boom"), 1, Operation::Download)
                .await
        );
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name("bucket", "a.csv"), ("bucket", "a.csv".to_string()));
        assert_eq!(
            object_name("bucket/results/", "a.csv"),
            ("bucket", "results/a.csv".to_string())
        );
        assert_eq!(
            object_name("bucket/results", "a.csv"),
            ("bucket", "results/a.csv".to_string())
        );
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("42").unwrap(), 42);
        assert!(parse_size("").is_err());
        let err = parse_size("4x2").unwrap_err();
        assert!(err.to_string().contains("4x2"));
    }

    #[test]
    fn test_listing_requires_size() {
        let page: ListPage = serde_json::from_str(
            r#"{"items":[{"name":"results/a.csv","size":"12","md5Hash":"abc"}],"nextPageToken":""}"#,
        )
        .unwrap();
        assert_eq!(parse_size(&page.items[0].size).unwrap(), 12);
        assert!(serde_json::from_str::<ListPage>(r#"{"items":[{"name":"a"}]}"#).is_err());
    }

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("a b/c?d"), "a%20b/c%3Fd");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests() {
        let transport = transport(None);
        transport.shutdown();
        assert!(transport
            .request(reqwest::Method::GET, "http://localhost/")
            .is_err());
    }
}
