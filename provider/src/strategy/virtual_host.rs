// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{header, Client, Url};

use super::{
    encode_key, object_name, parse_size, AccessStrategy, DownloadStream, GcsTransport,
    ObjectSummary, Operation, RemoteObjectMetadata, TokenUploadRequest, UploadStream, UserMetadata,
};
use crate::stage::{CredentialRefresher, StageLocation};
use crate::util::metadata_from_headers;

/// Virtual-host access: `https://{bucket}.{endpoint-host}/{key}`.
/// Metadata comes from a HEAD on the object; listing still goes through the JSON API.
pub struct VirtualHostAccessStrategy {
    transport: GcsTransport,
}

impl VirtualHostAccessStrategy {
    pub fn new(
        stage: &StageLocation,
        client: Client,
        refresher: Option<Arc<dyn CredentialRefresher>>,
        max_retries: u32,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            transport: GcsTransport::new(stage, client, refresher, max_retries, socket_timeout),
        }
    }

    fn object_url(&self, location: &str, key: &str) -> anyhow::Result<String> {
        let (bucket, name) = object_name(location, key);
        let mut url = Url::parse(self.transport.endpoint())?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("endpoint {} has no host", self.transport.endpoint()))?;
        let host = format!("{}.{}", bucket, host);
        url.set_host(Some(&host))?;
        Ok(format!(
            "{}/{}",
            url.as_str().trim_end_matches('/'),
            encode_key(&name)
        ))
    }
}

#[async_trait]
impl AccessStrategy for VirtualHostAccessStrategy {
    async fn list_objects(
        &self,
        location: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<ObjectSummary>> {
        self.transport.list_json(location, prefix).await
    }

    async fn object_metadata(
        &self,
        location: &str,
        key: &str,
    ) -> anyhow::Result<RemoteObjectMetadata> {
        let url = self.object_url(location, key)?;
        let builder = self.transport.request(reqwest::Method::HEAD, &url)?;
        let response = self.transport.send(builder).await?;
        let content_length = response
            .header(header::CONTENT_LENGTH.as_str())
            .ok_or_else(|| anyhow!("no content length for {}", key))
            .and_then(parse_size)?;
        Ok(RemoteObjectMetadata {
            content_length,
            content_encoding: response
                .header(header::CONTENT_ENCODING.as_str())
                .map(str::to_string),
            user_metadata: metadata_from_headers(&response.headers),
        })
    }

    async fn upload_with_token(
        &self,
        request: TokenUploadRequest<'_>,
        body: UploadStream,
    ) -> anyhow::Result<()> {
        let url = self.object_url(request.location, request.key)?;
        self.transport.put_object(&url, request, body).await
    }

    async fn download(
        &self,
        _parallelism: usize,
        location: &str,
        key: &str,
        dest: &Path,
    ) -> anyhow::Result<UserMetadata> {
        let url = self.object_url(location, key)?;
        self.transport.get_object_to_file(&url, dest).await
    }

    async fn download_to_stream(
        &self,
        location: &str,
        key: &str,
        decrypting: bool,
    ) -> anyhow::Result<(DownloadStream, UserMetadata)> {
        let url = self.object_url(location, key)?;
        self.transport.get_object(&url, decrypting).await
    }

    async fn handle_storage_error(
        &self,
        err: &anyhow::Error,
        retry_count: u32,
        operation: Operation,
    ) -> bool {
        self.transport
            .handle_storage_error(err, retry_count, operation)
            .await
    }

    async fn shutdown(&self) {
        self.transport.shutdown();
    }
}
