// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    encode_key, object_name, parse_size, AccessStrategy, DownloadStream, GcsTransport,
    ObjectSummary, Operation, RemoteObjectMetadata, TokenUploadRequest, UploadStream, UserMetadata,
};
use crate::stage::{CredentialRefresher, StageLocation};

/// Path-style access: `https://{endpoint}/{bucket}/{key}` for object data, JSON API for metadata.
pub struct DefaultAccessStrategy {
    transport: GcsTransport,
}

impl DefaultAccessStrategy {
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

    fn object_url(&self, location: &str, key: &str) -> String {
        let (bucket, name) = object_name(location, key);
        format!(
            "{}/{}/{}",
            self.transport.endpoint(),
            urlencoding::encode(bucket),
            encode_key(&name)
        )
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonObject {
    size: String,
    content_encoding: Option<String>,
    #[serde(default)]
    metadata: UserMetadata,
}

#[async_trait]
impl AccessStrategy for DefaultAccessStrategy {
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
        let (bucket, name) = object_name(location, key);
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.transport.endpoint(),
            urlencoding::encode(bucket),
            urlencoding::encode(&name)
        );
        let builder = self.transport.request(reqwest::Method::GET, &url)?;
        let body = self.transport.send(builder).await?.text().await?;
        let object: JsonObject =
            serde_json::from_str(&body).context("failed to parse object metadata")?;
        Ok(RemoteObjectMetadata {
            content_length: parse_size(&object.size)
                .with_context(|| format!("bad size for {}", name))?,
            content_encoding: object.content_encoding,
            user_metadata: object.metadata,
        })
    }

    async fn upload_with_token(
        &self,
        request: TokenUploadRequest<'_>,
        body: UploadStream,
    ) -> anyhow::Result<()> {
        let url = self.object_url(request.location, request.key);
        self.transport.put_object(&url, request, body).await
    }

    async fn download(
        &self,
        _parallelism: usize,
        location: &str,
        key: &str,
        dest: &Path,
    ) -> anyhow::Result<UserMetadata> {
        let url = self.object_url(location, key);
        self.transport.get_object_to_file(&url, dest).await
    }

    async fn download_to_stream(
        &self,
        location: &str,
        key: &str,
        decrypting: bool,
    ) -> anyhow::Result<(DownloadStream, UserMetadata)> {
        let url = self.object_url(location, key);
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
