// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::{Duration, Instant};

use anyhow::Context as _;
use reqwest::header::{self, HeaderValue};
use tracing::{debug, info};

use stagehand_provider::util::{metadata_headers, scrub_presigned_url, transport_content_encoding};
use stagehand_provider::{
    HttpRequest, Operation, StatusError, TokenUploadRequest, UploadStream,
};

use crate::client::{TransferClient, TransferSummary, UploadOptions};
use crate::error::{TransferError, TransferErrorKind};
use crate::metadata::ObjectMetadata;
use crate::retry::{classify, fatal_error, is_timeout, prepare_failure_kind, ClassifiedOutcome};
use crate::source::{ByteSource, ProvisionError, StreamProvisioner};

/// Destination and transport settings shared by every attempt of one upload.
struct UploadTarget<'a> {
    location: &'a str,
    key: &'a str,
    presigned_url: Option<&'a str>,
    parallelism: usize,
    network_timeout: Duration,
    retry_on_forbidden: bool,
}

impl TransferClient {
    /// Uploads `source` to `key` under `location`, encrypting when the client is encrypting.
    ///
    /// A presigned URL (from `options` or the stage) selects a direct PUT; otherwise the access
    /// strategy uploads with the stage token. Failed attempts are classified and retried with a
    /// fresh stream. A [`ByteSource::Stream`] can only be sent once.
    pub async fn upload(
        &self,
        source: ByteSource,
        location: &str,
        key: &str,
        meta: &ObjectMetadata,
        options: &UploadOptions,
    ) -> Result<TransferSummary, TransferError> {
        let operation = Operation::Upload;
        let query_id = self.query_id(options.query_id.as_deref());
        let policy = self.retry_policy();
        let target = UploadTarget {
            location,
            key,
            presigned_url: self.presigned_url(options.presigned_url.as_deref()),
            parallelism: self.parallelism(options.parallelism),
            network_timeout: self.context().config.network_timeout(),
            retry_on_forbidden: true,
        };
        let mut provisioner = StreamProvisioner::new(source);
        debug!(
            "uploading {} to {}/{} with {}",
            provisioner.describe(),
            location,
            key,
            target.describe()
        );

        let start = Instant::now();
        let mut retry_count = 0;
        let result = loop {
            self.stats_handle().record_attempt();
            let prepared = self.prepare_upload(&mut provisioner, meta, &query_id).await;
            let (body, attempt_meta) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => break Err(e),
            };
            let err = match self.send_upload(body, &attempt_meta, &target).await {
                Ok(()) => break Ok(retry_count + 1),
                Err(err) => err,
            };

            retry_count += 1;
            let outcome = classify(
                &err,
                retry_count,
                operation,
                policy.max_retries,
                self.strategy(),
            )
            .await;
            if let ClassifiedOutcome::Fatal(kind) = outcome {
                break Err(fatal_error(kind, operation, &query_id, err));
            }
            if policy.exhausted(retry_count) {
                break Err(self.exhausted_error(operation, &query_id, err));
            }
            if !provisioner.can_reopen() {
                break Err(fatal_error(
                    TransferErrorKind::StreamNotRetryable,
                    operation,
                    &query_id,
                    err.context("upload from a stream cannot be retried"),
                ));
            }

            self.stats_handle().record_retry();
            let delay = policy.delay(retry_count);
            debug!(
                "upload of {} failed ({:?}): {:#}; retry {} in {:?}",
                key, outcome, err, retry_count, delay
            );
            tokio::time::sleep(delay).await;
        };

        provisioner.close_all();
        match result {
            Ok(attempts) => {
                let elapsed = start.elapsed();
                self.stats_handle().record_success(operation);
                info!(
                    "uploaded {} to {}/{}. It took {} ms with {} retries",
                    provisioner.describe(),
                    location,
                    key,
                    elapsed.as_millis(),
                    attempts - 1
                );
                Ok(TransferSummary {
                    attempts,
                    network_elapsed: elapsed,
                    decrypt_elapsed: Duration::ZERO,
                })
            }
            Err(e) => {
                self.stats_handle().record_failure();
                Err(e)
            }
        }
    }

    /// Uploads `source` with a single attempt and no retry loop, bounded by `network_timeout`.
    /// Used for one-off writes that have no session to renew credentials against.
    pub async fn upload_without_session(
        &self,
        source: ByteSource,
        location: &str,
        key: &str,
        meta: &ObjectMetadata,
        options: &UploadOptions,
        network_timeout: Duration,
    ) -> Result<TransferSummary, TransferError> {
        let operation = Operation::Upload;
        let query_id = self.query_id(options.query_id.as_deref());
        let target = UploadTarget {
            location,
            key,
            presigned_url: self.presigned_url(options.presigned_url.as_deref()),
            parallelism: self.parallelism(options.parallelism),
            network_timeout,
            retry_on_forbidden: false,
        };
        let mut provisioner = StreamProvisioner::new(source);
        debug!(
            "uploading {} to {}/{} with {}, single attempt",
            provisioner.describe(),
            location,
            key,
            target.describe()
        );

        let start = Instant::now();
        self.stats_handle().record_attempt();
        let result = match self.prepare_upload(&mut provisioner, meta, &query_id).await {
            Ok((body, attempt_meta)) => {
                let send = self.send_upload(body, &attempt_meta, &target);
                match tokio::time::timeout(network_timeout, send).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(fatal_error(
                        upload_failure_kind(&err),
                        operation,
                        &query_id,
                        err,
                    )),
                    Err(elapsed) => Err(fatal_error(
                        TransferErrorKind::TransientTransport,
                        operation,
                        &query_id,
                        anyhow::Error::new(elapsed).context("upload timed out"),
                    )),
                }
            }
            Err(e) => Err(e),
        };
        provisioner.close_all();

        match result {
            Ok(()) => {
                let elapsed = start.elapsed();
                self.stats_handle().record_success(operation);
                info!(
                    "uploaded {} to {}/{}. It took {} ms",
                    provisioner.describe(),
                    location,
                    key,
                    elapsed.as_millis()
                );
                Ok(TransferSummary {
                    attempts: 1,
                    network_elapsed: elapsed,
                    decrypt_elapsed: Duration::ZERO,
                })
            }
            Err(e) => {
                self.stats_handle().record_failure();
                Err(e)
            }
        }
    }

    /// Opens a fresh stream and, when encrypting, wraps it and records the envelope
    /// in a copy of `meta`.
    async fn prepare_upload(
        &self,
        provisioner: &mut StreamProvisioner,
        meta: &ObjectMetadata,
        query_id: &str,
    ) -> Result<(UploadStream, ObjectMetadata), TransferError> {
        let operation = Operation::Upload;
        let stream = provisioner.reopen().await.map_err(|e| match e {
            ProvisionError::NotRetryable => fatal_error(
                TransferErrorKind::StreamNotRetryable,
                operation,
                query_id,
                anyhow::Error::new(ProvisionError::NotRetryable),
            ),
            ProvisionError::Io(io) => {
                let err = anyhow::Error::new(io).context("failed to open upload source");
                fatal_error(prepare_failure_kind(&err), operation, query_id, err)
            }
        })?;

        let mut attempt_meta = meta.clone();
        let material = match self.material() {
            Some(material) if self.is_encrypting() => material,
            _ => return Ok((stream, attempt_meta)),
        };
        let body = self
            .context()
            .engine
            .encrypt(&mut attempt_meta, meta.content_length(), stream, material)
            .map_err(|err| {
                let err = err.context("failed to encrypt upload source");
                fatal_error(prepare_failure_kind(&err), operation, query_id, err)
            })?;
        Ok((body, attempt_meta))
    }

    async fn send_upload(
        &self,
        body: UploadStream,
        meta: &ObjectMetadata,
        target: &UploadTarget<'_>,
    ) -> anyhow::Result<()> {
        match target.presigned_url {
            Some(url) => self.put_presigned(url, body, meta, target).await,
            None => {
                let request = TokenUploadRequest {
                    parallelism: target.parallelism,
                    location: target.location,
                    key: target.key,
                    content_encoding: meta.content_encoding(),
                    user_metadata: meta.user_metadata(),
                    content_length: meta.content_length(),
                };
                self.strategy().upload_with_token(request, body).await
            }
        }
    }

    async fn put_presigned(
        &self,
        url: &str,
        body: UploadStream,
        meta: &ObjectMetadata,
        target: &UploadTarget<'_>,
    ) -> anyhow::Result<()> {
        debug!("uploading to {}", scrub_presigned_url(url));
        let mut request = HttpRequest::put(url, body)?
            .with_headers(metadata_headers(meta.user_metadata())?)
            .with_header(header::CONTENT_LENGTH, HeaderValue::from(meta.content_length()));
        if let Some(encoding) = meta.content_encoding() {
            let value = HeaderValue::from_str(transport_content_encoding(encoding))
                .context("invalid content encoding")?;
            request = request.with_header(header::CONTENT_ENCODING, value);
        }

        let mut options = self
            .context()
            .execute_options(target.retry_on_forbidden, true);
        options.network_timeout = target.network_timeout;
        let response = self.context().executor.execute(request, &options).await?;
        debug!(
            "presigned PUT to {} returned {}",
            scrub_presigned_url(url),
            response.status
        );
        if !response.is_success() {
            return Err(response.into_status_error().await.into());
        }
        Ok(())
    }
}

impl UploadTarget<'_> {
    fn describe(&self) -> &'static str {
        if self.presigned_url.is_some() {
            "presigned URL"
        } else {
            "access token"
        }
    }
}

/// Kind for a failed single-attempt upload.
fn upload_failure_kind(err: &anyhow::Error) -> TransferErrorKind {
    match prepare_failure_kind(err) {
        TransferErrorKind::TransferFailed if is_timeout(err) => TransferErrorKind::TransientTransport,
        TransferErrorKind::TransferFailed if err.chain().any(|c| c.is::<StatusError>()) => {
            TransferErrorKind::RemoteRejected
        }
        kind => kind,
    }
}
