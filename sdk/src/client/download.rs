// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use reqwest::header::{self, HeaderValue};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use stagehand_provider::util::{metadata_from_headers, scrub_presigned_url};
use stagehand_provider::{DownloadStream, HttpRequest, HttpResponse, Operation, UserMetadata};

use crate::client::{DownloadOptions, TransferClient, TransferSummary};
use crate::encryption::metadata::{EncryptionEnvelope, EncryptionKeyData, ENCRYPTION_DATA_KEY};
use crate::error::{TransferError, TransferErrorKind};
use crate::retry::{classify, decrypt_failure_kind, fatal_error, ClassifiedOutcome};

impl TransferClient {
    /// Downloads `key` under `location` into `dest`, decrypting in place when the client is
    /// encrypting. Every retry fetches the whole object again.
    pub async fn download(
        &self,
        location: &str,
        key: &str,
        dest: &Path,
        options: &DownloadOptions,
    ) -> Result<TransferSummary, TransferError> {
        let operation = Operation::Download;
        let query_id = self.query_id(options.query_id.as_deref());
        let presigned_url = self.presigned_url(options.presigned_url.as_deref());
        let parallelism = self.parallelism(options.parallelism);
        debug!("downloading {}/{} to {}", location, key, dest.display());

        let start = Instant::now();
        let result = self
            .retry_fetch(operation, &query_id, move || async move {
                let user_metadata = match presigned_url {
                    Some(url) => self.get_presigned_to_file(url, dest).await?,
                    None => {
                        self.strategy()
                            .download(parallelism, location, key, dest)
                            .await?
                    }
                };
                self.restrict_permissions(dest).await?;
                anyhow::Ok(user_metadata)
            })
            .await;
        let (user_metadata, attempts) = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                self.stats_handle().record_failure();
                return Err(e);
            }
        };
        let network_elapsed = start.elapsed();

        let mut decrypt_elapsed = Duration::ZERO;
        if let Some(keys) = self.encryption_keys(&user_metadata, key, &query_id)? {
            let decrypt_start = Instant::now();
            let decrypted = async {
                let material = self.material().context("missing encryption material")?;
                self.context()
                    .engine
                    .decrypt_file(dest, &keys, material)
                    .await?;
                self.restrict_permissions(dest).await
            }
            .await;
            if let Err(err) = decrypted {
                self.stats_handle().record_failure();
                let err = err.context(format!("cannot decrypt {}", dest.display()));
                return Err(fatal_error(
                    decrypt_failure_kind(&err),
                    operation,
                    &query_id,
                    err,
                ));
            }
            decrypt_elapsed = decrypt_start.elapsed();
        }

        self.stats_handle().record_success(operation);
        info!(
            "downloaded {}/{} to {}. It took {} ms (download: {} ms, decryption: {} ms) with {} retries",
            location,
            key,
            dest.display(),
            (network_elapsed + decrypt_elapsed).as_millis(),
            network_elapsed.as_millis(),
            decrypt_elapsed.as_millis(),
            attempts - 1
        );
        Ok(TransferSummary {
            attempts,
            network_elapsed,
            decrypt_elapsed,
        })
    }

    /// Opens `key` under `location` for reading. When the client is encrypting, the stream
    /// decrypts as it is read.
    pub async fn download_to_stream(
        &self,
        location: &str,
        key: &str,
        options: &DownloadOptions,
    ) -> Result<DownloadStream, TransferError> {
        let operation = Operation::Download;
        let query_id = self.query_id(options.query_id.as_deref());
        let presigned_url = self.presigned_url(options.presigned_url.as_deref());
        let decrypting = self.is_encrypting();
        debug!("downloading {}/{} to a stream", location, key);

        let start = Instant::now();
        let result = self
            .retry_fetch(operation, &query_id, move || async move {
                match presigned_url {
                    Some(url) => {
                        let response = self.get_presigned(url).await?;
                        let user_metadata = metadata_from_headers(&response.headers);
                        anyhow::Ok((response.into_body(), user_metadata))
                    }
                    None => {
                        self.strategy()
                            .download_to_stream(location, key, decrypting)
                            .await
                    }
                }
            })
            .await;
        let ((stream, user_metadata), attempts) = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                self.stats_handle().record_failure();
                return Err(e);
            }
        };

        let stream = match self.encryption_keys(&user_metadata, key, &query_id)? {
            Some(keys) => {
                let wrapped = self
                    .material()
                    .context("missing encryption material")
                    .and_then(|material| {
                        self.context()
                            .engine
                            .decrypt_stream(stream, &keys, material)
                    });
                match wrapped {
                    Ok(stream) => stream,
                    Err(err) => {
                        self.stats_handle().record_failure();
                        return Err(fatal_error(
                            decrypt_failure_kind(&err),
                            operation,
                            &query_id,
                            err,
                        ));
                    }
                }
            }
            None => stream,
        };

        self.stats_handle().record_success(operation);
        info!(
            "opened {}/{} for streaming. It took {} ms with {} retries",
            location,
            key,
            start.elapsed().as_millis(),
            attempts - 1
        );
        Ok(stream)
    }

    /// Runs `fetch` until it succeeds or a failure is classified as fatal.
    /// Returns the value and the number of attempts made.
    async fn retry_fetch<T, F, Fut>(
        &self,
        operation: Operation,
        query_id: &str,
        mut fetch: F,
    ) -> Result<(T, u32), TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let policy = self.retry_policy();
        let mut retry_count = 0;
        loop {
            self.stats_handle().record_attempt();
            let err = match fetch().await {
                Ok(value) => return Ok((value, retry_count + 1)),
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
                return Err(fatal_error(kind, operation, query_id, err));
            }
            if policy.exhausted(retry_count) {
                return Err(self.exhausted_error(operation, query_id, err));
            }

            self.stats_handle().record_retry();
            let delay = policy.delay(retry_count);
            debug!(
                "{} failed ({:?}): {:#}; retry {} in {:?}",
                operation, outcome, err, retry_count, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// The content key and IV for a downloaded object, if it must be decrypted.
    /// An object without an envelope was written unencrypted and is passed through.
    fn encryption_keys(
        &self,
        user_metadata: &UserMetadata,
        key: &str,
        query_id: &str,
    ) -> Result<Option<EncryptionKeyData>, TransferError> {
        if !self.is_encrypting() {
            return Ok(None);
        }
        let Some(json) = user_metadata.get(ENCRYPTION_DATA_KEY) else {
            warn!("{} has no encryption data, returning it as stored", key);
            return Ok(None);
        };
        EncryptionEnvelope::parse(json).map(Some).map_err(|err| {
            self.stats_handle().record_failure();
            fatal_error(
                TransferErrorKind::DecryptionFailed,
                Operation::Download,
                query_id,
                err.context("file metadata incomplete"),
            )
        })
    }

    async fn get_presigned(&self, url: &str) -> anyhow::Result<HttpResponse> {
        debug!("fetching {}", scrub_presigned_url(url));
        let request = HttpRequest::get(url)?
            .with_header(header::ACCEPT_ENCODING, HeaderValue::from_static("GZIP"));
        let options = self.context().execute_options(true, false);
        let response = self.context().executor.execute(request, &options).await?;
        debug!(
            "presigned GET from {} returned {}",
            scrub_presigned_url(url),
            response.status
        );
        if !response.is_success() {
            return Err(response.into_status_error().await.into());
        }
        Ok(response)
    }

    async fn get_presigned_to_file(&self, url: &str, dest: &Path) -> anyhow::Result<UserMetadata> {
        let response = self.get_presigned(url).await?;
        let user_metadata = metadata_from_headers(&response.headers);
        let mut body = response.into_body();
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        Ok(user_metadata)
    }

    /// Restricts `path` to the owner when configured. No-op off Unix.
    async fn restrict_permissions(&self, path: &Path) -> anyhow::Result<()> {
        if !self.context().config.owner_only_permissions {
            return Ok(());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }
}
