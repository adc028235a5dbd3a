// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use stagehand_provider::util::usable_presigned_url;
use stagehand_provider::{AccessStrategy, ObjectSummary, Operation, StageCredentials, StageLocation};

use crate::config::{StrategyKind, TransferContext};
use crate::encryption::key::{EncryptionMaterial, KeySize};
use crate::error::{TransferError, TransferErrorKind};
use crate::metadata::ObjectMetadata;
use crate::retry::{fatal_error, RetryPolicy};

pub mod download;
pub mod upload;

/// Per-call options for uploads.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// Presigned PUT URL. Falls back to the stage's presigned URL.
    pub presigned_url: Option<String>,
    /// Correlation id carried by errors. Falls back to the encryption material's query id.
    pub query_id: Option<String>,
    /// Overrides the configured parallelism hint.
    pub parallelism: Option<usize>,
}

/// Per-call options for downloads.
#[derive(Clone, Debug, Default)]
pub struct DownloadOptions {
    /// Presigned GET URL. Falls back to the stage's presigned URL.
    pub presigned_url: Option<String>,
    /// Correlation id carried by errors. Falls back to the encryption material's query id.
    pub query_id: Option<String>,
    /// Overrides the configured parallelism hint.
    pub parallelism: Option<usize>,
}

/// Cumulative counters for one client. They survive [`TransferClient::renew`].
#[derive(Debug, Default)]
pub struct TransferStats {
    uploads: AtomicU64,
    downloads: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    renewals: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferStatsSnapshot {
    pub uploads: u64,
    pub downloads: u64,
    pub attempts: u64,
    pub retries: u64,
    pub failures: u64,
    pub renewals: u64,
}

impl TransferStats {
    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_success(&self, operation: Operation) {
        match operation {
            Operation::Upload => self.uploads.fetch_add(1, Ordering::Relaxed),
            Operation::Download => self.downloads.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of one successful transfer call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Wall-clock time spent moving bytes.
    #[serde(with = "millis")]
    pub network_elapsed: Duration,
    /// Wall-clock time spent decrypting after the download.
    #[serde(with = "millis")]
    pub decrypt_elapsed: Duration,
}

mod millis {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Transfer client bound to one stage.
///
/// `renew` takes `&mut self`, so credentials can only be replaced between transfers.
/// Calls that only need `&self` may run concurrently on a shared client.
pub struct TransferClient {
    stage: StageLocation,
    material: Option<EncryptionMaterial>,
    key_size: Option<KeySize>,
    strategy: Arc<dyn AccessStrategy>,
    strategy_kind: StrategyKind,
    context: TransferContext,
    stats: Arc<TransferStats>,
}

impl TransferClient {
    /// Creates a client for `stage`. Fails with [`TransferErrorKind::InvalidConfiguration`] if the
    /// master key cannot be decoded or is not 128, 192 or 256 bits long.
    pub fn new(
        stage: StageLocation,
        material: Option<EncryptionMaterial>,
        context: TransferContext,
    ) -> Result<Self, TransferError> {
        let query_id = material
            .as_ref()
            .map(|m| m.query_id.clone())
            .unwrap_or_default();

        let key_size = match &material {
            Some(material) => {
                let key = material.decode_master_key().map_err(|e| {
                    TransferError::invalid_configuration(
                        &query_id,
                        "query stage master key is not valid base64",
                    )
                    .with_source(e)
                })?;
                let size = KeySize::from_len(key.len()).ok_or_else(|| {
                    TransferError::invalid_configuration(
                        &query_id,
                        format!(
                            "unsupported key size: {} bits, expected 128, 192 or 256",
                            key.len() * 8
                        ),
                    )
                })?;
                Some(size)
            }
            None => None,
        };

        let strategy_kind = StrategyKind::select(&stage, &context.config);
        let strategy = context
            .strategy_factory
            .create(strategy_kind, &stage, &context)
            .map_err(|e| {
                TransferError::invalid_configuration(&query_id, "failed to create access strategy")
                    .with_source(e)
            })?;
        debug!(
            "created {} transfer client for {} (encrypted stage: {}, key size: {})",
            strategy_kind,
            stage.location,
            stage.client_side_encrypted,
            key_size.map(|k| k.bits()).unwrap_or_default()
        );

        Ok(Self {
            stage,
            material,
            key_size,
            strategy,
            strategy_kind,
            context,
            stats: Arc::new(TransferStats::default()),
        })
    }

    /// True if transfers encrypt on upload and decrypt on download.
    /// A key on an unencrypted stage is accepted and never used.
    pub fn is_encrypting(&self) -> bool {
        self.key_size.is_some() && self.stage.client_side_encrypted
    }

    /// Master key size in bits, or 0 without encryption material.
    pub fn encryption_key_size(&self) -> u32 {
        self.key_size.map(|k| k.bits()).unwrap_or_default()
    }

    /// True unless the stage credentials carry an access token.
    pub fn require_presigned_url(&self) -> bool {
        self.stage.credentials.access_token().is_none()
    }

    pub fn max_retries(&self) -> u32 {
        self.context.config.max_retries
    }

    pub fn stage(&self) -> &StageLocation {
        &self.stage
    }

    pub fn context(&self) -> &TransferContext {
        &self.context
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy_kind
    }

    pub fn stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Replaces the stage credentials and rebuilds the access strategy in place.
    /// Statistics and the pooled HTTP client are kept.
    pub async fn renew(&mut self, credentials: StageCredentials) -> Result<(), TransferError> {
        self.stage.credentials = credentials;
        let kind = StrategyKind::select(&self.stage, &self.context.config);
        let strategy = self
            .context
            .strategy_factory
            .create(kind, &self.stage, &self.context)
            .map_err(|e| {
                TransferError::invalid_configuration(
                    self.query_id(None),
                    "failed to recreate access strategy",
                )
                .with_source(e)
            })?;
        let previous = std::mem::replace(&mut self.strategy, strategy);
        previous.shutdown().await;
        self.strategy_kind = kind;
        self.stats.record_renewal();
        debug!("renewed {} transfer client credentials", kind);
        Ok(())
    }

    /// Releases the access strategy's resources. Later transfers fail.
    pub async fn shutdown(&self) {
        self.strategy.shutdown().await;
    }

    pub async fn list_objects(
        &self,
        location: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectSummary>, TransferError> {
        self.strategy
            .list_objects(location, prefix)
            .await
            .map_err(|e| self.passthrough_error("list", e))
    }

    pub async fn object_metadata(
        &self,
        location: &str,
        key: &str,
    ) -> Result<ObjectMetadata, TransferError> {
        self.strategy
            .object_metadata(location, key)
            .await
            .map(ObjectMetadata::from)
            .map_err(|e| self.passthrough_error("metadata", e))
    }

    pub(crate) fn strategy(&self) -> &dyn AccessStrategy {
        self.strategy.as_ref()
    }

    pub(crate) fn material(&self) -> Option<&EncryptionMaterial> {
        self.material.as_ref()
    }

    pub(crate) fn stats_handle(&self) -> &TransferStats {
        &self.stats
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.context.config)
    }

    pub(crate) fn parallelism(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.context.config.parallelism).max(1)
    }

    pub(crate) fn query_id(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_string)
            .or_else(|| self.material.as_ref().map(|m| m.query_id.clone()))
            .unwrap_or_default()
    }

    /// The usable presigned URL for a call, if any.
    pub(crate) fn presigned_url<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        usable_presigned_url(requested.or(self.stage.presigned_url.as_deref()))
    }

    /// Terminal error for a retry loop that ran out of attempts.
    pub(crate) fn exhausted_error(
        &self,
        operation: Operation,
        query_id: &str,
        err: anyhow::Error,
    ) -> TransferError {
        let err = err.context(format!("gave up after {} retries", self.max_retries()));
        fatal_error(TransferErrorKind::TransferFailed, operation, query_id, err)
    }

    fn passthrough_error(&self, operation: &'static str, err: anyhow::Error) -> TransferError {
        TransferError::new(
            TransferErrorKind::TransferFailed,
            operation,
            self.query_id(None),
            format!("{:#}", err),
        )
        .with_source(err)
    }
}
