// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::io;
use std::time::Duration;

use stagehand_provider::{AccessStrategy, Operation, StatusError};

use crate::config::TransferConfig;
use crate::encryption::key::CipherUnavailable;
use crate::error::{TransferError, TransferErrorKind};

/// OS error code for "no space left on device".
const ENOSPC: i32 = 28;

const CRYPTO_REMEDIATION: &str =
    "The AES cipher for the stage key could not be initialized. Check that the query stage master \
     key is a base64 encoded 128, 192 or 256 bit key.";
const DISK_FULL_REMEDIATION: &str = "Free up space on the local disk and try again.";

/// What the retry loop should do with a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassifiedOutcome {
    /// A timeout or interruption. Try again while attempts remain.
    Retry,
    /// The access strategy recovered (e.g. refreshed a token). Try again.
    Handled,
    /// Stop and surface an error of this kind.
    Fatal(TransferErrorKind),
}

impl ClassifiedOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClassifiedOutcome::Fatal(_))
    }
}

/// Classifies the failure of attempt number `retry_count` (1-based).
pub async fn classify(
    err: &anyhow::Error,
    retry_count: u32,
    operation: Operation,
    max_retries: u32,
    strategy: &dyn AccessStrategy,
) -> ClassifiedOutcome {
    if is_crypto_unavailable(err) {
        return ClassifiedOutcome::Fatal(TransferErrorKind::CryptoUnavailable);
    }
    if is_disk_full(err) {
        return ClassifiedOutcome::Fatal(TransferErrorKind::LocalResourceExhausted);
    }
    if strategy
        .handle_storage_error(err, retry_count, operation)
        .await
    {
        return ClassifiedOutcome::Handled;
    }
    if is_timeout(err) {
        if retry_count <= max_retries {
            return ClassifiedOutcome::Retry;
        }
        return ClassifiedOutcome::Fatal(TransferErrorKind::TransferFailed);
    }
    ClassifiedOutcome::Fatal(status_or_failed(err))
}

/// Kind for a failure while preparing an attempt (opening or encrypting the source).
/// These are never retried.
pub fn prepare_failure_kind(err: &anyhow::Error) -> TransferErrorKind {
    if is_crypto_unavailable(err) {
        TransferErrorKind::CryptoUnavailable
    } else if is_disk_full(err) {
        TransferErrorKind::LocalResourceExhausted
    } else {
        TransferErrorKind::TransferFailed
    }
}

/// Kind for a failure while decrypting a downloaded object.
pub fn decrypt_failure_kind(err: &anyhow::Error) -> TransferErrorKind {
    if is_crypto_unavailable(err) {
        TransferErrorKind::CryptoUnavailable
    } else if is_disk_full(err) {
        TransferErrorKind::LocalResourceExhausted
    } else {
        TransferErrorKind::DecryptionFailed
    }
}

/// Builds the terminal error for `err`, with remediation text where there is some.
pub fn fatal_error(
    kind: TransferErrorKind,
    operation: Operation,
    query_id: &str,
    err: anyhow::Error,
) -> TransferError {
    let message = format!("Encountered exception during {}: {:#}", operation, err);
    let fatal = TransferError::new(kind, operation.as_str(), query_id, message).with_source(err);
    match kind {
        TransferErrorKind::CryptoUnavailable => fatal.with_remediation(CRYPTO_REMEDIATION),
        TransferErrorKind::LocalResourceExhausted => fatal.with_remediation(DISK_FULL_REMEDIATION),
        _ => fatal,
    }
}

/// True if the chain contains a cipher initialization failure.
pub fn is_crypto_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<CipherUnavailable>())
}

/// True if the chain contains an out-of-space I/O error.
pub fn is_disk_full(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|e| e.kind() == io::ErrorKind::StorageFull || e.raw_os_error() == Some(ENOSPC))
}

/// True for interruptions and socket level timeouts.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(is_timeout_cause)
}

// `io::Error::source` skips the error it wraps, so wrapped errors are checked by hand.
fn is_timeout_cause(cause: &(dyn std::error::Error + 'static)) -> bool {
    if let Some(e) = cause.downcast_ref::<io::Error>() {
        if matches!(
            e.kind(),
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
        ) {
            return true;
        }
        return e.get_ref().is_some_and(|inner| {
            let inner: &(dyn std::error::Error + 'static) = inner;
            is_timeout_cause(inner)
        });
    }
    if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
        return e.is_timeout();
    }
    cause.is::<tokio::time::error::Elapsed>()
}

fn status_or_failed(err: &anyhow::Error) -> TransferErrorKind {
    if err.chain().any(|cause| cause.is::<StatusError>()) {
        TransferErrorKind::RemoteRejected
    } else {
        TransferErrorKind::TransferFailed
    }
}

/// Attempt bound and sleep schedule for the orchestrator's retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_min: Duration,
    pub backoff_max_exponent: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_min: config.retry_backoff_min(),
            backoff_max_exponent: config.retry_backoff_max_exponent,
        }
    }

    /// Sleep before retry number `retry_count`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count <= 1 {
            return self.backoff_min;
        }
        let exponent = (retry_count - 1).min(self.backoff_max_exponent).min(31);
        self.backoff_min.saturating_mul(1u32 << exponent)
    }

    /// True once `retry_count` failures have used up every allowed retry.
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }
}
