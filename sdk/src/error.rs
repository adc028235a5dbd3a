// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::error::Error as StdError;
use std::fmt;

/// Category of a transfer failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferErrorKind {
    /// Bad key size, bad credentials, unusable stage. Raised at setup, never retried.
    InvalidConfiguration,
    /// The cipher needed for the stage key could not be initialized.
    CryptoUnavailable,
    /// Local disk is full.
    LocalResourceExhausted,
    /// Timeouts and interruptions that outlived the retry budget.
    TransientTransport,
    /// The backend rejected the request with a non-2xx status.
    RemoteRejected,
    /// Ciphertext, wrapped key or envelope could not be decrypted or parsed.
    DecryptionFailed,
    /// A caller stream failed and cannot be read a second time.
    StreamNotRetryable,
    /// Any other terminal failure.
    TransferFailed,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferErrorKind::InvalidConfiguration => "invalid configuration",
            TransferErrorKind::CryptoUnavailable => "cryptography unavailable",
            TransferErrorKind::LocalResourceExhausted => "local resource exhausted",
            TransferErrorKind::TransientTransport => "transient transport failure",
            TransferErrorKind::RemoteRejected => "remote rejected request",
            TransferErrorKind::DecryptionFailed => "decryption failed",
            TransferErrorKind::StreamNotRetryable => "stream not retryable",
            TransferErrorKind::TransferFailed => "transfer failed",
        };
        f.write_str(s)
    }
}

/// Terminal error surfaced by the transfer client.
#[derive(Debug, thiserror::Error)]
#[error("{kind} during {operation} (query id: {query_id}): {message}")]
pub struct TransferError {
    kind: TransferErrorKind,
    operation: &'static str,
    query_id: String,
    message: String,
    remediation: Option<&'static str>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl TransferError {
    pub fn new(
        kind: TransferErrorKind,
        operation: &'static str,
        query_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation,
            query_id: query_id.into(),
            message: message.into(),
            remediation: None,
            source: None,
        }
    }

    pub fn invalid_configuration(
        query_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            TransferErrorKind::InvalidConfiguration,
            "setup",
            query_id,
            message,
        )
        .with_remediation("Check the stage credentials and the query stage master key.")
    }

    /// Attaches the original cause.
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_remediation(mut self, remediation: &'static str) -> Self {
        self.remediation = Some(remediation);
        self
    }

    pub fn kind(&self) -> TransferErrorKind {
        self.kind
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Human-readable advice for fixing the failure, if there is any.
    pub fn remediation(&self) -> Option<&'static str> {
        self.remediation
    }
}
