// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! # Stagehand SDK
//!
//! Moves objects between a database client and its cloud stage, adding client-side
//! envelope encryption, presigned URL or token authentication, and bounded retries.

pub mod client;
pub mod config;
pub mod encryption;
pub mod error;
pub mod metadata;
pub mod retry;
pub mod source;
pub mod spill;

pub use client::{
    DownloadOptions, TransferClient, TransferStats, TransferStatsSnapshot, TransferSummary,
    UploadOptions,
};
pub use config::{
    GcsStrategyFactory, StrategyFactory, StrategyKind, TransferConfig, TransferContext,
};
pub use encryption::key::{EncryptionMaterial, KeySize};
pub use encryption::{AesCbcEngine, EncryptionEngine};
pub use error::{TransferError, TransferErrorKind};
pub use metadata::ObjectMetadata;
pub use source::{ByteSource, StreamProvisioner};
pub use spill::SpillBuffer;
