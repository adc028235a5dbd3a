// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! # Stagehand Provider
//!
//! Stage descriptors, storage access strategies and the HTTP executor that the
//! Stagehand transfer engine drives.

pub mod http;
pub mod idle;
pub mod stage;
pub mod strategy;
pub mod util;

pub use http::{
    ExecuteOptions, HeaderCustomizer, HttpExecutor, HttpRequest, HttpResponse, ReqwestExecutor,
    StatusError,
};
pub use stage::{CredentialRefresher, StageCredentials, StageLocation, ACCESS_TOKEN_KEY};
pub use strategy::{
    AccessStrategy, DefaultAccessStrategy, DownloadStream, ObjectSummary, Operation,
    RemoteObjectMetadata, TokenUploadRequest, UploadStream, UserMetadata,
    VirtualHostAccessStrategy, METADATA_PREFIX,
};

pub use reqwest;
