// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Credentials key holding a GCS OAuth access token.
pub const ACCESS_TOKEN_KEY: &str = "GCS_ACCESS_TOKEN";

/// Default storage endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Bag of stage credentials as handed out by the backend.
/// Keys are opaque to the transfer engine except for [`ACCESS_TOKEN_KEY`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCredentials(BTreeMap<String, String>);

impl StageCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials carrying only an access token.
    pub fn with_access_token(token: impl Into<String>) -> Self {
        let mut creds = Self::new();
        creds.insert(ACCESS_TOKEN_KEY, token);
        creds
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the access token, if one is present and non-empty.
    pub fn access_token(&self) -> Option<&str> {
        self.get(ACCESS_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StageCredentials {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Storage backend descriptor for one stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLocation {
    /// Bucket name, optionally followed by a path prefix (`bucket/path/`).
    pub location: String,
    /// Stage region, informational only for GCS.
    pub region: Option<String>,
    /// Storage endpoint override. Defaults to [`DEFAULT_ENDPOINT`].
    pub endpoint: Option<String>,
    /// Whether objects are addressed virtual-host style (`bucket.host/key`).
    pub use_virtual_url: bool,
    /// Whether objects in this stage are client-side encrypted.
    pub client_side_encrypted: bool,
    /// Stage-wide presigned URL, if the backend issued one.
    pub presigned_url: Option<String>,
    /// Credentials; replaced in place on renewal.
    pub credentials: StageCredentials,
}

impl StageLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }

    /// Splits the location into bucket and path prefix.
    pub fn bucket_and_prefix(&self) -> (&str, &str) {
        split_location(&self.location)
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_ENDPOINT)
    }
}

/// Splits `bucket/path/to/prefix` into `("bucket", "path/to/prefix")`.
pub fn split_location(location: &str) -> (&str, &str) {
    match location.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix),
        None => (location, ""),
    }
}

/// Source of fresh credentials when the backend reports an expired token.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<StageCredentials>;
}
