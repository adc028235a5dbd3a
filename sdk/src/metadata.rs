// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use stagehand_provider::{RemoteObjectMetadata, UserMetadata};

use crate::encryption::metadata::{EncryptionEnvelope, MatDesc, ENCRYPTION_DATA_KEY, MATDESC_KEY};

/// User-metadata key holding the plaintext digest.
pub const DIGEST_KEY: &str = "sfc-digest";
/// User-metadata key holding the streaming ingest client name.
pub const INGEST_CLIENT_NAME_KEY: &str = "ingestclientname";
/// User-metadata key holding the streaming ingest client key.
pub const INGEST_CLIENT_KEY_KEY: &str = "ingestclientkey";

/// Metadata for one object transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    content_length: u64,
    content_encoding: Option<String>,
    user_metadata: UserMetadata,
}

impl ObjectMetadata {
    pub fn new(content_length: u64) -> Self {
        Self {
            content_length,
            ..Default::default()
        }
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn set_content_length(&mut self, content_length: u64) {
        self.content_length = content_length;
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn user_metadata(&self) -> &UserMetadata {
        &self.user_metadata
    }

    pub fn add_user_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.user_metadata.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.user_metadata.get(key).map(String::as_str)
    }
}

impl From<RemoteObjectMetadata> for ObjectMetadata {
    fn from(remote: RemoteObjectMetadata) -> Self {
        Self {
            content_length: remote.content_length,
            content_encoding: remote.content_encoding,
            user_metadata: remote.user_metadata,
        }
    }
}

/// Records the material descriptor and the encryption envelope, and sets the content
/// length to that of the ciphertext.
pub fn add_encryption_metadata(
    meta: &mut ObjectMetadata,
    matdesc: &MatDesc,
    iv: &[u8],
    encrypted_key: &[u8],
    content_length: u64,
) -> anyhow::Result<()> {
    meta.add_user_metadata(MATDESC_KEY, matdesc.to_json()?);
    let envelope = EncryptionEnvelope::new(STANDARD.encode(encrypted_key), STANDARD.encode(iv));
    meta.add_user_metadata(ENCRYPTION_DATA_KEY, envelope.to_json()?);
    meta.set_content_length(content_length);
    Ok(())
}

/// Records the digest unless it is blank.
pub fn add_digest_metadata(meta: &mut ObjectMetadata, digest: &str) {
    if !digest.trim().is_empty() {
        meta.add_user_metadata(DIGEST_KEY, digest);
    }
}

pub fn digest_metadata(meta: &ObjectMetadata) -> Option<&str> {
    meta.get(DIGEST_KEY)
}

/// Records the streaming ingest client identity, used for per-client billing.
pub fn add_streaming_ingest_metadata(
    meta: &mut ObjectMetadata,
    client_name: &str,
    client_key: &str,
) {
    meta.add_user_metadata(INGEST_CLIENT_NAME_KEY, client_name);
    meta.add_user_metadata(INGEST_CLIENT_KEY_KEY, client_key);
}

pub fn streaming_ingest_client_name(meta: &ObjectMetadata) -> Option<&str> {
    meta.get(INGEST_CLIENT_NAME_KEY)
}

pub fn streaming_ingest_client_key(meta: &ObjectMetadata) -> Option<&str> {
    meta.get(INGEST_CLIENT_KEY_KEY)
}

/// Base64 SHA-256 of everything `reader` yields, plus the byte count.
pub async fn compute_digest<R: AsyncRead + Unpin>(mut reader: R) -> anyhow::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((STANDARD.encode(hasher.finalize()), total))
}
