// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// User-metadata key holding the serialized [`EncryptionEnvelope`].
pub const ENCRYPTION_DATA_KEY: &str = "encryptiondata";
/// User-metadata key holding the material descriptor.
pub const MATDESC_KEY: &str = "matdesc";

const ENCRYPTION_MODE: &str = "FullBlob";
const KEY_ID: &str = "symmKey1";
const ALGORITHM: &str = "AES_CBC_256";
const AGENT_PROTOCOL: &str = "1.0";
const ENCRYPTION_LIBRARY: &str = "Java 5.3.0";

/// Encryption data stored alongside an encrypted blob.
/// Field order is part of the wire format and must not change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionEnvelope {
    pub encryption_mode: String,
    pub wrapped_content_key: WrappedContentKey,
    pub encryption_agent: EncryptionAgent,
    #[serde(rename = "ContentEncryptionIV")]
    pub content_encryption_iv: String,
    pub key_wrapping_metadata: KeyWrappingMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WrappedContentKey {
    pub key_id: String,
    pub encrypted_key: String,
    pub algorithm: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionAgent {
    pub protocol: String,
    pub encryption_algorithm: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyWrappingMetadata {
    pub encryption_library: String,
}

impl EncryptionEnvelope {
    /// Envelope for a base64 wrapped key and base64 IV.
    pub fn new(encrypted_key_b64: impl Into<String>, iv_b64: impl Into<String>) -> Self {
        Self {
            encryption_mode: ENCRYPTION_MODE.into(),
            wrapped_content_key: WrappedContentKey {
                key_id: KEY_ID.into(),
                encrypted_key: encrypted_key_b64.into(),
                algorithm: ALGORITHM.into(),
            },
            encryption_agent: EncryptionAgent {
                protocol: AGENT_PROTOCOL.into(),
                encryption_algorithm: ALGORITHM.into(),
            },
            content_encryption_iv: iv_b64.into(),
            key_wrapping_metadata: KeyWrappingMetadata {
                encryption_library: ENCRYPTION_LIBRARY.into(),
            },
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an envelope. Only the wrapped key and IV are required.
    pub fn parse(json: &str) -> anyhow::Result<EncryptionKeyData> {
        let data: EnvelopeKeys =
            serde_json::from_str(json).context("error parsing encryption data as json")?;
        Ok(EncryptionKeyData {
            encrypted_key: data.wrapped_content_key.encrypted_key,
            iv: data.content_encryption_iv,
        })
    }
}

/// The base64 wrapped key and IV recovered from an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionKeyData {
    pub encrypted_key: String,
    pub iv: String,
}

#[derive(Deserialize)]
struct EnvelopeKeys {
    #[serde(rename = "WrappedContentKey")]
    wrapped_content_key: EnvelopeKey,
    #[serde(rename = "ContentEncryptionIV")]
    content_encryption_iv: String,
}

#[derive(Deserialize)]
struct EnvelopeKey {
    #[serde(rename = "EncryptedKey")]
    encrypted_key: String,
}

/// Material descriptor recorded next to the envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatDesc {
    pub query_id: String,
    pub smk_id: String,
    pub key_size: String,
}

impl MatDesc {
    pub fn new(smk_id: i64, query_id: impl Into<String>, key_size_bits: u32) -> Self {
        Self {
            query_id: query_id.into(),
            smk_id: smk_id.to_string(),
            key_size: key_size_bits.to_string(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
