// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Client-side envelope encryption.
//!
//! Each object is encrypted with a fresh random content key using AES-CBC. The content key is
//! wrapped with the session master key and travels with the object as user metadata.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use stagehand_provider::{DownloadStream, UploadStream};

use crate::metadata::{add_encryption_metadata, ObjectMetadata};

pub mod decryptor;
pub mod encryptor;
pub mod key;
pub mod metadata;

use decryptor::{CbcDecryptor, DecryptReader};
use encryptor::{encrypted_length, CbcEncryptor, EncryptReader};
use key::{generate_iv, unsupported_key, ContentKey, EncryptionMaterial, KeySize};
use metadata::{EncryptionKeyData, MatDesc};

/// Envelope encryption of byte streams under a session master key.
#[async_trait]
pub trait EncryptionEngine: Send + Sync {
    /// Wraps `plaintext` in an encrypting stream and records the envelope, material
    /// descriptor and ciphertext length in `meta`.
    fn encrypt(
        &self,
        meta: &mut ObjectMetadata,
        plaintext_length: u64,
        plaintext: UploadStream,
        material: &EncryptionMaterial,
    ) -> anyhow::Result<UploadStream>;

    /// Decrypts the file at `path` in place.
    async fn decrypt_file(
        &self,
        path: &Path,
        key: &EncryptionKeyData,
        material: &EncryptionMaterial,
    ) -> anyhow::Result<()>;

    /// Wraps `ciphertext` in a decrypting stream.
    fn decrypt_stream(
        &self,
        ciphertext: DownloadStream,
        key: &EncryptionKeyData,
        material: &EncryptionMaterial,
    ) -> anyhow::Result<DownloadStream>;
}

/// AES-CBC content encryption with AES-ECB key wrapping.
#[derive(Clone, Copy, Debug, Default)]
pub struct AesCbcEngine;

impl AesCbcEngine {
    fn content_decryptor(
        &self,
        key: &EncryptionKeyData,
        material: &EncryptionMaterial,
    ) -> anyhow::Result<CbcDecryptor> {
        let master = material.decode_master_key()?;
        let wrapped = STANDARD
            .decode(&key.encrypted_key)
            .context("wrapped content key is not valid base64")?;
        let iv = STANDARD
            .decode(&key.iv)
            .context("content IV is not valid base64")?;
        let content_key = ContentKey::unwrap_from(&master, &wrapped)?;
        CbcDecryptor::new(content_key.as_bytes(), &iv)
    }
}

#[async_trait]
impl EncryptionEngine for AesCbcEngine {
    fn encrypt(
        &self,
        meta: &mut ObjectMetadata,
        plaintext_length: u64,
        plaintext: UploadStream,
        material: &EncryptionMaterial,
    ) -> anyhow::Result<UploadStream> {
        let master = material.decode_master_key()?;
        let size = KeySize::from_len(master.len()).ok_or_else(|| unsupported_key(master.len()))?;

        let content_key = ContentKey::generate(size, None);
        let iv = generate_iv(None);
        let encryptor = CbcEncryptor::new(content_key.as_bytes(), &iv)?;
        let wrapped = content_key.wrap(&master)?;

        let matdesc = MatDesc::new(material.smk_id, material.query_id.clone(), size.bits());
        add_encryption_metadata(
            meta,
            &matdesc,
            &iv,
            &wrapped,
            encrypted_length(plaintext_length),
        )?;
        Ok(Box::new(EncryptReader::new(plaintext, encryptor)))
    }

    async fn decrypt_file(
        &self,
        path: &Path,
        key: &EncryptionKeyData,
        material: &EncryptionMaterial,
    ) -> anyhow::Result<()> {
        let decryptor = self.content_decryptor(key, material)?;
        let source = File::open(path)
            .await
            .with_context(|| format!("failed to open {} for decryption", path.display()))?;
        let tmp = sibling_temp_path(path)?;

        let result = async {
            let mut reader = DecryptReader::new(source, decryptor);
            let mut out = File::create(&tmp).await?;
            tokio::io::copy(&mut reader, &mut out).await?;
            out.flush().await?;
            drop(out);
            tokio::fs::rename(&tmp, path).await?;
            anyhow::Ok(())
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    fn decrypt_stream(
        &self,
        ciphertext: DownloadStream,
        key: &EncryptionKeyData,
        material: &EncryptionMaterial,
    ) -> anyhow::Result<DownloadStream> {
        let decryptor = self.content_decryptor(key, material)?;
        Ok(Box::new(DecryptReader::new(ciphertext, decryptor)))
    }
}

fn sibling_temp_path(path: &Path) -> anyhow::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("{} is not a file path", path.display()))?
        .to_string_lossy();
    Ok(path.with_file_name(format!(
        ".{}.{:016x}.decrypting",
        name,
        rand::random::<u64>()
    )))
}
