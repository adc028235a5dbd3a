// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// A cipher could not be initialized with the given key material.
#[derive(Debug, thiserror::Error)]
#[error("cipher unavailable: {0}")]
pub struct CipherUnavailable(pub String);

/// Ciphertext or padding that does not decrypt.
#[derive(Debug, thiserror::Error)]
#[error("invalid ciphertext: {0}")]
pub struct InvalidCiphertext(pub &'static str);

/// Supported AES key sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl KeySize {
    /// Key size for a key of `len` bytes.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(KeySize::Aes128),
            24 => Some(KeySize::Aes192),
            32 => Some(KeySize::Aes256),
            _ => None,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bytes() as u32 * 8
    }

    pub fn bytes(&self) -> usize {
        match self {
            KeySize::Aes128 => 16,
            KeySize::Aes192 => 24,
            KeySize::Aes256 => 32,
        }
    }
}

/// Session master key and the identity it is issued under.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct EncryptionMaterial {
    /// Base64-encoded query stage master key.
    pub query_stage_master_key: String,
    /// Query the key was issued for.
    pub query_id: String,
    /// Stage master key id.
    pub smk_id: i64,
}

impl EncryptionMaterial {
    pub fn new(
        query_stage_master_key: impl Into<String>,
        query_id: impl Into<String>,
        smk_id: i64,
    ) -> Self {
        Self {
            query_stage_master_key: query_stage_master_key.into(),
            query_id: query_id.into(),
            smk_id,
        }
    }

    /// Decodes the base64 master key.
    pub fn decode_master_key(&self) -> anyhow::Result<Vec<u8>> {
        Ok(STANDARD.decode(self.query_stage_master_key.trim())?)
    }
}

/// A per-object content key.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey(Vec<u8>);

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey({} bits)", self.0.len() * 8)
    }
}

impl ContentKey {
    /// Generates a random key of the given size.
    pub fn generate(size: KeySize, random: Option<&mut dyn RngCore>) -> Self {
        let random = match random {
            Some(r) => r,
            None => &mut OsRng,
        };
        let mut key = vec![0u8; size.bytes()];
        random.fill_bytes(&mut key);
        ContentKey(key)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ContentKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wraps this key under the master key with AES-ECB/PKCS7.
    pub fn wrap(&self, master_key: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut data = pkcs7_pad(&self.0);
        match KeySize::from_len(master_key.len()) {
            Some(KeySize::Aes128) => ecb_encrypt::<Aes128>(master_key, &mut data)?,
            Some(KeySize::Aes192) => ecb_encrypt::<Aes192>(master_key, &mut data)?,
            Some(KeySize::Aes256) => ecb_encrypt::<Aes256>(master_key, &mut data)?,
            None => return Err(unsupported_key(master_key.len()).into()),
        }
        Ok(data)
    }

    /// Unwraps a key produced by [`ContentKey::wrap`].
    pub fn unwrap_from(master_key: &[u8], wrapped: &[u8]) -> anyhow::Result<Self> {
        if wrapped.is_empty() || wrapped.len() % BLOCK_SIZE != 0 {
            return Err(InvalidCiphertext("wrapped key is not a whole number of blocks").into());
        }
        let mut data = wrapped.to_vec();
        match KeySize::from_len(master_key.len()) {
            Some(KeySize::Aes128) => ecb_decrypt::<Aes128>(master_key, &mut data)?,
            Some(KeySize::Aes192) => ecb_decrypt::<Aes192>(master_key, &mut data)?,
            Some(KeySize::Aes256) => ecb_decrypt::<Aes256>(master_key, &mut data)?,
            None => return Err(unsupported_key(master_key.len()).into()),
        }
        let len = pkcs7_unpad(&data)?;
        data.truncate(len);
        Ok(ContentKey(data))
    }
}

pub fn generate_iv(random: Option<&mut dyn RngCore>) -> [u8; BLOCK_SIZE] {
    let random = match random {
        Some(r) => r,
        None => &mut OsRng,
    };
    let mut iv = [0u8; BLOCK_SIZE];
    random.fill_bytes(&mut iv);
    iv
}

pub(crate) fn unsupported_key(len: usize) -> CipherUnavailable {
    CipherUnavailable(format!("unsupported AES key length of {} bits", len * 8))
}

fn ecb_encrypt<C: BlockEncrypt + KeyInit>(key: &[u8], data: &mut [u8]) -> anyhow::Result<()> {
    let cipher = C::new_from_slice(key).map_err(|e| CipherUnavailable(e.to_string()))?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

fn ecb_decrypt<C: BlockDecrypt + KeyInit>(key: &[u8], data: &mut [u8]) -> anyhow::Result<()> {
    let cipher = C::new_from_slice(key).map_err(|e| CipherUnavailable(e.to_string()))?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// Pads to a whole number of blocks. Always adds at least one byte.
pub(crate) fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut padded = Vec::with_capacity(data.len() + pad);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad, pad as u8);
    padded
}

/// Returns the unpadded length of `data`.
pub(crate) fn pkcs7_unpad(data: &[u8]) -> Result<usize, InvalidCiphertext> {
    let pad = *data.last().ok_or(InvalidCiphertext("empty plaintext"))? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return Err(InvalidCiphertext("bad padding"));
    }
    if data[data.len() - pad..].iter().any(|b| *b as usize != pad) {
        return Err(InvalidCiphertext("bad padding"));
    }
    Ok(data.len() - pad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_size() {
        assert_eq!(KeySize::from_len(16).unwrap().bits(), 128);
        assert_eq!(KeySize::from_len(24).unwrap().bits(), 192);
        assert_eq!(KeySize::from_len(32).unwrap().bits(), 256);
        assert!(KeySize::from_len(8).is_none());
        assert!(KeySize::from_len(0).is_none());
    }

    #[test]
    fn test_wrap_unwrap() {
        for size in [KeySize::Aes128, KeySize::Aes192, KeySize::Aes256] {
            let master = ContentKey::generate(size, None);
            let key = ContentKey::generate(size, None);
            let wrapped = key.wrap(master.as_bytes()).unwrap();
            assert_eq!(wrapped.len() % BLOCK_SIZE, 0);
            assert_ne!(&wrapped[..size.bytes()], key.as_bytes());
            let unwrapped = ContentKey::unwrap_from(master.as_bytes(), &wrapped).unwrap();
            assert_eq!(unwrapped, key);
        }
    }

    #[test]
    fn test_unwrap_with_wrong_key_fails_or_differs() {
        let master = ContentKey::generate(KeySize::Aes128, None);
        let other = ContentKey::generate(KeySize::Aes128, None);
        let key = ContentKey::generate(KeySize::Aes128, None);
        let wrapped = key.wrap(master.as_bytes()).unwrap();
        match ContentKey::unwrap_from(other.as_bytes(), &wrapped) {
            Ok(unwrapped) => assert_ne!(unwrapped, key),
            Err(e) => assert!(e.downcast_ref::<InvalidCiphertext>().is_some()),
        }
    }

    #[test]
    fn test_wrap_rejects_bad_master_key() {
        let key = ContentKey::generate(KeySize::Aes128, None);
        let err = key.wrap(&[0u8; 7]).unwrap_err();
        assert!(err.downcast_ref::<CipherUnavailable>().is_some());
    }

    #[test]
    fn test_pkcs7() {
        assert_eq!(pkcs7_pad(&[]).len(), BLOCK_SIZE);
        assert_eq!(pkcs7_pad(&[1u8; 16]).len(), 2 * BLOCK_SIZE);
        let padded = pkcs7_pad(b"hello");
        assert_eq!(pkcs7_unpad(&padded).unwrap(), 5);
        assert!(pkcs7_unpad(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_decode_master_key() {
        let material = EncryptionMaterial::new("AAAAAAAAAAAAAAAAAAAAAA==", "q", 1);
        assert_eq!(material.decode_master_key().unwrap().len(), 16);
        let material = EncryptionMaterial::new("not base64!", "q", 1);
        assert!(material.decode_master_key().is_err());
    }
}
