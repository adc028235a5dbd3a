// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::io::{Error, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::cipher::{generic_array::GenericArray, BlockDecryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use bytes::{Buf, BytesMut};
use futures_core::ready;
use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::encryption::encryptor::CHUNK_SIZE;
use crate::encryption::key::{pkcs7_unpad, unsupported_key, CipherUnavailable, KeySize, BLOCK_SIZE};

/// AES-CBC decryptor for any supported key size.
pub enum CbcDecryptor {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}

impl CbcDecryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> anyhow::Result<Self> {
        let invalid = |e: aes::cipher::InvalidLength| CipherUnavailable(e.to_string());
        Ok(match KeySize::from_len(key.len()) {
            Some(KeySize::Aes128) => {
                Self::Aes128(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            Some(KeySize::Aes192) => {
                Self::Aes192(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            Some(KeySize::Aes256) => {
                Self::Aes256(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            None => return Err(unsupported_key(key.len()).into()),
        })
    }

    /// Decrypts whole blocks in place, chaining from the previous call.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            match self {
                Self::Aes128(c) => c.decrypt_block_mut(block),
                Self::Aes192(c) => c.decrypt_block_mut(block),
                Self::Aes256(c) => c.decrypt_block_mut(block),
            }
        }
    }
}

/// Decrypts an [`AsyncRead`] of AES-CBC/PKCS7 ciphertext as it is read.
/// The final block is held back until EOF so its padding can be stripped.
#[pin_project]
pub struct DecryptReader<R: AsyncRead> {
    #[pin]
    inner: R,
    decryptor: CbcDecryptor,

    pending: BytesMut,     // Ciphertext not yet decrypted
    decrypted: BytesMut,   // Plaintext ready to hand out
    chunk_buffer: Vec<u8>, // Scratch space for reads from the inner reader
    finished: bool,        // EOF reached and padding stripped
}

impl<R: AsyncRead> DecryptReader<R> {
    pub fn new(inner: R, decryptor: CbcDecryptor) -> Self {
        Self {
            inner,
            decryptor,
            pending: BytesMut::new(),
            decrypted: BytesMut::new(),
            chunk_buffer: vec![0u8; CHUNK_SIZE],
            finished: false,
        }
    }
}

impl<R: AsyncRead> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut this = self.project();

        loop {
            if !this.decrypted.is_empty() {
                let to_copy = this.decrypted.len().min(buf.remaining());
                buf.put_slice(&this.decrypted[..to_copy]);
                this.decrypted.advance(to_copy);
                return Poll::Ready(Ok(()));
            }
            if *this.finished {
                return Poll::Ready(Ok(()));
            }

            let mut temp_buf = ReadBuf::new(&mut this.chunk_buffer[..]);
            ready!(this.inner.as_mut().poll_read(cx, &mut temp_buf))?;
            let read = temp_buf.filled().len();

            if read == 0 {
                if this.pending.is_empty() || this.pending.len() % BLOCK_SIZE != 0 {
                    return Poll::Ready(Err(Error::new(
                        ErrorKind::InvalidData,
                        "ciphertext is not a whole number of blocks",
                    )));
                }
                let mut last = this.pending.split();
                this.decryptor.decrypt_blocks(&mut last);
                let len = pkcs7_unpad(&last).map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
                last.truncate(len);
                *this.decrypted = last;
                *this.finished = true;
                continue;
            }

            this.pending.extend_from_slice(&this.chunk_buffer[..read]);
            // Keep at least one whole block back for the padding check at EOF
            let whole = this.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
            if whole > BLOCK_SIZE {
                let take = if whole == this.pending.len() {
                    whole - BLOCK_SIZE
                } else {
                    whole
                };
                let mut ready_blocks = this.pending.split_to(take);
                this.decryptor.decrypt_blocks(&mut ready_blocks);
                *this.decrypted = ready_blocks;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::encryptor::{CbcEncryptor, EncryptReader};
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    async fn round_trip(key: &[u8], len: usize) -> Vec<u8> {
        let iv = [5u8; 16];
        let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut ciphertext = Vec::new();
        EncryptReader::new(
            Cursor::new(plaintext.clone()),
            CbcEncryptor::new(key, &iv).unwrap(),
        )
        .read_to_end(&mut ciphertext)
        .await
        .unwrap();

        let mut decrypted = Vec::new();
        DecryptReader::new(
            Cursor::new(ciphertext),
            CbcDecryptor::new(key, &iv).unwrap(),
        )
        .read_to_end(&mut decrypted)
        .await
        .unwrap();
        assert_eq!(decrypted, plaintext);
        decrypted
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        for key in [&[1u8; 16][..], &[2u8; 24][..], &[3u8; 32][..]] {
            for len in [0, 1, 15, 16, 17, 4096, CHUNK_SIZE, CHUNK_SIZE * 3 + 7] {
                round_trip(key, len).await;
            }
        }
    }

    #[tokio::test]
    async fn test_truncated_ciphertext() {
        let mut out = Vec::new();
        let err = DecryptReader::new(
            Cursor::new(vec![0u8; 20]),
            CbcDecryptor::new(&[0u8; 16], &[0u8; 16]).unwrap(),
        )
        .read_to_end(&mut out)
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_empty_ciphertext() {
        let mut out = Vec::new();
        let err = DecryptReader::new(
            Cursor::new(Vec::new()),
            CbcDecryptor::new(&[0u8; 16], &[0u8; 16]).unwrap(),
        )
        .read_to_end(&mut out)
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
