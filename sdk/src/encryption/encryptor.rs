// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::pin::Pin;
use std::task::{Context, Poll};

use aes::cipher::{generic_array::GenericArray, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use futures_core::ready;
use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::encryption::key::{pkcs7_pad, unsupported_key, CipherUnavailable, KeySize, BLOCK_SIZE};

/// Plaintext bytes read from the inner reader per encryption round. Must be a multiple of the block size.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Length of the AES-CBC/PKCS7 ciphertext for a plaintext of `len` bytes.
pub fn encrypted_length(len: u64) -> u64 {
    (len / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}

/// AES-CBC encryptor for any supported key size.
pub enum CbcEncryptor {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
}

impl CbcEncryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> anyhow::Result<Self> {
        let invalid = |e: aes::cipher::InvalidLength| CipherUnavailable(e.to_string());
        Ok(match KeySize::from_len(key.len()) {
            Some(KeySize::Aes128) => {
                Self::Aes128(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            Some(KeySize::Aes192) => {
                Self::Aes192(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            Some(KeySize::Aes256) => {
                Self::Aes256(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            None => return Err(unsupported_key(key.len()).into()),
        })
    }

    /// Encrypts whole blocks in place, chaining from the previous call.
    pub fn encrypt_blocks(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            match self {
                Self::Aes128(c) => c.encrypt_block_mut(block),
                Self::Aes192(c) => c.encrypt_block_mut(block),
                Self::Aes256(c) => c.encrypt_block_mut(block),
            }
        }
    }
}

/// Encrypts an [`AsyncRead`] of plaintext into AES-CBC/PKCS7 ciphertext as it is read.
#[pin_project]
pub struct EncryptReader<R: AsyncRead> {
    #[pin]
    inner: R,
    encryptor: CbcEncryptor,

    buffer: Vec<u8>,       // Encrypted data ready to hand out
    pos: usize,            // How much encrypted data was consumed
    chunk_buffer: Vec<u8>, // Plaintext accumulated for the next round
    chunk_filled: usize,   // How much of the chunk buffer is filled
    finished: bool,        // Final padded block has been produced
}

impl<R: AsyncRead> EncryptReader<R> {
    pub fn new(inner: R, encryptor: CbcEncryptor) -> Self {
        EncryptReader {
            inner,
            encryptor,
            buffer: Vec::new(),
            pos: 0,
            chunk_buffer: vec![0u8; CHUNK_SIZE],
            chunk_filled: 0,
            finished: false,
        }
    }
}

impl<R: AsyncRead> AsyncRead for EncryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut this = self.project();

        loop {
            if *this.pos < this.buffer.len() {
                let available = this.buffer.len() - *this.pos;
                let to_copy = available.min(buf.remaining());
                buf.put_slice(&this.buffer[*this.pos..*this.pos + to_copy]);
                *this.pos += to_copy;
                return Poll::Ready(Ok(()));
            }
            if *this.finished {
                return Poll::Ready(Ok(()));
            }

            // Fill the chunk buffer or hit EOF
            let mut eof = false;
            while *this.chunk_filled < CHUNK_SIZE {
                let filled_before = *this.chunk_filled;
                let mut temp_buf = ReadBuf::new(&mut this.chunk_buffer[*this.chunk_filled..]);
                ready!(this.inner.as_mut().poll_read(cx, &mut temp_buf))?;
                *this.chunk_filled += temp_buf.filled().len();
                if *this.chunk_filled == filled_before {
                    eof = true;
                    break;
                }
            }

            this.buffer.clear();
            *this.pos = 0;
            if eof {
                let mut last = pkcs7_pad(&this.chunk_buffer[..*this.chunk_filled]);
                this.encryptor.encrypt_blocks(&mut last);
                *this.buffer = last;
                *this.finished = true;
            } else {
                this.buffer
                    .extend_from_slice(&this.chunk_buffer[..*this.chunk_filled]);
                this.encryptor.encrypt_blocks(&mut this.buffer[..]);
            }
            *this.chunk_filled = 0;
        }
    }
}
