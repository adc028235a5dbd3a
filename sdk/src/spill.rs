// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::io::{self, Cursor};

use async_tempfile::TempFile;
use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Default in-memory capacity before spilling to disk.
pub const DEFAULT_SPILL_THRESHOLD: usize = 16 * 1024 * 1024;

/// Byte buffer that keeps data in memory up to a threshold and spills to a temp file
/// beyond it. It can be read back any number of times, which makes a caller stream
/// retryable. The temp file is deleted when the buffer is dropped.
pub struct SpillBuffer {
    threshold: usize,
    memory: BytesMut,
    file: Option<TempFile>,
    len: u64,
}

/// A fresh reader over a [`SpillBuffer`].
pub enum SpillReader {
    Memory(Cursor<Bytes>),
    File(File),
}

impl SpillBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            memory: BytesMut::new(),
            file: None,
            len: 0,
        }
    }

    /// Buffers everything `reader` yields.
    pub async fn from_reader<R: AsyncRead + Unpin>(
        reader: R,
        threshold: usize,
    ) -> anyhow::Result<Self> {
        let mut buffer = Self::new(threshold);
        buffer.fill_from(reader).await?;
        Ok(buffer)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if self.file.is_none() && self.memory.len() + data.len() > self.threshold {
            let mut file = TempFile::new().await?;
            file.write_all(&self.memory).await?;
            debug!(
                "spilling {} buffered bytes to {}",
                self.memory.len(),
                file.file_path().display()
            );
            self.memory = BytesMut::new();
            self.file = Some(file);
        }
        match &mut self.file {
            Some(file) => file.write_all(data).await?,
            None => self.memory.extend_from_slice(data),
        }
        self.len += data.len() as u64;
        Ok(())
    }

    pub async fn fill_from<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> anyhow::Result<u64> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        Ok(total)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        self.file.is_some()
    }

    /// Opens a reader positioned at the start of the buffered data.
    pub async fn open(&mut self) -> io::Result<SpillReader> {
        match &mut self.file {
            Some(file) => {
                file.flush().await?;
                Ok(SpillReader::File(File::open(file.file_path()).await?))
            }
            None => Ok(SpillReader::Memory(Cursor::new(
                self.memory.clone().freeze(),
            ))),
        }
    }
}
