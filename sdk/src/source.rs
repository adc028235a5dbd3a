// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};

use stagehand_provider::UploadStream;

use crate::spill::{SpillBuffer, SpillReader};

/// Where upload bytes come from.
pub enum ByteSource {
    /// A local file, reopened for every attempt.
    File(PathBuf),
    /// A caller stream. It can be read exactly once, so a failed attempt is final.
    Stream(UploadStream),
    /// A caller stream buffered through a [`SpillBuffer`], reopened for every attempt.
    Spill(SpillBuffer),
}

impl ByteSource {
    pub fn from_stream<R: AsyncRead + Send + Sync + Unpin + 'static>(reader: R) -> Self {
        ByteSource::Stream(Box::new(reader))
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteSource::File(path) => f.debug_tuple("File").field(path).finish(),
            ByteSource::Stream(_) => f.write_str("Stream"),
            ByteSource::Spill(buffer) => f.debug_tuple("Spill").field(&buffer.len()).finish(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("input stream was already consumed and cannot be read again")]
    NotRetryable,
    #[error("failed to open input: {0}")]
    Io(#[from] io::Error),
}

/// An opened file whose handle is released at most once, no matter how often
/// [`TrackedFile::close`] is called or how many clones exist.
#[derive(Clone)]
pub struct TrackedFile(Arc<TrackedInner>);

struct TrackedInner {
    file: Mutex<Option<File>>,
    releases: AtomicUsize,
}

impl TrackedFile {
    pub fn new(file: File) -> Self {
        Self(Arc::new(TrackedInner {
            file: Mutex::new(Some(file)),
            releases: AtomicUsize::new(0),
        }))
    }

    /// Releases the handle. Returns false if it was already released.
    pub fn close(&self) -> bool {
        let taken = match self.0.file.lock() {
            Ok(mut file) => file.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match taken {
            Some(file) => {
                drop(file);
                self.0.releases.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.release_count() > 0
    }

    /// Number of times the underlying handle was released. Never more than one.
    pub fn release_count(&self) -> usize {
        self.0.releases.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TrackedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedFile")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for TrackedFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut file = self
            .0
            .file
            .lock()
            .map_err(|_| io::Error::other("file handle lock poisoned"))?;
        match file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "file handle already closed",
            ))),
        }
    }
}

enum SourceState {
    File(PathBuf),
    Stream(Option<UploadStream>),
    Spill(SpillBuffer),
}

/// Produces a fresh upload stream per attempt and remembers every file handle it opened.
pub struct StreamProvisioner {
    source: SourceState,
    handles: Vec<TrackedFile>,
    opened: u32,
}

impl StreamProvisioner {
    pub fn new(source: ByteSource) -> Self {
        let source = match source {
            ByteSource::File(path) => SourceState::File(path),
            ByteSource::Stream(stream) => SourceState::Stream(Some(stream)),
            ByteSource::Spill(buffer) => SourceState::Spill(buffer),
        };
        Self {
            source,
            handles: Vec::new(),
            opened: 0,
        }
    }

    /// True if the bytes come from a caller stream (spilled or not).
    pub fn is_stream(&self) -> bool {
        !matches!(self.source, SourceState::File(_))
    }

    /// True if another call to [`StreamProvisioner::reopen`] can succeed.
    pub fn can_reopen(&self) -> bool {
        !matches!(self.source, SourceState::Stream(None))
    }

    /// Number of streams handed out so far.
    pub fn opened(&self) -> u32 {
        self.opened
    }

    pub fn describe(&self) -> String {
        match &self.source {
            SourceState::File(path) => format!("file {}", path.display()),
            SourceState::Stream(_) => "input stream".to_string(),
            SourceState::Spill(buffer) => format!("input stream ({} bytes buffered)", buffer.len()),
        }
    }

    /// Opens a stream positioned at the start of the source.
    pub async fn reopen(&mut self) -> Result<UploadStream, ProvisionError> {
        let stream: UploadStream = match &mut self.source {
            SourceState::File(path) => {
                let tracked = TrackedFile::new(File::open(&path).await?);
                self.handles.push(tracked.clone());
                Box::new(tracked)
            }
            SourceState::Stream(stream) => stream.take().ok_or(ProvisionError::NotRetryable)?,
            SourceState::Spill(buffer) => match buffer.open().await? {
                SpillReader::Memory(cursor) => Box::new(cursor),
                SpillReader::File(file) => {
                    let tracked = TrackedFile::new(file);
                    self.handles.push(tracked.clone());
                    Box::new(tracked)
                }
            },
        };
        self.opened += 1;
        Ok(stream)
    }

    /// Releases every file handle opened so far. Safe to call repeatedly.
    /// Returns how many handles this call actually released.
    pub fn close_all(&mut self) -> usize {
        self.handles.iter().filter(|h| h.close()).count()
    }

    pub fn handles(&self) -> &[TrackedFile] {
        &self.handles
    }
}

impl Drop for StreamProvisioner {
    fn drop(&mut self) {
        self.close_all();
    }
}
