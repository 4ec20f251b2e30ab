//! Frame capture from an externally maintained snapshot file.
//!
//! Screen grabbing and image encoding are done by an external tool that keeps
//! overwriting one encoded image file. Each capture reads the current file
//! contents and pairs them with the last known cursor position.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use protocol::FrameUnit;
use thiserror::Error;

use crate::dispatch::FrameSource;

/// Capture errors. A failed capture skips one dispatch tick.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to read snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {0} is empty")]
    Empty(PathBuf),

    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

/// Last known cursor position, shared between input handling and capture.
#[derive(Debug, Clone, Default)]
pub struct CursorPosition {
    inner: Arc<(AtomicI32, AtomicI32)>,
}

impl CursorPosition {
    /// Creates a cursor at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new position.
    pub fn set(&self, x: i32, y: i32) {
        self.inner.0.store(x, Ordering::Relaxed);
        self.inner.1.store(y, Ordering::Relaxed);
    }

    /// Returns the last recorded position.
    pub fn get(&self) -> (i32, i32) {
        (
            self.inner.0.load(Ordering::Relaxed),
            self.inner.1.load(Ordering::Relaxed),
        )
    }
}

/// Reads frames from a snapshot file on every capture.
#[derive(Debug, Clone)]
pub struct SnapshotFileSource {
    path: PathBuf,
    cursor: CursorPosition,
}

impl SnapshotFileSource {
    /// Creates a source reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor: CursorPosition::new(),
        }
    }

    /// Uses a shared cursor position instead of a private one.
    pub fn with_cursor(mut self, cursor: CursorPosition) -> Self {
        self.cursor = cursor;
        self
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cursor position this source reports.
    pub fn cursor(&self) -> &CursorPosition {
        &self.cursor
    }

    async fn read_snapshot(&self) -> Result<FrameUnit, CaptureError> {
        let image = tokio::fs::read(&self.path)
            .await
            .map_err(|source| CaptureError::Io {
                path: self.path.clone(),
                source,
            })?;

        if image.is_empty() {
            return Err(CaptureError::Empty(self.path.clone()));
        }

        let (x, y) = self.cursor.get();
        Ok(FrameUnit::new(image, x, y))
    }
}

impl FrameSource for SnapshotFileSource {
    fn capture(&self) -> impl std::future::Future<Output = Result<FrameUnit, CaptureError>> + Send {
        self.read_snapshot()
    }
}
