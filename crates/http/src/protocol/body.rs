//! Request body storage and file uploads.
//!
//! The engine buffers every request body before dispatch: small bodies into
//! memory, large bodies into a temp file under the configured directory.
//! Multipart file parts always go to a temp file and are surfaced to the
//! handler as [`FileUpload`] records.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Where a request body ended up after the engine read it off the socket.
#[derive(Debug, Clone, Default)]
pub enum BodyStore {
    /// No body was sent
    #[default]
    Empty,
    /// Body buffered in memory
    Memory(Bytes),
    /// Body spilled to a temp file owned by the engine
    File { path: PathBuf, len: u64 },
}

impl BodyStore {
    /// Total body length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            BodyStore::Empty => 0,
            BodyStore::Memory(bytes) => bytes.len() as u64,
            BodyStore::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The temp file backing this body, if it was spilled to disk.
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            BodyStore::File { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Reads the whole body into memory.
    ///
    /// For file-backed bodies this hits the disk; the form accessors only call
    /// it once and cache the parse result.
    pub fn read_all(&self) -> Bytes {
        match self {
            BodyStore::Empty => Bytes::new(),
            BodyStore::Memory(bytes) => bytes.clone(),
            BodyStore::File { path, .. } => match std::fs::read(path) {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    warn!(path = %path.display(), cause = %e, "failed to read spilled request body");
                    Bytes::new()
                }
            },
        }
    }
}

/// One uploaded file from a `multipart/form-data` request.
///
/// The engine owns the temp file and deletes it once the response has been
/// written, unless the handler claimed it with [`FileUpload::take_ownership`].
#[derive(Debug, Clone)]
pub struct FileUpload {
    field_name: String,
    filename: String,
    content_type: Option<String>,
    path: PathBuf,
    len: u64,
    moved: Arc<AtomicBool>,
}

impl FileUpload {
    pub(crate) fn new(
        field_name: String,
        filename: String,
        content_type: Option<String>,
        path: PathBuf,
        len: u64,
    ) -> Self {
        Self { field_name, filename, content_type, path, len, moved: Arc::new(AtomicBool::new(false)) }
    }

    /// The form field name this file was posted under.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// The filename the client supplied.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The part's Content-Type, if the client sent one.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Path of the temp file holding the uploaded bytes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uploaded size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Claims the temp file: the engine will no longer delete it after the
    /// response completes. Returns the path for the handler to move or keep.
    pub fn take_ownership(&self) -> PathBuf {
        self.moved.store(true, Ordering::Release);
        self.path.clone()
    }

    /// Whether a handler has claimed the temp file.
    pub fn is_moved(&self) -> bool {
        self.moved.load(Ordering::Acquire)
    }

    /// Shared flag the engine checks before deleting the temp file.
    pub(crate) fn moved_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.moved)
    }
}
