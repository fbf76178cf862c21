//! Engine error types
//!
//! A single closed error set is exposed to callers (the HTTP/OPDS layer and
//! the library scanner). Every variant carries the offending file identity
//! and format tag where one exists, plus a cause chain.
//!
//! Errors are `Clone` so that concurrent download requests coalesced onto a
//! single in-flight build all observe the same failure; causes are therefore
//! held behind `Arc` rather than `Box`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::model::FileFormat;

/// Shared cause chain entry.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Unified engine error type
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Source file does not exist or is unreadable
    #[error("source file missing: {}", .path.display())]
    SourceMissing {
        path: PathBuf,
        format: FileFormat,
        #[source]
        cause: Option<Cause>,
    },

    /// Source container is malformed
    #[error("corrupt {format} container {}{}: {detail}", .path.display(), offset_suffix(.offset))]
    SourceCorrupt {
        path: PathBuf,
        format: FileFormat,
        /// Byte offset of the failure, where one is meaningful
        offset: Option<u64>,
        detail: String,
        #[source]
        cause: Option<Cause>,
    },

    /// File extension or requested format is not one the engine handles
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// KePub conversion requested for a format without a converter
    #[error("kepub conversion is not supported for {format} files")]
    KepubNotSupported { format: FileFormat },

    /// A writer failed while producing a derived file
    #[error("{format} writer failed for {}: {detail}", .path.display())]
    WriterFailed {
        path: PathBuf,
        format: FileFormat,
        detail: String,
        #[source]
        cause: Option<Cause>,
    },

    /// The cache budget cannot hold the artifact even after evicting
    /// everything evictable
    #[error("download cache full: artifact of {needed} bytes cannot fit budget of {budget} bytes")]
    CacheFull { needed: u64, budget: u64 },

    /// The operation was cancelled via its cancellation handle
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

fn offset_suffix(offset: &Option<u64>) -> String {
    match offset {
        Some(off) => format!(" at offset {off}"),
        None => String::new(),
    }
}

impl EngineError {
    /// Classify an I/O failure while opening a source file.
    pub fn source_io(path: &Path, format: FileFormat, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::SourceMissing {
                path: path.to_path_buf(),
                format,
                cause: Some(Arc::new(err)),
            }
        } else {
            EngineError::SourceCorrupt {
                path: path.to_path_buf(),
                format,
                offset: None,
                detail: err.to_string(),
                cause: Some(Arc::new(err)),
            }
        }
    }

    /// A corrupt-container error with no underlying cause.
    pub fn corrupt(path: &Path, format: FileFormat, detail: impl Into<String>) -> Self {
        EngineError::SourceCorrupt {
            path: path.to_path_buf(),
            format,
            offset: None,
            detail: detail.into(),
            cause: None,
        }
    }

    /// A corrupt-container error anchored to a byte offset.
    pub fn corrupt_at(
        path: &Path,
        format: FileFormat,
        offset: u64,
        detail: impl Into<String>,
    ) -> Self {
        EngineError::SourceCorrupt {
            path: path.to_path_buf(),
            format,
            offset: Some(offset),
            detail: detail.into(),
            cause: None,
        }
    }

    /// A writer failure with no underlying cause.
    pub fn writer(path: &Path, format: FileFormat, detail: impl Into<String>) -> Self {
        EngineError::WriterFailed {
            path: path.to_path_buf(),
            format,
            detail: detail.into(),
            cause: None,
        }
    }

    /// A writer failure wrapping an underlying error.
    pub fn writer_cause<E>(path: &Path, format: FileFormat, detail: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EngineError::WriterFailed {
            path: path.to_path_buf(),
            format,
            detail: detail.into(),
            cause: Some(Arc::new(err)),
        }
    }

    /// Whether this error means the source was unreadable rather than the
    /// engine misbehaving. The scanner stores partial metadata and proceeds
    /// for these.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            EngineError::SourceMissing { .. } | EngineError::SourceCorrupt { .. }
        )
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
