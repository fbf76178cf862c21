//! Format-agnostic derived-file generation
//!
//! A `Generator` produces one derived artifact from a source file and the
//! catalog's authoritative `Book`/`BookFile` metadata. The factory maps
//! `(format, variant)` to the matching writer (identity) or converter
//! (kepub); `(M4b, Kepub)` has no converter and is rejected.
//!
//! Every generator follows the same protocol: write to `<dest>.tmp`, fsync,
//! rename onto `<dest>`, and unlink the temp file on any failure.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::formats::cbz::CbzWriter;
use crate::formats::epub::EpubWriter;
use crate::formats::kepub::{CbzToKepub, EpubToKepub};
use crate::formats::m4b::M4bWriter;
use crate::model::{Book, BookFile, FileFormat, Variant};

/// Cooperative cancellation handle
///
/// Long operations check the flag at their checkpoints (per image in CBZ
/// processing, per box in MP4 rebuild) and bail out with
/// [`EngineError::Cancelled`]. Already-started image decodes run to
/// completion and are discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Checkpoint: error out if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One derived-file producer for a fixed `(format, variant)` pair
///
/// Implementations are deterministic given fixed inputs; retries are the
/// caller's responsibility. They hold no global state and may run
/// concurrently for distinct `(source, book, file)` triples.
#[async_trait]
pub trait Generator: Send + Sync + std::fmt::Debug {
    /// Produce `dest` from `src` with the tracked metadata fields replaced
    /// by the catalog's values and everything else preserved.
    async fn generate(
        &self,
        cancel: &CancelToken,
        src: &Path,
        dest: &Path,
        book: &Book,
        file: &BookFile,
    ) -> Result<()>;
}

/// Resolve the generator for a `(format, variant)` pair.
pub fn generator_for(
    format: FileFormat,
    variant: Variant,
    config: &EngineConfig,
) -> Result<Box<dyn Generator>> {
    match (format, variant) {
        (FileFormat::Epub, Variant::Identity) => Ok(Box::new(EpubWriter::new())),
        (FileFormat::Cbz, Variant::Identity) => Ok(Box::new(CbzWriter::new(config.clone()))),
        (FileFormat::M4b, Variant::Identity) => Ok(Box::new(M4bWriter::new())),
        (FileFormat::Epub, Variant::Kepub) => Ok(Box::new(EpubToKepub::new())),
        (FileFormat::Cbz, Variant::Kepub) => Ok(Box::new(CbzToKepub::new())),
        (FileFormat::M4b, Variant::Kepub) => Err(EngineError::KepubNotSupported { format }),
    }
}

/// Shared commit step: fsync the staged temp file and rename it onto the
/// destination. The temp path is unlinked on any error.
pub(crate) fn commit_temp(tmp: &Path, dest: &Path, format: FileFormat) -> Result<()> {
    let commit = || -> std::io::Result<()> {
        let file = std::fs::File::open(tmp)?;
        file.sync_all()?;
        std::fs::rename(tmp, dest)?;
        Ok(())
    };
    commit().map_err(|err| {
        let _ = std::fs::remove_file(tmp);
        EngineError::writer_cause(dest, format, "failed to commit staged output", err)
    })
}

/// Staging path used by every writer: `<dest>.tmp` beside the destination.
pub(crate) fn staging_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".tmp");
    std::path::PathBuf::from(name)
}
