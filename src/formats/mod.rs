//! Format-specific parsers, writers, and converters
//!
//! Each container format gets a submodule with a `parser` (source ->
//! [`ParsedMetadata`](crate::model::ParsedMetadata)) and a `writer`
//! (source + catalog metadata -> re-embedded derived file). `kepub` holds
//! the Kobo converters, which sit on top of the other three.
//!
//! Parsers are reading-only and may be called from any number of threads
//! simultaneously without coordination.

pub mod cbz;
pub mod epub;
pub mod kepub;
pub mod m4b;

use std::path::Path;

use crate::error::Result;
use crate::model::{FileFormat, ParsedMetadata};

/// Parse a source file's embedded metadata, dispatching on format.
///
/// Runs the blocking parse on the tokio blocking pool. Corrupt containers
/// yield a `SourceCorrupt` error; callers that scan libraries store
/// whatever partial metadata the error path recovered and proceed.
pub async fn parse(path: &Path, format: FileFormat) -> Result<ParsedMetadata> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || match format {
        FileFormat::Epub => epub::parse_epub(&path),
        FileFormat::Cbz => cbz::parse_cbz(&path),
        FileFormat::M4b => m4b::parse_m4b(&path),
    })
    .await
    .map_err(|e| crate::error::EngineError::Internal(format!("parser task join error: {e}")))?
}

/// Parse a container-embedded date value: full `YYYY-MM-DD`, a date-time
/// with that prefix, or a bare year.
pub(crate) fn parse_release_date(value: &str) -> Option<chrono::NaiveDate> {
    let value = value.trim();
    if value.len() >= 10 {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(&value[..10], "%Y-%m-%d") {
            return Some(date);
        }
    }
    if let Ok(year) = value.parse::<i32>() {
        return chrono::NaiveDate::from_ymd_opt(year, 1, 1);
    }
    None
}
