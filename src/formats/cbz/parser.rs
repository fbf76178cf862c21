//! CBZ metadata parser
//!
//! Reads `ComicInfo.xml` (matched case-insensitively) and counts image
//! pages. A malformed ComicInfo document does not fail the parse; the
//! archive-level facts (page count, filename heuristics) are still
//! recovered and the document is treated as absent.

use std::fs::File;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};
use zip::read::ZipArchive;

use crate::archive;
use crate::error::{EngineError, Result};
use crate::model::{
    Author, AuthorRole, FileFormat, Identifier, IdentifierType, MetadataSource, ParsedMetadata,
    SeriesMembership,
};

use super::comicinfo::ComicInfo;

/// Parse the embedded metadata of a CBZ file.
pub fn parse_cbz(path: &Path) -> Result<ParsedMetadata> {
    let file =
        File::open(path).map_err(|e| EngineError::source_io(path, FileFormat::Cbz, e))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| EngineError::corrupt(path, FileFormat::Cbz, e.to_string()))?;
    let entries = archive::list_entries(&mut zip)
        .map_err(|e| EngineError::corrupt(path, FileFormat::Cbz, e.to_string()))?;

    let page_count = entries
        .iter()
        .filter(|e| !e.is_dir && archive::is_image_name(&e.name))
        .count() as u32;

    let comicinfo = entries
        .iter()
        .find(|e| !e.is_dir && e.file_name_lower() == "comicinfo.xml")
        .and_then(|entry| {
            let bytes = archive::read_entry(&mut zip, entry.index).ok()?;
            let xml = String::from_utf8_lossy(&bytes);
            match ComicInfo::parse(&xml) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(path = %path.display(), %err, "malformed ComicInfo.xml, ignoring");
                    None
                }
            }
        });

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut meta = match comicinfo {
        Some(info) => metadata_from_comicinfo(info, &stem),
        None => metadata_from_filename(&stem),
    };
    meta.page_count = Some(page_count);

    debug!(path = %path.display(), pages = page_count, source = ?meta.source, "parsed cbz");
    Ok(meta)
}

fn metadata_from_comicinfo(info: ComicInfo, stem: &str) -> ParsedMetadata {
    let mut meta = ParsedMetadata {
        source: Some(MetadataSource::CbzComicinfo),
        ..Default::default()
    };

    meta.title = info.title.clone();
    meta.description = info.summary.clone();
    meta.publisher = info.publisher.clone();
    meta.imprint = info.imprint.clone();
    meta.url = info.web.clone();
    meta.language = info.language_iso.clone();
    meta.cover_page = info.front_cover_page();

    if let Some(series) = &info.series {
        let position = info
            .number
            .as_deref()
            .and_then(|n| n.parse::<f64>().ok())
            .or_else(|| series_number_from_filename(stem));
        meta.series.push(SeriesMembership {
            name: series.clone(),
            position,
        });
    }

    if let Some(year) = info.year {
        meta.release_date = chrono::NaiveDate::from_ymd_opt(
            year,
            info.month.unwrap_or(1),
            info.day.unwrap_or(1),
        );
    }

    for (field, role) in [
        (&info.writer, AuthorRole::Writer),
        (&info.penciller, AuthorRole::Penciller),
        (&info.inker, AuthorRole::Inker),
        (&info.colorist, AuthorRole::Colorist),
        (&info.letterer, AuthorRole::Letterer),
        (&info.cover_artist, AuthorRole::CoverArtist),
        (&info.editor, AuthorRole::Editor),
        (&info.translator, AuthorRole::Translator),
    ] {
        if let Some(names) = field {
            for name in split_names(names) {
                meta.authors.push(Author {
                    name,
                    sort_name: None,
                    role: Some(role),
                });
            }
        }
    }

    if let Some(genre) = &info.genre {
        meta.genres = split_names(genre);
    }
    if let Some(tags) = &info.tags {
        meta.tags = split_names(tags);
    }

    if let Some(gtin) = info.gtin.as_deref().filter(|g| !g.trim().is_empty()) {
        let kind = IdentifierType::classify_gtin(gtin);
        meta.identifiers.push(Identifier::new(kind, gtin.trim()));
    }

    meta
}

/// Filename-only fallback when no ComicInfo is present.
fn metadata_from_filename(stem: &str) -> ParsedMetadata {
    let mut meta = ParsedMetadata {
        source: Some(MetadataSource::Filepath),
        ..Default::default()
    };
    let cleaned = strip_bracketed(stem);
    if !cleaned.is_empty() {
        meta.title = Some(cleaned);
    }
    if let Some(number) = series_number_from_filename(stem) {
        let name = strip_markers(stem);
        if !name.is_empty() {
            meta.series.push(SeriesMembership {
                name,
                position: Some(number),
            });
        }
    }
    meta
}

fn split_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Volume/chapter number from a filename: `v02`, `#7`, or a bare trailing
/// integer before parenthesised tags.
pub(crate) fn series_number_from_filename(stem: &str) -> Option<f64> {
    static VOLUME: OnceLock<Regex> = OnceLock::new();
    static HASH: OnceLock<Regex> = OnceLock::new();
    static TRAILING: OnceLock<Regex> = OnceLock::new();

    let volume = VOLUME.get_or_init(|| {
        Regex::new(r"(?i)\bv(?:ol(?:ume)?)?\.?\s*(\d{1,4}(?:\.\d+)?)\b").unwrap()
    });
    if let Some(caps) = volume.captures(stem) {
        return caps[1].parse().ok();
    }

    let hash = HASH.get_or_init(|| Regex::new(r"#(\d{1,4}(?:\.\d+)?)").unwrap());
    if let Some(caps) = hash.captures(stem) {
        return caps[1].parse().ok();
    }

    // Bare trailing integer, ignoring `(2019) (digital)`-style tags.
    let without_tags = strip_bracketed(stem);
    let trailing = TRAILING.get_or_init(|| Regex::new(r"(\d{1,4}(?:\.\d+)?)\s*$").unwrap());
    trailing
        .captures(&without_tags)
        .and_then(|caps| caps[1].parse().ok())
}

/// Remove parenthesised/bracketed tag groups and trim.
fn strip_bracketed(stem: &str) -> String {
    static BRACKETS: OnceLock<Regex> = OnceLock::new();
    let brackets =
        BRACKETS.get_or_init(|| Regex::new(r"[\(\[][^\)\]]*[\)\]]").unwrap());
    brackets.replace_all(stem, "").trim().to_string()
}

/// Remove tags plus the volume/number marker itself, for a series name.
fn strip_markers(stem: &str) -> String {
    static MARKERS: OnceLock<Regex> = OnceLock::new();
    let markers = MARKERS.get_or_init(|| {
        Regex::new(r"(?i)(\bv(?:ol(?:ume)?)?\.?\s*\d{1,4}(?:\.\d+)?\b|#\d{1,4}(?:\.\d+)?|\d{1,4}(?:\.\d+)?\s*$)").unwrap()
    });
    let cleaned = strip_bracketed(stem);
    markers
        .replace_all(&cleaned, "")
        .trim()
        .trim_end_matches('-')
        .trim()
        .to_string()
}
