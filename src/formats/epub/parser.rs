//! EPUB metadata parser
//!
//! Locates the OPF package document by scanning the archive for any member
//! with an `.opf` extension, then extracts the tracked catalog fields and
//! the chapter tree (spine plus nav document or NCX).

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use tracing::debug;
use zip::read::ZipArchive;

use crate::archive;
use crate::error::{EngineError, Result};
use crate::model::{
    Author, ChapterLocator, CoverImage, FileFormat, Identifier, IdentifierType, MetadataSource,
    ParsedMetadata, SeriesMembership,
};

use super::nav;
use super::opf::OpfDocument;

/// Parse the embedded metadata of an EPUB file.
pub fn parse_epub(path: &Path) -> Result<ParsedMetadata> {
    let file = File::open(path).map_err(|e| EngineError::source_io(path, FileFormat::Epub, e))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| EngineError::corrupt(path, FileFormat::Epub, e.to_string()))?;

    let (opf_name, opf_xml) = read_opf(&mut zip, path)?;
    let doc = OpfDocument::parse(&opf_xml).map_err(|e| {
        EngineError::corrupt(path, FileFormat::Epub, format!("invalid OPF: {e}"))
    })?;

    let opf_dir = parent_dir(&opf_name);
    let mut meta = metadata_from_opf(&doc);
    meta.cover = read_cover(&mut zip, &doc, opf_dir);
    meta.chapters = read_chapters(&mut zip, &doc, opf_dir);

    debug!(path = %path.display(), title = ?meta.title, chapters = meta.chapters.len(), "parsed epub");
    Ok(meta)
}

/// Find and slurp the OPF member.
fn read_opf<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    path: &Path,
) -> Result<(String, String)> {
    let entries = archive::list_entries(zip)
        .map_err(|e| EngineError::corrupt(path, FileFormat::Epub, e.to_string()))?;
    let opf = entries
        .iter()
        .find(|e| !e.is_dir && !archive::is_hidden_name(&e.name) && e.name.to_lowercase().ends_with(".opf"))
        .ok_or_else(|| {
            EngineError::corrupt(path, FileFormat::Epub, "no OPF package document in archive")
        })?;
    let bytes = archive::read_entry(zip, opf.index)
        .map_err(|e| EngineError::corrupt(path, FileFormat::Epub, e.to_string()))?;
    Ok((opf.name.clone(), String::from_utf8_lossy(&bytes).into_owned()))
}

/// Map the OPF document onto the catalog's parsed-metadata shape.
fn metadata_from_opf(doc: &OpfDocument) -> ParsedMetadata {
    let mut meta = ParsedMetadata {
        source: Some(MetadataSource::EpubOpf),
        ..Default::default()
    };

    meta.title = doc.main_title().map(str::to_string);
    meta.subtitle = doc.subtitle_index().map(|i| doc.titles[i].text.clone());
    meta.language = doc.language.clone();
    meta.publisher = doc.publisher.clone();
    meta.description = doc.description.clone();
    meta.release_date = doc.date.as_deref().and_then(crate::formats::parse_release_date);
    meta.genres = doc.subjects.clone();

    // Authors: explicit `aut` role, or creators with no role at all (very
    // common in EPUB2 files).
    for creator in &doc.creators {
        let role = doc.creator_role(creator);
        if role.as_deref().map(|r| r == "aut").unwrap_or(true) {
            meta.authors.push(Author {
                name: creator.name.clone(),
                sort_name: creator.file_as.clone(),
                role: None,
            });
        }
    }

    if let Some(tags) = doc.meta_named("calibre:tags") {
        meta.tags = split_comma_list(tags);
    }
    if let Some(series) = doc.meta_named("calibre:series") {
        let position = doc
            .meta_named("calibre:series_index")
            .and_then(|s| s.parse::<f64>().ok());
        meta.series.push(SeriesMembership {
            name: series.to_string(),
            position,
        });
    }
    meta.title_sort = doc.meta_named("calibre:title_sort").map(str::to_string);
    meta.url = doc.meta_named("shisho:url").map(str::to_string);
    meta.imprint = doc.meta_named("shisho:imprint").map(str::to_string);

    for identifier in &doc.identifiers {
        if let Some(mapped) = map_identifier(identifier.scheme.as_deref(), &identifier.value) {
            meta.identifiers.push(mapped);
        }
    }

    meta
}

/// Map a `dc:identifier` onto the catalog's closed scheme set.
pub(crate) fn map_identifier(scheme: Option<&str>, value: &str) -> Option<Identifier> {
    let mut value = value.trim().to_string();
    let mut scheme_lower = scheme.map(|s| s.to_lowercase());

    for (prefix, implied) in [("urn:isbn:", "isbn"), ("urn:uuid:", "uuid")] {
        if let Some(stripped) = value.strip_prefix(prefix) {
            value = stripped.to_string();
            scheme_lower.get_or_insert_with(|| implied.to_string());
        }
    }
    if value.is_empty() {
        return None;
    }

    let kind = match scheme_lower.as_deref() {
        Some("isbn") | Some("isbn-13") | Some("isbn13") | Some("isbn-10") | Some("isbn10") => {
            IdentifierType::classify_gtin(&value)
        }
        Some("asin") | Some("mobi-asin") | Some("amazon") => IdentifierType::Asin,
        Some("uuid") => IdentifierType::Uuid,
        Some("goodreads") => IdentifierType::Goodreads,
        Some("google") => IdentifierType::Google,
        _ => IdentifierType::Other,
    };
    Some(Identifier::new(kind, value))
}

pub(crate) fn split_comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_cover<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    doc: &OpfDocument,
    opf_dir: &str,
) -> Option<CoverImage> {
    let item = doc.cover_item()?;
    let member = resolve_href(opf_dir, &item.href);
    let data = read_member(zip, &member)?;
    let mime_type = item
        .media_type
        .clone()
        .unwrap_or_else(|| mime_guess::from_path(&member).first_or_octet_stream().to_string());
    Some(CoverImage { data, mime_type })
}

fn read_chapters<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    doc: &OpfDocument,
    opf_dir: &str,
) -> Vec<crate::model::ParsedChapter> {
    // EPUB3 nav document first, NCX as the fallback.
    let parsed = if let Some(item) = doc.nav_item() {
        let member = resolve_href(opf_dir, &item.href);
        let base = parent_dir(&member).to_string();
        read_member(zip, &member)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .and_then(|xml| nav::parse_nav(&xml).ok())
            .map(|chapters| (chapters, base))
    } else {
        None
    };

    let parsed = parsed.or_else(|| {
        let item = doc.ncx_item()?;
        let member = resolve_href(opf_dir, &item.href);
        let base = parent_dir(&member).to_string();
        let bytes = read_member(zip, &member)?;
        let chapters = nav::parse_ncx(&String::from_utf8_lossy(&bytes)).ok()?;
        Some((chapters, base))
    });

    let Some((mut chapters, base)) = parsed else {
        return Vec::new();
    };
    for chapter in &mut chapters {
        if let ChapterLocator::Href(href) = &chapter.locator {
            chapter.locator = ChapterLocator::Href(resolve_href(&base, href));
        }
    }
    chapters
}

fn read_member<R: Read + Seek>(zip: &mut ZipArchive<R>, name: &str) -> Option<Vec<u8>> {
    let index = (0..zip.len()).find(|&i| {
        zip.by_index(i)
            .map(|f| f.name() == name)
            .unwrap_or(false)
    })?;
    archive::read_entry(zip, index).ok()
}

/// Directory part of an archive member path (no trailing slash).
pub(crate) fn parent_dir(member: &str) -> &str {
    match member.rfind('/') {
        Some(slash) => &member[..slash],
        None => "",
    }
}

/// Resolve an href against a base directory inside the archive,
/// normalising `./` and `../` segments. Fragments are kept.
pub(crate) fn resolve_href(base_dir: &str, href: &str) -> String {
    let (path, fragment) = match href.find('#') {
        Some(hash) => (&href[..hash], Some(&href[hash..])),
        None => (href, None),
    };

    let mut segments: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').collect()
    };
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut resolved = segments.join("/");
    if let Some(fragment) = fragment {
        resolved.push_str(fragment);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::epub::test_fixtures::{build_epub, EpubFixture};

    #[test]
    fn test_resolve_href() {
        assert_eq!(resolve_href("OEBPS", "ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(resolve_href("OEBPS", "../images/a.jpg"), "images/a.jpg");
        assert_eq!(resolve_href("", "ch1.xhtml#frag"), "ch1.xhtml#frag");
        assert_eq!(resolve_href("a/b", "./c.xhtml"), "a/b/c.xhtml");
    }

    #[test]
    fn test_identifier_mapping() {
        let id = map_identifier(Some("ISBN"), "9781234567890").unwrap();
        assert_eq!(id.kind, IdentifierType::Isbn13);
        let id = map_identifier(None, "urn:uuid:abcd").unwrap();
        assert_eq!(id.kind, IdentifierType::Uuid);
        assert_eq!(id.value, "abcd");
        let id = map_identifier(Some("MOBI-ASIN"), "B000123").unwrap();
        assert_eq!(id.kind, IdentifierType::Asin);
        assert!(map_identifier(Some("ISBN"), "  ").is_none());
    }

    #[test]
    fn test_release_date_parsing() {
        use crate::formats::parse_release_date;
        assert_eq!(
            parse_release_date("2020-04-01"),
            chrono::NaiveDate::from_ymd_opt(2020, 4, 1)
        );
        assert_eq!(
            parse_release_date("2020-04-01T00:00:00Z"),
            chrono::NaiveDate::from_ymd_opt(2020, 4, 1)
        );
        assert_eq!(
            parse_release_date("1999"),
            chrono::NaiveDate::from_ymd_opt(1999, 1, 1)
        );
        assert_eq!(parse_release_date("not a date"), None);
    }

    #[test]
    fn test_parse_full_epub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        std::fs::write(&path, build_epub(&EpubFixture::default())).unwrap();

        let meta = parse_epub(&path).unwrap();
        assert_eq!(meta.source, Some(MetadataSource::EpubOpf));
        assert_eq!(meta.title.as_deref(), Some("Original Title"));
        assert_eq!(meta.subtitle.as_deref(), Some("A Subtitle"));
        assert_eq!(meta.authors.len(), 1);
        assert_eq!(meta.authors[0].name, "Old Author");
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(meta.publisher.as_deref(), Some("Original House"));
        assert_eq!(meta.genres, vec!["Fantasy"]);
        assert_eq!(meta.tags, vec!["tag1", "tag2"]);
        assert_eq!(meta.series.len(), 1);
        assert_eq!(meta.series[0].name, "Old Series");
        assert_eq!(meta.series[0].position, Some(3.0));
        assert!(meta.cover.is_some());
        assert_eq!(meta.cover.as_ref().unwrap().mime_type, "image/jpeg");
        assert_eq!(meta.chapters.len(), 2);
        assert_eq!(meta.chapters[0].title, "Chapter 1");
        assert_eq!(
            meta.chapters[0].locator,
            ChapterLocator::Href("OEBPS/ch1.xhtml".to_string())
        );
    }

    #[test]
    fn test_missing_source_classified() {
        let err = parse_epub(Path::new("/definitely/not/here.epub")).unwrap_err();
        assert!(matches!(err, EngineError::SourceMissing { .. }));
    }

    #[test]
    fn test_garbage_is_source_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.epub");
        std::fs::write(&path, b"this is not a zip").unwrap();
        let err = parse_epub(&path).unwrap_err();
        assert!(matches!(err, EngineError::SourceCorrupt { .. }));
    }
}
