//! CBZ metadata writer
//!
//! A two-stage pipeline. Stage 1 pushes every page image through the
//! parallel e-reader optimizer (`images`). Stage 2 reassembles the
//! archive: non-image entries stream through in source order with the
//! ComicInfo payload substituted, processed images follow, and a fresh
//! ComicInfo.xml is appended as the final entry when the source had none.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;
use zip::read::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::archive::{self, ZipEntry};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::generate::{commit_temp, staging_path, CancelToken, Generator};
use crate::model::{
    format_series_position, AuthorRole, Book, BookFile, FileFormat, IdentifierType,
};

use super::comicinfo::ComicInfo;
use super::images::{process_images, ImageInput};

/// Identity writer for CBZ sources
#[derive(Debug)]
pub struct CbzWriter {
    config: EngineConfig,
}

impl CbzWriter {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Generator for CbzWriter {
    async fn generate(
        &self,
        cancel: &CancelToken,
        src: &Path,
        dest: &Path,
        book: &Book,
        file: &BookFile,
    ) -> Result<()> {
        let cancel = cancel.clone();
        let (src, dest) = (src.to_path_buf(), dest.to_path_buf());
        let (book, file) = (book.clone(), file.clone());
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            write_cbz(&cancel, &src, &dest, &book, &file, &config)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("cbz writer task join error: {e}")))?
    }
}

pub(crate) fn write_cbz(
    cancel: &CancelToken,
    src: &Path,
    dest: &Path,
    book: &Book,
    file: &BookFile,
    config: &EngineConfig,
) -> Result<()> {
    // OPEN
    let source = File::open(src).map_err(|e| EngineError::source_io(src, FileFormat::Cbz, e))?;
    let mut zip = ZipArchive::new(source)
        .map_err(|e| EngineError::corrupt(src, FileFormat::Cbz, e.to_string()))?;

    // SCAN: partition the entry table.
    let entries = archive::list_entries(&mut zip)
        .map_err(|e| EngineError::corrupt(src, FileFormat::Cbz, e.to_string()))?;
    let comicinfo_entry = entries
        .iter()
        .find(|e| !e.is_dir && e.file_name_lower() == "comicinfo.xml")
        .cloned();
    let image_entries: Vec<ZipEntry> = entries
        .iter()
        .filter(|e| !e.is_dir && archive::is_image_name(&e.name))
        .cloned()
        .collect();

    let source_info = match &comicinfo_entry {
        Some(entry) => archive::read_entry(&mut zip, entry.index)
            .ok()
            .and_then(|bytes| ComicInfo::parse(&String::from_utf8_lossy(&bytes)).ok())
            .unwrap_or_default(),
        None => ComicInfo::default(),
    };
    cancel.check()?;

    // Stage 1: parallel image processing.
    let mut inputs = Vec::with_capacity(image_entries.len());
    for entry in &image_entries {
        cancel.check()?;
        let data = archive::read_entry(&mut zip, entry.index)
            .map_err(|e| EngineError::corrupt(src, FileFormat::Cbz, e.to_string()))?;
        inputs.push(ImageInput {
            entry_index: entry.index,
            name: entry.name.clone(),
            data,
        });
    }
    let workers = config.worker_count(inputs.len());
    let processed = process_images(cancel, &config.image, workers, inputs)?;
    debug!(
        src = %src.display(),
        images = processed.len(),
        workers,
        "cbz image stage complete"
    );

    // STAGE: rewritten ComicInfo payload.
    let info = rewrite_comicinfo(source_info, book, file, image_entries.len() as u32);
    let info_xml = info.to_xml().map_err(|e| {
        EngineError::writer_cause(dest, FileFormat::Cbz, "ComicInfo serialization failed", e)
    })?;

    // Stage 2 / WRITE: archive assembly.
    let tmp = staging_path(dest);
    let write_result = (|| -> Result<()> {
        let out = File::create(&tmp).map_err(|e| {
            EngineError::writer_cause(dest, FileFormat::Cbz, "cannot create staging file", e)
        })?;
        let mut writer = ZipWriter::new(BufWriter::new(out));
        let assembly = |err: zip::result::ZipError| {
            EngineError::writer_cause(dest, FileFormat::Cbz, "archive assembly failed", err)
        };

        // Non-image entries in source order, ComicInfo substituted in place.
        for entry in &entries {
            cancel.check()?;
            if !entry.is_dir && archive::is_image_name(&entry.name) {
                continue;
            }
            let is_comicinfo = comicinfo_entry
                .as_ref()
                .map(|c| c.index == entry.index)
                .unwrap_or(false);
            if is_comicinfo {
                writer
                    .start_file(entry.name.as_str(), entry.options())
                    .map_err(assembly)?;
                writer.write_all(info_xml.as_bytes()).map_err(|e| {
                    EngineError::writer_cause(dest, FileFormat::Cbz, "archive assembly failed", e)
                })?;
            } else {
                archive::copy_entry(&mut zip, entry.index, &mut writer, None).map_err(assembly)?;
            }
        }

        // Processed images, in source order.
        for image in &processed {
            cancel.check()?;
            let options = entries[image.entry_index].options();
            writer
                .start_file(image.name.as_str(), options)
                .map_err(assembly)?;
            writer.write_all(&image.data).map_err(|e| {
                EngineError::writer_cause(dest, FileFormat::Cbz, "archive assembly failed", e)
            })?;
        }

        // No ComicInfo in the source: emit one as the final entry.
        if comicinfo_entry.is_none() {
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            writer.start_file("ComicInfo.xml", options).map_err(assembly)?;
            writer.write_all(info_xml.as_bytes()).map_err(|e| {
                EngineError::writer_cause(dest, FileFormat::Cbz, "archive assembly failed", e)
            })?;
        }

        writer.finish().map_err(assembly)?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }

    // COMMIT
    commit_temp(&tmp, dest, FileFormat::Cbz)
}

/// Apply the catalog's authoritative metadata onto a source ComicInfo.
/// Fields the catalog has no value for keep the source's values.
fn rewrite_comicinfo(
    mut info: ComicInfo,
    book: &Book,
    file: &BookFile,
    page_count: u32,
) -> ComicInfo {
    info.title = Some(file.effective_title(book).to_string());

    if let Some(primary) = book.primary_series() {
        info.series = Some(primary.name.clone());
        info.number = primary.position.map(format_series_position);
    }

    if !book.authors.is_empty() {
        let names_for = |role: AuthorRole| -> Vec<&str> {
            book.authors
                .iter()
                .filter(|a| a.role == Some(role))
                .map(|a| a.name.as_str())
                .collect()
        };
        let join = |names: Vec<&str>| -> Option<String> {
            if names.is_empty() {
                None
            } else {
                Some(names.join(", "))
            }
        };

        // Role-less authors land in Writer when nothing else claims it.
        let mut writers = names_for(AuthorRole::Writer);
        if writers.is_empty() {
            writers = book
                .authors
                .iter()
                .filter(|a| a.role.is_none())
                .map(|a| a.name.as_str())
                .collect();
        }
        info.writer = join(writers);
        info.penciller = join(names_for(AuthorRole::Penciller));
        info.inker = join(names_for(AuthorRole::Inker));
        info.colorist = join(names_for(AuthorRole::Colorist));
        info.letterer = join(names_for(AuthorRole::Letterer));
        info.cover_artist = join(names_for(AuthorRole::CoverArtist));
        info.editor = join(names_for(AuthorRole::Editor));
        info.translator = join(names_for(AuthorRole::Translator));
    }

    if !book.genres.is_empty() {
        info.genre = Some(book.genres.join(", "));
    }
    if !book.tags.is_empty() {
        info.tags = Some(book.tags.join(", "));
    }
    if let Some(description) = book.description.as_deref().filter(|d| !d.is_empty()) {
        info.summary = Some(description.to_string());
    }

    if let Some(publisher) = &file.publisher {
        info.publisher = Some(publisher.clone());
    }
    if let Some(imprint) = &file.imprint {
        info.imprint = Some(imprint.clone());
    }
    if let Some(url) = &file.url {
        info.web = Some(url.clone());
    }
    if let Some(date) = file.release_date {
        use chrono::Datelike;
        info.year = Some(date.year());
        info.month = Some(date.month());
        info.day = Some(date.day());
    }

    // GTIN: best identifier under the fixed priority order.
    for kind in [
        IdentifierType::Isbn13,
        IdentifierType::Isbn10,
        IdentifierType::Other,
        IdentifierType::Asin,
    ] {
        if let Some(identifier) = file.identifier(kind) {
            info.gtin = Some(identifier.value.clone());
            break;
        }
    }

    info.page_count = Some(page_count);

    if let Some(cover_page) = file.cover_page {
        info.set_front_cover(cover_page);
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::cbz::parse_cbz;
    use crate::formats::cbz::test_fixtures::{build_cbz, jpeg_page, png_page, CbzFixture};
    use crate::model::{Author, Identifier, SeriesMembership};
    use std::io::Cursor;

    fn test_config() -> EngineConfig {
        EngineConfig::new(crate::config::CacheConfig::new("/tmp/unused", 1 << 20))
    }

    fn sample_book(dir: &Path) -> Book {
        Book {
            id: 2,
            title: "Rewritten".into(),
            subtitle: None,
            description: Some("New summary.".into()),
            filepath: dir.to_path_buf(),
            authors: vec![
                Author::with_role("Writer One", AuthorRole::Writer),
                Author::with_role("Pencils", AuthorRole::Penciller),
            ],
            series: vec![SeriesMembership {
                name: "Saga Prime".into(),
                position: Some(1.5),
            }],
            genres: vec!["Action".into(), "Drama".into()],
            tags: vec!["favorite".into()],
        }
    }

    fn sample_file(src: &Path) -> BookFile {
        BookFile {
            id: 20,
            book_id: 2,
            filepath: src.to_path_buf(),
            format: FileFormat::Cbz,
            role: crate::model::FileRole::Main,
            name_override: None,
            publisher: Some("New Comics".into()),
            imprint: None,
            release_date: chrono::NaiveDate::from_ymd_opt(2021, 7, 9),
            url: Some("https://example.com/saga".into()),
            cover: None,
            identifiers: vec![
                Identifier::new(IdentifierType::Asin, "B0AAA"),
                Identifier::new(IdentifierType::Isbn13, "9780000000002"),
            ],
            chapters: vec![],
            page_count: None,
            cover_page: None,
            duration_seconds: None,
            bitrate: None,
        }
    }

    #[test]
    fn test_png_scaled_and_jpeg_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.cbz");
        let dest = dir.path().join("out.cbz");
        let small_jpeg = jpeg_page(800, 1200);
        let fixture = CbzFixture {
            images: vec![
                ("page1.png".into(), png_page(2000, 3000)),
                ("page2.jpg".into(), small_jpeg.clone()),
            ],
            ..Default::default()
        };
        std::fs::write(&src, build_cbz(&fixture)).unwrap();

        write_cbz(
            &CancelToken::new(),
            &src,
            &dest,
            &sample_book(dir.path()),
            &sample_file(&src),
            &test_config(),
        )
        .unwrap();

        let bytes = std::fs::read(&dest).unwrap();
        let mut out = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..out.len())
            .map(|i| out.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"page1.jpg".to_string()), "{names:?}");
        assert!(!names.contains(&"page1.png".to_string()), "{names:?}");

        let converted = archive::read_entry(&mut out, names.iter().position(|n| n == "page1.jpg").unwrap()).unwrap();
        let img = image::load_from_memory(&converted).unwrap();
        use image::GenericImageView;
        assert_eq!(img.dimensions(), (1120, 1680));

        let kept =
            archive::read_entry(&mut out, names.iter().position(|n| n == "page2.jpg").unwrap())
                .unwrap();
        assert_eq!(kept, small_jpeg);
    }

    #[test]
    fn test_comicinfo_rewrite_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.cbz");
        let dest = dir.path().join("out.cbz");
        std::fs::write(&src, build_cbz(&CbzFixture::default())).unwrap();

        let book = sample_book(dir.path());
        let file = sample_file(&src);
        write_cbz(&CancelToken::new(), &src, &dest, &book, &file, &test_config()).unwrap();

        let meta = parse_cbz(&dest).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Rewritten"));
        assert_eq!(meta.description.as_deref(), Some("New summary."));
        assert_eq!(meta.series[0].name, "Saga Prime");
        assert_eq!(meta.series[0].position, Some(1.5));
        assert_eq!(meta.publisher.as_deref(), Some("New Comics"));
        assert_eq!(meta.url.as_deref(), Some("https://example.com/saga"));
        assert_eq!(meta.release_date, file.release_date);
        assert_eq!(meta.genres, vec!["Action", "Drama"]);
        assert_eq!(meta.tags, vec!["favorite"]);
        // ISBN-13 outranks ASIN for the GTIN slot.
        assert_eq!(meta.identifiers[0].kind, IdentifierType::Isbn13);
        assert_eq!(meta.identifiers[0].value, "9780000000002");
        assert_eq!(meta.page_count, Some(3));
    }

    #[test]
    fn test_cover_page_marking_without_pages_section() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.cbz");
        let dest = dir.path().join("out.cbz");
        let fixture = CbzFixture {
            comicinfo_override: Some(
                b"<?xml version=\"1.0\"?><ComicInfo><Title>Five Pager</Title></ComicInfo>"
                    .to_vec(),
            ),
            images: (0..5)
                .map(|i| (format!("p{i}.jpg"), jpeg_page(100, 150)))
                .collect(),
            ..Default::default()
        };
        std::fs::write(&src, build_cbz(&fixture)).unwrap();

        let book = sample_book(dir.path());
        let mut file = sample_file(&src);
        file.cover_page = Some(2);
        write_cbz(&CancelToken::new(), &src, &dest, &book, &file, &test_config()).unwrap();

        let meta = parse_cbz(&dest).unwrap();
        assert_eq!(meta.cover_page, Some(2));

        let bytes = std::fs::read(&dest).unwrap();
        let mut out = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let index = (0..out.len())
            .find(|&i| out.by_index(i).unwrap().name().to_lowercase().ends_with("comicinfo.xml"))
            .unwrap();
        let xml = String::from_utf8(archive::read_entry(&mut out, index).unwrap()).unwrap();
        assert!(xml.contains(r#"Image="2""#), "{xml}");
        assert!(xml.contains(r#"Type="FrontCover""#), "{xml}");
    }

    #[test]
    fn test_missing_comicinfo_appended_last() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.cbz");
        let dest = dir.path().join("out.cbz");
        let fixture = CbzFixture {
            include_comicinfo: false,
            ..Default::default()
        };
        std::fs::write(&src, build_cbz(&fixture)).unwrap();

        write_cbz(
            &CancelToken::new(),
            &src,
            &dest,
            &sample_book(dir.path()),
            &sample_file(&src),
            &test_config(),
        )
        .unwrap();

        let bytes = std::fs::read(&dest).unwrap();
        let mut out = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let last = out.by_index(out.len() - 1).unwrap();
        assert_eq!(last.name(), "ComicInfo.xml");
    }

    #[test]
    fn test_other_entries_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.cbz");
        let dest = dir.path().join("out.cbz");
        let payload = b"some sidecar data".to_vec();
        let fixture = CbzFixture {
            extra_entry: Some(("notes/readme.txt".into(), payload.clone())),
            ..Default::default()
        };
        std::fs::write(&src, build_cbz(&fixture)).unwrap();

        write_cbz(
            &CancelToken::new(),
            &src,
            &dest,
            &sample_book(dir.path()),
            &sample_file(&src),
            &test_config(),
        )
        .unwrap();

        let bytes = std::fs::read(&dest).unwrap();
        let mut out = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let index = (0..out.len())
            .find(|&i| out.by_index(i).unwrap().name() == "notes/readme.txt")
            .unwrap();
        assert_eq!(archive::read_entry(&mut out, index).unwrap(), payload);
    }
}
