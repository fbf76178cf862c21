//! CBZ to KePub conversion
//!
//! Builds a fixed-layout EPUB directly from the comic archive: one XHTML
//! page per image, pre-paginated rendition, image bytes copied verbatim
//! (lossless), an OPF generated from the catalog metadata with the same
//! field semantics as the EPUB writer, and a depth-1 nav document from the
//! file's top-level chapters.

use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;

use async_trait::async_trait;
use quick_xml::escape::escape;
use tracing::debug;
use zip::read::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::archive::{self, KEPUB_MIMETYPE};
use crate::error::{EngineError, Result};
use crate::generate::{commit_temp, staging_path, CancelToken, Generator};
use crate::model::{
    format_series_position, Book, BookFile, ChapterLocator, FileFormat, IdentifierType,
};

/// CBZ -> KePub (fixed-layout EPUB) converter
#[derive(Debug, Default)]
pub struct CbzToKepub;

impl CbzToKepub {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for CbzToKepub {
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
        tokio::task::spawn_blocking(move || cbz_to_kepub(&cancel, &src, &dest, &book, &file))
            .await
            .map_err(|e| EngineError::Internal(format!("kepub task join error: {e}")))?
    }
}

struct PageImage {
    /// Zero-based page index
    index: usize,
    /// Archive member name inside the output EPUB
    member: String,
    media_type: String,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

pub(crate) fn cbz_to_kepub(
    cancel: &CancelToken,
    src: &Path,
    dest: &Path,
    book: &Book,
    file: &BookFile,
) -> Result<()> {
    let source = File::open(src).map_err(|e| EngineError::source_io(src, FileFormat::Cbz, e))?;
    let mut zip = ZipArchive::new(source)
        .map_err(|e| EngineError::corrupt(src, FileFormat::Cbz, e.to_string()))?;
    let entries = archive::list_entries(&mut zip)
        .map_err(|e| EngineError::corrupt(src, FileFormat::Cbz, e.to_string()))?;

    // Page images in archive order, bytes copied losslessly.
    let mut pages: Vec<PageImage> = Vec::new();
    for entry in entries
        .iter()
        .filter(|e| !e.is_dir && archive::is_image_name(&e.name))
    {
        cancel.check()?;
        let data = archive::read_entry(&mut zip, entry.index)
            .map_err(|e| EngineError::corrupt(src, FileFormat::Cbz, e.to_string()))?;
        let (width, height) = image::ImageReader::new(Cursor::new(&data))
            .with_guessed_format()
            .ok()
            .and_then(|r| r.into_dimensions().ok())
            .unwrap_or((600, 800));
        let extension = entry
            .name
            .rsplit('.')
            .next()
            .unwrap_or("jpg")
            .to_lowercase();
        let index = pages.len();
        pages.push(PageImage {
            index,
            member: format!("OEBPS/images/page-{index:03}.{extension}"),
            media_type: mime_guess::from_path(&entry.name)
                .first_or_octet_stream()
                .to_string(),
            width,
            height,
            data,
        });
    }
    if pages.is_empty() {
        return Err(EngineError::corrupt(src, FileFormat::Cbz, "no page images"));
    }

    let cover_index = file
        .cover_page
        .map(|p| p as usize)
        .filter(|&p| p < pages.len())
        .unwrap_or(0);

    let tmp = staging_path(dest);
    let write_result = (|| -> Result<()> {
        let out = File::create(&tmp).map_err(|e| {
            EngineError::writer_cause(dest, FileFormat::Cbz, "cannot create staging file", e)
        })?;
        let mut writer = ZipWriter::new(BufWriter::new(out));
        let assembly = |err: zip::result::ZipError| {
            EngineError::writer_cause(dest, FileFormat::Cbz, "archive assembly failed", err)
        };
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut put = |writer: &mut ZipWriter<BufWriter<File>>,
                       name: &str,
                       options: SimpleFileOptions,
                       data: &[u8]|
         -> Result<()> {
            writer.start_file(name, options).map_err(assembly)?;
            writer.write_all(data).map_err(|e| {
                EngineError::writer_cause(dest, FileFormat::Cbz, "archive assembly failed", e)
            })
        };

        archive::start_mimetype(&mut writer, KEPUB_MIMETYPE).map_err(assembly)?;
        put(
            &mut writer,
            "META-INF/container.xml",
            deflated,
            CONTAINER_XML.as_bytes(),
        )?;
        put(
            &mut writer,
            "OEBPS/content.opf",
            deflated,
            content_opf(book, file, &pages, cover_index).as_bytes(),
        )?;
        put(
            &mut writer,
            "OEBPS/nav.xhtml",
            deflated,
            nav_document(file, &pages).as_bytes(),
        )?;
        for page in &pages {
            cancel.check()?;
            put(
                &mut writer,
                &format!("OEBPS/pages/page-{:03}.xhtml", page.index),
                deflated,
                page_xhtml(page).as_bytes(),
            )?;
            put(&mut writer, &page.member, stored, &page.data)?;
        }
        writer.finish().map_err(assembly)?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }

    debug!(dest = %dest.display(), pages = pages.len(), "built fixed-layout kepub");
    commit_temp(&tmp, dest, FileFormat::Cbz)
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container xmlns="urn:oasis:names:tc:opendocument:xmlns:container" version="1.0">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Stable package identifier: the file's uuid identifier when one exists.
fn package_identifier(file: &BookFile) -> String {
    file.identifier(IdentifierType::Uuid)
        .map(|i| format!("urn:uuid:{}", i.value))
        .unwrap_or_else(|| format!("urn:shisho:file:{}", file.id))
}

fn content_opf(book: &Book, file: &BookFile, pages: &[PageImage], cover_index: usize) -> String {
    let mut metadata = String::new();
    let push_text = |out: &mut String, name: &str, attrs: &str, value: &str| {
        out.push_str(&format!("    <{name}{attrs}>{}</{name}>\n", escape(value)));
    };

    push_text(&mut metadata, "dc:identifier", r#" id="uid""#, &package_identifier(file));
    push_text(&mut metadata, "dc:title", "", file.effective_title(book));
    if let Some(subtitle) = book.subtitle.as_deref().filter(|s| !s.is_empty()) {
        push_text(&mut metadata, "dc:title", r#" id="subtitle""#, subtitle);
        metadata.push_str(
            "    <meta refines=\"#subtitle\" property=\"title-type\">subtitle</meta>\n",
        );
    }
    for author in &book.authors {
        let attrs = match author.sort_name.as_deref() {
            Some(sort) => format!(r#" opf:role="aut" opf:file-as="{}""#, escape(sort)),
            None => r#" opf:role="aut""#.to_string(),
        };
        push_text(&mut metadata, "dc:creator", &attrs, &author.name);
    }
    push_text(&mut metadata, "dc:language", "", "und");
    if let Some(publisher) = file.publisher.as_deref() {
        push_text(&mut metadata, "dc:publisher", "", publisher);
    }
    if let Some(date) = file.release_date {
        push_text(&mut metadata, "dc:date", "", &date.format("%Y-%m-%d").to_string());
    }
    if let Some(description) = book.description.as_deref().filter(|d| !d.is_empty()) {
        push_text(&mut metadata, "dc:description", "", description);
    }
    for genre in &book.genres {
        push_text(&mut metadata, "dc:subject", "", genre);
    }
    for identifier in &file.identifiers {
        let scheme = match identifier.kind {
            IdentifierType::Isbn10 | IdentifierType::Isbn13 => r#" opf:scheme="ISBN""#,
            IdentifierType::Asin => r#" opf:scheme="ASIN""#,
            IdentifierType::Uuid => r#" opf:scheme="UUID""#,
            IdentifierType::Goodreads => r#" opf:scheme="GOODREADS""#,
            IdentifierType::Google => r#" opf:scheme="GOOGLE""#,
            IdentifierType::Other => "",
        };
        push_text(&mut metadata, "dc:identifier", scheme, &identifier.value);
    }
    if let Some(primary) = book.primary_series() {
        metadata.push_str(&format!(
            "    <meta name=\"calibre:series\" content=\"{}\"/>\n",
            escape(&primary.name)
        ));
        if let Some(position) = primary.position {
            metadata.push_str(&format!(
                "    <meta name=\"calibre:series_index\" content=\"{}\"/>\n",
                format_series_position(position)
            ));
        }
    }
    for (index, series) in book.series.iter().enumerate() {
        let id = format!("series-{}", index + 1);
        push_text(
            &mut metadata,
            "meta",
            &format!(r#" property="belongs-to-collection" id="{id}""#),
            &series.name,
        );
        push_text(
            &mut metadata,
            "meta",
            &format!(r##" refines="#{id}" property="collection-type""##),
            "series",
        );
        if let Some(position) = series.position {
            push_text(
                &mut metadata,
                "meta",
                &format!(r##" refines="#{id}" property="group-position""##),
                &format_series_position(position),
            );
        }
    }
    if !book.tags.is_empty() {
        metadata.push_str(&format!(
            "    <meta name=\"calibre:tags\" content=\"{}\"/>\n",
            escape(&book.tags.join(", "))
        ));
    }
    if let Some(url) = file.url.as_deref() {
        metadata.push_str(&format!(
            "    <meta name=\"shisho:url\" content=\"{}\"/>\n",
            escape(url)
        ));
    }
    if let Some(imprint) = file.imprint.as_deref() {
        metadata.push_str(&format!(
            "    <meta name=\"shisho:imprint\" content=\"{}\"/>\n",
            escape(imprint)
        ));
    }
    metadata.push_str(&format!(
        "    <meta name=\"cover\" content=\"img-{cover_index:03}\"/>\n"
    ));
    metadata.push_str("    <meta property=\"rendition:layout\">pre-paginated</meta>\n");

    let mut manifest = String::from(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n",
    );
    let mut spine = String::new();
    for page in pages {
        let image_properties = if page.index == cover_index {
            " properties=\"cover-image\""
        } else {
            ""
        };
        manifest.push_str(&format!(
            "    <item id=\"page-{index:03}\" href=\"pages/page-{index:03}.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            index = page.index
        ));
        manifest.push_str(&format!(
            "    <item id=\"img-{index:03}\" href=\"{href}\" media-type=\"{media}\"{image_properties}/>\n",
            index = page.index,
            href = page.member.trim_start_matches("OEBPS/"),
            media = page.media_type,
        ));
        spine.push_str(&format!(
            "    <itemref idref=\"page-{index:03}\" properties=\"rendition:layout-pre-paginated\"/>\n",
            index = page.index
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" xmlns:opf="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid" prefix="rendition: http://www.idpf.org/vocab/rendition/#">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
{metadata}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine>
{spine}  </spine>
</package>"#
    )
}

/// Depth-1 nav document from the file's top-level chapters, each entry
/// pointing at the spine item of its start page. Falls back to a single
/// entry for chapterless files.
fn nav_document(file: &BookFile, pages: &[PageImage]) -> String {
    let mut items = String::new();
    let roots = file.root_chapters();
    if roots.is_empty() {
        items.push_str("      <li><a href=\"pages/page-000.xhtml\">Start</a></li>\n");
    } else {
        for chapter in roots {
            let page = match &chapter.locator {
                ChapterLocator::Page(p) => (*p as usize).min(pages.len().saturating_sub(1)),
                _ => 0,
            };
            items.push_str(&format!(
                "      <li><a href=\"pages/page-{page:03}.xhtml\">{}</a></li>\n",
                escape(&chapter.title)
            ));
        }
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>Contents</title></head>
<body>
  <nav epub:type="toc">
    <ol>
{items}    </ol>
  </nav>
</body>
</html>"#
    )
}

fn page_xhtml(page: &PageImage) -> String {
    let image_href = format!("../{}", page.member.trim_start_matches("OEBPS/"));
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <title>Page {index}</title>
  <meta name="viewport" content="width={width}, height={height}"/>
</head>
<body>
  <div class="page">
    <img src="{image_href}" alt="Page {index}"/>
  </div>
</body>
</html>"#,
        index = page.index + 1,
        width = page.width,
        height = page.height,
    )
}
