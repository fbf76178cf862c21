//! EPUB to KePub conversion
//!
//! Two passes: the EPUB writer first produces a metadata-updated
//! intermediate at `<dest>.epub.tmp`, then the KePub transform rewrites
//! it — Kobo span markers in every spine XHTML document, a
//! `rendition:layout` default when absent, and the internal mime set to
//! `application/kepub+zip`. The intermediate is removed on exit.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, warn};
use zip::read::ZipArchive;
use zip::write::ZipWriter;

use crate::archive::{self, KEPUB_MIMETYPE};
use crate::error::{EngineError, Result};
use crate::formats::epub::{parent_dir, resolve_href, write_epub, OpfDocument};
use crate::generate::{commit_temp, staging_path, CancelToken, Generator};
use crate::model::{Book, BookFile, FileFormat};

use super::markup::kepubify_xhtml;

/// EPUB -> KePub converter
#[derive(Debug, Default)]
pub struct EpubToKepub;

impl EpubToKepub {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for EpubToKepub {
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
        tokio::task::spawn_blocking(move || epub_to_kepub(&cancel, &src, &dest, &book, &file))
            .await
            .map_err(|e| EngineError::Internal(format!("kepub task join error: {e}")))?
    }
}

pub(crate) fn epub_to_kepub(
    cancel: &CancelToken,
    src: &Path,
    dest: &Path,
    book: &Book,
    file: &BookFile,
) -> Result<()> {
    let intermediate = PathBuf::from(format!("{}.epub.tmp", dest.display()));
    write_epub(cancel, src, &intermediate, book, file)?;

    let result = kepub_transform(cancel, &intermediate, dest);
    let _ = std::fs::remove_file(&intermediate);
    result
}

fn kepub_transform(cancel: &CancelToken, src: &Path, dest: &Path) -> Result<()> {
    let failed = |detail: &str, err: Option<crate::error::Cause>| EngineError::WriterFailed {
        path: dest.to_path_buf(),
        format: FileFormat::Epub,
        detail: detail.to_string(),
        cause: err,
    };

    let source = File::open(src)
        .map_err(|e| failed("cannot reopen intermediate epub", Some(std::sync::Arc::new(e))))?;
    let mut zip = ZipArchive::new(source)
        .map_err(|e| failed("intermediate epub unreadable", Some(std::sync::Arc::new(e))))?;
    let entries = archive::list_entries(&mut zip)
        .map_err(|e| failed("intermediate epub unreadable", Some(std::sync::Arc::new(e))))?;

    let opf_entry = entries
        .iter()
        .find(|e| !e.is_dir && e.name.to_lowercase().ends_with(".opf"))
        .cloned()
        .ok_or_else(|| failed("intermediate epub has no OPF", None))?;
    let opf_xml = archive::read_entry(&mut zip, opf_entry.index)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| failed("intermediate epub unreadable", Some(std::sync::Arc::new(e))))?;
    let doc = OpfDocument::parse(&opf_xml)
        .map_err(|e| failed("intermediate OPF invalid", Some(std::sync::Arc::new(e))))?;

    // Spine documents get the span treatment.
    let opf_dir = parent_dir(&opf_entry.name);
    let xhtml_members: HashSet<String> = doc
        .manifest
        .iter()
        .filter(|i| i.media_type.as_deref() == Some("application/xhtml+xml"))
        .map(|i| resolve_href(opf_dir, &i.href))
        .collect();

    let new_opf = ensure_rendition_layout(&opf_xml, &doc)
        .map_err(|e| failed("OPF rendition rewrite failed", Some(std::sync::Arc::new(e))))?;
    cancel.check()?;

    let tmp = staging_path(dest);
    let write_result = (|| -> Result<()> {
        let out = File::create(&tmp)
            .map_err(|e| failed("cannot create staging file", Some(std::sync::Arc::new(e))))?;
        let mut writer = ZipWriter::new(BufWriter::new(out));
        archive::start_mimetype(&mut writer, KEPUB_MIMETYPE)
            .map_err(|e| failed("cannot write mimetype entry", Some(std::sync::Arc::new(e))))?;

        for entry in &entries {
            cancel.check()?;
            if entry.name == "mimetype" {
                continue;
            }
            if entry.index == opf_entry.index {
                writer
                    .start_file(entry.name.as_str(), entry.options())
                    .and_then(|_| writer.write_all(new_opf.as_bytes()).map_err(Into::into))
                    .map_err(|e| failed("archive assembly failed", Some(std::sync::Arc::new(e))))?;
            } else if xhtml_members.contains(&entry.name) {
                let bytes = archive::read_entry(&mut zip, entry.index)
                    .map_err(|e| failed("archive assembly failed", Some(std::sync::Arc::new(e))))?;
                let xhtml = String::from_utf8_lossy(&bytes).into_owned();
                let transformed = match kepubify_xhtml(&xhtml) {
                    Ok(out) => out,
                    Err(err) => {
                        // A single malformed document keeps its original
                        // markup rather than sinking the conversion.
                        warn!(member = %entry.name, %err, "kepub span injection failed");
                        xhtml
                    }
                };
                writer
                    .start_file(entry.name.as_str(), entry.options())
                    .and_then(|_| writer.write_all(transformed.as_bytes()).map_err(Into::into))
                    .map_err(|e| failed("archive assembly failed", Some(std::sync::Arc::new(e))))?;
            } else {
                archive::copy_entry(&mut zip, entry.index, &mut writer, None)
                    .map_err(|e| failed("archive assembly failed", Some(std::sync::Arc::new(e))))?;
            }
        }
        writer
            .finish()
            .map_err(|e| failed("archive finalisation failed", Some(std::sync::Arc::new(e))))?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }

    debug!(dest = %dest.display(), spine_docs = xhtml_members.len(), "kepub transform complete");
    commit_temp(&tmp, dest, FileFormat::Epub)
}

/// Add `<meta property="rendition:layout">reflowable</meta>` when the
/// package declares no layout.
fn ensure_rendition_layout(
    xml: &str,
    doc: &OpfDocument,
) -> std::result::Result<String, quick_xml::Error> {
    let has_layout = doc
        .metas
        .iter()
        .any(|m| m.property.as_deref() == Some("rendition:layout"));
    if has_layout {
        return Ok(xml.to_string());
    }

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut depth = 0usize;
    let mut in_metadata = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if e.name().local_name().as_ref() == b"metadata" {
                    in_metadata = true;
                    depth = 0;
                } else if in_metadata {
                    depth += 1;
                }
                writer.write_event(Event::Start(e))?;
            }
            Event::End(e) => {
                if in_metadata && e.name().local_name().as_ref() == b"metadata" && depth == 0 {
                    let mut meta = BytesStart::new("meta");
                    meta.push_attribute(("property", "rendition:layout"));
                    writer.write_event(Event::Start(meta))?;
                    writer.write_event(Event::Text(BytesText::new("reflowable")))?;
                    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("meta")))?;
                    in_metadata = false;
                } else if in_metadata {
                    depth = depth.saturating_sub(1);
                }
                writer.write_event(Event::End(e))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }
    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
