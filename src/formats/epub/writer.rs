//! EPUB metadata writer
//!
//! Rewrites the OPF package document so the tracked fields carry the
//! catalog's authoritative values, then reassembles the archive preserving
//! every other member byte-identically (same order, same compression
//! method). The `mimetype` entry is always emitted first and STORED.
//!
//! Creators are replaced as a block: elements whose role resolves to `aut`
//! (or that carry no role at all) make way for the catalog's authors; every
//! creator with an explicit non-author role is preserved.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::debug;
use zip::read::ZipArchive;
use zip::write::ZipWriter;

use crate::archive::{self, EPUB_MIMETYPE};
use crate::error::{EngineError, Result};
use crate::generate::{commit_temp, staging_path, CancelToken, Generator};
use crate::model::{
    format_series_position, Book, BookFile, FileFormat, IdentifierType,
};

use super::opf::{attrs_of, OpfDocument};
use super::parser::{parent_dir, resolve_href};

/// Identity writer for EPUB sources
#[derive(Debug, Default)]
pub struct EpubWriter;

impl EpubWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for EpubWriter {
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
        tokio::task::spawn_blocking(move || write_epub(&cancel, &src, &dest, &book, &file))
            .await
            .map_err(|e| EngineError::Internal(format!("epub writer task join error: {e}")))?
    }
}

/// Substitution of the cover image member planned during the scan phase.
struct CoverPlan {
    member: String,
    item_id: String,
    bytes: Vec<u8>,
    mime_type: String,
}

pub(crate) fn write_epub(
    cancel: &CancelToken,
    src: &Path,
    dest: &Path,
    book: &Book,
    file: &BookFile,
) -> Result<()> {
    // OPEN
    let source =
        File::open(src).map_err(|e| EngineError::source_io(src, FileFormat::Epub, e))?;
    let mut zip = ZipArchive::new(source)
        .map_err(|e| EngineError::corrupt(src, FileFormat::Epub, e.to_string()))?;

    // SCAN: locate the OPF and everything we will rewrite.
    let entries = archive::list_entries(&mut zip)
        .map_err(|e| EngineError::corrupt(src, FileFormat::Epub, e.to_string()))?;
    let opf_entry = entries
        .iter()
        .find(|e| {
            !e.is_dir
                && !archive::is_hidden_name(&e.name)
                && e.name.to_lowercase().ends_with(".opf")
        })
        .cloned()
        .ok_or_else(|| {
            EngineError::corrupt(src, FileFormat::Epub, "no OPF package document in archive")
        })?;
    let opf_xml = archive::read_entry(&mut zip, opf_entry.index)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| EngineError::corrupt(src, FileFormat::Epub, e.to_string()))?;
    let doc = OpfDocument::parse(&opf_xml)
        .map_err(|e| EngineError::corrupt(src, FileFormat::Epub, format!("invalid OPF: {e}")))?;
    cancel.check()?;

    let opf_dir = parent_dir(&opf_entry.name);
    let cover = plan_cover_override(book, file, &doc, opf_dir, dest)?;

    // STAGE: materialise the rewritten OPF.
    let new_opf = rewrite_opf(&opf_xml, book, file, &doc, cover.as_ref())
        .map_err(|e| EngineError::writer_cause(dest, FileFormat::Epub, "OPF rewrite failed", e))?;
    debug!(src = %src.display(), opf = %opf_entry.name, "staged rewritten OPF");

    // WRITE
    let tmp = staging_path(dest);
    let write_result = (|| -> Result<()> {
        let out = File::create(&tmp).map_err(|e| {
            EngineError::writer_cause(dest, FileFormat::Epub, "cannot create staging file", e)
        })?;
        let mut writer = ZipWriter::new(BufWriter::new(out));
        archive::start_mimetype(&mut writer, EPUB_MIMETYPE).map_err(|e| {
            EngineError::writer_cause(dest, FileFormat::Epub, "cannot write mimetype entry", e)
        })?;

        for entry in &entries {
            cancel.check()?;
            if entry.name == "mimetype" {
                continue;
            }
            let write_entry = |writer: &mut ZipWriter<BufWriter<File>>,
                               payload: &[u8]|
             -> zip::result::ZipResult<()> {
                writer.start_file(entry.name.as_str(), entry.options())?;
                writer.write_all(payload)?;
                Ok(())
            };
            let copied = if entry.index == opf_entry.index {
                write_entry(&mut writer, new_opf.as_bytes())
            } else if cover.as_ref().map(|c| c.member == entry.name).unwrap_or(false) {
                write_entry(&mut writer, &cover.as_ref().unwrap().bytes)
            } else {
                archive::copy_entry(&mut zip, entry.index, &mut writer, None)
            };
            copied.map_err(|e| {
                EngineError::writer_cause(dest, FileFormat::Epub, "archive assembly failed", e)
            })?;
        }
        writer.finish().map_err(|e| {
            EngineError::writer_cause(dest, FileFormat::Epub, "archive finalisation failed", e)
        })?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }

    // COMMIT
    commit_temp(&tmp, dest, FileFormat::Epub)
}

fn plan_cover_override(
    book: &Book,
    file: &BookFile,
    doc: &OpfDocument,
    opf_dir: &str,
    dest: &Path,
) -> Result<Option<CoverPlan>> {
    let Some(cover) = &file.cover else {
        return Ok(None);
    };
    let Some(item) = doc.cover_item() else {
        return Ok(None);
    };
    let disk_path = book.cover_dir().join(&cover.filename);
    let bytes = std::fs::read(&disk_path).map_err(|e| {
        EngineError::writer_cause(
            dest,
            FileFormat::Epub,
            format!("cannot read cover override {}", disk_path.display()),
            e,
        )
    })?;
    Ok(Some(CoverPlan {
        member: resolve_href(opf_dir, &item.href),
        item_id: item.id.clone(),
        bytes,
        mime_type: cover.mime_type.clone(),
    }))
}

// --- OPF rewrite ---

/// One top-level node inside `<metadata>`: either an element subtree or
/// inter-element trivia (whitespace, comments).
enum MetadataNode {
    Element {
        events: Vec<Event<'static>>,
        local: Vec<u8>,
        attrs: Vec<(String, String)>,
    },
    Trivia(Event<'static>),
}

fn rewrite_opf(
    xml: &str,
    book: &Book,
    file: &BookFile,
    doc: &OpfDocument,
    cover: Option<&CoverPlan>,
) -> std::result::Result<String, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut in_metadata = false;
    let mut metadata_depth = 0usize;
    let mut metadata_buf: Vec<Event<'static>> = Vec::new();

    loop {
        let event = reader.read_event()?;
        if in_metadata {
            match &event {
                Event::End(e) if metadata_depth == 0 && is_local(e.name().local_name().as_ref(), b"metadata") => {
                    write_metadata_body(&mut writer, &metadata_buf, book, file, doc)?;
                    writer.write_event(event.clone())?;
                    in_metadata = false;
                    metadata_buf.clear();
                    continue;
                }
                Event::Start(_) => metadata_depth += 1,
                Event::End(_) => metadata_depth = metadata_depth.saturating_sub(1),
                _ => {}
            }
            metadata_buf.push(event.into_owned());
            continue;
        }

        match event {
            Event::Start(ref e) if is_local(e.name().local_name().as_ref(), b"package") => {
                writer.write_event(Event::Start(ensure_opf_namespace(e)))?;
            }
            Event::Start(ref e) if is_local(e.name().local_name().as_ref(), b"metadata") => {
                writer.write_event(event.clone())?;
                in_metadata = true;
                metadata_depth = 0;
            }
            Event::Empty(ref e) if is_local(e.name().local_name().as_ref(), b"metadata") => {
                // Degenerate `<metadata/>`: reopen it so new fields land.
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut start = BytesStart::new(name.clone());
                for attr in e.attributes().flatten() {
                    start.push_attribute(attr);
                }
                writer.write_event(Event::Start(start))?;
                write_metadata_body(&mut writer, &[], book, file, doc)?;
                writer.write_event(Event::End(quick_xml::events::BytesEnd::new(name)))?;
            }
            Event::Start(ref e) | Event::Empty(ref e)
                if cover.is_some() && is_local(e.name().local_name().as_ref(), b"item") =>
            {
                let plan = cover.unwrap();
                let attrs = attrs_of(e);
                if super::opf::attr(&attrs, "id") == Some(plan.item_id.as_str()) {
                    let rebuilt = replace_attr(e, b"media-type", &plan.mime_type);
                    let rebuilt_event = if matches!(event, Event::Empty(_)) {
                        Event::Empty(rebuilt)
                    } else {
                        Event::Start(rebuilt)
                    };
                    writer.write_event(rebuilt_event)?;
                } else {
                    writer.write_event(event.clone())?;
                }
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn is_local(local: &[u8], name: &[u8]) -> bool {
    local == name
}

/// Re-emit the buffered metadata children minus the elements we replace,
/// then append the catalog's values.
fn write_metadata_body(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    buffered: &[Event<'static>],
    book: &Book,
    file: &BookFile,
    doc: &OpfDocument,
) -> std::result::Result<(), quick_xml::Error> {
    let nodes = group_metadata_nodes(buffered);
    let dropped_ids = collect_dropped_ids(&nodes, file, doc);

    for node in &nodes {
        match node {
            MetadataNode::Trivia(event) => writer.write_event(event.clone())?,
            MetadataNode::Element {
                events,
                local,
                attrs,
            } => {
                if element_is_replaced(local, attrs, book, file, doc, &dropped_ids) {
                    continue;
                }
                for event in events {
                    writer.write_event(event.clone())?;
                }
            }
        }
    }

    emit_catalog_metadata(writer, book, file, doc)
}

fn group_metadata_nodes(buffered: &[Event<'static>]) -> Vec<MetadataNode> {
    let mut nodes = Vec::new();
    let mut current: Option<(Vec<Event<'static>>, Vec<u8>, Vec<(String, String)>)> = None;
    let mut depth = 0usize;

    for event in buffered {
        match event {
            Event::Start(e) => {
                if current.is_none() {
                    current = Some((
                        Vec::new(),
                        e.name().local_name().as_ref().to_vec(),
                        attrs_of(e),
                    ));
                    depth = 0;
                } else {
                    depth += 1;
                }
                current.as_mut().unwrap().0.push(event.clone());
            }
            Event::End(_) => {
                if let Some(open) = current.as_mut() {
                    open.0.push(event.clone());
                    if depth == 0 {
                        let (events, local, attrs) = current.take().unwrap();
                        nodes.push(MetadataNode::Element {
                            events,
                            local,
                            attrs,
                        });
                    } else {
                        depth -= 1;
                    }
                }
            }
            Event::Empty(e) => {
                if let Some(open) = current.as_mut() {
                    open.0.push(event.clone());
                } else {
                    nodes.push(MetadataNode::Element {
                        events: vec![event.clone()],
                        local: e.name().local_name().as_ref().to_vec(),
                        attrs: attrs_of(e),
                    });
                }
            }
            other => {
                if let Some(open) = current.as_mut() {
                    open.0.push(other.clone());
                } else {
                    nodes.push(MetadataNode::Trivia(other.clone()));
                }
            }
        }
    }
    nodes
}

/// Ids of elements that get dropped, so their `refines` satellites drop too.
fn collect_dropped_ids(
    nodes: &[MetadataNode],
    file: &BookFile,
    doc: &OpfDocument,
) -> HashSet<String> {
    let mut dropped = HashSet::new();
    for node in nodes {
        let MetadataNode::Element { local, attrs, .. } = node else {
            continue;
        };
        let id = super::opf::attr(attrs, "id");
        match local.as_slice() {
            b"title" => {
                if let Some(id) = id {
                    dropped.insert(id.to_string());
                }
            }
            b"creator" => {
                if creator_is_author(attrs, doc) {
                    if let Some(id) = id {
                        dropped.insert(id.to_string());
                    }
                }
            }
            b"identifier" => {
                if !file.identifiers.is_empty() {
                    if let Some(id) = id {
                        dropped.insert(id.to_string());
                    }
                }
            }
            b"meta" => {
                if super::opf::attr(attrs, "property") == Some("belongs-to-collection") {
                    if let Some(id) = id {
                        dropped.insert(id.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    dropped
}

/// Whether a creator element's role resolves to author (and is therefore
/// replaced by the catalog's author list).
fn creator_is_author(attrs: &[(String, String)], doc: &OpfDocument) -> bool {
    match super::opf::attr(attrs, "role") {
        Some(role) => role == "aut",
        None => {
            // No role attribute: check for an EPUB3 role refinement.
            match super::opf::attr(attrs, "id") {
                Some(id) => match doc.refined_property(id, "role") {
                    Some(role) => role == "aut",
                    None => true,
                },
                None => true,
            }
        }
    }
}

fn element_is_replaced(
    local: &[u8],
    attrs: &[(String, String)],
    book: &Book,
    file: &BookFile,
    doc: &OpfDocument,
    dropped_ids: &HashSet<String>,
) -> bool {
    if let Some(id) = super::opf::attr(attrs, "id") {
        if dropped_ids.contains(id) {
            return true;
        }
    }
    match local {
        b"title" => true,
        b"creator" => creator_is_author(attrs, doc),
        b"publisher" => file.publisher.is_some(),
        b"date" => file.release_date.is_some(),
        b"description" => book.description.as_deref().map(|d| !d.is_empty()).unwrap_or(false),
        b"subject" => !book.genres.is_empty(),
        b"identifier" => !file.identifiers.is_empty(),
        b"meta" => {
            if let Some(refines) = super::opf::attr(attrs, "refines") {
                if let Some(target) = refines.strip_prefix('#') {
                    if dropped_ids.contains(target) {
                        return true;
                    }
                }
            }
            match super::opf::attr(attrs, "name") {
                Some("calibre:series") | Some("calibre:series_index") => true,
                Some("calibre:tags") => !book.tags.is_empty(),
                Some("shisho:url") | Some("shisho:imprint") => true,
                _ => super::opf::attr(attrs, "property") == Some("belongs-to-collection"),
            }
        }
        _ => false,
    }
}

fn emit_text(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    attrs: &[(&str, &str)],
    text: &str,
) -> std::result::Result<(), quick_xml::Error> {
    write_indent(writer)?;
    let mut start = BytesStart::new(name.to_string());
    for (key, value) in attrs {
        start.push_attribute((*key, *value));
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new(name.to_string())))
}

fn emit_catalog_metadata(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    book: &Book,
    file: &BookFile,
    doc: &OpfDocument,
) -> std::result::Result<(), quick_xml::Error> {
    // Title, plus the subtitle as a second refined title element.
    emit_text(writer, "dc:title", &[], file.effective_title(book))?;
    if let Some(subtitle) = book.subtitle.as_deref().filter(|s| !s.is_empty()) {
        emit_text(writer, "dc:title", &[("id", "subtitle")], subtitle)?;
        emit_text(
            writer,
            "meta",
            &[("refines", "#subtitle"), ("property", "title-type")],
            "subtitle",
        )?;
    }

    // Authors in catalog sort order, role `aut`.
    for author in &book.authors {
        let mut attrs: Vec<(&str, &str)> = vec![("opf:role", "aut")];
        if let Some(sort) = author.sort_name.as_deref() {
            attrs.push(("opf:file-as", sort));
        }
        emit_text(writer, "dc:creator", &attrs, &author.name)?;
    }

    if let Some(publisher) = file.publisher.as_deref() {
        emit_text(writer, "dc:publisher", &[], publisher)?;
    }
    if let Some(date) = file.release_date {
        emit_text(writer, "dc:date", &[], &date.format("%Y-%m-%d").to_string())?;
    }
    if let Some(description) = book.description.as_deref().filter(|d| !d.is_empty()) {
        emit_text(writer, "dc:description", &[], description)?;
    }
    for genre in &book.genres {
        emit_text(writer, "dc:subject", &[], genre)?;
    }

    // The identifier list is replaced wholesale; the first replacement
    // adopts the package's declared unique-identifier id so the package
    // attribute keeps resolving.
    for (index, identifier) in file.identifiers.iter().enumerate() {
        let mut attrs: Vec<(&str, &str)> = Vec::new();
        if index == 0 {
            if let Some(uid) = doc.unique_identifier.as_deref() {
                attrs.push(("id", uid));
            }
        }
        let scheme = opf_scheme(identifier.kind);
        if !scheme.is_empty() {
            attrs.push(("opf:scheme", scheme));
        }
        emit_text(writer, "dc:identifier", &attrs, &identifier.value)?;
    }

    // Series in both the Calibre and EPUB3 forms.
    if let Some(primary) = book.primary_series() {
        write_indent(writer)?;
        write_empty(
            writer,
            "meta",
            &[("name", "calibre:series"), ("content", &primary.name)],
        )?;
        if let Some(position) = primary.position {
            write_indent(writer)?;
            write_empty(
                writer,
                "meta",
                &[
                    ("name", "calibre:series_index"),
                    ("content", &format_series_position(position)),
                ],
            )?;
        }
    }
    for (index, series) in book.series.iter().enumerate() {
        let id = format!("series-{}", index + 1);
        let refines = format!("#{id}");
        emit_text(
            writer,
            "meta",
            &[("property", "belongs-to-collection"), ("id", &id)],
            &series.name,
        )?;
        emit_text(
            writer,
            "meta",
            &[("refines", &refines), ("property", "collection-type")],
            "series",
        )?;
        if let Some(position) = series.position {
            emit_text(
                writer,
                "meta",
                &[("refines", &refines), ("property", "group-position")],
                &format_series_position(position),
            )?;
        }
    }

    if !book.tags.is_empty() {
        write_indent(writer)?;
        write_empty(
            writer,
            "meta",
            &[("name", "calibre:tags"), ("content", &book.tags.join(", "))],
        )?;
    }
    if let Some(url) = file.url.as_deref() {
        write_indent(writer)?;
        write_empty(writer, "meta", &[("name", "shisho:url"), ("content", url)])?;
    }
    if let Some(imprint) = file.imprint.as_deref() {
        write_indent(writer)?;
        write_empty(
            writer,
            "meta",
            &[("name", "shisho:imprint"), ("content", imprint)],
        )?;
    }

    write_trailing_indent(writer)
}

fn write_indent(
    writer: &mut Writer<Cursor<Vec<u8>>>,
) -> std::result::Result<(), quick_xml::Error> {
    writer.write_event(Event::Text(BytesText::from_escaped("\n    ")))
}

fn write_trailing_indent(
    writer: &mut Writer<Cursor<Vec<u8>>>,
) -> std::result::Result<(), quick_xml::Error> {
    writer.write_event(Event::Text(BytesText::from_escaped("\n  ")))
}

fn write_empty(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    attrs: &[(&str, &str)],
) -> std::result::Result<(), quick_xml::Error> {
    let mut start = BytesStart::new(name);
    for (key, value) in attrs {
        start.push_attribute((*key, *value));
    }
    writer.write_event(Event::Empty(start))
}

/// Identifier scheme labels for `opf:scheme`; `other` carries no scheme.
fn opf_scheme(kind: IdentifierType) -> &'static str {
    match kind {
        IdentifierType::Isbn10 | IdentifierType::Isbn13 => "ISBN",
        IdentifierType::Asin => "ASIN",
        IdentifierType::Uuid => "UUID",
        IdentifierType::Goodreads => "GOODREADS",
        IdentifierType::Google => "GOOGLE",
        IdentifierType::Other => "",
    }
}

fn ensure_opf_namespace(e: &BytesStart) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut rebuilt = BytesStart::new(name);
    let mut has_opf = false;
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"xmlns:opf" {
            has_opf = true;
        }
        rebuilt.push_attribute(attr);
    }
    if !has_opf {
        rebuilt.push_attribute(("xmlns:opf", "http://www.idpf.org/2007/opf"));
    }
    rebuilt
}

fn replace_attr(e: &BytesStart, key: &[u8], new_value: &str) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut rebuilt = BytesStart::new(name);
    let mut replaced = false;
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == key {
            rebuilt.push_attribute((
                String::from_utf8_lossy(attr.key.as_ref()).as_ref(),
                new_value,
            ));
            replaced = true;
        } else {
            rebuilt.push_attribute(attr);
        }
    }
    if !replaced {
        rebuilt.push_attribute((
            String::from_utf8_lossy(key).as_ref(),
            new_value,
        ));
    }
    rebuilt
}
