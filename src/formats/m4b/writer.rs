//! M4B metadata writer
//!
//! Reads the source into memory, copies every non-`moov` box verbatim by
//! byte range, and rebuilds `moov`: a fresh `udta/meta/ilst` carrying the
//! catalog's values plus every raw atom preserved from parsing, and a
//! fresh Nero `chpl` (v0) when the file has chapters. The existing `chpl`
//! is dropped; QuickTime chapter tracks are read but never written.
//!
//! Chapters are emitted in array order. The catalog UI maintains temporal
//! order; the writer does not defensively sort.
//!
//! When the rebuilt `moov` changes size and boxes follow it, the chunk
//! offset tables (`stco`/`co64`) of every copied track are shifted so the
//! samples still resolve.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::generate::{commit_temp, staging_path, CancelToken, Generator};
use crate::model::{
    format_series_position, AuthorRole, Book, BookFile, ChapterLocator, FileFormat,
    IdentifierType,
};
use crate::mp4::atoms::*;
use crate::mp4::{build_box, push_box, BoxHeader, BoxIter, FourCc, Mp4Error};

use super::parser::{parse_m4b_source, M4bSource};

/// Identity writer for M4B sources
#[derive(Debug, Default)]
pub struct M4bWriter;

impl M4bWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for M4bWriter {
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
        tokio::task::spawn_blocking(move || write_m4b(&cancel, &src, &dest, &book, &file))
            .await
            .map_err(|e| EngineError::Internal(format!("m4b writer task join error: {e}")))?
    }
}

fn box_failed(dest: &Path, err: Mp4Error) -> EngineError {
    EngineError::writer_cause(dest, FileFormat::M4b, "box assembly failed", err)
}

pub(crate) fn write_m4b(
    cancel: &CancelToken,
    src: &Path,
    dest: &Path,
    book: &Book,
    file: &BookFile,
) -> Result<()> {
    // OPEN/SNAPSHOT: bounded to a few GB in this system's profile.
    let data =
        std::fs::read(src).map_err(|e| EngineError::source_io(src, FileFormat::M4b, e))?;

    // SCAN: a parse failure on the source is SourceCorrupt, no output.
    let source = parse_m4b_source(&data, src)?;
    cancel.check()?;

    let tops: Vec<BoxHeader> = BoxIter::top_level(&data)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| EngineError::corrupt(src, FileFormat::M4b, e.to_string()))?;
    let moov = tops
        .iter()
        .find(|b| b.kind == MOOV)
        .copied()
        .ok_or_else(|| EngineError::corrupt(src, FileFormat::M4b, "no moov box"))?;

    // STAGE: rebuild moov with the new udta subtree.
    let mut new_moov = rebuild_moov(&data, moov, book, file, &source, cancel, dest)?;

    // Boxes after moov shift when its size changes; chunk offsets pointing
    // past the old moov must shift with them.
    let delta = new_moov.len() as i64 - moov.size as i64;
    let has_trailing_boxes = tops.iter().any(|b| b.offset > moov.offset);
    if delta != 0 && has_trailing_boxes {
        shift_chunk_offsets(&mut new_moov, moov.end() as u64, delta)
            .map_err(|e| box_failed(dest, e))?;
        debug!(delta, "shifted chunk offsets for relocated mdat");
    }

    // WRITE
    let tmp = staging_path(dest);
    let write_result = (|| -> Result<()> {
        let mut out = std::io::BufWriter::new(std::fs::File::create(&tmp).map_err(|e| {
            EngineError::writer_cause(dest, FileFormat::M4b, "cannot create staging file", e)
        })?);
        for top in &tops {
            cancel.check()?;
            let bytes: &[u8] = if top.offset == moov.offset {
                &new_moov
            } else {
                top.raw(&data)
            };
            out.write_all(bytes).map_err(|e| {
                EngineError::writer_cause(dest, FileFormat::M4b, "write failed", e)
            })?;
        }
        out.flush()
            .map_err(|e| EngineError::writer_cause(dest, FileFormat::M4b, "write failed", e))?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }

    // COMMIT
    commit_temp(&tmp, dest, FileFormat::M4b)
}

fn rebuild_moov(
    data: &[u8],
    moov: BoxHeader,
    book: &Book,
    file: &BookFile,
    source: &M4bSource,
    cancel: &CancelToken,
    dest: &Path,
) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(moov.size);
    let mut saw_udta = false;

    for child in moov.children(data) {
        cancel.check()?;
        let child = child.map_err(|e| box_failed(dest, e))?;
        if child.kind == UDTA {
            let udta = rebuild_udta(data, Some(child), book, file, source, dest)?;
            payload.extend_from_slice(&udta);
            saw_udta = true;
        } else {
            payload.extend_from_slice(child.raw(data));
        }
    }
    if !saw_udta {
        let udta = rebuild_udta(data, None, book, file, source, dest)?;
        payload.extend_from_slice(&udta);
    }

    build_box(MOOV, &payload).map_err(|e| box_failed(dest, e))
}

fn rebuild_udta(
    data: &[u8],
    udta: Option<BoxHeader>,
    book: &Book,
    file: &BookFile,
    source: &M4bSource,
    dest: &Path,
) -> Result<Vec<u8>> {
    let mut payload = Vec::new();

    if let Some(udta) = udta {
        for child in udta.children(data) {
            let child = child.map_err(|e| box_failed(dest, e))?;
            // meta is rebuilt wholesale; the old chpl is dropped.
            if child.kind == META || child.kind == CHPL {
                continue;
            }
            payload.extend_from_slice(child.raw(data));
        }
    }

    payload.extend_from_slice(&build_meta(book, file, source, dest)?);

    let chapters: Vec<(u64, &str)> = file
        .chapters
        .iter()
        .filter_map(|c| match &c.locator {
            ChapterLocator::Timestamp(ms) => Some((*ms, c.title.as_str())),
            _ => None,
        })
        .collect();
    if !chapters.is_empty() {
        payload.extend_from_slice(&build_chpl(&chapters).map_err(|e| box_failed(dest, e))?);
    }

    build_box(UDTA, &payload).map_err(|e| box_failed(dest, e))
}

fn build_meta(
    book: &Book,
    file: &BookFile,
    source: &M4bSource,
    dest: &Path,
) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; 4]; // meta is a full box

    match &source.meta_hdlr {
        Some(hdlr) => payload.extend_from_slice(hdlr),
        None => {
            let mut body = Vec::with_capacity(25);
            body.extend_from_slice(&[0u8; 4]); // predefined
            body.extend_from_slice(b"mdir");
            body.extend_from_slice(b"appl");
            body.extend_from_slice(&[0u8; 8]);
            body.push(0); // empty name
            let hdlr = crate::mp4::build_full_box(HDLR, 0, 0, &body)
                .map_err(|e| box_failed(dest, e))?;
            payload.extend_from_slice(&hdlr);
        }
    }

    let ilst = build_ilst(book, file, source, dest)?;
    payload.extend_from_slice(&ilst);

    build_box(META, &payload).map_err(|e| box_failed(dest, e))
}

fn build_ilst(
    book: &Book,
    file: &BookFile,
    source: &M4bSource,
    dest: &Path,
) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    let fail = |e: Mp4Error| box_failed(dest, e);

    let mut text_atom = |payload: &mut Vec<u8>, kind: FourCc, value: &str| {
        push_atom(payload, kind, DataType::Utf8, value.as_bytes())
    };

    // Title
    text_atom(&mut payload, TITLE, file.effective_title(book)).map_err(fail)?;

    // Artist: comma-joined authors (narrators excluded), source fallback.
    let artists: Vec<&str> = if book.authors.is_empty() {
        source.meta.authors.iter().map(|a| a.name.as_str()).collect()
    } else {
        book.authors
            .iter()
            .filter(|a| a.role != Some(AuthorRole::Narrator))
            .map(|a| a.name.as_str())
            .collect()
    };
    if !artists.is_empty() {
        text_atom(&mut payload, ARTIST, &artists.join(", ")).map_err(fail)?;
    }

    // Album: `<series> #N` when a series is present, else the source album.
    let album = match book.primary_series() {
        Some(series) => Some(match series.position {
            Some(position) => {
                format!("{} #{}", series.name, format_series_position(position))
            }
            None => series.name.clone(),
        }),
        None => source.album.clone(),
    };
    if let Some(album) = album {
        text_atom(&mut payload, ALBUM, &album).map_err(fail)?;
    }

    // Narrators go to both ©nrt and ©cmp for reader compatibility.
    let narrators: Vec<&str> = {
        let from_book: Vec<&str> = book
            .authors
            .iter()
            .filter(|a| a.role == Some(AuthorRole::Narrator))
            .map(|a| a.name.as_str())
            .collect();
        if from_book.is_empty() {
            source.meta.narrators.iter().map(String::as_str).collect()
        } else {
            from_book
        }
    };
    if !narrators.is_empty() {
        let joined = narrators.join(", ");
        text_atom(&mut payload, NARRATOR, &joined).map_err(fail)?;
        text_atom(&mut payload, COMPOSER, &joined).map_err(fail)?;
    }

    // Genre
    let genres = if book.genres.is_empty() {
        source.meta.genres.clone()
    } else {
        book.genres.clone()
    };
    if !genres.is_empty() {
        text_atom(&mut payload, GENRE, &genres.join(", ")).map_err(fail)?;
    }

    // Description
    let description = book
        .description
        .as_deref()
        .filter(|d| !d.is_empty())
        .or(source.meta.description.as_deref());
    if let Some(description) = description {
        text_atom(&mut payload, DESCRIPTION, description).map_err(fail)?;
    }

    // Release date
    let release_date = file.release_date.or(source.meta.release_date);
    if let Some(date) = release_date {
        text_atom(&mut payload, DAY, &date.format("%Y-%m-%d").to_string()).map_err(fail)?;
    }

    // Subtitle, tags, ASIN as freeform atoms.
    let subtitle = book
        .subtitle
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(source.meta.subtitle.as_deref());
    if let Some(subtitle) = subtitle {
        push_freeform(&mut payload, FREEFORM_SUBTITLE, subtitle).map_err(fail)?;
    }

    let tags = if book.tags.is_empty() {
        source.meta.tags.clone()
    } else {
        book.tags.clone()
    };
    if !tags.is_empty() {
        push_freeform(&mut payload, FREEFORM_TAGS, &tags.join(", ")).map_err(fail)?;
    }

    let asin = file
        .identifier(IdentifierType::Asin)
        .map(|i| i.value.clone())
        .or_else(|| {
            source
                .meta
                .identifiers
                .iter()
                .find(|i| i.kind == IdentifierType::Asin)
                .map(|i| i.value.clone())
        });
    if let Some(asin) = asin {
        push_freeform(&mut payload, FREEFORM_ASIN, &asin).map_err(fail)?;
    }

    // Cover: file override from disk, else the source's embedded art.
    let cover: Option<(Vec<u8>, String)> = match &file.cover {
        Some(cover) => {
            let path = book.cover_dir().join(&cover.filename);
            let bytes = std::fs::read(&path).map_err(|e| {
                EngineError::writer_cause(
                    dest,
                    FileFormat::M4b,
                    format!("cannot read cover override {}", path.display()),
                    e,
                )
            })?;
            Some((bytes, cover.mime_type.clone()))
        }
        None => source
            .meta
            .cover
            .as_ref()
            .map(|c| (c.data.clone(), c.mime_type.clone())),
    };
    if let Some((bytes, mime)) = cover {
        push_atom(&mut payload, COVER, DataType::for_image_mime(&mime), &bytes).map_err(fail)?;
    }

    // Media type: audiobook.
    push_atom(&mut payload, MEDIA_TYPE, DataType::BeSigned, &[STIK_AUDIOBOOK]).map_err(fail)?;

    // Unknown vendor atoms round-trip verbatim, in the order seen.
    for raw in &source.raw_atoms {
        push_box(&mut payload, raw.kind, &raw.data).map_err(fail)?;
    }

    build_box(ILST, &payload).map_err(|e| box_failed(dest, e))
}

/// Append one metadata atom wrapping a `data` box: version 0, 24-bit type
/// code, 4-byte zero locale, then the payload.
fn push_atom(
    out: &mut Vec<u8>,
    kind: FourCc,
    data_type: DataType,
    value: &[u8],
) -> std::result::Result<(), Mp4Error> {
    let mut data_payload = Vec::with_capacity(8 + value.len());
    data_payload.push(0);
    data_payload.extend_from_slice(&data_type.code().to_be_bytes()[1..]);
    data_payload.extend_from_slice(&[0u8; 4]);
    data_payload.extend_from_slice(value);

    let data_box = build_box(DATA, &data_payload)?;
    push_box(out, kind, &data_box)
}

/// Append a freeform (`----`) atom keyed `<mean>:<name>`.
fn push_freeform(
    out: &mut Vec<u8>,
    key: &str,
    value: &str,
) -> std::result::Result<(), Mp4Error> {
    let (mean, name) = key.split_once(':').unwrap_or((key, ""));

    let mut payload = Vec::new();
    let mut mean_payload = vec![0u8; 4];
    mean_payload.extend_from_slice(mean.as_bytes());
    push_box(&mut payload, FREEFORM_MEAN, &mean_payload)?;

    let mut name_payload = vec![0u8; 4];
    name_payload.extend_from_slice(name.as_bytes());
    push_box(&mut payload, FREEFORM_NAME, &name_payload)?;

    let mut data_payload = vec![0u8, 0, 0, DataType::Utf8.code() as u8, 0, 0, 0, 0];
    data_payload.extend_from_slice(value.as_bytes());
    push_box(&mut payload, DATA, &data_payload)?;

    push_box(out, FREEFORM, &payload)
}

/// Build a Nero chapter list, v0: 4-byte reserved field, 32-bit count,
/// then per chapter an 8-byte 100-ns timestamp, a 1-byte title length,
/// and the UTF-8 title (truncated to 255 bytes).
fn build_chpl(chapters: &[(u64, &str)]) -> std::result::Result<Vec<u8>, Mp4Error> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 4]); // reserved
    body.extend_from_slice(&(chapters.len() as u32).to_be_bytes());
    for (start_ms, title) in chapters {
        body.extend_from_slice(&(start_ms * 10_000).to_be_bytes());
        let mut title_bytes = title.as_bytes();
        if title_bytes.len() > 255 {
            let mut cut = 255;
            while cut > 0 && !title.is_char_boundary(cut) {
                cut -= 1;
            }
            title_bytes = &title_bytes[..cut];
        }
        body.push(title_bytes.len() as u8);
        body.extend_from_slice(title_bytes);
    }
    crate::mp4::build_full_box(CHPL, 0, 0, &body)
}

/// Shift every `stco`/`co64` entry pointing at or past `boundary` by
/// `delta`, in place, within a rebuilt moov buffer.
fn shift_chunk_offsets(
    moov_bytes: &mut [u8],
    boundary: u64,
    delta: i64,
) -> std::result::Result<(), Mp4Error> {
    // Collect patch locations first; the walk borrows the buffer.
    let mut patches_u32: Vec<usize> = Vec::new();
    let mut patches_u64: Vec<usize> = Vec::new();
    {
        let data: &[u8] = moov_bytes;
        let moov = match crate::mp4::read_box_at(data, 0, data.len())? {
            Some(header) => header,
            None => return Ok(()),
        };
        for trak in moov.children(data) {
            let trak = trak?;
            if trak.kind != TRAK {
                continue;
            }
            let Some(stbl) = crate::mp4::find_path(data, trak, &[MDIA, MINF, STBL])? else {
                continue;
            };
            for table in stbl.children(data) {
                let table = table?;
                if table.kind != STCO && table.kind != CO64 {
                    continue;
                }
                let body_start = table.offset + table.header_len + 4; // version+flags
                let Some(count) = crate::mp4::be_u32(data, body_start) else {
                    continue;
                };
                let entries_start = body_start + 4;
                for index in 0..count as usize {
                    if table.kind == STCO {
                        patches_u32.push(entries_start + index * 4);
                    } else {
                        patches_u64.push(entries_start + index * 8);
                    }
                }
            }
        }
    }

    for at in patches_u32 {
        if let Some(value) = crate::mp4::be_u32(moov_bytes, at) {
            if value as u64 >= boundary {
                let shifted = (value as i64 + delta) as u32;
                moov_bytes[at..at + 4].copy_from_slice(&shifted.to_be_bytes());
            }
        }
    }
    for at in patches_u64 {
        if let Some(value) = crate::mp4::be_u64(moov_bytes, at) {
            if value >= boundary {
                let shifted = (value as i64 + delta) as u64;
                moov_bytes[at..at + 8].copy_from_slice(&shifted.to_be_bytes());
            }
        }
    }
    Ok(())
}
