//! M4B metadata parser
//!
//! Walks the MP4 box tree: `mvhd` for timescale/duration, `esds` (and
//! Dolby `btrt`) for bitrate and codec, `moov/udta/meta/ilst` for every
//! known iTunes atom, freeform (`----`) atoms, and unrecognised atoms kept
//! verbatim for round-trip. Chapters come from the QuickTime chapter track
//! when present, else the Nero `chpl` box.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::model::{
    Author, CoverImage, FileFormat, Identifier, IdentifierType, MetadataSource, ParsedMetadata,
    SeriesMembership,
};
use crate::mp4::atoms::*;
use crate::mp4::{
    be_u16, be_u24, be_u32, be_u64, find_path, read_full_box, BoxHeader, BoxIter, FourCc,
    Mp4Error,
};

use super::chapters;

/// An ilst atom preserved verbatim (type code plus raw payload) so vendor
/// tags survive a rewrite untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAtom {
    pub kind: FourCc,
    pub data: Vec<u8>,
}

/// Everything the writer needs from a source M4B: the parsed metadata,
/// the raw atoms in the order seen, the source `hdlr`, and the verbatim
/// album string (the parsed form splits it into series + position).
#[derive(Debug, Clone, Default)]
pub struct M4bSource {
    pub meta: ParsedMetadata,
    pub raw_atoms: Vec<RawAtom>,
    pub album: Option<String>,
    pub meta_hdlr: Option<Vec<u8>>,
}

/// Parse the embedded metadata of an M4B file.
pub fn parse_m4b(path: &Path) -> Result<ParsedMetadata> {
    let data =
        std::fs::read(path).map_err(|e| EngineError::source_io(path, FileFormat::M4b, e))?;
    parse_m4b_source(&data, path).map(|source| source.meta)
}

fn corrupt(path: &Path, err: Mp4Error) -> EngineError {
    let offset = match &err {
        Mp4Error::TruncatedHeader { offset }
        | Mp4Error::Overrun { offset, .. }
        | Mp4Error::Undersize { offset, .. }
        | Mp4Error::TruncatedPayload { offset, .. } => Some(*offset as u64),
        Mp4Error::OversizePayload { .. } => None,
    };
    EngineError::SourceCorrupt {
        path: path.to_path_buf(),
        format: FileFormat::M4b,
        offset,
        detail: err.to_string(),
        cause: None,
    }
}

/// Full parse retaining writer-side context.
pub(crate) fn parse_m4b_source(data: &[u8], path: &Path) -> Result<M4bSource> {
    let moov = BoxIter::top_level(data)
        .find(MOOV)
        .map_err(|e| corrupt(path, e))?
        .ok_or_else(|| EngineError::corrupt(path, FileFormat::M4b, "no moov box"))?;

    let mut source = M4bSource {
        meta: ParsedMetadata {
            source: Some(MetadataSource::M4bMetadata),
            ..Default::default()
        },
        ..Default::default()
    };

    read_mvhd(data, moov, &mut source.meta);
    read_audio_tracks(data, moov, &mut source.meta);

    if let Ok(Some(meta_box)) = find_path(data, moov, &[UDTA, META]) {
        if let Ok(Some(hdlr)) = meta_box.children_after(data, 4).find(HDLR) {
            source.meta_hdlr = Some(hdlr.raw(data).to_vec());
        }
        if let Ok(Some(ilst)) = meta_box.children_after(data, 4).find(ILST) {
            read_ilst(data, ilst, &mut source);
        }
    }

    // QuickTime chapter track first, Nero chpl as the fallback.
    source.meta.chapters = chapters::read_qt_chapters(data, moov)
        .or_else(|| chapters::read_chpl(data, moov))
        .unwrap_or_default();

    // Series from the album field: `<series> #<number>`.
    if let Some(album) = &source.album {
        if let Some((name, position)) = split_album_series(album) {
            source.meta.series.push(SeriesMembership {
                name,
                position: Some(position),
            });
        }
    }

    debug!(
        path = %path.display(),
        title = ?source.meta.title,
        chapters = source.meta.chapters.len(),
        raw_atoms = source.raw_atoms.len(),
        "parsed m4b"
    );
    Ok(source)
}

/// `^(.+?)\s*#(\d+(?:\.\d+)?)$` over the album string.
pub(crate) fn split_album_series(album: &str) -> Option<(String, f64)> {
    static ALBUM_SERIES: OnceLock<Regex> = OnceLock::new();
    let re = ALBUM_SERIES
        .get_or_init(|| Regex::new(r"^(.+?)\s*#(\d+(?:\.\d+)?)$").unwrap());
    let caps = re.captures(album.trim())?;
    let position: f64 = caps[2].parse().ok()?;
    Some((caps[1].to_string(), position))
}

fn read_mvhd(data: &[u8], moov: BoxHeader, meta: &mut ParsedMetadata) {
    let Ok(Some(mvhd)) = moov.children(data).find(MVHD) else {
        return;
    };
    let Some((version, _, body)) = read_full_box(mvhd.payload(data)) else {
        return;
    };
    let (timescale, duration) = if version == 1 {
        match (be_u32(body, 16), be_u64(body, 20)) {
            (Some(ts), Some(d)) => (ts, d),
            _ => return,
        }
    } else {
        match (be_u32(body, 8), be_u32(body, 12)) {
            (Some(ts), Some(d)) => (ts, d as u64),
            _ => return,
        }
    };
    if timescale > 0 {
        meta.duration_seconds = Some(duration as f64 / timescale as f64);
    }
}

fn read_audio_tracks(data: &[u8], moov: BoxHeader, meta: &mut ParsedMetadata) {
    for trak in moov.children(data).filter_map(|r| r.ok()) {
        if trak.kind != TRAK {
            continue;
        }
        let Ok(Some(stsd)) = find_path(data, trak, &[MDIA, MINF, STBL, STSD]) else {
            continue;
        };
        // stsd is a full box followed by a 32-bit entry count.
        for entry in stsd.children_after(data, 8).filter_map(|r| r.ok()) {
            match &entry.kind {
                kind if *kind == MP4A => {
                    // Audio sample entry: 28 bytes of fixed fields before
                    // the child boxes.
                    for child in entry.children_after(data, 28).filter_map(|r| r.ok()) {
                        if child.kind == ESDS {
                            if let Some(info) = parse_esds(child.payload(data)) {
                                if meta.bitrate.is_none() && info.avg_bitrate > 0 {
                                    meta.bitrate = Some(info.avg_bitrate);
                                }
                                if meta.codec.is_none() {
                                    meta.codec = codec_label(info.object_type, info.audio_object_type);
                                }
                            }
                        }
                    }
                }
                kind if *kind == AC_3 || *kind == EC_3 => {
                    for child in entry.children_after(data, 28).filter_map(|r| r.ok()) {
                        if child.kind == BTRT {
                            // bufferSizeDB(4) maxBitrate(4) avgBitrate(4)
                            if let Some(avg) = be_u32(child.payload(data), 8) {
                                if meta.bitrate.is_none() && avg > 0 {
                                    meta.bitrate = Some(avg);
                                }
                            }
                        }
                    }
                    if meta.codec.is_none() {
                        meta.codec = Some(
                            if entry.kind == AC_3 { "AC-3" } else { "E-AC-3" }.to_string(),
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

struct EsdsInfo {
    object_type: u8,
    avg_bitrate: u32,
    audio_object_type: Option<u8>,
}

/// Walk the ES descriptor chain: ES_Descriptor (0x03) ->
/// DecoderConfigDescriptor (0x04) -> DecoderSpecificInfo (0x05).
fn parse_esds(payload: &[u8]) -> Option<EsdsInfo> {
    let (_, _, body) = read_full_box(payload)?;

    let (tag, _, header_len) = read_descriptor(body, 0)?;
    if tag != 0x03 {
        return None;
    }
    let mut pos = header_len;
    // ES_ID(2) then a flags byte with optional trailing fields.
    let flags = *body.get(pos + 2)?;
    pos += 3;
    if flags & 0x80 != 0 {
        pos += 2; // dependsOn_ES_ID
    }
    if flags & 0x40 != 0 {
        let url_len = *body.get(pos)? as usize;
        pos += 1 + url_len;
    }
    if flags & 0x20 != 0 {
        pos += 2; // OCR_ES_ID
    }

    let (tag, config_len, header_len) = read_descriptor(body, pos)?;
    if tag != 0x04 {
        return None;
    }
    let config_start = pos + header_len;
    let object_type = *body.get(config_start)?;
    let avg_bitrate = be_u32(body, config_start + 9)?;

    // DecoderSpecificInfo: the AudioSpecificConfig's first five bits name
    // the audio object type, with a 5-bit escape to an extended form.
    let mut audio_object_type = None;
    let mut inner = config_start + 13;
    let config_end = config_start + config_len;
    while inner < config_end.min(body.len()) {
        let Some((tag, len, header_len)) = read_descriptor(body, inner) else {
            break;
        };
        if tag == 0x05 {
            let asc = body.get(inner + header_len..inner + header_len + len)?;
            audio_object_type = decode_audio_object_type(asc);
            break;
        }
        inner += header_len + len;
    }

    Some(EsdsInfo {
        object_type,
        avg_bitrate,
        audio_object_type,
    })
}

/// Expandable descriptor header: tag byte plus a 7-bits-per-byte length
/// with continuation in the high bit.
fn read_descriptor(data: &[u8], pos: usize) -> Option<(u8, usize, usize)> {
    let tag = *data.get(pos)?;
    let mut len = 0usize;
    let mut header_len = 1usize;
    for _ in 0..4 {
        let byte = *data.get(pos + header_len)?;
        header_len += 1;
        len = (len << 7) | (byte & 0x7F) as usize;
        if byte & 0x80 == 0 {
            break;
        }
    }
    Some((tag, len, header_len))
}

fn decode_audio_object_type(asc: &[u8]) -> Option<u8> {
    let first = *asc.first()?;
    let aot = first >> 3;
    if aot == 31 {
        // Escape: 6 more bits, value 32 + those bits.
        let second = *asc.get(1)?;
        let extended = ((first & 0x07) << 3) | (second >> 5);
        Some(32 + extended)
    } else {
        Some(aot)
    }
}

/// Codec label from the ObjectTypeIndication plus (for MPEG-4 Audio) the
/// AudioSpecificConfig object type.
fn codec_label(object_type: u8, audio_object_type: Option<u8>) -> Option<String> {
    let label = match object_type {
        0x40 => match audio_object_type {
            Some(1) => "AAC Main",
            Some(2) => "AAC-LC",
            Some(3) => "AAC SSR",
            Some(4) => "AAC LTP",
            Some(5) => "HE-AAC",
            Some(29) => "HE-AACv2",
            Some(42) => "xHE-AAC",
            _ => "MPEG-4 Audio",
        },
        0x66 => "MPEG-2 AAC Main",
        0x67 => "MPEG-2 AAC-LC",
        0x68 => "MPEG-2 AAC SSR",
        0x69 | 0x6B => "MP3",
        0xA5 => "AC-3",
        0xA6 => "E-AC-3",
        _ => return None,
    };
    Some(label.to_string())
}

// --- ilst decoding ---

/// Decoded `data` box payload.
enum AtomValue {
    Text(String),
    Integer(i64),
    Image { data: Vec<u8>, mime: &'static str },
}

fn read_data_box(data: &[u8], atom: BoxHeader) -> Option<AtomValue> {
    let data_box = atom.children(data).find(DATA).ok()??;
    decode_data_payload(data_box.payload(data))
}

fn decode_data_payload(payload: &[u8]) -> Option<AtomValue> {
    // version byte, 24-bit type code, 4-byte locale, then the value.
    let type_code = be_u24(payload, 1)?;
    let value = payload.get(8..)?;
    let data_type = DataType::from_code(type_code)?;

    match data_type {
        DataType::Utf8 | DataType::Utf8Genre => {
            Some(AtomValue::Text(String::from_utf8_lossy(value).into_owned()))
        }
        DataType::Utf16 => Some(AtomValue::Text(decode_utf16be(value))),
        DataType::BeSigned => {
            let int = match value.len() {
                1 => value[0] as i8 as i64,
                2 => i16::from_be_bytes([value[0], value[1]]) as i64,
                4 => i32::from_be_bytes([value[0], value[1], value[2], value[3]]) as i64,
                8 => i64::from_be_bytes([
                    value[0], value[1], value[2], value[3], value[4], value[5], value[6],
                    value[7],
                ]),
                _ => return None,
            };
            Some(AtomValue::Integer(int))
        }
        DataType::Jpeg | DataType::Png | DataType::Bmp => Some(AtomValue::Image {
            data: value.to_vec(),
            mime: data_type.image_mime()?,
        }),
        DataType::Implicit => {
            // `gnre` ships its index as an implicit big-endian u16.
            Some(AtomValue::Integer(be_u16(value, 0)? as i64))
        }
    }
}

fn decode_utf16be(value: &[u8]) -> String {
    let (bytes, big_endian) = match value {
        [0xFE, 0xFF, rest @ ..] => (rest, true),
        [0xFF, 0xFE, rest @ ..] => (rest, false),
        rest => (rest, true),
    };
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// Freeform atom key: `<mean>:<name>`.
fn freeform_key(data: &[u8], atom: BoxHeader) -> Option<String> {
    let mean = atom.children(data).find(FREEFORM_MEAN).ok()??;
    let name = atom.children(data).find(FREEFORM_NAME).ok()??;
    // Both carry a 4-byte version/flags prefix before their text.
    let mean_text = String::from_utf8_lossy(mean.payload(data).get(4..)?).into_owned();
    let name_text = String::from_utf8_lossy(name.payload(data).get(4..)?).into_owned();
    Some(format!("{mean_text}:{name_text}"))
}

fn read_ilst(data: &[u8], ilst: BoxHeader, source: &mut M4bSource) {
    for atom in ilst.children(data).filter_map(|r| r.ok()) {
        let handled = decode_known_atom(data, atom, source);
        if !handled {
            source.raw_atoms.push(RawAtom {
                kind: atom.kind,
                data: atom.payload(data).to_vec(),
            });
        }
    }
}

/// Decode one ilst child into the parsed metadata. Returns false when the
/// atom is not one the catalog tracks, in which case it is preserved raw.
fn decode_known_atom(data: &[u8], atom: BoxHeader, source: &mut M4bSource) -> bool {
    let meta = &mut source.meta;
    match atom.kind {
        kind if kind == TITLE => {
            if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                meta.title = Some(text);
            }
            true
        }
        kind if kind == ARTIST => {
            if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                meta.authors = split_people(&text)
                    .into_iter()
                    .map(Author::new)
                    .collect();
            }
            true
        }
        kind if kind == ALBUM => {
            if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                source.album = Some(text);
            }
            true
        }
        kind if kind == GENRE => {
            if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                meta.genres = split_people(&text);
            }
            true
        }
        kind if kind == GENRE_ID => {
            if let Some(AtomValue::Integer(id)) = read_data_box(data, atom) {
                if let Some(genre) = genre_by_id(id as u16) {
                    if meta.genres.is_empty() {
                        meta.genres.push(genre.to_string());
                    }
                }
            }
            true
        }
        kind if kind == DAY => {
            if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                meta.release_date = crate::formats::parse_release_date(&text);
            }
            true
        }
        kind if kind == NARRATOR => {
            if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                meta.narrators = split_people(&text);
            }
            true
        }
        kind if kind == COMPOSER => {
            // Written alongside ©nrt for reader compatibility; only used
            // when no dedicated narrator atom was present.
            if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                if meta.narrators.is_empty() {
                    meta.narrators = split_people(&text);
                }
            }
            true
        }
        kind if kind == DESCRIPTION => {
            if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                meta.description = Some(text);
            }
            true
        }
        kind if kind == COVER => {
            if let Some(AtomValue::Image { data: bytes, mime }) = read_data_box(data, atom) {
                meta.cover = Some(CoverImage {
                    data: bytes,
                    mime_type: mime.to_string(),
                });
            }
            true
        }
        kind if kind == MEDIA_TYPE => {
            // stik: always re-emitted as audiobook by the writer.
            true
        }
        kind if kind == FREEFORM => {
            let Some(key) = freeform_key(data, atom) else {
                return false;
            };
            match key.as_str() {
                FREEFORM_SUBTITLE => {
                    if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                        meta.subtitle = Some(text);
                    }
                    true
                }
                FREEFORM_TAGS => {
                    if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                        meta.tags = split_people(&text);
                    }
                    true
                }
                FREEFORM_ASIN => {
                    if let Some(AtomValue::Text(text)) = read_data_box(data, atom) {
                        meta.identifiers
                            .push(Identifier::new(IdentifierType::Asin, text));
                    }
                    true
                }
                _ => false,
            }
        }
        _ => false,
    }
}

fn split_people(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
