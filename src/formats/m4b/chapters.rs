//! M4B chapter extraction
//!
//! Two representations coexist in the wild and are tried in order: a
//! QuickTime chapter track (a text `trak` referenced by the audio track
//! via `tref/chap`, with its sample tables pointing at length-prefixed
//! text samples), then the Nero `chpl` box in `moov/udta`.

use crate::model::{ChapterLocator, ParsedChapter};
use crate::mp4::atoms::*;
use crate::mp4::{be_u16, be_u32, be_u64, find_path, read_full_box, BoxHeader};

/// Read chapters from the QuickTime chapter track, if one is referenced.
pub(crate) fn read_qt_chapters(data: &[u8], moov: BoxHeader) -> Option<Vec<ParsedChapter>> {
    let mut chapter_track_ids: Vec<u32> = Vec::new();
    for trak in traks(data, moov) {
        if let Ok(Some(tref)) = find_path(data, trak, &[TREF]) {
            if let Ok(Some(chap)) = tref.children(data).find(CHAP) {
                let payload = chap.payload(data);
                for chunk in payload.chunks_exact(4) {
                    chapter_track_ids.push(u32::from_be_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ]));
                }
            }
        }
    }
    if chapter_track_ids.is_empty() {
        return None;
    }

    for trak in traks(data, moov) {
        let Some(track_id) = track_id(data, trak) else {
            continue;
        };
        if chapter_track_ids.contains(&track_id) {
            let chapters = read_text_track(data, trak)?;
            if !chapters.is_empty() {
                return Some(chapters);
            }
        }
    }
    None
}

fn traks(data: &[u8], moov: BoxHeader) -> impl Iterator<Item = BoxHeader> + '_ {
    moov.children(data)
        .filter_map(|r| r.ok())
        .filter(|b| b.kind == TRAK)
}

fn track_id(data: &[u8], trak: BoxHeader) -> Option<u32> {
    let tkhd = trak.children(data).find(TKHD).ok()??;
    let (version, _, rest) = read_full_box(tkhd.payload(data))?;
    // v0: creation(4) modification(4) track_id(4); v1: 8+8 then track_id.
    let offset = if version == 1 { 16 } else { 8 };
    rest.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Walk the chapter text track's sample tables and read each chapter text
/// sample (2-byte length prefix, then UTF-8 text).
fn read_text_track(data: &[u8], trak: BoxHeader) -> Option<Vec<ParsedChapter>> {
    let mdhd = find_path(data, trak, &[MDIA, MDHD]).ok()??;
    let (version, _, rest) = read_full_box(mdhd.payload(data))?;
    let timescale = if version == 1 {
        be_u32(rest, 16)?
    } else {
        be_u32(rest, 8)?
    };
    if timescale == 0 {
        return None;
    }

    let stbl = find_path(data, trak, &[MDIA, MINF, STBL]).ok()??;

    // stts: per-sample time deltas.
    let stts = stbl.children(data).find(STTS).ok()??;
    let (_, _, body) = read_full_box(stts.payload(data))?;
    let entry_count = be_u32(body, 0)? as usize;
    let mut deltas: Vec<u64> = Vec::new();
    for entry in 0..entry_count {
        let base = 4 + entry * 8;
        let sample_count = be_u32(body, base)?;
        let delta = be_u32(body, base + 4)? as u64;
        for _ in 0..sample_count {
            deltas.push(delta);
        }
    }

    // stsz: per-sample sizes.
    let stsz = stbl.children(data).find(STSZ).ok()??;
    let (_, _, body) = read_full_box(stsz.payload(data))?;
    let uniform = be_u32(body, 0)?;
    let sample_count = be_u32(body, 4)? as usize;
    let sizes: Vec<u64> = if uniform != 0 {
        vec![uniform as u64; sample_count]
    } else {
        (0..sample_count)
            .map(|i| be_u32(body, 8 + i * 4).map(|v| v as u64))
            .collect::<Option<Vec<u64>>>()?
    };

    // stsc: sample-to-chunk map.
    let stsc = stbl.children(data).find(STSC).ok()??;
    let (_, _, body) = read_full_box(stsc.payload(data))?;
    let stsc_count = be_u32(body, 0)? as usize;
    let mut stsc_entries: Vec<(u32, u32)> = Vec::with_capacity(stsc_count);
    for entry in 0..stsc_count {
        let base = 4 + entry * 12;
        stsc_entries.push((be_u32(body, base)?, be_u32(body, base + 4)?));
    }

    // stco / co64: chunk offsets.
    let chunk_offsets: Vec<u64> = if let Some(stco) = stbl.children(data).find(STCO).ok()? {
        let (_, _, body) = read_full_box(stco.payload(data))?;
        let count = be_u32(body, 0)? as usize;
        (0..count)
            .map(|i| be_u32(body, 4 + i * 4).map(|v| v as u64))
            .collect::<Option<Vec<u64>>>()?
    } else if let Some(co64) = stbl.children(data).find(CO64).ok()? {
        let (_, _, body) = read_full_box(co64.payload(data))?;
        let count = be_u32(body, 0)? as usize;
        (0..count)
            .map(|i| be_u64(body, 4 + i * 8))
            .collect::<Option<Vec<u64>>>()?
    } else {
        return None;
    };

    // Walk chunks to compute each sample's absolute file offset.
    let mut sample_offsets: Vec<u64> = Vec::with_capacity(sample_count);
    'outer: for (chunk_index, &chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = (chunk_index + 1) as u32;
        let samples_in_chunk = stsc_entries
            .iter()
            .rev()
            .find(|(first, _)| *first <= chunk_number)
            .map(|(_, count)| *count)
            .unwrap_or(1);
        let mut offset = chunk_offset;
        for _ in 0..samples_in_chunk {
            let index = sample_offsets.len();
            if index >= sample_count {
                break 'outer;
            }
            sample_offsets.push(offset);
            offset += sizes[index];
        }
    }

    // Cumulative start times plus the sample text.
    let mut chapters = Vec::with_capacity(sample_offsets.len());
    let mut elapsed_units: u64 = 0;
    for (index, &offset) in sample_offsets.iter().enumerate() {
        let offset = offset as usize;
        let text_len = be_u16(data, offset)? as usize;
        let text = data.get(offset + 2..offset + 2 + text_len)?;
        let start_ms = elapsed_units * 1000 / timescale as u64;
        chapters.push(ParsedChapter {
            parent: None,
            sort: index as u32,
            title: String::from_utf8_lossy(text).into_owned(),
            locator: ChapterLocator::Timestamp(start_ms),
            end_ms: None,
        });
        elapsed_units += deltas.get(index).copied().unwrap_or(0);
    }

    fill_end_times(&mut chapters);
    Some(chapters)
}

/// Read the Nero `chpl` chapter list from `moov/udta`.
///
/// Layout: version byte, 3 flag bytes, a 4-byte reserved field, the
/// chapter count (32-bit for v0, 8-bit for v1), then per chapter an
/// 8-byte 100-ns timestamp, a 1-byte title length, and the UTF-8 title.
pub(crate) fn read_chpl(data: &[u8], moov: BoxHeader) -> Option<Vec<ParsedChapter>> {
    let udta = moov.children(data).find(UDTA).ok()??;
    let chpl = udta.children(data).find(CHPL).ok()??;
    let (version, _, body) = read_full_box(chpl.payload(data))?;

    let (count, mut pos): (usize, usize) = if version == 0 {
        (be_u32(body, 4)? as usize, 8)
    } else {
        (*body.get(4)? as usize, 5)
    };

    let mut chapters = Vec::with_capacity(count);
    for index in 0..count {
        let timestamp_100ns = be_u64(body, pos)?;
        let title_len = *body.get(pos + 8)? as usize;
        let title = body.get(pos + 9..pos + 9 + title_len)?;
        pos += 9 + title_len;
        chapters.push(ParsedChapter {
            parent: None,
            sort: index as u32,
            title: String::from_utf8_lossy(title).into_owned(),
            locator: ChapterLocator::Timestamp(timestamp_100ns / 10_000),
            end_ms: None,
        });
    }

    fill_end_times(&mut chapters);
    Some(chapters)
}

/// End time of chapter N is the start of chapter N+1; the final chapter's
/// end stays unset.
fn fill_end_times(chapters: &mut [ParsedChapter]) {
    let starts: Vec<u64> = chapters
        .iter()
        .map(|c| match c.locator {
            ChapterLocator::Timestamp(ms) => ms,
            _ => 0,
        })
        .collect();
    for index in 0..chapters.len() {
        chapters[index].end_ms = starts.get(index + 1).copied();
    }
}
