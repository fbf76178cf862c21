//! Synthetic M4B fixtures
//!
//! Assembles a structurally valid MP4 box graph in memory: an audio track
//! with an `esds` (AAC-LC, 128 kbps), a QuickTime chapter text track whose
//! samples live in `mdat`, a Nero `chpl`, and an `ilst` exercising every
//! tracked atom plus unknown ones for raw round-trip.

use crate::mp4::atoms::*;
use crate::mp4::{build_box, build_full_box, FourCc};

pub struct M4bFixture {
    pub include_qt_chapters: bool,
    /// Place `moov` before `mdat` to exercise chunk-offset shifting.
    pub moov_first: bool,
}

impl Default for M4bFixture {
    fn default() -> Self {
        Self {
            include_qt_chapters: true,
            moov_first: false,
        }
    }
}

const QT_CHAPTERS: [(&str, u64); 3] = [("Intro", 60_000), ("Main", 120_000), ("End", 20_000)];

fn b(kind: FourCc, payload: &[u8]) -> Vec<u8> {
    build_box(kind, payload).unwrap()
}

fn fb(kind: FourCc, version: u8, body: &[u8]) -> Vec<u8> {
    build_full_box(kind, version, 0, body).unwrap()
}

pub fn build_m4b(fixture: &M4bFixture) -> Vec<u8> {
    let ftyp = b(FTYP, b"M4B \x00\x00\x00\x01M4B mp42isom");

    // Chapter text samples: 2-byte length prefix then UTF-8 text.
    let mut mdat_payload = Vec::new();
    let mut sample_layout: Vec<(usize, usize)> = Vec::new(); // (rel offset, size)
    for (title, _) in QT_CHAPTERS {
        let rel = mdat_payload.len();
        mdat_payload.extend_from_slice(&(title.len() as u16).to_be_bytes());
        mdat_payload.extend_from_slice(title.as_bytes());
        sample_layout.push((rel, 2 + title.len()));
    }
    let mdat = b(*b"mdat", &mdat_payload);

    if fixture.moov_first {
        // Two passes: moov size is independent of the offsets inside stco.
        let probe = build_moov(fixture, &sample_layout, 0);
        let mdat_payload_start = ftyp.len() + probe.len() + 8;
        let moov = build_moov(fixture, &sample_layout, mdat_payload_start);
        assert_eq!(moov.len(), probe.len());
        [ftyp, moov, mdat].concat()
    } else {
        let mdat_payload_start = ftyp.len() + 8;
        let moov = build_moov(fixture, &sample_layout, mdat_payload_start);
        [ftyp, mdat, moov].concat()
    }
}

fn build_moov(
    fixture: &M4bFixture,
    sample_layout: &[(usize, usize)],
    mdat_payload_start: usize,
) -> Vec<u8> {
    let mut payload = Vec::new();

    // mvhd v0: timescale 1000, duration 180000 (180 s).
    let mut mvhd = Vec::new();
    mvhd.extend_from_slice(&[0u8; 8]); // creation + modification
    mvhd.extend_from_slice(&1000u32.to_be_bytes());
    mvhd.extend_from_slice(&180_000u32.to_be_bytes());
    mvhd.extend_from_slice(&[0u8; 80]); // rate/volume/matrix/predefined/next id
    payload.extend_from_slice(&fb(MVHD, 0, &mvhd));

    payload.extend_from_slice(&audio_trak(fixture));
    if fixture.include_qt_chapters {
        payload.extend_from_slice(&text_trak(sample_layout, mdat_payload_start));
    }
    payload.extend_from_slice(&udta());

    b(MOOV, &payload)
}

fn tkhd(track_id: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&track_id.to_be_bytes());
    body.extend_from_slice(&[0u8; 68]);
    fb(TKHD, 0, &body)
}

fn mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&timescale.to_be_bytes());
    body.extend_from_slice(&duration.to_be_bytes());
    body.extend_from_slice(&[0u8; 4]); // language + predefined
    fb(MDHD, 0, &body)
}

fn audio_trak(fixture: &M4bFixture) -> Vec<u8> {
    let mut trak_payload = tkhd(1);

    if fixture.include_qt_chapters {
        let chap = b(CHAP, &2u32.to_be_bytes());
        trak_payload.extend_from_slice(&b(TREF, &chap));
    }

    // esds: ES descriptor -> DecoderConfig (OTI 0x40, avg 128000)
    // -> DecoderSpecificInfo (AOT 2, AAC-LC).
    let dec_specific: &[u8] = &[0x05, 0x02, 0b0001_0000, 0x00];
    let mut dec_config = vec![
        0x04, 0x11, // tag, length (17)
        0x40, // ObjectTypeIndication: MPEG-4 Audio
        0x15, // streamType audio
        0x00, 0x30, 0x00, // bufferSizeDB
    ];
    dec_config.extend_from_slice(&160_000u32.to_be_bytes()); // maxBitrate
    dec_config.extend_from_slice(&128_000u32.to_be_bytes()); // avgBitrate
    dec_config.extend_from_slice(dec_specific);
    let mut es = vec![0x03, (3 + dec_config.len()) as u8, 0x00, 0x01, 0x00];
    es.extend_from_slice(&dec_config);
    let esds = fb(ESDS, 0, &es);

    // mp4a sample entry: 8 bytes reserved/data-ref + 20 bytes audio fields.
    let mut mp4a = vec![0u8; 28];
    mp4a[7] = 1; // data reference index
    mp4a.extend_from_slice(&esds);
    let mp4a_entry = b(MP4A, &mp4a);

    let mut stsd = 1u32.to_be_bytes().to_vec();
    stsd.extend_from_slice(&mp4a_entry);

    let mut stbl = fb(STSD, 0, &stsd);
    stbl.extend_from_slice(&fb(STTS, 0, &0u32.to_be_bytes()));
    let mut stsz_body = 0u32.to_be_bytes().to_vec();
    stsz_body.extend_from_slice(&0u32.to_be_bytes());
    stbl.extend_from_slice(&fb(STSZ, 0, &stsz_body));
    stbl.extend_from_slice(&fb(STSC, 0, &0u32.to_be_bytes()));
    stbl.extend_from_slice(&fb(STCO, 0, &0u32.to_be_bytes()));

    let minf = b(MINF, &b(STBL, &stbl));
    let mut mdia = mdhd(44_100, 7_938_000);
    mdia.extend_from_slice(&minf);
    trak_payload.extend_from_slice(&b(MDIA, &mdia));

    b(TRAK, &trak_payload)
}

fn text_trak(sample_layout: &[(usize, usize)], mdat_payload_start: usize) -> Vec<u8> {
    let mut trak_payload = tkhd(2);

    // stts: one entry per sample (timescale 1000 -> deltas in ms).
    let mut stts_body = (QT_CHAPTERS.len() as u32).to_be_bytes().to_vec();
    for (_, delta_ms) in QT_CHAPTERS {
        stts_body.extend_from_slice(&1u32.to_be_bytes());
        stts_body.extend_from_slice(&(delta_ms as u32).to_be_bytes());
    }

    // stsz: explicit per-sample sizes.
    let mut stsz_body = 0u32.to_be_bytes().to_vec();
    stsz_body.extend_from_slice(&(sample_layout.len() as u32).to_be_bytes());
    for (_, size) in sample_layout {
        stsz_body.extend_from_slice(&(*size as u32).to_be_bytes());
    }

    // stsc: one chunk holding every sample.
    let mut stsc_body = 1u32.to_be_bytes().to_vec();
    stsc_body.extend_from_slice(&1u32.to_be_bytes());
    stsc_body.extend_from_slice(&(sample_layout.len() as u32).to_be_bytes());
    stsc_body.extend_from_slice(&1u32.to_be_bytes());

    // stco: the single chunk starts at the first sample.
    let mut stco_body = 1u32.to_be_bytes().to_vec();
    let chunk_offset = (mdat_payload_start + sample_layout[0].0) as u32;
    stco_body.extend_from_slice(&chunk_offset.to_be_bytes());

    let mut stbl = fb(STSD, 0, &0u32.to_be_bytes());
    stbl.extend_from_slice(&fb(STTS, 0, &stts_body));
    stbl.extend_from_slice(&fb(STSZ, 0, &stsz_body));
    stbl.extend_from_slice(&fb(STSC, 0, &stsc_body));
    stbl.extend_from_slice(&fb(STCO, 0, &stco_body));

    let minf = b(MINF, &b(STBL, &stbl));
    let mut mdia = mdhd(1000, 200_000);
    mdia.extend_from_slice(&minf);
    trak_payload.extend_from_slice(&b(MDIA, &mdia));

    b(TRAK, &trak_payload)
}

fn data_atom(kind: FourCc, type_code: u32, value: &[u8]) -> Vec<u8> {
    let mut data_payload = vec![0u8];
    data_payload.extend_from_slice(&type_code.to_be_bytes()[1..]);
    data_payload.extend_from_slice(&[0u8; 4]);
    data_payload.extend_from_slice(value);
    b(kind, &b(DATA, &data_payload))
}

fn freeform(key_mean: &str, key_name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut mean_payload = vec![0u8; 4];
    mean_payload.extend_from_slice(key_mean.as_bytes());
    payload.extend_from_slice(&b(FREEFORM_MEAN, &mean_payload));
    let mut name_payload = vec![0u8; 4];
    name_payload.extend_from_slice(key_name.as_bytes());
    payload.extend_from_slice(&b(FREEFORM_NAME, &name_payload));
    let mut data_payload = vec![0u8, 0, 0, 1, 0, 0, 0, 0];
    data_payload.extend_from_slice(value.as_bytes());
    payload.extend_from_slice(&b(DATA, &data_payload));
    b(FREEFORM, &payload)
}

fn udta() -> Vec<u8> {
    let mut ilst = Vec::new();
    ilst.extend_from_slice(&data_atom(TITLE, 1, b"Source Title"));
    ilst.extend_from_slice(&data_atom(ARTIST, 1, b"Old Author"));
    ilst.extend_from_slice(&data_atom(ALBUM, 1, b"Spoken Saga #3"));
    // Genre with the type-18 UTF-8 variant.
    ilst.extend_from_slice(&data_atom(GENRE, 18, b"Fantasy"));
    ilst.extend_from_slice(&data_atom(DAY, 1, b"2018-05-06"));
    ilst.extend_from_slice(&data_atom(NARRATOR, 1, b"Old Narrator"));
    ilst.extend_from_slice(&data_atom(DESCRIPTION, 1, b"Source description."));
    ilst.extend_from_slice(&data_atom(COVER, 13, &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]));
    ilst.extend_from_slice(&data_atom(MEDIA_TYPE, 21, &[2]));
    ilst.extend_from_slice(&freeform("com.apple.iTunes", "SUBTITLE", "Source Subtitle"));
    ilst.extend_from_slice(&freeform("com.shisho", "tags", "tagA, tagB"));
    ilst.extend_from_slice(&freeform("com.apple.iTunes", "ASIN", "B0SOURCE"));
    // Unknown atoms that must round-trip verbatim.
    ilst.extend_from_slice(&data_atom(*b"\xA9too", 1, b"Lavf58.76.100"));
    ilst.extend_from_slice(&data_atom(*b"trkn", 0, &[0, 0, 0, 1, 0, 3, 0, 0]));

    let mut hdlr_body = vec![0u8; 4];
    hdlr_body.extend_from_slice(b"mdir");
    hdlr_body.extend_from_slice(b"appl");
    hdlr_body.extend_from_slice(&[0u8; 8]);
    hdlr_body.push(0);

    let mut meta_payload = vec![0u8; 4];
    meta_payload.extend_from_slice(&fb(HDLR, 0, &hdlr_body));
    meta_payload.extend_from_slice(&b(ILST, &ilst));

    // Nero chapter list: 2 chapters at 0 s and 90 s.
    let mut chpl_body = vec![0u8; 4]; // reserved
    chpl_body.extend_from_slice(&2u32.to_be_bytes());
    for (title, start_ms) in [("Nero One", 0u64), ("Nero Two", 90_000)] {
        chpl_body.extend_from_slice(&(start_ms * 10_000).to_be_bytes());
        chpl_body.push(title.len() as u8);
        chpl_body.extend_from_slice(title.as_bytes());
    }

    let mut udta_payload = b(META, &meta_payload);
    udta_payload.extend_from_slice(&fb(CHPL, 0, &chpl_body));
    b(UDTA, &udta_payload)
}
