//! Low-level ISO BMFF (MP4) box access
//!
//! Pure byte-slice parsing and building, no I/O. The M4B parser and writer
//! in `formats::m4b` sit on top of this layer: reading walks top-level
//! boxes in document order and descends selectively; writing rebuilds the
//! `moov` subtree and streams every other box past by byte range.
//!
//! All integers are big-endian. Atom types containing the copyright glyph
//! are four-byte codes starting with `0xA9`.

pub mod atoms;
pub mod boxes;

pub use boxes::{
    be_u16, be_u24, be_u32, be_u64, build_box, build_full_box, find_path, push_box, read_box_at,
    read_full_box, BoxHeader, BoxIter, FourCc, Mp4Error, MAX_BOX_PAYLOAD,
};
