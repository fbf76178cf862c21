//! M4B (MP4 audiobook) parsing and rewriting
//!
//! Sits on the `mp4` box layer. Reading is full-featured (metadata,
//! codec/bitrate, both chapter representations); writing re-embeds
//! catalog metadata for derived downloads. In-place metadata mutation
//! for user edits is handled elsewhere in the system.

pub(crate) mod chapters;
mod parser;
#[cfg(test)]
pub(crate) mod test_fixtures;
mod writer;

pub use parser::{parse_m4b, M4bSource, RawAtom};
pub use writer::M4bWriter;
