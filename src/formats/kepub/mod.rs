//! Kobo KePub converters
//!
//! `epub` wraps the EPUB writer with the Kobo span/rendition transform;
//! `cbz` builds a fixed-layout EPUB straight from a comic archive. M4B has
//! no KePub form; the factory rejects that pair before reaching here.

mod cbz;
mod epub;
mod markup;

pub use cbz::CbzToKepub;
pub use epub::EpubToKepub;
pub use markup::kepubify_xhtml;
