//! CBZ (zipped comic archive) parsing and rewriting

pub mod comicinfo;
mod images;
mod parser;
#[cfg(test)]
pub(crate) mod test_fixtures;
mod writer;

pub use comicinfo::ComicInfo;
pub use images::{process_images, ImageInput, ProcessedImage};
pub use parser::parse_cbz;
pub use writer::CbzWriter;
