//! Deterministic download filenames
//!
//! The name a browser saves: `<Series> #N - <Title> - <Author>.<ext>`,
//! with the series part omitted when the book has no series and the
//! author part omitted when it has no authors. Derived purely from the
//! Book/File identity; it never feeds the fingerprint.

use crate::model::{format_series_position, Book, BookFile, Variant};

/// Build the download filename for a derived artifact.
pub fn download_filename(book: &Book, file: &BookFile, variant: Variant) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(series) = book.primary_series() {
        let label = match series.position {
            Some(position) => {
                format!("{} #{}", series.name, format_series_position(position))
            }
            None => series.name.clone(),
        };
        parts.push(label);
    }

    parts.push(file.effective_title(book).to_string());

    if let Some(author) = book.authors.first() {
        parts.push(author.name.clone());
    }

    let stem = parts.join(" - ");
    let extension = variant.artifact_extension(file.format);
    sanitize_filename::sanitize(format!("{stem}.{extension}"))
}
