//! Catalog aggregates consumed by the engine
//!
//! These mirror the relational catalog's `Book`/`File` rows plus the parser
//! output (`ParsedMetadata`). The engine never talks to the catalog itself;
//! the embedding server loads an aggregate and hands it in.

use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Container format of a library file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Epub,
    Cbz,
    M4b,
}

impl FileFormat {
    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(Self::Epub),
            "cbz" => Some(Self::Cbz),
            "m4b" => Some(Self::M4b),
            _ => None,
        }
    }

    /// Canonical extension (without dot)
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Epub => "epub",
            Self::Cbz => "cbz",
            Self::M4b => "m4b",
        }
    }

    /// MIME type of an identity download
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Epub => "application/epub+zip",
            Self::Cbz => "application/vnd.comicbook+zip",
            Self::M4b => "audio/mp4",
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Output family of a download: same container as the source, or Kobo's
/// KePub variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Identity,
    Kepub,
}

impl Variant {
    /// Stable tag fed into fingerprints
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Kepub => "kepub",
        }
    }

    /// Extension of the derived artifact for a given source format
    pub fn artifact_extension(&self, format: FileFormat) -> &'static str {
        match self {
            Self::Identity => format.extension(),
            Self::Kepub => "kepub.epub",
        }
    }

    /// MIME type of the derived artifact
    pub fn mime_type(&self, format: FileFormat) -> &'static str {
        match self {
            Self::Identity => format.mime_type(),
            Self::Kepub => "application/kepub+zip",
        }
    }
}

/// Closed set of author roles tracked by the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorRole {
    Writer,
    Penciller,
    Inker,
    Colorist,
    Letterer,
    CoverArtist,
    Editor,
    Translator,
    Narrator,
}

/// Author relation on a book, in catalog sort order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub sort_name: Option<String>,
    pub role: Option<AuthorRole>,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sort_name: None,
            role: None,
        }
    }

    pub fn with_role(name: impl Into<String>, role: AuthorRole) -> Self {
        Self {
            name: name.into(),
            sort_name: None,
            role: Some(role),
        }
    }
}

/// Series membership with an optional fractional position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMembership {
    pub name: String,
    pub position: Option<f64>,
}

/// Formats a series position the way Calibre does: `1` for whole numbers,
/// `1.5` otherwise.
pub fn format_series_position(position: f64) -> String {
    if position.fract() == 0.0 {
        format!("{}", position as i64)
    } else {
        format!("{position}")
    }
}

/// Closed set of identifier schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Isbn13,
    Isbn10,
    Asin,
    Uuid,
    Goodreads,
    Google,
    Other,
}

impl IdentifierType {
    /// Stable tag fed into fingerprints
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Isbn13 => "isbn_13",
            Self::Isbn10 => "isbn_10",
            Self::Asin => "asin",
            Self::Uuid => "uuid",
            Self::Goodreads => "goodreads",
            Self::Google => "google",
            Self::Other => "other",
        }
    }

    /// Classify a bare GTIN/identifier value the way ComicInfo's `GTIN`
    /// field is interpreted: 13 digits starting 978/979 is an ISBN-13, 10
    /// characters is an ISBN-10, anything else is `other`.
    pub fn classify_gtin(value: &str) -> Self {
        let digits: String = value.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
        if digits.len() == 13
            && digits.chars().all(|c| c.is_ascii_digit())
            && (digits.starts_with("978") || digits.starts_with("979"))
        {
            Self::Isbn13
        } else if digits.len() == 10 {
            Self::Isbn10
        } else {
            Self::Other
        }
    }
}

/// External identifier attached to a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub kind: IdentifierType,
    pub value: String,
}

impl Identifier {
    pub fn new(kind: IdentifierType, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Whether a file is the book's main content or supplemental material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Main,
    Supplement,
}

/// Where a chapter starts inside its container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterLocator {
    /// 0-indexed page of a CBZ
    Page(u32),
    /// Start timestamp in milliseconds of an M4B
    Timestamp(u64),
    /// Intra-spine href of an EPUB
    Href(String),
}

/// A chapter node. Chapters form a forest rooted at a file, represented as
/// a flat array with parent indices (no shared-ownership cycles).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// Index of the parent chapter within the file's chapter array, or
    /// `None` for a root chapter
    pub parent: Option<usize>,
    /// Sibling-local sort order
    pub sort: u32,
    pub title: String,
    pub locator: ChapterLocator,
}

/// Cover image reference stored on a file, resolved relative to the book's
/// cover directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverRef {
    pub filename: String,
    pub mime_type: String,
}

/// Book aggregate (input to writers and the cache)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    /// Either a directory holding the book's files, or a single file for
    /// root-level books
    pub filepath: PathBuf,
    /// Ordered by catalog sort order
    pub authors: Vec<Author>,
    /// Ordered by catalog sort order; index 0 is the primary series
    pub series: Vec<SeriesMembership>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
}

impl Book {
    /// The directory cover filenames resolve against: the book directory
    /// itself, or the parent directory for root-level (single file) books.
    pub fn cover_dir(&self) -> PathBuf {
        if self.filepath.is_dir() {
            self.filepath.clone()
        } else {
            self.filepath
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| self.filepath.clone())
        }
    }

    /// Primary series membership (sort order 0), if any.
    pub fn primary_series(&self) -> Option<&SeriesMembership> {
        self.series.first()
    }
}

/// File aggregate. Belongs to exactly one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookFile {
    pub id: i64,
    pub book_id: i64,
    /// Source path on disk
    pub filepath: PathBuf,
    pub format: FileFormat,
    pub role: FileRole,
    /// Display-name override; when set it replaces the book title in
    /// derived files
    pub name_override: Option<String>,
    pub publisher: Option<String>,
    pub imprint: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub url: Option<String>,
    pub cover: Option<CoverRef>,
    pub identifiers: Vec<Identifier>,
    /// Chapter forest, flattened; array order is emission order
    pub chapters: Vec<Chapter>,
    /// CBZ: number of image pages
    pub page_count: Option<u32>,
    /// CBZ: 0-indexed preferred cover page
    pub cover_page: Option<u32>,
    /// M4B: duration in seconds
    pub duration_seconds: Option<f64>,
    /// M4B: average bitrate in bits per second
    pub bitrate: Option<u32>,
}

impl BookFile {
    /// Title used in derived files: the name override when non-empty, else
    /// the book title.
    pub fn effective_title<'a>(&'a self, book: &'a Book) -> &'a str {
        match &self.name_override {
            Some(name) if !name.is_empty() => name,
            _ => &book.title,
        }
    }

    /// First identifier of the given type.
    pub fn identifier(&self, kind: IdentifierType) -> Option<&Identifier> {
        self.identifiers.iter().find(|i| i.kind == kind)
    }

    /// Top-level chapters (no parent) in sort order.
    pub fn root_chapters(&self) -> Vec<&Chapter> {
        let mut roots: Vec<&Chapter> = self
            .chapters
            .iter()
            .filter(|c| c.parent.is_none())
            .collect();
        roots.sort_by_key(|c| c.sort);
        roots
    }
}

/// Extraction source of a `ParsedMetadata`, in catalog priority order.
/// The catalog keeps the highest-priority source per field; the ordering
/// lives there, this tag merely names where a parse came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataSource {
    M4bMetadata,
    EpubOpf,
    CbzComicinfo,
    Filepath,
}

impl MetadataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M4bMetadata => "m4b-metadata",
            Self::EpubOpf => "epub-opf",
            Self::CbzComicinfo => "cbz-comicinfo",
            Self::Filepath => "filepath",
        }
    }
}

/// Cover image bytes extracted from a container
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl std::fmt::Debug for CoverImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Chapter as produced by a parser: flat arena plus, for audiobooks, the
/// computed end timestamp (start of the following chapter; unset for the
/// last one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedChapter {
    pub parent: Option<usize>,
    pub sort: u32,
    pub title: String,
    pub locator: ChapterLocator,
    /// End timestamp in milliseconds; only meaningful for M4B chapters
    pub end_ms: Option<u64>,
}

/// Parser output: everything a container yielded, tagged with its source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedMetadata {
    pub source: Option<MetadataSource>,
    pub title: Option<String>,
    pub title_sort: Option<String>,
    pub subtitle: Option<String>,
    pub authors: Vec<Author>,
    pub narrators: Vec<String>,
    pub series: Vec<SeriesMembership>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub publisher: Option<String>,
    pub imprint: Option<String>,
    pub url: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub language: Option<String>,
    pub identifiers: Vec<Identifier>,
    pub cover: Option<CoverImage>,
    pub chapters: Vec<ParsedChapter>,
    /// CBZ: image entry count
    pub page_count: Option<u32>,
    /// CBZ: 0-indexed front cover page
    pub cover_page: Option<u32>,
    /// M4B: duration in seconds
    pub duration_seconds: Option<f64>,
    /// M4B: average bitrate in bits per second
    pub bitrate: Option<u32>,
    /// M4B: decoded codec label (`AAC-LC`, `HE-AAC`, ...)
    pub codec: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_extension("EPUB"), Some(FileFormat::Epub));
        assert_eq!(FileFormat::from_extension("m4b"), Some(FileFormat::M4b));
        assert_eq!(FileFormat::from_extension("pdf"), None);
    }

    #[test]
    fn test_variant_artifact_extension() {
        assert_eq!(Variant::Identity.artifact_extension(FileFormat::Cbz), "cbz");
        assert_eq!(
            Variant::Kepub.artifact_extension(FileFormat::Cbz),
            "kepub.epub"
        );
        assert_eq!(
            Variant::Kepub.mime_type(FileFormat::Epub),
            "application/kepub+zip"
        );
    }

    #[test]
    fn test_series_position_formatting() {
        assert_eq!(format_series_position(1.0), "1");
        assert_eq!(format_series_position(1.5), "1.5");
        assert_eq!(format_series_position(12.0), "12");
    }

    #[test]
    fn test_gtin_classification() {
        assert_eq!(
            IdentifierType::classify_gtin("9781234567890"),
            IdentifierType::Isbn13
        );
        assert_eq!(
            IdentifierType::classify_gtin("979-1-23456-789-0"),
            IdentifierType::Isbn13
        );
        assert_eq!(
            IdentifierType::classify_gtin("0123456789"),
            IdentifierType::Isbn10
        );
        assert_eq!(
            IdentifierType::classify_gtin("123456789012"),
            IdentifierType::Other
        );
    }

    #[test]
    fn test_effective_title() {
        let book = Book {
            id: 1,
            title: "Book Title".into(),
            subtitle: None,
            description: None,
            filepath: PathBuf::from("/library/book"),
            authors: vec![],
            series: vec![],
            genres: vec![],
            tags: vec![],
        };
        let mut file = BookFile {
            id: 1,
            book_id: 1,
            filepath: PathBuf::from("/library/book/a.epub"),
            format: FileFormat::Epub,
            role: FileRole::Main,
            name_override: None,
            publisher: None,
            imprint: None,
            release_date: None,
            url: None,
            cover: None,
            identifiers: vec![],
            chapters: vec![],
            page_count: None,
            cover_page: None,
            duration_seconds: None,
            bitrate: None,
        };
        assert_eq!(file.effective_title(&book), "Book Title");
        file.name_override = Some("Override".into());
        assert_eq!(file.effective_title(&book), "Override");
        file.name_override = Some(String::new());
        assert_eq!(file.effective_title(&book), "Book Title");
    }

    #[test]
    fn test_root_chapters_sorted() {
        let file = BookFile {
            id: 1,
            book_id: 1,
            filepath: PathBuf::from("/x.m4b"),
            format: FileFormat::M4b,
            role: FileRole::Main,
            name_override: None,
            publisher: None,
            imprint: None,
            release_date: None,
            url: None,
            cover: None,
            identifiers: vec![],
            chapters: vec![
                Chapter {
                    parent: None,
                    sort: 1,
                    title: "Two".into(),
                    locator: ChapterLocator::Timestamp(60_000),
                },
                Chapter {
                    parent: Some(0),
                    sort: 0,
                    title: "Nested".into(),
                    locator: ChapterLocator::Timestamp(70_000),
                },
                Chapter {
                    parent: None,
                    sort: 0,
                    title: "One".into(),
                    locator: ChapterLocator::Timestamp(0),
                },
            ],
            page_count: None,
            cover_page: None,
            duration_seconds: None,
            bitrate: None,
        };
        let roots = file.root_chapters();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].title, "One");
        assert_eq!(roots[1].title, "Two");
    }
}
