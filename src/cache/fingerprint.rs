//! Derived-file fingerprints
//!
//! A fingerprint identifies one cacheable `(source, book, file, variant)`
//! tuple. It covers the source file's path/mtime/size, the format and
//! variant tags, and every `Book`/`BookFile` field a writer consults, so
//! it changes whenever any writer input changes.
//!
//! Canonicalisation: every field is hashed as `tag || len || bytes`
//! (length-prefixed, field-tagged), and the relationship lists whose
//! database order is arbitrary — authors, series, genres, tags,
//! identifiers — are sorted by a documented key before hashing, so map
//! iteration order and join order never leak in. Chapters hash in array
//! order, because array order is what the writer emits.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::model::{Book, BookFile, ChapterLocator, Variant};

/// 128-bit truncated SHA-256 digest, rendered as 32 hex chars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Fingerprint {
    /// Parse the hex form (as used in cache filenames).
    pub fn parse(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        let array: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn compute(
        book: &Book,
        file: &BookFile,
        variant: Variant,
        src_mtime: SystemTime,
        src_size: u64,
    ) -> Self {
        let mut hasher = FieldHasher::new();

        hasher.str_field("src.path", &file.filepath.to_string_lossy());
        let mtime_nanos = src_mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        hasher.str_field("src.mtime", &mtime_nanos.to_string());
        hasher.str_field("src.size", &src_size.to_string());
        hasher.str_field("src.format", file.format.extension());
        hasher.str_field("variant", variant.tag());

        hasher.str_field("book.title", &book.title);
        hasher.opt_field("book.subtitle", book.subtitle.as_deref());
        hasher.opt_field("book.description", book.description.as_deref());
        hasher.str_field("book.path", &book.filepath.to_string_lossy());

        // Authors sorted by (sort name, name, role tag).
        let mut authors: Vec<String> = book
            .authors
            .iter()
            .map(|a| {
                format!(
                    "{}\u{1F}{}\u{1F}{:?}",
                    a.sort_name.as_deref().unwrap_or(&a.name),
                    a.name,
                    a.role
                )
            })
            .collect();
        authors.sort();
        hasher.list_field("book.authors", &authors);

        // Series sorted by (name, position bits).
        let mut series: Vec<String> = book
            .series
            .iter()
            .map(|s| {
                format!(
                    "{}\u{1F}{:016x}",
                    s.name,
                    s.position.unwrap_or(f64::NAN).to_bits()
                )
            })
            .collect();
        series.sort();
        hasher.list_field("book.series", &series);

        let mut genres = book.genres.clone();
        genres.sort();
        hasher.list_field("book.genres", &genres);
        let mut tags = book.tags.clone();
        tags.sort();
        hasher.list_field("book.tags", &tags);

        hasher.opt_field("file.name_override", file.name_override.as_deref());
        hasher.opt_field("file.publisher", file.publisher.as_deref());
        hasher.opt_field("file.imprint", file.imprint.as_deref());
        hasher.opt_field(
            "file.release_date",
            file.release_date.map(|d| d.to_string()).as_deref(),
        );
        hasher.opt_field("file.url", file.url.as_deref());
        hasher.opt_field(
            "file.cover",
            file.cover
                .as_ref()
                .map(|c| format!("{}\u{1F}{}", c.filename, c.mime_type))
                .as_deref(),
        );
        hasher.opt_field(
            "file.cover_page",
            file.cover_page.map(|p| p.to_string()).as_deref(),
        );

        // Identifiers sorted by (type tag, value).
        let mut identifiers: Vec<String> = file
            .identifiers
            .iter()
            .map(|i| format!("{}\u{1F}{}", i.kind.tag(), i.value))
            .collect();
        identifiers.sort();
        hasher.list_field("file.identifiers", &identifiers);

        // Chapters in array order: the writer emits them as given.
        let chapters: Vec<String> = file
            .chapters
            .iter()
            .map(|c| {
                let locator = match &c.locator {
                    ChapterLocator::Page(p) => format!("page:{p}"),
                    ChapterLocator::Timestamp(ms) => format!("ts:{ms}"),
                    ChapterLocator::Href(href) => format!("href:{href}"),
                };
                format!(
                    "{}\u{1F}{}\u{1F}{}\u{1F}{}",
                    c.parent.map(|p| p.to_string()).unwrap_or_default(),
                    c.sort,
                    c.title,
                    locator
                )
            })
            .collect();
        hasher.list_field("file.chapters", &chapters);

        Self(hasher.finish())
    }
}

struct FieldHasher {
    hasher: Sha256,
}

impl FieldHasher {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn raw(&mut self, tag: &str, value: &[u8]) {
        self.hasher.update((tag.len() as u32).to_be_bytes());
        self.hasher.update(tag.as_bytes());
        self.hasher.update((value.len() as u32).to_be_bytes());
        self.hasher.update(value);
    }

    fn str_field(&mut self, tag: &str, value: &str) {
        self.raw(tag, value.as_bytes());
    }

    /// Absent and empty are distinct.
    fn opt_field(&mut self, tag: &str, value: Option<&str>) {
        match value {
            Some(value) => self.raw(tag, format!("+{value}").as_bytes()),
            None => self.raw(tag, b"-"),
        }
    }

    fn list_field(&mut self, tag: &str, values: &[String]) {
        self.raw(tag, &(values.len() as u32).to_be_bytes());
        for value in values {
            self.raw(tag, value.as_bytes());
        }
    }

    fn finish(self) -> [u8; 16] {
        let digest = self.hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Author, AuthorRole, Chapter, FileFormat, FileRole, Identifier, IdentifierType,
        SeriesMembership,
    };
    use std::path::PathBuf;

    fn sample() -> (Book, BookFile, SystemTime, u64) {
        let book = Book {
            id: 1,
            title: "T".into(),
            subtitle: None,
            description: Some("D".into()),
            filepath: PathBuf::from("/library/b"),
            authors: vec![
                Author::with_role("A", AuthorRole::Writer),
                Author::new("B"),
            ],
            series: vec![
                SeriesMembership {
                    name: "S1".into(),
                    position: Some(1.0),
                },
                SeriesMembership {
                    name: "S2".into(),
                    position: None,
                },
            ],
            genres: vec!["g1".into(), "g2".into()],
            tags: vec!["t1".into(), "t2".into()],
        };
        let file = BookFile {
            id: 2,
            book_id: 1,
            filepath: PathBuf::from("/library/b/x.epub"),
            format: FileFormat::Epub,
            role: FileRole::Main,
            name_override: None,
            publisher: Some("P".into()),
            imprint: None,
            release_date: chrono::NaiveDate::from_ymd_opt(2020, 1, 1),
            url: None,
            cover: None,
            identifiers: vec![
                Identifier::new(IdentifierType::Isbn13, "978"),
                Identifier::new(IdentifierType::Asin, "B0"),
            ],
            chapters: vec![Chapter {
                parent: None,
                sort: 0,
                title: "C1".into(),
                locator: ChapterLocator::Href("c1.xhtml".into()),
            }],
            page_count: None,
            cover_page: None,
            duration_seconds: None,
            bitrate: None,
        };
        (book, file, UNIX_EPOCH + std::time::Duration::from_secs(1000), 42)
    }

    #[test]
    fn test_stable_under_list_permutation() {
        let (book, file, mtime, size) = sample();
        let base = Fingerprint::compute(&book, &file, Variant::Identity, mtime, size);

        let mut permuted_book = book.clone();
        permuted_book.authors.reverse();
        permuted_book.series.reverse();
        permuted_book.genres.reverse();
        permuted_book.tags.reverse();
        let mut permuted_file = file.clone();
        permuted_file.identifiers.reverse();

        let permuted =
            Fingerprint::compute(&permuted_book, &permuted_file, Variant::Identity, mtime, size);
        assert_eq!(base, permuted);
    }

    #[test]
    fn test_sensitive_to_every_writer_input() {
        let (book, file, mtime, size) = sample();
        let base = Fingerprint::compute(&book, &file, Variant::Identity, mtime, size);

        let mut changed = book.clone();
        changed.title = "Other".into();
        assert_ne!(
            base,
            Fingerprint::compute(&changed, &file, Variant::Identity, mtime, size)
        );

        let mut changed = book.clone();
        changed.tags.push("new".into());
        assert_ne!(
            base,
            Fingerprint::compute(&changed, &file, Variant::Identity, mtime, size)
        );

        let mut changed_file = file.clone();
        changed_file.identifiers[0].value = "979".into();
        assert_ne!(
            base,
            Fingerprint::compute(&book, &changed_file, Variant::Identity, mtime, size)
        );

        let mut changed_file = file.clone();
        changed_file.chapters[0].title = "Renamed".into();
        assert_ne!(
            base,
            Fingerprint::compute(&book, &changed_file, Variant::Identity, mtime, size)
        );

        assert_ne!(
            base,
            Fingerprint::compute(&book, &file, Variant::Kepub, mtime, size)
        );
        assert_ne!(
            base,
            Fingerprint::compute(
                &book,
                &file,
                Variant::Identity,
                mtime + std::time::Duration::from_secs(1),
                size
            )
        );
        assert_ne!(
            base,
            Fingerprint::compute(&book, &file, Variant::Identity, mtime, size + 1)
        );
    }

    #[test]
    fn test_chapter_order_is_semantic() {
        let (book, mut file, mtime, size) = sample();
        file.chapters.push(Chapter {
            parent: None,
            sort: 1,
            title: "C2".into(),
            locator: ChapterLocator::Href("c2.xhtml".into()),
        });
        let base = Fingerprint::compute(&book, &file, Variant::Identity, mtime, size);
        file.chapters.reverse();
        let reversed = Fingerprint::compute(&book, &file, Variant::Identity, mtime, size);
        assert_ne!(base, reversed);
    }

    #[test]
    fn test_hex_round_trip() {
        let (book, file, mtime, size) = sample();
        let fp = Fingerprint::compute(&book, &file, Variant::Identity, mtime, size);
        let hex_form = fp.to_string();
        assert_eq!(hex_form.len(), 32);
        assert_eq!(Fingerprint::parse(&hex_form), Some(fp));
        assert_eq!(Fingerprint::parse("zz"), None);
    }
}
