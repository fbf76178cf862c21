//! Zip container helpers
//!
//! EPUB and CBZ are both zip archives. Rewriting either must preserve each
//! entry's compression method, modification time, and declared order; the
//! helpers here capture that central-directory shape so writers can copy
//! entries through or substitute payloads without disturbing the rest.

use std::io::{Read, Seek, Write};

use zip::read::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};
use zip::{CompressionMethod, DateTime};

pub const EPUB_MIMETYPE: &str = "application/epub+zip";
pub const KEPUB_MIMETYPE: &str = "application/kepub+zip";

/// Central-directory view of one entry
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub index: usize,
    pub name: String,
    pub method: CompressionMethod,
    pub mtime: Option<DateTime>,
    pub size: u64,
    pub is_dir: bool,
}

impl ZipEntry {
    /// Lowercased final path segment.
    pub fn file_name_lower(&self) -> String {
        self.name
            .rsplit('/')
            .next()
            .unwrap_or(&self.name)
            .to_lowercase()
    }

    /// Write options reproducing this entry's method and mtime.
    pub fn options(&self) -> SimpleFileOptions {
        let mut options = SimpleFileOptions::default()
            .compression_method(self.method)
            .large_file(self.size >= u32::MAX as u64);
        if let Some(mtime) = self.mtime {
            options = options.last_modified_time(mtime);
        }
        options
    }
}

/// List entries in declared order.
pub fn list_entries<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> zip::result::ZipResult<Vec<ZipEntry>> {
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        entries.push(ZipEntry {
            index,
            name: file.name().to_string(),
            method: file.compression(),
            mtime: file.last_modified(),
            size: file.size(),
            is_dir: file.is_dir(),
        });
    }
    Ok(entries)
}

/// Slurp one entry's bytes by index.
pub fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
) -> zip::result::ZipResult<Vec<u8>> {
    let mut file = archive.by_index(index)?;
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(data)
}

/// Copy an entry to the writer without recompressing, optionally renaming.
pub fn copy_entry<R: Read + Seek, W: Write + Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
    writer: &mut ZipWriter<W>,
    rename: Option<&str>,
) -> zip::result::ZipResult<()> {
    let file = archive.by_index(index)?;
    match rename {
        Some(name) => writer.raw_copy_file_rename(file, name),
        None => writer.raw_copy_file(file),
    }
}

/// Begin an EPUB-family archive: the `mimetype` entry must be the first
/// member and STORED.
pub fn start_mimetype<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    value: &str,
) -> zip::result::ZipResult<()> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    writer.start_file("mimetype", options)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

/// Whether an entry name denotes a page image: image extension, not a
/// dotfile, not macOS resource-fork junk.
pub fn is_image_name(name: &str) -> bool {
    if is_hidden_name(name) {
        return false;
    }
    let lower = name.to_lowercase();
    [".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Dotfiles and `__MACOSX` members are metadata, not content.
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with("__MACOSX/")
        || name
            .rsplit('/')
            .next()
            .map(|segment| segment.starts_with('.'))
            .unwrap_or(false)
}

/// Swap the extension of an archive member name (`a/b/page.png` -> jpg).
pub fn rename_extension(name: &str, new_ext: &str) -> String {
    match name.rfind('.') {
        Some(dot) => format!("{}.{}", &name[..dot], new_ext),
        None => format!("{name}.{new_ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_zip() -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
            let stored =
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            let deflated =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            zip.start_file("mimetype", stored).unwrap();
            zip.write_all(EPUB_MIMETYPE.as_bytes()).unwrap();
            zip.start_file("OEBPS/content.opf", deflated).unwrap();
            zip.write_all(b"<package/>").unwrap();
            zip.start_file("OEBPS/page.png", stored).unwrap();
            zip.write_all(&[0u8; 16]).unwrap();
            zip.finish().unwrap();
        }
        buffer
    }

    #[test]
    fn test_list_preserves_order_and_method() {
        let data = sample_zip();
        let mut archive = ZipArchive::new(Cursor::new(data)).unwrap();
        let entries = list_entries(&mut archive).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "mimetype");
        assert_eq!(entries[0].method, CompressionMethod::Stored);
        assert_eq!(entries[1].name, "OEBPS/content.opf");
        assert_eq!(entries[1].method, CompressionMethod::Deflated);
    }

    #[test]
    fn test_raw_copy_round_trip() {
        let data = sample_zip();
        let mut archive = ZipArchive::new(Cursor::new(data)).unwrap();

        let mut out = Vec::new();
        {
            let mut writer = ZipWriter::new(Cursor::new(&mut out));
            for index in 0..archive.len() {
                copy_entry(&mut archive, index, &mut writer, None).unwrap();
            }
            writer.finish().unwrap();
        }

        let mut copied = ZipArchive::new(Cursor::new(out)).unwrap();
        let entries = list_entries(&mut copied).unwrap();
        assert_eq!(entries[1].method, CompressionMethod::Deflated);
        assert_eq!(read_entry(&mut copied, 1).unwrap(), b"<package/>");
    }

    #[test]
    fn test_image_name_filter() {
        assert!(is_image_name("pages/001.jpg"));
        assert!(is_image_name("cover.PNG"));
        assert!(!is_image_name("pages/.hidden.jpg"));
        assert!(!is_image_name("__MACOSX/pages/001.jpg"));
        assert!(!is_image_name("ComicInfo.xml"));
    }

    #[test]
    fn test_rename_extension() {
        assert_eq!(rename_extension("a/b/page.png", "jpg"), "a/b/page.jpg");
        assert_eq!(rename_extension("noext", "jpg"), "noext.jpg");
    }
}
