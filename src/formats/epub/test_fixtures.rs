//! In-memory EPUB fixtures for parser/writer tests

use std::io::{Cursor, Write};

use zip::write::{SimpleFileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::archive::EPUB_MIMETYPE;

/// Knobs for the synthetic EPUB used across tests.
pub struct EpubFixture {
    pub title: String,
    pub subtitle: Option<String>,
    pub include_cover: bool,
    pub include_nav: bool,
    pub extra_entry: Option<(String, Vec<u8>)>,
}

impl Default for EpubFixture {
    fn default() -> Self {
        Self {
            title: "Original Title".to_string(),
            subtitle: Some("A Subtitle".to_string()),
            include_cover: true,
            include_nav: true,
            extra_entry: None,
        }
    }
}

pub fn build_epub(fixture: &EpubFixture) -> Vec<u8> {
    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file("mimetype", stored).unwrap();
        zip.write_all(EPUB_MIMETYPE.as_bytes()).unwrap();

        zip.start_file("META-INF/container.xml", deflated).unwrap();
        zip.write_all(
            br#"<?xml version="1.0" encoding="UTF-8"?>
<container xmlns="urn:oasis:names:tc:opendocument:xmlns:container" version="1.0">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
        )
        .unwrap();

        zip.start_file("OEBPS/content.opf", deflated).unwrap();
        zip.write_all(content_opf(fixture).as_bytes()).unwrap();

        if fixture.include_nav {
            zip.start_file("OEBPS/nav.xhtml", deflated).unwrap();
            zip.write_all(
                br#"<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
<nav epub:type="toc">
  <ol>
    <li><a href="ch1.xhtml">Chapter 1</a></li>
    <li><a href="ch2.xhtml">Chapter 2</a></li>
  </ol>
</nav>
</body></html>"#,
            )
            .unwrap();
        }

        for name in ["OEBPS/ch1.xhtml", "OEBPS/ch2.xhtml"] {
            zip.start_file(name, deflated).unwrap();
            zip.write_all(
                br#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>c</title></head>
<body><p>First sentence. Second sentence!</p><p>Another paragraph here.</p></body></html>"#,
            )
            .unwrap();
        }

        if fixture.include_cover {
            zip.start_file("OEBPS/images/cover.jpg", stored).unwrap();
            zip.write_all(&[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4]).unwrap();
        }

        if let Some((name, data)) = &fixture.extra_entry {
            zip.start_file(name.as_str(), deflated).unwrap();
            zip.write_all(data).unwrap();
        }

        zip.finish().unwrap();
    }
    buffer
}

fn content_opf(fixture: &EpubFixture) -> String {
    let subtitle = match &fixture.subtitle {
        Some(subtitle) => format!(
            r#"    <dc:title id="subtitle">{subtitle}</dc:title>
"#
        ),
        None => String::new(),
    };
    let cover_meta = if fixture.include_cover {
        r#"    <meta name="cover" content="cover-img"/>
"#
    } else {
        ""
    };
    let cover_item = if fixture.include_cover {
        r#"    <item id="cover-img" href="images/cover.jpg" media-type="image/jpeg"/>
"#
    } else {
        ""
    };
    let nav_item = if fixture.include_nav {
        r#"    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
"#
    } else {
        ""
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" xmlns:opf="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:uuid:11111111-2222-3333-4444-555555555555</dc:identifier>
    <dc:title>{title}</dc:title>
{subtitle}    <dc:creator opf:role="aut">Old Author</dc:creator>
    <dc:creator opf:role="ill">Keep Me</dc:creator>
    <dc:language>en</dc:language>
    <dc:publisher>Original House</dc:publisher>
    <dc:description>Original description.</dc:description>
    <dc:date>2011-06-15</dc:date>
    <dc:subject>Fantasy</dc:subject>
    <meta name="calibre:tags" content="tag1, tag2"/>
    <meta name="calibre:series" content="Old Series"/>
    <meta name="calibre:series_index" content="3"/>
{cover_meta}  </metadata>
  <manifest>
{cover_item}{nav_item}    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="ch2.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine>
    <itemref idref="c1"/>
    <itemref idref="c2"/>
  </spine>
</package>"#,
        title = fixture.title,
    )
}
