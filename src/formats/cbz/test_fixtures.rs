//! In-memory CBZ fixtures for parser/writer tests

use std::io::{Cursor, Write};

use image::RgbImage;
use zip::write::{SimpleFileOptions, ZipWriter};
use zip::CompressionMethod;

/// Knobs for the synthetic CBZ used across tests.
pub struct CbzFixture {
    pub include_comicinfo: bool,
    /// Raw ComicInfo payload overriding the default document
    pub comicinfo_override: Option<Vec<u8>>,
    pub images: Vec<(String, Vec<u8>)>,
    pub extra_entry: Option<(String, Vec<u8>)>,
}

impl Default for CbzFixture {
    fn default() -> Self {
        Self {
            include_comicinfo: true,
            comicinfo_override: None,
            images: (0..3)
                .map(|i| (format!("page{i}.jpg"), jpeg_page(80, 120)))
                .collect(),
            extra_entry: None,
        }
    }
}

pub fn jpeg_page(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([200, 100, 40]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)
        .unwrap();
    out
}

pub fn png_page(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([10, 220, 160]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

const DEFAULT_COMICINFO: &[u8] = br#"<?xml version="1.0"?>
<ComicInfo>
  <Title>Issue One</Title>
  <Series>Example Saga</Series>
  <Number>1</Number>
  <Summary>A summary.</Summary>
  <Year>2019</Year>
  <Month>4</Month>
  <Day>17</Day>
  <Writer>Alice, Bob</Writer>
  <Penciller>Carol</Penciller>
  <Publisher>Example Comics</Publisher>
  <Genre>Action</Genre>
  <Web>https://example.com/1</Web>
  <GTIN>9781234567890</GTIN>
  <Pages>
    <Page Image="0" Type="FrontCover"/>
  </Pages>
</ComicInfo>"#;

pub fn build_cbz(fixture: &CbzFixture) -> Vec<u8> {
    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        if fixture.include_comicinfo {
            zip.start_file("ComicInfo.xml", deflated).unwrap();
            match &fixture.comicinfo_override {
                Some(payload) => zip.write_all(payload).unwrap(),
                None => zip.write_all(DEFAULT_COMICINFO).unwrap(),
            }
        }

        if let Some((name, data)) = &fixture.extra_entry {
            zip.start_file(name.as_str(), deflated).unwrap();
            zip.write_all(data).unwrap();
        }

        for (name, data) in &fixture.images {
            zip.start_file(name.as_str(), stored).unwrap();
            zip.write_all(data).unwrap();
        }

        zip.finish().unwrap();
    }
    buffer
}
