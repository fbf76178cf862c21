//! Parallel e-reader image optimization
//!
//! Stage 1 of the CBZ writer: decode every page image on a bounded worker
//! pool, downscale anything larger than the device preset, and re-encode
//! PNG (and other non-JPEG) inputs as JPEG. JPEG pages already within the
//! target dimensions pass through byte-identical.
//!
//! Workers check the shared cancel signal before decoding the next image;
//! a decode already underway runs to completion and is discarded.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::archive;
use crate::config::ImagePreset;
use crate::error::{EngineError, Result};
use crate::generate::CancelToken;

/// One page image queued for processing
pub struct ImageInput {
    /// Index into the source archive's entry table
    pub entry_index: usize,
    pub name: String,
    pub data: Vec<u8>,
}

/// A processed page image ready for archive assembly
#[derive(Debug)]
pub struct ProcessedImage {
    pub entry_index: usize,
    /// Member name, renamed when the encoding changed (`.png` -> `.jpg`)
    pub name: String,
    pub data: Vec<u8>,
}

/// Process page images on a pool of `workers` threads, preserving input
/// order in the output.
pub fn process_images(
    cancel: &CancelToken,
    preset: &ImagePreset,
    workers: usize,
    inputs: Vec<ImageInput>,
) -> Result<Vec<ProcessedImage>> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| EngineError::Internal(format!("image worker pool: {e}")))?;

    pool.install(|| {
        inputs
            .into_par_iter()
            .map(|input| {
                cancel.check()?;
                Ok(optimize_one(preset, input))
            })
            .collect()
    })
}

/// Optimize a single page image.
///
/// Undecodable images pass through untouched; repairing malformed content
/// is out of scope and a broken page should not sink the whole book.
fn optimize_one(preset: &ImagePreset, input: ImageInput) -> ProcessedImage {
    let format = image::guess_format(&input.data).ok();
    let (width, height) = match image::ImageReader::new(Cursor::new(&input.data))
        .with_guessed_format()
        .ok()
        .and_then(|r| r.into_dimensions().ok())
    {
        Some(dims) => dims,
        None => {
            warn!(name = %input.name, "undecodable page image, passing through");
            return passthrough(input);
        }
    };

    let needs_resize = preset.needs_resize(width, height);
    let is_jpeg = format == Some(ImageFormat::Jpeg);

    // JPEG already within target: byte-identical copy.
    if is_jpeg && !needs_resize {
        return passthrough(input);
    }

    let decoded = match image::load_from_memory(&input.data) {
        Ok(img) => img,
        Err(err) => {
            warn!(name = %input.name, %err, "page image decode failed, passing through");
            return passthrough(input);
        }
    };

    let resized = if needs_resize {
        decoded.resize(preset.max_width, preset.max_height, FilterType::CatmullRom)
    } else {
        decoded
    };

    let mut encoded = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut encoded), preset.jpeg_quality);
    if let Err(err) = resized.write_with_encoder(encoder) {
        warn!(name = %input.name, %err, "jpeg encode failed, passing through");
        return passthrough(input);
    }

    let name = if is_jpeg {
        input.name
    } else {
        archive::rename_extension(&input.name, "jpg")
    };
    debug!(
        name = %name,
        from = ?(width, height),
        to = ?resized.dimensions(),
        "optimized page image"
    );
    ProcessedImage {
        entry_index: input.entry_index,
        name,
        data: encoded,
    }
}

fn passthrough(input: ImageInput) -> ProcessedImage {
    ProcessedImage {
        entry_index: input.entry_index,
        name: input.name,
        data: input.data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([120, 10, 200]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([40, 90, 10]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .unwrap();
        out
    }

    fn input(index: usize, name: &str, data: Vec<u8>) -> ImageInput {
        ImageInput {
            entry_index: index,
            name: name.to_string(),
            data,
        }
    }

    #[test]
    fn test_large_png_is_scaled_and_renamed() {
        let preset = ImagePreset::default();
        let out = process_images(
            &CancelToken::new(),
            &preset,
            2,
            vec![input(0, "page1.png", png_bytes(2000, 3000))],
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "page1.jpg");
        assert_eq!(
            image::guess_format(&out[0].data).unwrap(),
            ImageFormat::Jpeg
        );
        let img = image::load_from_memory(&out[0].data).unwrap();
        assert_eq!(img.dimensions(), (1120, 1680));
    }

    #[test]
    fn test_small_jpeg_passes_through_byte_identical() {
        let preset = ImagePreset::default();
        let original = jpeg_bytes(800, 1200);
        let out = process_images(
            &CancelToken::new(),
            &preset,
            2,
            vec![input(0, "page2.jpg", original.clone())],
        )
        .unwrap();
        assert_eq!(out[0].name, "page2.jpg");
        assert_eq!(out[0].data, original);
    }

    #[test]
    fn test_small_png_still_converts_to_jpeg() {
        let preset = ImagePreset::default();
        let out = process_images(
            &CancelToken::new(),
            &preset,
            1,
            vec![input(0, "a/b/page.png", png_bytes(100, 150))],
        )
        .unwrap();
        assert_eq!(out[0].name, "a/b/page.jpg");
        assert_eq!(
            image::guess_format(&out[0].data).unwrap(),
            ImageFormat::Jpeg
        );
        let img = image::load_from_memory(&out[0].data).unwrap();
        assert_eq!(img.dimensions(), (100, 150));
    }

    #[test]
    fn test_garbage_passes_through() {
        let preset = ImagePreset::default();
        let out = process_images(
            &CancelToken::new(),
            &preset,
            1,
            vec![input(0, "weird.jpg", vec![1, 2, 3, 4])],
        )
        .unwrap();
        assert_eq!(out[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_cancellation_stops_processing() {
        let preset = ImagePreset::default();
        let token = CancelToken::new();
        token.cancel();
        let err = process_images(
            &token,
            &preset,
            2,
            vec![input(0, "p.png", png_bytes(10, 10))],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
