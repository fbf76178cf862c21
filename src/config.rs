//! Engine configuration
//!
//! All tunables enter through these structs; the engine holds no global
//! state. The embedding server owns env/file parsing and constructs one
//! `EngineConfig` at startup.

use std::path::PathBuf;

/// Target dimensions and encoding quality for e-reader image optimization.
///
/// The default matches the Kobo Clara/Libra class of devices.
#[derive(Debug, Clone, Copy)]
pub struct ImagePreset {
    /// Maximum page width in pixels
    pub max_width: u32,
    /// Maximum page height in pixels
    pub max_height: u32,
    /// JPEG re-encode quality (1-100)
    pub jpeg_quality: u8,
}

impl Default for ImagePreset {
    fn default() -> Self {
        Self {
            max_width: 1264,
            max_height: 1680,
            jpeg_quality: 85,
        }
    }
}

impl ImagePreset {
    /// Whether an image of the given dimensions needs downscaling.
    pub fn needs_resize(&self, width: u32, height: u32) -> bool {
        width > self.max_width || height > self.max_height
    }

    /// Uniform scale target preserving aspect ratio:
    /// `min(max_width/w, max_height/h)`.
    pub fn scaled_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = f64::min(
            self.max_width as f64 / width as f64,
            self.max_height as f64 / height as f64,
        );
        (
            ((width as f64) * scale).round() as u32,
            ((height as f64) * scale).round() as u32,
        )
    }
}

/// Download cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding derived artifacts (`downloads/` in the data dir)
    pub dir: PathBuf,
    /// Maximum total bytes of cached artifacts
    pub max_bytes: u64,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub image: ImagePreset,
    /// Cap on CBZ image workers; `None` means one per CPU
    pub max_workers: Option<usize>,
}

impl EngineConfig {
    pub fn new(cache: CacheConfig) -> Self {
        Self {
            cache,
            image: ImagePreset::default(),
            max_workers: None,
        }
    }

    /// Worker pool size for processing `n` images:
    /// `min(NumCPU, n)`, further capped by `max_workers`.
    pub fn worker_count(&self, n: usize) -> usize {
        let cpus = num_cpus::get().max(1);
        let cap = self.max_workers.unwrap_or(cpus);
        cpus.min(n).min(cap).max(1)
    }
}
