//! Shisho file-format engine
//!
//! The derived-file core of the Shisho book/audiobook server: parsers and
//! writers for EPUB, CBZ, and M4B containers, the Kobo KePub converters,
//! and the bounded on-disk cache that coordinates generation of derived
//! downloads. The HTTP/OPDS layer, the relational catalog, and the
//! library scanner live elsewhere and talk to this crate through
//! [`DownloadCache::get_or_generate`](cache::DownloadCache::get_or_generate)
//! and [`formats::parse`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    DownloadCache                       │
//! │  (fingerprints, single-flight builds, LRU eviction)    │
//! └────────────────────────────────────────────────────────┘
//!                           │ Generator
//!        ┌───────────┬──────┴──────┬──────────────┐
//!        ▼           ▼             ▼              ▼
//!  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌─────────────┐
//!  │   EPUB   │ │   CBZ    │ │   M4B    │ │    KePub    │
//!  │ writer   │ │ writer   │ │ writer   │ │ converters  │
//!  └──────────┘ └──────────┘ └──────────┘ └─────────────┘
//!        │           │             │              │
//!        └─────┬─────┴───────┬─────┴──────────────┘
//!              ▼             ▼
//!       ┌────────────┐ ┌────────────┐
//!       │  archive   │ │    mp4     │
//!       │ (zip I/O)  │ │ (box I/O)  │
//!       └────────────┘ └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use shisho_engine::cache::DownloadCache;
//! use shisho_engine::config::{CacheConfig, EngineConfig};
//! use shisho_engine::generate::CancelToken;
//! use shisho_engine::model::Variant;
//!
//! let config = EngineConfig::new(CacheConfig::new("/data/downloads", 10 << 30));
//! let cache = DownloadCache::new(config)?;
//!
//! let download = cache
//!     .get_or_generate(&CancelToken::new(), &book, &file, Variant::Kepub)
//!     .await?;
//! // serve download.path as download.filename with download.mime_type,
//! // then: cache.release(download.fingerprint);
//! ```

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod formats;
pub mod generate;
pub mod model;
pub mod mp4;

pub use cache::{Download, DownloadCache, Fingerprint};
pub use config::{CacheConfig, EngineConfig, ImagePreset};
pub use error::{EngineError, Result};
pub use generate::{CancelToken, Generator};
pub use model::{Book, BookFile, FileFormat, ParsedMetadata, Variant};
