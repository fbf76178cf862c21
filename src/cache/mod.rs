//! Bounded on-disk download cache
//!
//! Content-addressed store of derived files under a configured directory
//! and byte budget. `get_or_generate` is the single entry point: it
//! fingerprints the request, returns the cached artifact when present,
//! and otherwise coordinates exactly one build per fingerprint with every
//! concurrent caller observing that build's result.
//!
//! The filesystem is the source of truth; the in-memory index is an
//! accelerator rebuilt from directory contents on startup (stale `.tmp`
//! files from a crash are unlinked, finished artifacts are enrolled with
//! their mtime as last access).

mod filename;
mod fingerprint;

pub use filename::download_filename;
pub use fingerprint::Fingerprint;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::generate::{generator_for, CancelToken};
use crate::model::{Book, BookFile, Variant};

/// A served download: local artifact path, stable download name, MIME type
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub filename: String,
    pub mime_type: &'static str,
    pub fingerprint: Fingerprint,
}

/// Index entry for one cached artifact
#[derive(Debug, Clone)]
struct ArtifactEntry {
    path: PathBuf,
    size: u64,
    last_access: SystemTime,
    /// Held while an open download is streaming; never evicted above zero
    ref_count: u32,
    /// Source file id, for invalidation. `None` for artifacts enrolled by
    /// crash recovery (the id is not recoverable from the filename); those
    /// age out through normal eviction instead.
    file_id: Option<i64>,
}

#[derive(Default)]
struct CacheIndex {
    entries: HashMap<Fingerprint, ArtifactEntry>,
    total_bytes: u64,
}

type BuildFuture = Shared<BoxFuture<'static, std::result::Result<(), EngineError>>>;

/// Cache statistics snapshot
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub artifact_count: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
}

/// The download cache
#[derive(Clone)]
pub struct DownloadCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: EngineConfig,
    index: Mutex<CacheIndex>,
    /// Per-fingerprint build leases; entries exist only while a build is
    /// in flight. Acquired while holding no other lock.
    in_flight: Mutex<HashMap<Fingerprint, BuildFuture>>,
    build_invocations: AtomicU64,
}

impl DownloadCache {
    /// Open (or create) the cache directory and rebuild the index from
    /// its contents.
    pub fn new(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.cache.dir).map_err(|e| {
            EngineError::Internal(format!(
                "cannot create cache dir {}: {e}",
                config.cache.dir.display()
            ))
        })?;

        let mut index = CacheIndex::default();
        let dir_entries = std::fs::read_dir(&config.cache.dir).map_err(|e| {
            EngineError::Internal(format!(
                "cannot read cache dir {}: {e}",
                config.cache.dir.display()
            ))
        })?;
        let mut removed_tmp = 0usize;
        for dir_entry in dir_entries.flatten() {
            let path = dir_entry.path();
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), %err, "cannot remove stale temp file");
                } else {
                    removed_tmp += 1;
                }
                continue;
            }
            let Some(fp) = name.split('.').next().and_then(Fingerprint::parse) else {
                debug!(path = %path.display(), "foreign file in cache dir, ignoring");
                continue;
            };
            let Ok(metadata) = dir_entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let size = metadata.len();
            index.entries.insert(
                fp,
                ArtifactEntry {
                    path,
                    size,
                    last_access: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    ref_count: 0,
                    file_id: None,
                },
            );
            index.total_bytes += size;
        }
        info!(
            artifacts = index.entries.len(),
            bytes = index.total_bytes,
            removed_tmp,
            dir = %config.cache.dir.display(),
            "download cache recovered"
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                index: Mutex::new(index),
                in_flight: Mutex::new(HashMap::new()),
                build_invocations: AtomicU64::new(0),
            }),
        })
    }

    /// Serve a derived file, generating and caching it if needed.
    ///
    /// Increments the artifact's ref-count; callers release it via
    /// [`release`](Self::release) once the download stream completes.
    pub async fn get_or_generate(
        &self,
        cancel: &CancelToken,
        book: &Book,
        file: &BookFile,
        variant: Variant,
    ) -> Result<Download> {
        let metadata = tokio::fs::metadata(&file.filepath)
            .await
            .map_err(|e| EngineError::source_io(&file.filepath, file.format, e))?;
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let fp = Fingerprint::compute(book, file, variant, mtime, metadata.len());

        let download = Download {
            path: self.inner.artifact_path(fp, variant, file),
            filename: download_filename(book, file, variant),
            mime_type: variant.mime_type(file.format),
            fingerprint: fp,
        };

        // Fast path: cached and on disk.
        if self.inner.try_acquire(fp) {
            debug!(fingerprint = %fp, "cache hit");
            return Ok(download);
        }

        // Single flight: join the in-flight build or start one.
        let build = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&fp) {
                Some(existing) => existing.clone(),
                None => {
                    let inner = self.inner.clone();
                    let cancel = cancel.clone();
                    let book = book.clone();
                    let file = file.clone();
                    let fut: BuildFuture =
                        async move { CacheInner::build(inner, cancel, book, file, variant, fp).await }
                            .boxed()
                            .shared();
                    in_flight.insert(fp, fut.clone());
                    fut
                }
            }
        };
        let result = build.await;
        self.inner.in_flight.lock().remove(&fp);
        result?;

        if !self.inner.try_acquire(fp) {
            // Evicted in the window between publish and acquisition; a
            // retry would rebuild, but surfacing is the honest outcome.
            return Err(EngineError::Internal(
                "artifact evicted before acquisition".into(),
            ));
        }
        Ok(download)
    }

    /// Release a reference taken by `get_or_generate`.
    pub fn release(&self, fingerprint: Fingerprint) {
        let mut index = self.inner.index.lock();
        if let Some(entry) = index.entries.get_mut(&fingerprint) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Drop every cached artifact derived from the given file id.
    pub fn invalidate(&self, file_id: i64) {
        let removed: Vec<(Fingerprint, PathBuf)> = {
            let mut index = self.inner.index.lock();
            let victims: Vec<Fingerprint> = index
                .entries
                .iter()
                .filter(|(_, e)| e.file_id == Some(file_id))
                .map(|(fp, _)| *fp)
                .collect();
            victims
                .into_iter()
                .filter_map(|fp| {
                    index.entries.remove(&fp).map(|entry| {
                        index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                        (fp, entry.path)
                    })
                })
                .collect()
        };
        for (fp, path) in &removed {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(fingerprint = %fp, %err, "cannot remove invalidated artifact");
            }
        }
        if !removed.is_empty() {
            info!(file_id, count = removed.len(), "invalidated cached artifacts");
        }
    }

    /// Enforce the byte budget by evicting least-recently-accessed
    /// artifacts with zero ref-count.
    pub async fn prune(&self) {
        let inner = self.inner.clone();
        let _ = tokio::task::spawn_blocking(move || inner.prune_now()).await;
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.inner.index.lock();
        CacheStats {
            artifact_count: index.entries.len(),
            total_bytes: index.total_bytes,
            budget_bytes: self.inner.config.cache.max_bytes,
        }
    }

    #[cfg(test)]
    fn ref_count(&self, fingerprint: Fingerprint) -> Option<u32> {
        self.inner
            .index
            .lock()
            .entries
            .get(&fingerprint)
            .map(|e| e.ref_count)
    }

    #[cfg(test)]
    fn build_invocations(&self) -> u64 {
        self.inner.build_invocations.load(Ordering::Relaxed)
    }
}

impl CacheInner {
    fn artifact_path(&self, fp: Fingerprint, variant: Variant, file: &BookFile) -> PathBuf {
        self.config
            .cache
            .dir
            .join(format!("{fp}.{}", variant.artifact_extension(file.format)))
    }

    /// Bump last-access and take a reference if the artifact is cached
    /// and still on disk. Stale index entries (file gone) are dropped.
    fn try_acquire(&self, fp: Fingerprint) -> bool {
        let mut index = self.index.lock();
        let Some(entry) = index.entries.get_mut(&fp) else {
            return false;
        };
        if !entry.path.exists() {
            let size = entry.size;
            index.entries.remove(&fp);
            index.total_bytes = index.total_bytes.saturating_sub(size);
            return false;
        }
        entry.last_access = SystemTime::now();
        entry.ref_count += 1;
        true
    }

    /// The build half of `get_or_generate`; at most one runs per
    /// fingerprint, and all coalesced callers see its result.
    async fn build(
        inner: Arc<Self>,
        cancel: CancelToken,
        book: Book,
        file: BookFile,
        variant: Variant,
        fp: Fingerprint,
    ) -> std::result::Result<(), EngineError> {
        // Re-check under the lease: another builder may have published
        // while this caller was waiting.
        {
            let index = inner.index.lock();
            if let Some(entry) = index.entries.get(&fp) {
                if entry.path.exists() {
                    return Ok(());
                }
            }
        }

        let generator = generator_for(file.format, variant, &inner.config)?;
        inner.build_invocations.fetch_add(1, Ordering::Relaxed);

        let final_path = inner.artifact_path(fp, variant, &file);
        let build_dest = PathBuf::from(format!("{}.tmp", final_path.display()));
        debug!(fingerprint = %fp, dest = %final_path.display(), "building artifact");

        if let Err(err) = generator
            .generate(&cancel, &file.filepath, &build_dest, &book, &file)
            .await
        {
            let _ = std::fs::remove_file(&build_dest);
            return Err(err);
        }

        if let Err(err) = std::fs::rename(&build_dest, &final_path) {
            let _ = std::fs::remove_file(&build_dest);
            return Err(EngineError::writer_cause(
                &final_path,
                file.format,
                "publish rename failed",
                err,
            ));
        }
        let size = std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);

        let over_budget = {
            let mut index = inner.index.lock();
            // Budget check against what eviction can never reclaim: if the
            // new artifact plus every pinned artifact exceeds the budget,
            // evicting everything evictable still cannot make it fit.
            let pinned: u64 = index
                .entries
                .values()
                .filter(|e| e.ref_count > 0)
                .map(|e| e.size)
                .sum();
            if size + pinned > inner.config.cache.max_bytes {
                drop(index);
                let _ = std::fs::remove_file(&final_path);
                return Err(EngineError::CacheFull {
                    needed: size,
                    budget: inner.config.cache.max_bytes,
                });
            }
            if let Some(old) = index.entries.insert(
                fp,
                ArtifactEntry {
                    path: final_path.clone(),
                    size,
                    last_access: SystemTime::now(),
                    ref_count: 0,
                    file_id: Some(file.id),
                },
            ) {
                index.total_bytes = index.total_bytes.saturating_sub(old.size);
            }
            index.total_bytes += size;
            index.total_bytes > inner.config.cache.max_bytes
        };
        info!(fingerprint = %fp, size, "artifact generated");

        // Eviction runs off the caller's path.
        if over_budget {
            let background = inner.clone();
            tokio::spawn(async move {
                let _ = tokio::task::spawn_blocking(move || background.prune_now()).await;
            });
        }
        Ok(())
    }

    /// Evict refcount-zero artifacts in ascending last-access order until
    /// the total is within budget. Pinned artifacts are skipped and
    /// retried on the next prune.
    fn prune_now(&self) {
        let victims: Vec<(Fingerprint, PathBuf)> = {
            let mut index = self.index.lock();
            if index.total_bytes <= self.config.cache.max_bytes {
                return;
            }
            let mut candidates: Vec<(Fingerprint, SystemTime, u64)> = index
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .map(|(fp, e)| (*fp, e.last_access, e.size))
                .collect();
            candidates.sort_by_key(|(_, last_access, _)| *last_access);

            let mut projected = index.total_bytes;
            let mut chosen = Vec::new();
            for (fp, _, size) in candidates {
                if projected <= self.config.cache.max_bytes {
                    break;
                }
                projected = projected.saturating_sub(size);
                chosen.push(fp);
            }

            chosen
                .into_iter()
                .filter_map(|fp| {
                    index.entries.remove(&fp).map(|entry| {
                        index.total_bytes = index.total_bytes.saturating_sub(entry.size);
                        (fp, entry.path)
                    })
                })
                .collect()
        };

        for (fp, path) in &victims {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(fingerprint = %fp, %err, "eviction unlink failed");
            } else {
                debug!(fingerprint = %fp, "evicted artifact");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::formats::epub::test_fixtures::{build_epub, EpubFixture};
    use crate::model::{Author, FileFormat, FileRole};
    use std::path::Path;
    use std::time::Duration;

    fn test_book(dir: &Path, title: &str) -> Book {
        Book {
            id: 1,
            title: title.into(),
            subtitle: None,
            description: None,
            filepath: dir.to_path_buf(),
            authors: vec![Author::new("Author")],
            series: vec![],
            genres: vec![],
            tags: vec![],
        }
    }

    fn test_file(src: &Path) -> BookFile {
        BookFile {
            id: 11,
            book_id: 1,
            filepath: src.to_path_buf(),
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
        }
    }

    fn cache_at(dir: &Path, budget: u64) -> DownloadCache {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let config = EngineConfig::new(CacheConfig::new(dir.join("downloads"), budget));
        DownloadCache::new(config).unwrap()
    }

    fn write_source_epub(dir: &Path) -> PathBuf {
        let src = dir.join("book.epub");
        std::fs::write(&src, build_epub(&EpubFixture::default())).unwrap();
        src
    }

    #[tokio::test]
    async fn test_generate_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source_epub(dir.path());
        let cache = cache_at(dir.path(), 10 << 20);
        let book = test_book(dir.path(), "Cache Me");
        let file = test_file(&src);

        let first = cache
            .get_or_generate(&CancelToken::new(), &book, &file, Variant::Identity)
            .await
            .unwrap();
        assert!(first.path.exists());
        assert_eq!(first.mime_type, "application/epub+zip");
        assert_eq!(cache.build_invocations(), 1);

        let second = cache
            .get_or_generate(&CancelToken::new(), &book, &file, Variant::Identity)
            .await
            .unwrap();
        assert_eq!(first.path, second.path);
        // Second call was a cache hit.
        assert_eq!(cache.build_invocations(), 1);
        assert_eq!(cache.ref_count(first.fingerprint), Some(2));

        cache.release(first.fingerprint);
        cache.release(second.fingerprint);
        assert_eq!(cache.ref_count(first.fingerprint), Some(0));
    }

    #[tokio::test]
    async fn test_single_flight_many_concurrent_callers() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source_epub(dir.path());
        let cache = cache_at(dir.path(), 10 << 20);
        let book = test_book(dir.path(), "Contended");
        let file = test_file(&src);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = cache.clone();
            let book = book.clone();
            let file = file.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_generate(&CancelToken::new(), &book, &file, Variant::Identity)
                    .await
                    .unwrap()
            }));
        }
        let mut paths = Vec::new();
        let mut fingerprint = None;
        for handle in handles {
            let download = handle.await.unwrap();
            fingerprint = Some(download.fingerprint);
            paths.push(download.path);
        }
        paths.dedup();
        assert_eq!(paths.len(), 1);
        assert_eq!(cache.build_invocations(), 1);
        // Every caller still holds a reference.
        assert_eq!(cache.ref_count(fingerprint.unwrap()), Some(100));
    }

    #[tokio::test]
    async fn test_kepub_for_m4b_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.m4b");
        std::fs::write(&src, b"irrelevant").unwrap();
        let cache = cache_at(dir.path(), 10 << 20);
        let book = test_book(dir.path(), "Audio");
        let mut file = test_file(&src);
        file.format = FileFormat::M4b;

        let err = cache
            .get_or_generate(&CancelToken::new(), &book, &file, Variant::Kepub)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::KepubNotSupported {
                format: FileFormat::M4b
            }
        ));
        assert_eq!(cache.build_invocations(), 0);
    }

    #[tokio::test]
    async fn test_failed_build_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("broken.epub");
        std::fs::write(&src, b"not a zip").unwrap();
        let cache = cache_at(dir.path(), 10 << 20);
        let book = test_book(dir.path(), "Broken");
        let file = test_file(&src);

        let err = cache
            .get_or_generate(&CancelToken::new(), &book, &file, Variant::Identity)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceCorrupt { .. }));

        // Repair the source and retry with the same book/file identity.
        std::fs::write(&src, build_epub(&EpubFixture::default())).unwrap();
        let download = cache
            .get_or_generate(&CancelToken::new(), &book, &file, Variant::Identity)
            .await
            .unwrap();
        assert!(download.path.exists());
    }

    #[tokio::test]
    async fn test_eviction_is_lru_over_unpinned() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 100);
        let downloads = dir.path().join("downloads");

        // Hand-placed artifacts: 30 entries of 10 bytes, distinct ages.
        {
            let mut index = cache.inner.index.lock();
            for i in 0..30u64 {
                let fp = Fingerprint::parse(&format!("{i:032x}")).unwrap();
                let path = downloads.join(format!("{fp}.epub"));
                std::fs::write(&path, vec![0u8; 10]).unwrap();
                index.entries.insert(
                    fp,
                    ArtifactEntry {
                        path,
                        size: 10,
                        last_access: SystemTime::UNIX_EPOCH + Duration::from_secs(i),
                        ref_count: 0,
                        file_id: None,
                    },
                );
                index.total_bytes += 10;
            }
        }

        cache.prune().await;

        let index = cache.inner.index.lock();
        assert_eq!(index.entries.len(), 10);
        assert_eq!(index.total_bytes, 100);
        // The 20 oldest are gone; the newest (ages 20..30) survive.
        for i in 0..20u64 {
            let fp = Fingerprint::parse(&format!("{i:032x}")).unwrap();
            assert!(!index.entries.contains_key(&fp), "age {i} should be evicted");
            assert!(!downloads.join(format!("{fp}.epub")).exists());
        }
        for i in 20..30u64 {
            let fp = Fingerprint::parse(&format!("{i:032x}")).unwrap();
            assert!(index.entries.contains_key(&fp), "age {i} should survive");
        }
    }

    #[tokio::test]
    async fn test_pinned_artifacts_never_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 10);
        let downloads = dir.path().join("downloads");

        {
            let mut index = cache.inner.index.lock();
            for (i, ref_count) in [(0u64, 1u32), (1, 0)] {
                let fp = Fingerprint::parse(&format!("{i:032x}")).unwrap();
                let path = downloads.join(format!("{fp}.epub"));
                std::fs::write(&path, vec![0u8; 10]).unwrap();
                index.entries.insert(
                    fp,
                    ArtifactEntry {
                        path,
                        size: 10,
                        last_access: SystemTime::UNIX_EPOCH + Duration::from_secs(i),
                        ref_count,
                        file_id: None,
                    },
                );
                index.total_bytes += 10;
            }
        }

        cache.prune().await;

        let index = cache.inner.index.lock();
        // The pinned, older artifact survives; the unpinned one went.
        let pinned = Fingerprint::parse(&format!("{:032x}", 0u64)).unwrap();
        let unpinned = Fingerprint::parse(&format!("{:032x}", 1u64)).unwrap();
        assert!(index.entries.contains_key(&pinned));
        assert!(!index.entries.contains_key(&unpinned));
    }

    #[tokio::test]
    async fn test_cache_full_when_nothing_can_fit() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source_epub(dir.path());
        // Budget below any realistic artifact size.
        let cache = cache_at(dir.path(), 16);
        let book = test_book(dir.path(), "Too Big");
        let file = test_file(&src);

        let err = cache
            .get_or_generate(&CancelToken::new(), &book, &file, Variant::Identity)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CacheFull { .. }));
        // Nothing lingers on disk.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("downloads"))
            .unwrap()
            .flatten()
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_invalidate_removes_artifacts_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source_epub(dir.path());
        let cache = cache_at(dir.path(), 10 << 20);
        let book = test_book(dir.path(), "Invalidate Me");
        let file = test_file(&src);

        let download = cache
            .get_or_generate(&CancelToken::new(), &book, &file, Variant::Identity)
            .await
            .unwrap();
        assert!(download.path.exists());

        cache.invalidate(file.id);
        assert!(!download.path.exists());
        assert_eq!(cache.stats().artifact_count, 0);
    }

    #[tokio::test]
    async fn test_crash_recovery_cleans_tmp_and_enrolls_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();

        let fp = Fingerprint::parse(&format!("{:032x}", 7u64)).unwrap();
        std::fs::write(downloads.join(format!("{fp}.epub")), vec![0u8; 64]).unwrap();
        std::fs::write(downloads.join("deadbeef.epub.tmp"), b"partial").unwrap();
        std::fs::write(downloads.join("notes.txt"), b"foreign").unwrap();

        let cache = cache_at(dir.path(), 10 << 20);

        assert!(!downloads.join("deadbeef.epub.tmp").exists());
        let stats = cache.stats();
        assert_eq!(stats.artifact_count, 1);
        assert_eq!(stats.total_bytes, 64);
        assert_eq!(cache.ref_count(fp), Some(0));
    }
}
