//! Content-addressed conversion cache.
//!
//! ## Why digest, not path + mtime?
//!
//! A renamed or copied file with identical bytes should hit; a file edited in
//! place with a restored mtime must miss. Keying on a SHA-256 of the full
//! content gives both. The schema version is part of the key so a change to
//! the result layout invalidates old entries instead of misreading them.
//!
//! ## Durability
//!
//! Each entry is one JSON file named after its digest, written to a temp file
//! in the same directory and renamed into place. Readers never observe a
//! half-written entry, and concurrent writers of the same digest converge on
//! equal content. Any persistence failure is logged and swallowed: the cache
//! is an optimisation, never a reason to fail a conversion.

use crate::output::ConversionResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Bumped whenever [`ConversionResult`]'s persisted shape or the pipeline's
/// output format changes.
pub const CACHE_SCHEMA_VERSION: u32 = 3;

const ENTRY_SUFFIX: &str = ".json";

/// Hex-encoded SHA-256 of a file's full content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Hash a file in 64 KiB chunks. Blocking.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// On-disk cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub digest: ContentDigest,
    pub schema_version: u32,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub result: ConversionResult,
}

/// Entry count and total size of a cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Digest-keyed store of previous conversion results.
#[derive(Debug, Clone)]
pub struct ConversionCache {
    dir: PathBuf,
    schema_version: u32,
}

impl ConversionCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_schema_version(dir, CACHE_SCHEMA_VERSION)
    }

    pub fn with_schema_version(dir: impl Into<PathBuf>, schema_version: u32) -> Self {
        Self {
            dir: dir.into(),
            schema_version,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, digest: &ContentDigest) -> PathBuf {
        self.dir.join(format!("{}{ENTRY_SUFFIX}", digest.as_str()))
    }

    /// Return the stored result for `digest`, or `None` on a miss.
    ///
    /// Unreadable, foreign-schema and mismatched-key entries are all misses.
    pub fn lookup(&self, digest: &ContentDigest) -> Option<ConversionResult> {
        let path = self.entry_path(digest);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache entry unreadable");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache entry corrupt; ignoring");
                return None;
            }
        };
        if entry.schema_version != self.schema_version {
            debug!(
                digest = %digest,
                stored = entry.schema_version,
                current = self.schema_version,
                "cache entry from another schema version"
            );
            return None;
        }
        if &entry.digest != digest {
            warn!(path = %path.display(), "cache entry key mismatch; ignoring");
            return None;
        }
        Some(entry.result)
    }

    /// Persist `result` under `digest`.
    ///
    /// Idempotent: an existing entry with the same schema and content is left
    /// untouched. Returns whether an entry was written. Never fails; errors
    /// are logged.
    pub fn store(&self, digest: &ContentDigest, result: &ConversionResult) -> bool {
        if let Some(existing) = self.lookup(digest) {
            if same_content(&existing, result) {
                debug!(digest = %digest, "cache entry already current");
                return false;
            }
        }

        let entry = CacheEntry {
            digest: digest.clone(),
            schema_version: self.schema_version,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            result: result.clone(),
        };

        match self.write_atomic(digest, &entry) {
            Ok(()) => true,
            Err(e) => {
                warn!(digest = %digest, dir = %self.dir.display(), error = %e, "failed to persist cache entry");
                false
            }
        }
    }

    fn write_atomic(&self, digest: &ContentDigest, entry: &CacheEntry) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".entry-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.entry_path(digest))
            .map_err(|e| e.error)?;
        Ok(())
    }

    /// Count entries and bytes.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for (_, len) in self.entries() {
            stats.entries += 1;
            stats.total_bytes += len;
        }
        stats
    }

    /// Remove every entry. Returns how many were deleted.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for (path, _) in self.entries() {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cache entry"),
            }
        }
        removed
    }

    fn entries(&self) -> Vec<(PathBuf, u64)> {
        let Ok(read_dir) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        read_dir
            .filter_map(Result::ok)
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                !name.starts_with('.') && name.ends_with(ENTRY_SUFFIX)
            })
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                meta.is_file().then(|| (e.path(), meta.len()))
            })
            .collect()
    }
}

/// Equality ignoring per-request fields.
fn same_content(a: &ConversionResult, b: &ConversionResult) -> bool {
    a.content == b.content && a.format == b.format && a.failures == b.failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detect::FormatTag;

    fn result(content: &str) -> ConversionResult {
        ConversionResult {
            content: content.into(),
            format: FormatTag::Markdown,
            source_path: "notes.md".into(),
            trace_id: "t1".into(),
            failures: vec![],
            page_count: 1,
            ocr: false,
            from_cache: false,
        }
    }

    #[test]
    fn digest_depends_on_bytes_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.md");
        let b = dir.path().join("renamed.md");
        std::fs::write(&a, "same").unwrap();
        std::fs::write(&b, "same").unwrap();
        assert_eq!(
            ContentDigest::of_file(&a).unwrap(),
            ContentDigest::of_file(&b).unwrap()
        );
        assert_eq!(ContentDigest::of_file(&a).unwrap(), ContentDigest::of_bytes(b"same"));
        assert_ne!(ContentDigest::of_bytes(b"same"), ContentDigest::of_bytes(b"diff"));
    }

    #[test]
    fn store_then_lookup_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversionCache::new(dir.path());
        let d = ContentDigest::of_bytes(b"x");
        assert!(cache.lookup(&d).is_none());
        assert!(cache.store(&d, &result("hello\n")));
        assert_eq!(cache.lookup(&d).unwrap().content, "hello\n");
    }

    #[test]
    fn store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversionCache::new(dir.path());
        let d = ContentDigest::of_bytes(b"x");
        assert!(cache.store(&d, &result("hello\n")));
        let mut again = result("hello\n");
        again.trace_id = "other".into();
        assert!(!cache.store(&d, &again));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn schema_change_invalidates_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let d = ContentDigest::of_bytes(b"x");
        let old = ConversionCache::with_schema_version(dir.path(), 1);
        assert!(old.store(&d, &result("v1")));

        let new = ConversionCache::with_schema_version(dir.path(), 2);
        assert!(new.lookup(&d).is_none());
        assert!(new.store(&d, &result("v2")));
        assert_eq!(new.lookup(&d).unwrap().content, "v2");
        assert!(old.lookup(&d).is_none());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversionCache::new(dir.path());
        let d = ContentDigest::of_bytes(b"x");
        std::fs::write(dir.path().join(format!("{d}.json")), b"{not json").unwrap();
        assert!(cache.lookup(&d).is_none());
        assert!(cache.store(&d, &result("fixed")));
        assert_eq!(cache.lookup(&d).unwrap().content, "fixed");
    }

    #[test]
    fn entry_under_wrong_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversionCache::new(dir.path());
        let real = ContentDigest::of_bytes(b"real");
        let other = ContentDigest::of_bytes(b"other");
        cache.store(&real, &result("real"));
        std::fs::rename(
            dir.path().join(format!("{real}.json")),
            dir.path().join(format!("{other}.json")),
        )
        .unwrap();
        assert!(cache.lookup(&other).is_none());
    }

    #[test]
    fn unwritable_dir_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let cache = ConversionCache::new(blocker.join("cache"));
        let d = ContentDigest::of_bytes(b"x");
        assert!(!cache.store(&d, &result("lost")));
        assert!(cache.lookup(&d).is_none());
    }

    #[test]
    fn stats_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversionCache::new(dir.path());
        cache.store(&ContentDigest::of_bytes(b"1"), &result("one"));
        cache.store(&ContentDigest::of_bytes(b"2"), &result("two"));
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert!(stats.total_bytes > 0);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
