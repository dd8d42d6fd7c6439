//! Durable cache tier: one JSON file per entry, named by the key digest.
//!
//! # Layout
//!
//! ```text
//! <dir>/<sha256 of RequestKey>.json
//! ```
//!
//! Each file holds the key, status, headers, base64 body, validator, HTTP
//! expiry and the time it was written. The write time bounds storage growth
//! independently of HTTP expiry: files older than `max_age` are misses and
//! are removed by `sweep`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::CacheEntry;
use crate::cache_headers::Validator;
use crate::error::StoreError;
use crate::key::RequestKey;
use crate::store_io;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: RequestKey,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    validator: Option<Validator>,
    expires_at: DateTime<Utc>,
    written_at: DateTime<Utc>,
}

/// On-disk cache tier. Cheap to clone; clones share the directory.
#[derive(Debug, Clone)]
pub struct PersistentCache {
    dir: PathBuf,
    max_age: Duration,
}

impl PersistentCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, max_age: Duration) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir, max_age })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &RequestKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }

    fn is_over_age(&self, written_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.max_age) {
            Ok(max_age) => now - written_at > max_age,
            Err(_) => false,
        }
    }

    /// Load an entry. Missing, unreadable, corrupt and over-age files are
    /// all misses; corrupt and over-age files are deleted.
    pub fn get(&self, key: &RequestKey) -> Option<CacheEntry> {
        let path = self.path_for(key);
        match self.read(&path, key) {
            Ok(found) => found,
            Err(err) => {
                warn!(key = %key, error = %err, "discarding unreadable cache entry");
                if matches!(err, StoreError::Corrupt { .. }) {
                    let _ = fs::remove_file(&path);
                }
                None
            }
        }
    }

    fn read(&self, path: &Path, key: &RequestKey) -> Result<Option<CacheEntry>, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let stored: StoredEntry = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if &stored.key != key {
            // Digest collision or a file copied from elsewhere.
            return Ok(None);
        }
        let now = Utc::now();
        if self.is_over_age(stored.written_at, now) {
            debug!(key = %key, "persistent cache entry past max age");
            let _ = fs::remove_file(path);
            return Ok(None);
        }
        let body = base64::engine::general_purpose::STANDARD
            .decode(stored.body)
            .map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let stale = now >= stored.expires_at;
        Ok(Some(CacheEntry {
            key: stored.key,
            status: stored.status,
            headers: stored.headers,
            body,
            validator: stored.validator,
            expires_at: stored.expires_at,
            stale,
            stored_at: stored.written_at,
        }))
    }

    /// Store an entry atomically.
    pub fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let stored = StoredEntry {
            key: entry.key.clone(),
            status: entry.status,
            headers: entry.headers.clone(),
            body: base64::engine::general_purpose::STANDARD.encode(&entry.body),
            validator: entry.validator.clone(),
            expires_at: entry.expires_at,
            written_at: entry.stored_at,
        };
        let bytes = serde_json::to_vec(&stored)?;
        store_io::write_atomic(&self.path_for(&entry.key), &bytes)?;
        debug!(key = %entry.key, bytes = entry.body.len(), "stored cache entry");
        Ok(())
    }

    /// Whether a file for `key` exists. Does not read or validate it.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.path_for(key).is_file()
    }

    pub fn remove(&self, key: &RequestKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Remove over-age entries, corrupt entries and abandoned temp files.
    /// Returns how many files were deleted.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut removed = 0;
        for path in self.files()? {
            let expired = if store_io::is_temp_file(&path) {
                true
            } else {
                match fs::read(&path)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<StoredEntry>(&bytes).ok())
                {
                    Some(stored) => self.is_over_age(stored.written_at, now),
                    None => true,
                }
            };
            if expired && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "swept persistent cache");
        }
        Ok(removed)
    }

    /// Delete every entry.
    pub fn clear(&self) -> Result<(), StoreError> {
        for path in self.files()? {
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files()
            .map(|files| files.iter().filter(|p| !store_io::is_temp_file(p)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        Ok(entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn create_test_cache() -> (PersistentCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = PersistentCache::open(temp_dir.path().join("cache"), DAY).unwrap();
        (cache, temp_dir)
    }

    fn key(path: &str) -> RequestKey {
        RequestKey::new(HttpMethod::Get, &format!("http://example.com/{path}"), &[], None)
    }

    fn entry(path: &str, expires_in: i64) -> CacheEntry {
        CacheEntry::new(
            key(path),
            200,
            vec![("ETag".to_string(), "\"v1\"".to_string())],
            vec![0, 1, 2, 255],
            Utc::now() + chrono::Duration::seconds(expires_in),
        )
    }

    #[test]
    fn put_then_get_returns_the_entry() {
        let (cache, _dir) = create_test_cache();
        let e = entry("a", 60);
        cache.put(&e).unwrap();

        let loaded = cache.get(&key("a")).unwrap();
        assert_eq!(loaded.body, e.body);
        assert_eq!(loaded.stored_at, e.stored_at);
        assert!(cache.contains(&key("a")));
        assert_eq!(loaded.validator, Some(Validator::Strong("\"v1\"".into())));
        assert!(!loaded.stale);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_load_as_stale() {
        let (cache, _dir) = create_test_cache();
        cache.put(&entry("a", -5)).unwrap();
        assert!(cache.get(&key("a")).unwrap().stale);
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let (cache, _dir) = create_test_cache();
        assert!(cache.get(&key("nothing")).is_none());
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_removed() {
        let (cache, _dir) = create_test_cache();
        let path = cache.path_for(&key("a"));
        fs::write(&path, b"{not json").unwrap();

        assert!(cache.get(&key("a")).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn over_age_entries_are_misses() {
        let temp_dir = TempDir::new().unwrap();
        let cache = PersistentCache::open(temp_dir.path(), Duration::ZERO).unwrap();
        cache.put(&entry("a", 3600)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn sweep_removes_old_and_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let cache = PersistentCache::open(temp_dir.path(), Duration::ZERO).unwrap();
        cache.put(&entry("a", 3600)).unwrap();
        fs::write(temp_dir.path().join("x.json.123.tmp"), b"partial").unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.sweep().unwrap(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_keeps_young_entries() {
        let (cache, _dir) = create_test_cache();
        cache.put(&entry("a", -60)).unwrap();
        assert_eq!(cache.sweep().unwrap(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_and_clear() {
        let (cache, _dir) = create_test_cache();
        cache.put(&entry("a", 60)).unwrap();
        cache.put(&entry("b", 60)).unwrap();
        cache.remove(&key("a")).unwrap();
        cache.remove(&key("a")).unwrap();
        assert!(cache.get(&key("a")).is_none());
        cache.clear().unwrap();
        assert!(cache.is_empty());
    }
}
