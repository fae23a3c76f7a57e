use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, error, trace, warn};

use super::codec::{EntryHeader, Reader};
use super::{Cache, CacheEntry};

pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Eviction runs until usage drops below this fraction of the cap, so that
/// a put near the boundary does not evict on every call.
const HYSTERESIS_FACTOR: f64 = 0.9;

/// One file per key under a root directory, with an in-memory index ordered
/// by access for LRU eviction and a running byte total.
///
/// Filenames are derived from two independent hashes of the key, so distinct
/// keys can collide on one file; the mismatch is detected when the file is
/// read back and treated as corruption. Access must be serialized through
/// the dispatch layer.
pub struct DiskBasedCache {
    root: PathBuf,
    max_bytes: u64,
    state: Mutex<IndexState>,
}

#[derive(Debug)]
struct IndexState {
    /// key -> entry metadata, iteration-ordered by access.
    entries: LruCache<String, HeaderRecord>,
    total_bytes: u64,
}

#[derive(Debug, Clone)]
struct HeaderRecord {
    header: EntryHeader,
    size: u64,
}

impl DiskBasedCache {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
            state: Mutex::new(IndexState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for_key(&self, key: &str) -> PathBuf {
        self.root.join(filename_for_key(key))
    }

    /// Records a key in the index, adjusting the byte total for replacement.
    fn record(&self, key: &str, header: EntryHeader, size: u64) {
        let mut state = self.state.lock();
        match state.entries.put(key.to_string(), HeaderRecord { header, size }) {
            Some(previous) => {
                state.total_bytes = state.total_bytes.saturating_sub(previous.size) + size;
            }
            None => state.total_bytes += size,
        }
    }

    fn drop_record(&self, key: &str) -> Option<u64> {
        let mut state = self.state.lock();
        let removed = state.entries.pop(key)?;
        state.total_bytes = state.total_bytes.saturating_sub(removed.size);
        Some(removed.size)
    }

    /// Evicts oldest-accessed entries until `needed` more bytes fit with
    /// margin under the cap. No-op while there is room.
    async fn prune_if_needed(&self, needed: u64) {
        let victims = {
            let mut state = self.state.lock();
            if state.total_bytes + needed < self.max_bytes {
                return;
            }
            let before = state.total_bytes;
            let watermark = self.max_bytes as f64 * HYSTERESIS_FACTOR;
            let mut victims = Vec::new();
            while let Some((key, record)) = state.entries.pop_lru() {
                state.total_bytes = state.total_bytes.saturating_sub(record.size);
                victims.push(key);
                if ((state.total_bytes + needed) as f64) < watermark {
                    break;
                }
            }
            debug!(
                pruned = victims.len(),
                reclaimed = before - state.total_bytes,
                "pruned cache entries"
            );
            victims
        };
        for key in victims {
            let path = self.file_for_key(&key);
            if let Err(err) = fs::remove_file(&path).await {
                debug!(key = %key, error = %err, "could not delete pruned cache file");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[async_trait]
impl Cache for DiskBasedCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        // The index is the authority for existence; the lookup also bumps
        // the entry's access order.
        let record = self.state.lock().entries.get(key).cloned()?;

        let path = self.file_for_key(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(key, path = %path.display(), error = %err, "cache file unreadable");
                self.remove(key).await;
                return None;
            }
        };

        let mut reader = Reader::new(&bytes);
        let on_disk = match EntryHeader::read(&mut reader) {
            Ok(header) => header,
            Err(err) => {
                debug!(key, error = %err, "corrupt cache file, evicting");
                self.remove(key).await;
                return None;
            }
        };

        if on_disk.key != key {
            // Filename collision: the file now belongs to another key. Only
            // the index entry for this key is stale.
            debug!(key, found = %on_disk.key, "cache filename collision");
            self.drop_record(key);
            return None;
        }

        let data = Bytes::copy_from_slice(reader.read_remaining());
        Some(record.header.into_entry(data))
    }

    async fn put(&self, key: &str, entry: CacheEntry) {
        self.prune_if_needed(entry.data.len() as u64).await;

        let path = self.file_for_key(key);
        let header = EntryHeader::from_entry(key, &entry);
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        buf.extend_from_slice(&entry.data);

        if let Err(err) = fs::write(&path, &buf).await {
            warn!(key, path = %path.display(), error = %err, "cache write failed, dropping entry");
            if let Err(err) = fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %err, "could not clean up partial cache file");
            }
            return;
        }

        self.record(key, header, entry.data.len() as u64);
        trace!(key, bytes = entry.data.len(), "cache entry written");
    }

    async fn initialize(&self) {
        if fs::metadata(&self.root).await.is_err() {
            if let Err(err) = fs::create_dir_all(&self.root).await {
                error!(root = %self.root.display(), error = %err, "unable to create cache directory");
            }
            // A directory that did not exist has nothing to scan.
            return;
        }

        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) => {
                error!(root = %self.root.display(), error = %err, "unable to scan cache directory");
                return;
            }
        };

        loop {
            let dirent = match dir.next_entry().await {
                Ok(Some(dirent)) => dirent,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "cache scan aborted");
                    break;
                }
            };
            let path = dirent.path();
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "unreadable cache file, removing");
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
            };
            let size = bytes.len() as u64;
            match EntryHeader::read(&mut Reader::new(&bytes)) {
                Ok(header) => {
                    let key = header.key.clone();
                    self.record(&key, header, size);
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "undecodable cache file, removing");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }

        let state = self.state.lock();
        debug!(
            entries = state.entries.len(),
            bytes = state.total_bytes,
            "cache index rebuilt"
        );
    }

    async fn invalidate(&self, key: &str, full_expire: bool) {
        if let Some(mut entry) = self.get(key).await {
            entry.soft_ttl = 0;
            if full_expire {
                entry.ttl = 0;
            }
            self.put(key, entry).await;
        }
    }

    async fn remove(&self, key: &str) {
        let path = self.file_for_key(key);
        if let Err(err) = fs::remove_file(&path).await {
            debug!(key, path = %path.display(), error = %err, "could not delete cache file");
        }
        self.drop_record(key);
    }

    async fn clear(&self) {
        if let Ok(mut dir) = fs::read_dir(&self.root).await {
            while let Ok(Some(dirent)) = dir.next_entry().await {
                let _ = fs::remove_file(dirent.path()).await;
            }
        }
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_bytes = 0;
        debug!("cache cleared");
    }
}

/// Pseudo-random filename for a key: the decimal hashes of the key's two
/// halves, concatenated. Collisions are possible and resolved lazily when
/// the file is read back.
fn filename_for_key(key: &str) -> String {
    let bytes = key.as_bytes();
    let (first, second) = bytes.split_at(bytes.len() / 2);
    format!("{}{}", half_hash(first), half_hash(second))
}

fn half_hash(half: &[u8]) -> u32 {
    half.iter()
        .fold(0u32, |hash, byte| hash.wrapping_mul(31).wrapping_add(*byte as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Header;
    use tempfile::TempDir;

    fn entry(data: &[u8], ttl: i64) -> CacheEntry {
        CacheEntry {
            data: Bytes::copy_from_slice(data),
            etag: Some("\"tag\"".to_string()),
            server_date: 1_700_000_000_000,
            last_modified: 1_690_000_000_000,
            ttl,
            soft_ttl: ttl,
            headers: vec![Header::new("Content-Type", "text/plain")],
        }
    }

    fn far_future() -> i64 {
        super::super::epoch_millis() + 3_600_000
    }

    #[tokio::test]
    async fn round_trips_data_and_metadata() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;

        let stored = entry(b"hello world", far_future());
        cache.put("http://example.com/a", stored.clone()).await;

        let loaded = cache.get("http://example.com/a").await.unwrap();
        assert_eq!(loaded.data, stored.data);
        assert_eq!(loaded.etag, stored.etag);
        assert_eq!(loaded.server_date, stored.server_date);
        assert_eq!(loaded.last_modified, stored.last_modified);
        assert_eq!(loaded.ttl, stored.ttl);
        assert_eq!(loaded.soft_ttl, stored.soft_ttl);
        assert_eq!(loaded.headers, stored.headers);
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;
        assert!(cache.get("http://example.com/absent").await.is_none());
    }

    #[tokio::test]
    async fn eviction_keeps_total_under_the_cap() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), 1_000);
        cache.initialize().await;

        for i in 0..50 {
            let key = format!("http://example.com/{i}");
            cache.put(&key, entry(&[0u8; 100], far_future())).await;
            assert!(
                cache.total_bytes() <= 1_000,
                "total {} exceeded cap after put {i}",
                cache.total_bytes()
            );
        }
        // Sustained pressure settles at or below the hysteresis watermark.
        assert!(cache.total_bytes() <= 900);
        assert!(cache.entry_count() < 50);
    }

    #[tokio::test]
    async fn eviction_prefers_least_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), 1_000);
        cache.initialize().await;

        cache.put("a", entry(&[0u8; 300], far_future())).await;
        cache.put("b", entry(&[0u8; 300], far_future())).await;
        cache.put("c", entry(&[0u8; 300], far_future())).await;

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").await.is_some());
        cache.put("d", entry(&[0u8; 300], far_future())).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("d").await.is_some());
    }

    #[tokio::test]
    async fn corrupt_file_self_heals_to_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;

        cache.put("http://example.com/c", entry(b"data", far_future())).await;
        let path = cache.file_for_key("http://example.com/c");
        std::fs::write(&path, b"garbage").unwrap();

        assert!(cache.get("http://example.com/c").await.is_none());
        assert!(!path.exists(), "corrupt file should be deleted");
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn filename_collision_drops_only_the_index_entry() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;

        cache.put("key-one", entry(b"one", far_future())).await;

        // Overwrite key-one's file with a header that names a different key,
        // as a hash collision between two keys would.
        let path = cache.file_for_key("key-one");
        let mut buf = BytesMut::new();
        EntryHeader::from_entry("key-two", &entry(b"two", far_future())).write(&mut buf);
        buf.extend_from_slice(b"two");
        std::fs::write(&path, &buf).unwrap();

        assert!(cache.get("key-one").await.is_none());
        assert!(path.exists(), "the colliding file belongs to the other key");
    }

    #[tokio::test]
    async fn initialize_rebuilds_the_index() {
        let dir = TempDir::new().unwrap();
        {
            let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
            cache.initialize().await;
            cache.put("http://example.com/p", entry(b"persisted", far_future())).await;
        }

        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;
        let loaded = cache.get("http://example.com/p").await.unwrap();
        assert_eq!(loaded.data, Bytes::from_static(b"persisted"));
    }

    #[tokio::test]
    async fn initialize_deletes_undecodable_files() {
        let dir = TempDir::new().unwrap();
        let stray = dir.path().join("123456");
        std::fs::write(&stray, b"not a cache file").unwrap();

        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;
        assert!(!stray.exists(), "undecodable file should be removed");
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refresh() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;

        cache.put("k", entry(b"data", far_future())).await;
        cache.invalidate("k", false).await;
        let soft = cache.get("k").await.unwrap();
        assert_eq!(soft.soft_ttl, 0);
        assert!(soft.refresh_needed());
        assert!(!soft.is_expired());

        cache.invalidate("k", true).await;
        let full = cache.get("k").await.unwrap();
        assert_eq!(full.ttl, 0);
        assert!(full.is_expired());
    }

    #[tokio::test]
    async fn remove_and_clear_release_bytes() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;

        cache.put("x", entry(&[0u8; 10], far_future())).await;
        cache.put("y", entry(&[0u8; 10], far_future())).await;
        assert_eq!(cache.total_bytes(), 20);

        cache.remove("x").await;
        assert_eq!(cache.total_bytes(), 10);
        assert!(cache.get("x").await.is_none());

        cache.clear().await;
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.get("y").await.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn replacing_an_entry_adjusts_the_byte_total() {
        let dir = TempDir::new().unwrap();
        let cache = DiskBasedCache::new(dir.path(), DEFAULT_MAX_BYTES);
        cache.initialize().await;

        cache.put("k", entry(&[0u8; 100], far_future())).await;
        cache.put("k", entry(&[0u8; 40], far_future())).await;
        assert_eq!(cache.total_bytes(), 40);
        assert_eq!(cache.entry_count(), 1);
    }
}
