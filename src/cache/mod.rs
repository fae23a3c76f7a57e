use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

mod codec;
mod disk;
mod freshness;

pub use disk::{DEFAULT_MAX_BYTES, DiskBasedCache};
pub(crate) use freshness::format_epoch_ms;
pub use freshness::parse_cache_headers;

use crate::response::{Header, header_map};

/// A cached response body plus the metadata that decides whether it may be
/// served, revalidated, or must be refetched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Bytes,
    pub etag: Option<String>,
    /// `Date` response header, epoch milliseconds.
    pub server_date: i64,
    /// `Last-Modified` response header, epoch milliseconds.
    pub last_modified: i64,
    /// Hard expiry: past this instant the entry must not be used.
    pub ttl: i64,
    /// Soft expiry: past this instant the entry is served but refreshed.
    pub soft_ttl: i64,
    /// Ordered response headers, duplicates preserved.
    pub headers: Vec<Header>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        self.ttl < epoch_millis()
    }

    pub fn refresh_needed(&self) -> bool {
        self.soft_ttl < epoch_millis()
    }

    /// Case-insensitive last-wins view of the stored headers.
    pub fn header_map(&self) -> HeaderMap {
        header_map(&self.headers)
    }
}

/// Durable key-to-entry store behind the dispatch pipeline. Implementations
/// assume access is serialized through the dispatchers; they are not meant
/// for uncoordinated external use.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    async fn put(&self, key: &str, entry: CacheEntry);

    /// One-time startup work such as rebuilding an index from disk.
    async fn initialize(&self);

    /// Forces a refresh on next use; with `full_expire` the entry also stops
    /// being servable at all.
    async fn invalidate(&self, key: &str, full_expire: bool);

    async fn remove(&self, key: &str);

    async fn clear(&self);
}

pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
