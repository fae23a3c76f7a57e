use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};

use crate::cache::CacheEntry;

const DEFAULT_CONTENT_CHARSET: &str = "ISO-8859-1";

/// A single response header. Responses keep the full ordered list so that
/// duplicate names survive; [`header_map`] gives the case-insensitive
/// last-wins view used for caching decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Case-insensitive map view of an ordered header list. Later entries win,
/// names that do not parse are skipped.
pub fn header_map(headers: &[Header]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for header in headers {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(header.name()),
            http::HeaderValue::from_str(header.value()),
        ) {
            map.insert(name, value);
        }
    }
    map
}

/// What the transport handed back for one exchange.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    pub status: StatusCode,
    pub data: Bytes,
    pub headers: Vec<Header>,
    /// The origin answered 304 and the body was reconstructed from the
    /// stale cache entry the request carried.
    pub not_modified: bool,
    pub network_time: Duration,
}

impl NetworkResponse {
    pub fn new(status: StatusCode, data: Bytes, headers: Vec<Header>, not_modified: bool) -> Self {
        Self {
            status,
            data,
            headers,
            not_modified,
            network_time: Duration::ZERO,
        }
    }

    pub fn ok(data: Bytes, headers: Vec<Header>) -> Self {
        Self::new(StatusCode::OK, data, headers, false)
    }

    pub fn with_network_time(mut self, network_time: Duration) -> Self {
        self.network_time = network_time;
        self
    }

    /// Synthesizes the response a fresh cache hit stands in for.
    pub fn from_cache_entry(entry: &CacheEntry) -> Self {
        Self::new(
            StatusCode::OK,
            entry.data.clone(),
            entry.headers.clone(),
            false,
        )
    }

    pub fn header_map(&self) -> HeaderMap {
        header_map(&self.headers)
    }

    /// Charset named by `Content-Type`, falling back to the HTTP default.
    pub fn charset(&self) -> String {
        let map = self.header_map();
        let Some(content_type) = map
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        else {
            return DEFAULT_CONTENT_CHARSET.to_string();
        };
        for param in content_type.split(';').skip(1) {
            if let Some((name, value)) = param.split_once('=')
                && name.trim().eq_ignore_ascii_case("charset")
            {
                return value.trim().to_string();
            }
        }
        DEFAULT_CONTENT_CHARSET.to_string()
    }
}

/// A decoded result on its way to delivery. The payload is type-erased and
/// reference-counted so the same object can be handed to every deduplicated
/// waiter of a fetch.
#[derive(Clone)]
pub struct ParsedResponse {
    result: Arc<dyn Any + Send + Sync>,
    cache_entry: Option<CacheEntry>,
    intermediate: bool,
}

impl ParsedResponse {
    pub fn new(result: Arc<dyn Any + Send + Sync>, cache_entry: Option<CacheEntry>) -> Self {
        Self {
            result,
            cache_entry,
            intermediate: false,
        }
    }

    pub fn result(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.result)
    }

    /// Convenience downcast back to the concrete result type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.result).downcast().ok()
    }

    pub fn cache_entry(&self) -> Option<&CacheEntry> {
        self.cache_entry.as_ref()
    }

    /// A result that is valid now but will be refreshed in the background.
    pub fn intermediate(&self) -> bool {
        self.intermediate
    }

    pub(crate) fn mark_intermediate(&mut self) {
        self.intermediate = true;
    }
}

impl fmt::Debug for ParsedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedResponse")
            .field("cache_entry", &self.cache_entry)
            .field("intermediate", &self.intermediate)
            .finish_non_exhaustive()
    }
}
