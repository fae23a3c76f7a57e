//! Derives cache metadata from HTTP caching headers: `Cache-Control`
//! directives first, the `Date`/`Expires` pair as a fallback.

use std::time::{Duration, SystemTime};

use http::header;
use tracing::debug;

use crate::cache::{CacheEntry, epoch_millis};
use crate::response::NetworkResponse;

/// Builds the cache entry a response should be stored under, or `None` when
/// the response must not be cached at all.
///
/// Without any freshness information the entry is still built so its etag
/// and `Last-Modified` survive, but with zero lifetimes, which forces a
/// revalidation on every use.
pub fn parse_cache_headers(response: &NetworkResponse) -> Option<CacheEntry> {
    entry_for_response(response, epoch_millis())
}

pub(crate) fn entry_for_response(response: &NetworkResponse, now_ms: i64) -> Option<CacheEntry> {
    let headers = response.header_map();

    let mut server_date = 0i64;
    let mut last_modified = 0i64;
    let mut server_expires = 0i64;
    let mut max_age = 0i64;
    let mut stale_while_revalidate = 0i64;
    let mut has_cache_control = false;
    let mut must_revalidate = false;

    if let Some(value) = headers.get(header::DATE).and_then(|v| v.to_str().ok()) {
        server_date = parse_date_ms(value);
    }

    if let Some(value) = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    {
        has_cache_control = true;
        for token in value.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("no-cache") || token.eq_ignore_ascii_case("no-store") {
                return None;
            } else if let Some(seconds) = token.strip_prefix("max-age=") {
                max_age = seconds.parse().unwrap_or(0);
            } else if let Some(seconds) = token.strip_prefix("stale-while-revalidate=") {
                stale_while_revalidate = seconds.parse().unwrap_or(0);
            } else if token.eq_ignore_ascii_case("must-revalidate")
                || token.eq_ignore_ascii_case("proxy-revalidate")
            {
                must_revalidate = true;
            }
        }
    }

    if let Some(value) = headers.get(header::EXPIRES).and_then(|v| v.to_str().ok()) {
        server_expires = parse_date_ms(value);
    }

    if let Some(value) = headers
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
    {
        last_modified = parse_date_ms(value);
    }

    let etag = headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut soft_expire = 0i64;
    let mut final_expire = 0i64;

    if has_cache_control {
        soft_expire = now_ms + max_age * 1_000;
        final_expire = if must_revalidate {
            soft_expire
        } else {
            soft_expire + stale_while_revalidate * 1_000
        };
    } else if server_date > 0 && server_expires >= server_date {
        // Clock-skew tolerant: only the server-side delta matters.
        soft_expire = now_ms + (server_expires - server_date);
        final_expire = soft_expire;
    }

    Some(CacheEntry {
        data: response.data.clone(),
        etag,
        server_date,
        last_modified,
        ttl: final_expire,
        soft_ttl: soft_expire,
        headers: response.headers.clone(),
    })
}

/// RFC 1123 date to epoch milliseconds; unparseable dates collapse to zero.
pub(crate) fn parse_date_ms(value: &str) -> i64 {
    match httpdate::parse_http_date(value) {
        Ok(time) => time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0),
        Err(err) => {
            debug!(value, error = %err, "unparseable HTTP date, treating as epoch");
            0
        }
    }
}

/// Epoch milliseconds to an RFC 1123 date string.
pub(crate) fn format_epoch_ms(ms: i64) -> String {
    let time = SystemTime::UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64);
    httpdate::fmt_http_date(time)
}
