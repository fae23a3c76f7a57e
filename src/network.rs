use async_trait::async_trait;

use crate::error::FetchError;
use crate::request::Request;
use crate::response::NetworkResponse;

/// The wire transport, implemented outside this crate. One call performs one
/// HTTP exchange; failures come back as typed [`FetchError`]s so the
/// dispatcher can route them through the retry policy.
///
/// Implementations should honor [`Request::timeout`] for the attempt and
/// attach [`Request::revalidation_headers`] when the request carries a stale
/// cache entry, answering a 304 with `not_modified` set and the stale body
/// filled back in.
#[async_trait]
pub trait Network: Send + Sync {
    async fn perform_request(&self, request: &Request) -> Result<NetworkResponse, FetchError>;
}
