//! Priority-scheduled HTTP request runtime for resource-constrained
//! clients: requests are queued by priority and submission order,
//! concurrent fetches of one resource are coalesced, responses are written
//! through to a size-bounded on-disk cache, and freshness is derived from
//! HTTP caching headers.
//!
//! The wire transport ([`Network`]), result delivery ([`Delivery`]), and
//! per-request-type decoding ([`RequestHandler`]) are capabilities supplied
//! by the embedding application.

pub mod cache;
pub mod delivery;
mod dispatch;
pub mod error;
pub mod logging;
pub mod network;
pub mod queue;
pub mod request;
pub mod response;
pub mod retry;
pub mod settings;

use std::sync::Arc;

pub use cache::{Cache, CacheEntry, DiskBasedCache, parse_cache_headers};
pub use delivery::{Continuation, Delivery, SerialDelivery};
pub use error::{ErrorKind, FetchError};
pub use logging::LogFormat;
pub use network::Network;
pub use queue::{RequestFinishedListener, RequestQueue};
pub use request::{Decoded, Priority, Request, RequestBuilder, RequestHandler, Tag};
pub use response::{Header, NetworkResponse, ParsedResponse};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use settings::Settings;

/// Builds a [`RequestQueue`] backed by a [`DiskBasedCache`] configured from
/// `settings`. The queue still has to be started.
pub fn build_queue(
    settings: &Settings,
    network: Arc<dyn Network>,
    delivery: Arc<dyn Delivery>,
) -> RequestQueue {
    let cache = Arc::new(DiskBasedCache::new(
        settings.cache_dir.clone(),
        settings.cache_max_bytes,
    ));
    RequestQueue::with_pool_size(cache, network, delivery, settings.network_pool_size)
}
