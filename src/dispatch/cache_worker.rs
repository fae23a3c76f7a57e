use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, trace};

use super::{DispatchQueue, WaitingRequestManager};
use crate::cache::Cache;
use crate::delivery::{Continuation, Delivery};
use crate::request::Request;
use crate::response::{NetworkResponse, ParsedResponse};

/// Single worker draining the cache queue: serves fresh hits directly,
/// forwards misses and expired hits to the network queue through the dedup
/// table, and kicks off background refreshes for soft-expired hits.
pub(crate) struct CacheDispatcher {
    cache_queue: Arc<DispatchQueue>,
    network_queue: Arc<DispatchQueue>,
    cache: Arc<dyn Cache>,
    delivery: Arc<dyn Delivery>,
    waiting: Arc<WaitingRequestManager>,
}

impl CacheDispatcher {
    pub(crate) fn new(
        cache_queue: Arc<DispatchQueue>,
        network_queue: Arc<DispatchQueue>,
        cache: Arc<dyn Cache>,
        delivery: Arc<dyn Delivery>,
        waiting: Arc<WaitingRequestManager>,
    ) -> Self {
        Self {
            cache_queue,
            network_queue,
            cache,
            delivery,
            waiting,
        }
    }

    pub(crate) async fn run(self, mut quit: watch::Receiver<bool>) {
        debug!("cache dispatcher started");
        self.cache.initialize().await;
        while let Some(request) = self.cache_queue.pop(&mut quit).await {
            self.process(request).await;
        }
        debug!("cache dispatcher stopped");
    }

    async fn process(&self, request: Arc<Request>) {
        trace!(url = %request.url(), sequence = request.sequence(), "cache-queue-take");

        if request.is_canceled() {
            request.finish("cache-discard-cancelled");
            return;
        }

        let entry = match self.cache.get(request.cache_key()).await {
            None => {
                trace!(key = %request.cache_key(), "cache-miss");
                self.forward_to_network(&request);
                return;
            }
            Some(entry) if entry.is_expired() => {
                trace!(key = %request.cache_key(), "cache-hit-expired");
                // Keep the stale entry around so the transport can
                // revalidate instead of refetching.
                request.set_cache_entry(entry);
                self.forward_to_network(&request);
                return;
            }
            Some(entry) => entry,
        };

        trace!(key = %request.cache_key(), "cache-hit");
        let synthesized = NetworkResponse::from_cache_entry(&entry);
        let mut response = match request.handler().decode(&synthesized) {
            Ok(decoded) => ParsedResponse::new(decoded.result, decoded.cache_entry),
            Err(err) => {
                let err = request.handler().refine_error(err);
                self.delivery.post_error(request, err);
                return;
            }
        };

        if !entry.refresh_needed() {
            self.delivery.post_response(request, response, None);
            return;
        }

        // The hit is served immediately but marked intermediate, and a
        // refresh goes out through the same ownership protocol once the
        // result is on its way.
        trace!(key = %request.cache_key(), "cache-hit-refresh-needed");
        request.set_cache_entry(entry);
        response.mark_intermediate();
        let continuation: Continuation = {
            let waiting = Arc::clone(&self.waiting);
            let network_queue = Arc::clone(&self.network_queue);
            let request = Arc::clone(&request);
            Box::new(move || {
                if !waiting.park_or_own(&request) {
                    network_queue.push(request);
                }
            })
        };
        self.delivery
            .post_response(request, response, Some(continuation));
    }

    fn forward_to_network(&self, request: &Arc<Request>) {
        if !self.waiting.park_or_own(request) {
            self.network_queue.push(Arc::clone(request));
        }
    }
}
