use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::DispatchQueue;
use crate::cache::Cache;
use crate::delivery::Delivery;
use crate::error::FetchError;
use crate::network::Network;
use crate::request::{CompletionOutcome, Request};
use crate::response::{NetworkResponse, ParsedResponse};

/// One worker of the network pool: performs the exchange, owns the retry
/// loop, writes cacheable responses through, and signals the dedup table.
pub(crate) struct NetworkDispatcher {
    id: usize,
    queue: Arc<DispatchQueue>,
    network: Arc<dyn Network>,
    cache: Arc<dyn Cache>,
    delivery: Arc<dyn Delivery>,
}

impl NetworkDispatcher {
    pub(crate) fn new(
        id: usize,
        queue: Arc<DispatchQueue>,
        network: Arc<dyn Network>,
        cache: Arc<dyn Cache>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            id,
            queue,
            network,
            cache,
            delivery,
        }
    }

    pub(crate) async fn run(self, mut quit: watch::Receiver<bool>) {
        debug!(worker = self.id, "network dispatcher started");
        while let Some(request) = self.queue.pop(&mut quit).await {
            self.process(request).await;
        }
        debug!(worker = self.id, "network dispatcher stopped");
    }

    async fn process(&self, request: Arc<Request>) {
        let started = Instant::now();
        trace!(url = %request.url(), sequence = request.sequence(), "network-queue-take");

        if request.is_canceled() {
            request.finish("network-discard-cancelled");
            request.complete(CompletionOutcome::NotUsable);
            return;
        }

        let response = match self.fetch_with_retries(&request).await {
            Ok(response) => response,
            Err(err) => {
                let err = request.handler().refine_error(err);
                warn!(
                    url = %request.url(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request failed"
                );
                self.delivery.post_error(Arc::clone(&request), err);
                request.complete(CompletionOutcome::NotUsable);
                return;
            }
        };
        trace!(
            url = %request.url(),
            status = response.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "network-http-complete"
        );

        // A 304 after a result already went out would be a duplicate
        // delivery of the same representation.
        if response.not_modified && request.has_had_response_delivered() {
            request.finish("not-modified");
            request.complete(CompletionOutcome::NotUsable);
            return;
        }

        let decoded = match request.handler().decode(&response) {
            Ok(decoded) => decoded,
            Err(err) => {
                let err = request.handler().refine_error(err);
                self.delivery.post_error(Arc::clone(&request), err);
                request.complete(CompletionOutcome::NotUsable);
                return;
            }
        };
        trace!(url = %request.url(), "network-parse-complete");

        if request.should_cache()
            && let Some(entry) = &decoded.cache_entry
        {
            self.cache.put(request.cache_key(), entry.clone()).await;
            trace!(key = %request.cache_key(), "network-cache-written");
        }

        let parsed = ParsedResponse::new(decoded.result, decoded.cache_entry);
        request.mark_delivered();
        self.delivery
            .post_response(Arc::clone(&request), parsed.clone(), None);
        request.complete(CompletionOutcome::Received(parsed));
    }

    /// Runs the exchange until it succeeds, the failure is not retryable, or
    /// the request's retry policy gives up and hands the error back.
    async fn fetch_with_retries(&self, request: &Arc<Request>) -> Result<NetworkResponse, FetchError> {
        loop {
            let err = match self.network.perform_request(request).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if !err.is_retryable(request.should_retry_server_errors()) {
                return Err(err);
            }
            let kind = err.kind();
            match request.retry(err) {
                Ok(()) => {
                    debug!(
                        url = %request.url(),
                        kind = %kind,
                        retry = request.retry_count(),
                        timeout_ms = request.timeout().as_millis() as u64,
                        "retrying request"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
