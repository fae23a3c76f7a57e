use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::cache::Cache;
use crate::delivery::Delivery;
use crate::dispatch::{CacheDispatcher, DispatchQueue, NetworkDispatcher, WaitingRequestManager};
use crate::network::Network;
use crate::request::{Request, Tag};

pub const DEFAULT_NETWORK_POOL_SIZE: usize = 4;

/// Observer invoked once per request when it reaches its terminal outcome.
pub type RequestFinishedListener = Arc<dyn Fn(&Arc<Request>) + Send + Sync>;

/// Entry point of the runtime: assigns submission order, routes requests to
/// the cache or network queue, and owns the dispatcher lifecycles.
pub struct RequestQueue {
    core: Arc<QueueCore>,
    lifecycle: Mutex<Lifecycle>,
}

pub(crate) struct QueueCore {
    sequence: AtomicU64,
    current: Mutex<HashMap<u64, Arc<Request>>>,
    cache_queue: Arc<DispatchQueue>,
    network_queue: Arc<DispatchQueue>,
    cache: Arc<dyn Cache>,
    network: Arc<dyn Network>,
    delivery: Arc<dyn Delivery>,
    finished_listeners: Mutex<Vec<RequestFinishedListener>>,
    pool_size: usize,
}

#[derive(Default)]
struct Lifecycle {
    quit: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
}

impl RequestQueue {
    pub fn new(
        cache: Arc<dyn Cache>,
        network: Arc<dyn Network>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self::with_pool_size(cache, network, delivery, DEFAULT_NETWORK_POOL_SIZE)
    }

    pub fn with_pool_size(
        cache: Arc<dyn Cache>,
        network: Arc<dyn Network>,
        delivery: Arc<dyn Delivery>,
        pool_size: usize,
    ) -> Self {
        Self {
            core: Arc::new(QueueCore {
                sequence: AtomicU64::new(0),
                current: Mutex::new(HashMap::new()),
                cache_queue: Arc::new(DispatchQueue::new()),
                network_queue: Arc::new(DispatchQueue::new()),
                cache,
                network,
                delivery,
                finished_listeners: Mutex::new(Vec::new()),
                pool_size: pool_size.max(1),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.core.cache
    }

    /// Spawns the cache dispatcher and the network pool. Always stops first,
    /// so calling it twice never leaves duplicate workers behind.
    pub fn start(&self) {
        self.stop();

        let core = &self.core;
        let (quit_tx, quit_rx) = watch::channel(false);
        let waiting =
            WaitingRequestManager::new(Arc::clone(&core.network_queue), Arc::clone(&core.delivery));

        let mut workers = Vec::with_capacity(core.pool_size + 1);
        let cache_dispatcher = CacheDispatcher::new(
            Arc::clone(&core.cache_queue),
            Arc::clone(&core.network_queue),
            Arc::clone(&core.cache),
            Arc::clone(&core.delivery),
            waiting,
        );
        workers.push(tokio::spawn(cache_dispatcher.run(quit_rx.clone())));

        for id in 0..core.pool_size {
            let dispatcher = NetworkDispatcher::new(
                id,
                Arc::clone(&core.network_queue),
                Arc::clone(&core.network),
                Arc::clone(&core.cache),
                Arc::clone(&core.delivery),
            );
            workers.push(tokio::spawn(dispatcher.run(quit_rx.clone())));
        }

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.quit = Some(quit_tx);
        lifecycle.workers = workers;
        debug!(pool_size = core.pool_size, "request queue started");
    }

    /// Signals every dispatcher to quit and wakes any blocked queue wait.
    /// Requests still queued are abandoned without notification. Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if let Some(quit) = lifecycle.quit.take() {
            let _ = quit.send(true);
            debug!("request queue stopping");
        }
        lifecycle.workers.clear();
    }

    /// Registers the request, stamps its submission sequence, and routes it
    /// to the cache queue when cacheable, straight to the network queue
    /// otherwise. The returned handle doubles as the cancel handle.
    pub fn add(&self, request: Request) -> Arc<Request> {
        let request = Arc::new(request);
        let sequence = self.core.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        request.assign_sequence(sequence);
        request.bind_queue(Arc::downgrade(&self.core));
        self.core
            .current
            .lock()
            .insert(sequence, Arc::clone(&request));
        trace!(
            url = %request.url(),
            sequence,
            priority = ?request.priority(),
            "add-to-queue"
        );

        if request.should_cache() {
            self.core.cache_queue.push(Arc::clone(&request));
        } else {
            self.core.network_queue.push(Arc::clone(&request));
        }
        request
    }

    /// Cancels every live request the filter matches.
    pub fn cancel_all<F>(&self, filter: F)
    where
        F: Fn(&Arc<Request>) -> bool,
    {
        let current = self.core.current.lock();
        for request in current.values() {
            if filter(request) {
                request.cancel();
            }
        }
    }

    /// Cancels every live request carrying this exact tag.
    pub fn cancel_all_by_tag(&self, tag: &Tag) {
        self.cancel_all(|request| request.tag() == Some(tag));
    }

    pub fn add_request_finished_listener(&self, listener: RequestFinishedListener) {
        self.core.finished_listeners.lock().push(listener);
    }

    pub fn remove_request_finished_listener(&self, listener: &RequestFinishedListener) {
        self.core
            .finished_listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    #[cfg(test)]
    pub(crate) fn live_requests(&self) -> usize {
        self.core.current.lock().len()
    }
}

impl QueueCore {
    /// Deregisters a finished request and notifies the observers. Called
    /// exactly once per request via `Request::finish`.
    pub(crate) fn finish(&self, request: &Arc<Request>) {
        self.current.lock().remove(&request.sequence());
        let listeners: Vec<_> = self.finished_listeners.lock().clone();
        for listener in listeners {
            listener(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::error::FetchError;
    use crate::request::{Decoded, RequestHandler};
    use crate::response::NetworkResponse;
    use async_trait::async_trait;
    use std::any::Any;

    struct NullHandler;

    impl RequestHandler for NullHandler {
        fn decode(&self, response: &NetworkResponse) -> Result<Decoded, FetchError> {
            Ok(Decoded::new(response.data.clone()))
        }

        fn deliver_result(&self, _result: Arc<dyn Any + Send + Sync>) {}

        fn deliver_error(&self, _error: FetchError) {}
    }

    struct NullCache;

    #[async_trait]
    impl Cache for NullCache {
        async fn get(&self, _key: &str) -> Option<CacheEntry> {
            None
        }
        async fn put(&self, _key: &str, _entry: CacheEntry) {}
        async fn initialize(&self) {}
        async fn invalidate(&self, _key: &str, _full_expire: bool) {}
        async fn remove(&self, _key: &str) {}
        async fn clear(&self) {}
    }

    struct NullNetwork;

    #[async_trait]
    impl crate::network::Network for NullNetwork {
        async fn perform_request(
            &self,
            _request: &Request,
        ) -> Result<NetworkResponse, FetchError> {
            Err(FetchError::timeout())
        }
    }

    struct NullDelivery;

    impl Delivery for NullDelivery {
        fn post_response(
            &self,
            _request: Arc<Request>,
            _response: crate::response::ParsedResponse,
            _continuation: Option<crate::delivery::Continuation>,
        ) {
        }

        fn post_error(&self, _request: Arc<Request>, _error: FetchError) {}
    }

    fn queue() -> RequestQueue {
        RequestQueue::with_pool_size(
            Arc::new(NullCache),
            Arc::new(NullNetwork),
            Arc::new(NullDelivery),
            2,
        )
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing() {
        let queue = queue();
        let first = queue.add(Request::get("http://example.com/1").build(NullHandler));
        let second = queue.add(Request::get("http://example.com/2").build(NullHandler));
        let third = queue.add(Request::get("http://example.com/3").build(NullHandler));
        assert!(first.sequence() < second.sequence());
        assert!(second.sequence() < third.sequence());
        assert_eq!(queue.live_requests(), 3);
    }

    #[tokio::test]
    async fn cancel_all_by_tag_matches_identity() {
        let queue = queue();
        let tag = Tag::new();
        let other = Tag::new();

        let tagged_a = queue.add(
            Request::get("http://example.com/a")
                .tag(tag.clone())
                .build(NullHandler),
        );
        let tagged_b = queue.add(
            Request::get("http://example.com/b")
                .tag(tag.clone())
                .build(NullHandler),
        );
        let untagged = queue.add(Request::get("http://example.com/c").build(NullHandler));
        let differently_tagged = queue.add(
            Request::get("http://example.com/d")
                .tag(other.clone())
                .build(NullHandler),
        );

        queue.cancel_all_by_tag(&tag);
        assert!(tagged_a.is_canceled());
        assert!(tagged_b.is_canceled());
        assert!(!untagged.is_canceled());
        assert!(!differently_tagged.is_canceled());
    }

    #[tokio::test]
    async fn cancel_all_applies_the_filter() {
        let queue = queue();
        let slow = queue.add(
            Request::get("http://example.com/slow")
                .priority(crate::request::Priority::Low)
                .build(NullHandler),
        );
        let fast = queue.add(
            Request::get("http://example.com/fast")
                .priority(crate::request::Priority::High)
                .build(NullHandler),
        );

        queue.cancel_all(|request| request.priority() == crate::request::Priority::Low);
        assert!(slow.is_canceled());
        assert!(!fast.is_canceled());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let queue = queue();
        queue.start();
        queue.start();
        queue.stop();
        queue.stop();
        queue.start();
        queue.stop();
    }
}
