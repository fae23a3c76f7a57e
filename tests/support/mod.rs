#![allow(dead_code)]

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::{sleep, timeout};

use courier::{
    Cache, CacheEntry, Decoded, Delivery, FetchError, Header, Network, NetworkResponse, Request,
    RequestHandler, RequestQueue, SerialDelivery, parse_cache_headers,
};

const WAIT: Duration = Duration::from_secs(5);

/// Milliseconds since the epoch, for building entry lifetimes in tests.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

pub fn entry(data: &[u8], ttl: i64, soft_ttl: i64, etag: Option<&str>) -> CacheEntry {
    CacheEntry {
        data: Bytes::copy_from_slice(data),
        etag: etag.map(str::to_string),
        server_date: 0,
        last_modified: 0,
        ttl,
        soft_ttl,
        headers: Vec::new(),
    }
}

pub fn ok_response(body: &str, headers: &[(&str, &str)]) -> NetworkResponse {
    NetworkResponse::ok(
        Bytes::copy_from_slice(body.as_bytes()),
        headers
            .iter()
            .map(|(name, value)| Header::new(*name, *value))
            .collect(),
    )
}

pub fn not_modified_response(body: &[u8], headers: &[(&str, &str)]) -> NetworkResponse {
    NetworkResponse::new(
        StatusCode::NOT_MODIFIED,
        Bytes::copy_from_slice(body),
        headers
            .iter()
            .map(|(name, value)| Header::new(*name, *value))
            .collect(),
        true,
    )
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub revalidation_headers: Vec<Header>,
}

/// Scripted transport. Calls are recorded before they pass the gate, so a
/// test can hold a worker mid-exchange while it lines up duplicates.
pub struct MockNetwork {
    scripts: Mutex<HashMap<String, VecDeque<Result<NetworkResponse, FetchError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
    count_tx: watch::Sender<usize>,
    count_rx: watch::Receiver<usize>,
    gate: Semaphore,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    /// A network where no call completes until [`MockNetwork::release`].
    pub fn gated() -> Arc<Self> {
        Self::with_permits(0)
    }

    fn with_permits(permits: usize) -> Arc<Self> {
        let (count_tx, count_rx) = watch::channel(0);
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            count_tx,
            count_rx,
            gate: Semaphore::new(permits),
        })
    }

    pub fn script(&self, url: &str, result: Result<NetworkResponse, FetchError>) {
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Waits until at least `n` calls have entered the transport.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.count_rx.clone();
        timeout(WAIT, async {
            while *rx.borrow() < n {
                rx.changed().await.expect("mock network dropped");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n} network calls"));
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn perform_request(&self, request: &Request) -> Result<NetworkResponse, FetchError> {
        {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                url: request.url().to_string(),
                revalidation_headers: request.revalidation_headers(),
            });
            let _ = self.count_tx.send(calls.len());
        }
        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();

        let scripted = self
            .scripts
            .lock()
            .get_mut(request.url())
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| Ok(ok_response("default", &[])))
    }
}

/// In-memory cache that records writes, so tests can assert on write-through
/// behavior and seed entries without touching disk.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    puts: Mutex<Vec<String>>,
}

impl MemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, key: &str, entry: CacheEntry) {
        self.entries.lock().insert(key.to_string(), entry);
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().len()
    }

    pub fn stored(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    async fn put(&self, key: &str, entry: CacheEntry) {
        self.puts.lock().push(key.to_string());
        self.entries.lock().insert(key.to_string(), entry);
    }

    async fn initialize(&self) {}

    async fn invalidate(&self, key: &str, full_expire: bool) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.soft_ttl = 0;
            if full_expire {
                entry.ttl = 0;
            }
        }
    }

    async fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    async fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Handler that decodes bodies as strings and records every delivery.
pub struct RecordingHandler {
    results: mpsc::UnboundedSender<Arc<String>>,
    errors: mpsc::UnboundedSender<FetchError>,
}

pub struct HandlerProbe {
    results: mpsc::UnboundedReceiver<Arc<String>>,
    errors: mpsc::UnboundedReceiver<FetchError>,
}

pub fn recording_handler() -> (RecordingHandler, HandlerProbe) {
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    (
        RecordingHandler {
            results: results_tx,
            errors: errors_tx,
        },
        HandlerProbe {
            results: results_rx,
            errors: errors_rx,
        },
    )
}

impl RequestHandler for RecordingHandler {
    fn decode(&self, response: &NetworkResponse) -> Result<Decoded, FetchError> {
        let text = String::from_utf8_lossy(&response.data).into_owned();
        Ok(Decoded::new(text).with_cache_entry(parse_cache_headers(response)))
    }

    fn deliver_result(&self, result: Arc<dyn Any + Send + Sync>) {
        let text = result.downcast::<String>().expect("string result");
        let _ = self.results.send(text);
    }

    fn deliver_error(&self, error: FetchError) {
        let _ = self.errors.send(error);
    }
}

impl HandlerProbe {
    pub async fn next_result(&mut self) -> Arc<String> {
        timeout(WAIT, self.results.recv())
            .await
            .expect("timed out waiting for a result")
            .expect("handler dropped")
    }

    pub async fn next_error(&mut self) -> FetchError {
        timeout(WAIT, self.errors.recv())
            .await
            .expect("timed out waiting for an error")
            .expect("handler dropped")
    }

    /// Asserts that nothing further is delivered within a grace period.
    pub async fn assert_silent(&mut self) {
        sleep(Duration::from_millis(100)).await;
        assert!(self.results.try_recv().is_err(), "unexpected result");
        assert!(self.errors.try_recv().is_err(), "unexpected error");
    }
}

pub struct Harness {
    pub queue: RequestQueue,
    pub network: Arc<MockNetwork>,
    pub cache: Arc<MemoryCache>,
}

impl Harness {
    /// Running harness whose transport answers immediately.
    pub fn new(pool_size: usize) -> Self {
        let harness = Self::stopped(MockNetwork::new(), pool_size);
        harness.queue.start();
        harness
    }

    /// Running harness whose transport is gated behind explicit releases.
    pub fn gated(pool_size: usize) -> Self {
        let harness = Self::stopped(MockNetwork::gated(), pool_size);
        harness.queue.start();
        harness
    }

    /// Harness whose dispatchers have not been started yet.
    pub fn stopped(network: Arc<MockNetwork>, pool_size: usize) -> Self {
        let cache = MemoryCache::new();
        let delivery: Arc<dyn Delivery> = Arc::new(SerialDelivery::spawn());
        let queue = RequestQueue::with_pool_size(
            Arc::clone(&cache) as Arc<dyn Cache>,
            Arc::clone(&network) as Arc<dyn Network>,
            delivery,
            pool_size,
        );
        Self {
            queue,
            network,
            cache,
        }
    }
}

/// Identity comparison for broadcast results.
pub fn same_object(a: &Arc<String>, b: &Arc<String>) -> bool {
    Arc::ptr_eq(a, b)
}
