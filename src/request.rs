use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use http::Method;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::cache::CacheEntry;
use crate::error::FetchError;
use crate::queue::QueueCore;
use crate::response::{Header, NetworkResponse, ParsedResponse};
use crate::retry::{ExponentialBackoff, RetryPolicy};

/// Scheduling priority. Higher priorities drain first; within one priority
/// submission order wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

/// An identity token for grouped cancellation. Two tags compare equal only
/// when they are clones of the same token.
#[derive(Debug, Clone, Default)]
pub struct Tag(Arc<()>);

impl Tag {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tag {}

/// Per-request-type capability: turns raw responses into a typed result and
/// receives the terminal outcome. The dispatch pipeline depends only on this
/// interface.
pub trait RequestHandler: Send + Sync {
    /// Decodes a raw exchange into a typed result plus the cache entry the
    /// response should be stored under, if any.
    fn decode(&self, response: &NetworkResponse) -> Result<Decoded, FetchError>;

    fn deliver_result(&self, result: Arc<dyn Any + Send + Sync>);

    fn deliver_error(&self, error: FetchError);

    /// Chance to replace a failure with a more specific one before delivery.
    fn refine_error(&self, error: FetchError) -> FetchError {
        error
    }
}

/// Output of [`RequestHandler::decode`].
pub struct Decoded {
    pub result: Arc<dyn Any + Send + Sync>,
    pub cache_entry: Option<CacheEntry>,
}

impl Decoded {
    pub fn new<T: Any + Send + Sync>(result: T) -> Self {
        Self {
            result: Arc::new(result),
            cache_entry: None,
        }
    }

    pub fn with_cache_entry(mut self, cache_entry: Option<CacheEntry>) -> Self {
        self.cache_entry = cache_entry;
        self
    }
}

/// Signal a network worker sends when a fetch reaches its end, consumed by
/// the dedup manager watching the owning request.
#[derive(Debug)]
pub(crate) enum CompletionOutcome {
    Received(ParsedResponse),
    NotUsable,
}

/// One unit of work. Immutable routing data lives in plain fields; state
/// that submitters, dispatch workers, and the delivery context all touch is
/// behind a per-request lock.
pub struct Request {
    method: Method,
    url: String,
    cache_key: String,
    priority: Priority,
    should_cache: bool,
    retry_server_errors: bool,
    tag: Option<Tag>,
    handler: Box<dyn RequestHandler>,
    retry_policy: Mutex<Box<dyn RetryPolicy>>,
    sequence: OnceLock<u64>,
    state: Mutex<RequestState>,
}

#[derive(Default)]
struct RequestState {
    canceled: bool,
    delivered: bool,
    completion: Option<oneshot::Sender<CompletionOutcome>>,
    cache_entry: Option<CacheEntry>,
    queue: Option<Weak<QueueCore>>,
}

impl Request {
    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    pub fn get(url: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::GET, url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Identifier used for cache lookups and dedup, defaults to the url.
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn should_cache(&self) -> bool {
        self.should_cache
    }

    pub fn should_retry_server_errors(&self) -> bool {
        self.retry_server_errors
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    /// Submission order, assigned by `RequestQueue::add`.
    pub fn sequence(&self) -> u64 {
        self.sequence
            .get()
            .copied()
            .expect("sequence is assigned when the request is added to a queue")
    }

    pub(crate) fn assign_sequence(&self, sequence: u64) {
        let _ = self.sequence.set(sequence);
    }

    /// Marks the request canceled. Cooperative: work already in flight may
    /// still run, but the delivery step will not invoke the handler once it
    /// observes the flag.
    pub fn cancel(&self) {
        self.state.lock().canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    pub(crate) fn mark_delivered(&self) {
        self.state.lock().delivered = true;
    }

    pub fn has_had_response_delivered(&self) -> bool {
        self.state.lock().delivered
    }

    /// Stale entry held while a revalidation for this request is in flight.
    pub fn cache_entry(&self) -> Option<CacheEntry> {
        self.state.lock().cache_entry.clone()
    }

    pub(crate) fn set_cache_entry(&self, entry: CacheEntry) {
        self.state.lock().cache_entry = Some(entry);
    }

    /// Conditional headers a transport should attach when revalidating the
    /// stale entry this request carries.
    pub fn revalidation_headers(&self) -> Vec<Header> {
        let Some(entry) = self.cache_entry() else {
            return Vec::new();
        };
        let mut headers = Vec::new();
        if let Some(etag) = &entry.etag {
            headers.push(Header::new("If-None-Match", etag.clone()));
        }
        if entry.last_modified > 0 {
            headers.push(Header::new(
                "If-Modified-Since",
                crate::cache::format_epoch_ms(entry.last_modified),
            ));
        }
        headers
    }

    /// Timeout the next network attempt should use.
    pub fn timeout(&self) -> std::time::Duration {
        self.retry_policy.lock().current_timeout()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_policy.lock().current_retry_count()
    }

    pub(crate) fn retry(&self, error: FetchError) -> Result<(), FetchError> {
        self.retry_policy.lock().retry(error)
    }

    pub(crate) fn handler(&self) -> &dyn RequestHandler {
        self.handler.as_ref()
    }

    /// Installs a fresh one-shot completion hook and hands back its
    /// receiving end. Completing the previous hook is abandoned.
    pub(crate) fn arm_completion(&self) -> oneshot::Receiver<CompletionOutcome> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().completion = Some(tx);
        rx
    }

    /// Fires the completion hook, if one is armed. At most one signal per
    /// ownership generation.
    pub(crate) fn complete(&self, outcome: CompletionOutcome) {
        let completion = self.state.lock().completion.take();
        if let Some(tx) = completion {
            let _ = tx.send(outcome);
        }
    }

    pub(crate) fn bind_queue(&self, queue: Weak<QueueCore>) {
        self.state.lock().queue = Some(queue);
    }

    /// Reports the terminal outcome to the owning queue, exactly once per
    /// request lifecycle.
    pub(crate) fn finish(self: &Arc<Self>, reason: &str) {
        trace!(url = %self.url, sequence = self.sequence.get().copied().unwrap_or(0), reason, "request finished");
        let queue = self.state.lock().queue.take();
        if let Some(core) = queue.and_then(|weak| weak.upgrade()) {
            core.finish(self);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence.get())
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Request`]. The handler is supplied last since every request
/// needs one.
pub struct RequestBuilder {
    method: Method,
    url: String,
    cache_key: Option<String>,
    priority: Priority,
    should_cache: bool,
    retry_server_errors: bool,
    tag: Option<Tag>,
    retry_policy: Option<Box<dyn RetryPolicy>>,
}

impl RequestBuilder {
    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            cache_key: None,
            priority: Priority::Normal,
            should_cache: true,
            retry_server_errors: false,
            tag: None,
            retry_policy: None,
        }
    }

    pub fn cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = should_cache;
        self
    }

    pub fn retry_server_errors(mut self, retry: bool) -> Self {
        self.retry_server_errors = retry;
        self
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Box::new(policy));
        self
    }

    pub fn build(self, handler: impl RequestHandler + 'static) -> Request {
        let url = self.url;
        Request {
            method: self.method,
            cache_key: self.cache_key.unwrap_or_else(|| url.clone()),
            url,
            priority: self.priority,
            should_cache: self.should_cache,
            retry_server_errors: self.retry_server_errors,
            tag: self.tag,
            handler: Box::new(handler),
            retry_policy: Mutex::new(
                self.retry_policy
                    .unwrap_or_else(|| Box::new(ExponentialBackoff::default())),
            ),
            sequence: OnceLock::new(),
            state: Mutex::new(RequestState::default()),
        }
    }
}
