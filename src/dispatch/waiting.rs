use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::DispatchQueue;
use crate::delivery::Delivery;
use crate::request::{CompletionOutcome, Request};

/// Coalesces concurrent fetches of one cache key. The first request through
/// becomes the owner of the in-flight fetch; duplicates are parked until the
/// owner's outcome arrives. A key mapped to an empty list means an owner is
/// in flight with nobody waiting yet.
///
/// Every check-then-insert and pop-then-reinsert runs under one lock so a
/// key can never gain two owners or lose a wakeup.
pub(crate) struct WaitingRequestManager {
    waiting: Mutex<HashMap<String, Vec<Arc<Request>>>>,
    network_queue: Arc<DispatchQueue>,
    delivery: Arc<dyn Delivery>,
}

impl WaitingRequestManager {
    pub(crate) fn new(
        network_queue: Arc<DispatchQueue>,
        delivery: Arc<dyn Delivery>,
    ) -> Arc<Self> {
        Arc::new(Self {
            waiting: Mutex::new(HashMap::new()),
            network_queue,
            delivery,
        })
    }

    /// Registers `request` against its cache key. Returns `true` when an
    /// owner is already in flight and the request was parked behind it; the
    /// caller forwards the request to the network queue otherwise.
    pub(crate) fn park_or_own(self: &Arc<Self>, request: &Arc<Request>) -> bool {
        let key = request.cache_key().to_string();
        let parked = {
            let mut waiting = self.waiting.lock();
            if let Some(parked) = waiting.get_mut(&key) {
                parked.push(Arc::clone(request));
                trace!(key = %key, parked = parked.len(), "waiting-for-response");
                true
            } else {
                waiting.insert(key, Vec::new());
                false
            }
        };
        if !parked {
            trace!(key = %request.cache_key(), "new in-flight fetch");
            self.watch_owner(request);
        }
        parked
    }

    /// Subscribes to the owner's completion hook; the outcome releases the
    /// key's waiters.
    fn watch_owner(self: &Arc<Self>, request: &Arc<Request>) {
        let completion = request.arm_completion();
        let manager = Arc::clone(self);
        let key = request.cache_key().to_string();
        tokio::spawn(async move {
            // A dropped sender means the owner was abandoned; treat that
            // like a fetch that produced nothing usable.
            let outcome = completion.await.unwrap_or(CompletionOutcome::NotUsable);
            manager.release(&key, outcome);
        });
    }

    fn release(self: &Arc<Self>, key: &str, outcome: CompletionOutcome) {
        match outcome {
            CompletionOutcome::Received(response) => {
                let parked = self.waiting.lock().remove(key).unwrap_or_default();
                if !parked.is_empty() {
                    trace!(key, released = parked.len(), "broadcasting shared response");
                }
                for waiter in parked {
                    self.delivery.post_response(waiter, response.clone(), None);
                }
            }
            CompletionOutcome::NotUsable => {
                // A failure does not prove the resource changed, so each
                // waiter in turn gets its own network attempt: promote one,
                // keep the rest parked.
                let promoted = {
                    let mut waiting = self.waiting.lock();
                    match waiting.remove(key) {
                        Some(mut parked) if !parked.is_empty() => {
                            let next = parked.remove(0);
                            waiting.insert(key.to_string(), parked);
                            Some(next)
                        }
                        _ => None,
                    }
                };
                if let Some(next) = promoted {
                    trace!(key, "promoting waiter to owner");
                    self.watch_owner(&next);
                    self.network_queue.push(next);
                }
            }
        }
    }
}
