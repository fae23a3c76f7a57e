use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};

use crate::request::Request;

/// Unbounded async priority queue. Pop order is priority descending, then
/// sequence ascending; sequences are unique so ties cannot happen. Push
/// never blocks; pop suspends on an empty queue until a push or the quit
/// signal wakes it.
pub(crate) struct DispatchQueue {
    heap: Mutex<BinaryHeap<PendingRequest>>,
    /// One permit per queued request.
    items: Semaphore,
}

struct PendingRequest(Arc<Request>);

impl PartialEq for PendingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence() == other.0.sequence()
    }
}

impl Eq for PendingRequest {}

impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority()
            .cmp(&other.0.priority())
            .then_with(|| other.0.sequence().cmp(&self.0.sequence()))
    }
}

impl DispatchQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            items: Semaphore::new(0),
        }
    }

    pub(crate) fn push(&self, request: Arc<Request>) {
        self.heap.lock().push(PendingRequest(request));
        self.items.add_permits(1);
    }

    /// Next request by (priority desc, sequence asc), or `None` once the
    /// quit signal fires.
    pub(crate) async fn pop(&self, quit: &mut watch::Receiver<bool>) -> Option<Arc<Request>> {
        loop {
            if *quit.borrow() {
                return None;
            }
            tokio::select! {
                permit = self.items.acquire() => {
                    match permit {
                        Ok(permit) => {
                            permit.forget();
                            // A permit implies an item in the heap.
                            match self.heap.lock().pop() {
                                Some(pending) => return Some(pending.0),
                                None => continue,
                            }
                        }
                        Err(_) => return None,
                    }
                }
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        return None;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }
}
