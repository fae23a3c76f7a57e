use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::FetchError;
use crate::request::Request;
use crate::response::ParsedResponse;

/// Work to run after a response or error has been handed to its listener.
pub type Continuation = Box<dyn FnOnce() + Send>;

/// Hands terminal outcomes back to the caller's context. Cancellation is
/// only watertight when all deliveries for a request run on one consistent
/// execution context, which [`SerialDelivery`] guarantees.
pub trait Delivery: Send + Sync {
    fn post_response(
        &self,
        request: Arc<Request>,
        response: ParsedResponse,
        continuation: Option<Continuation>,
    );

    fn post_error(&self, request: Arc<Request>, error: FetchError);
}

enum DeliveryJob {
    Response {
        request: Arc<Request>,
        response: ParsedResponse,
        continuation: Option<Continuation>,
    },
    Error {
        request: Arc<Request>,
        error: FetchError,
    },
}

/// Default [`Delivery`]: every callback runs on one dedicated task, in post
/// order. A request canceled before its job runs is finished without its
/// handler ever being invoked.
pub struct SerialDelivery {
    tx: mpsc::UnboundedSender<DeliveryJob>,
}

impl SerialDelivery {
    /// Spawns the consumer task. Must be called inside a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(job);
            }
        });
        Self { tx }
    }
}

impl Delivery for SerialDelivery {
    fn post_response(
        &self,
        request: Arc<Request>,
        response: ParsedResponse,
        continuation: Option<Continuation>,
    ) {
        request.mark_delivered();
        trace!(url = %request.url(), "post-response");
        if self
            .tx
            .send(DeliveryJob::Response {
                request,
                response,
                continuation,
            })
            .is_err()
        {
            warn!("delivery task is gone, dropping response");
        }
    }

    fn post_error(&self, request: Arc<Request>, error: FetchError) {
        trace!(url = %request.url(), error = %error, "post-error");
        if self
            .tx
            .send(DeliveryJob::Error { request, error })
            .is_err()
        {
            warn!("delivery task is gone, dropping error");
        }
    }
}

fn run_job(job: DeliveryJob) {
    match job {
        DeliveryJob::Response {
            request,
            response,
            continuation,
        } => {
            if request.is_canceled() {
                request.finish("canceled-at-delivery");
                return;
            }
            request.handler().deliver_result(response.result());
            if response.intermediate() {
                // A refresh is still running for this request; it is not
                // done yet.
                trace!(url = %request.url(), "intermediate-response");
            } else {
                request.finish("done");
            }
            if let Some(continuation) = continuation {
                continuation();
            }
        }
        DeliveryJob::Error { request, error } => {
            if request.is_canceled() {
                request.finish("canceled-at-delivery");
                return;
            }
            request.handler().deliver_error(error);
            request.finish("done");
        }
    }
}
