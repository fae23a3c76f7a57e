use http::StatusCode;
use thiserror::Error;

use crate::response::NetworkResponse;

/// Classification of a request failure. The kind decides retry eligibility
/// and how the failure is reported; the raw response, when one exists, rides
/// along on the [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// No route to the origin at all. Terminal.
    #[error("no connection")]
    NoConnection,
    /// The exchange timed out. Retried until the policy gives up.
    #[error("request timed out")]
    Timeout,
    /// The origin answered 401/403. Retried like a timeout.
    #[error("authentication required")]
    AuthRequired,
    /// A 4xx answer. Terminal, never retried.
    #[error("client fault")]
    ClientFault,
    /// A 5xx answer. Retried only when the request opts in.
    #[error("server fault")]
    ServerFault,
    /// Decoding produced no usable result.
    #[error("response could not be parsed")]
    Parse,
    /// Anything unexpected, wrapped so it is never dropped silently.
    #[error("internal error")]
    Internal,
}

/// A request failure: a kind plus the raw response that produced it, when
/// there was one.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct FetchError {
    kind: ErrorKind,
    response: Option<NetworkResponse>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FetchError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            response: None,
            source: None,
        }
    }

    pub fn no_connection(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            kind: ErrorKind::NoConnection,
            response: None,
            source: Some(source.into()),
        }
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    pub fn auth_required(response: Option<NetworkResponse>) -> Self {
        Self {
            kind: ErrorKind::AuthRequired,
            response,
            source: None,
        }
    }

    pub fn client_fault(response: NetworkResponse) -> Self {
        Self {
            kind: ErrorKind::ClientFault,
            response: Some(response),
            source: None,
        }
    }

    pub fn server_fault(response: Option<NetworkResponse>) -> Self {
        Self {
            kind: ErrorKind::ServerFault,
            response,
            source: None,
        }
    }

    pub fn parse(detail: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Parse,
            response: None,
            source: Some(detail.into().into()),
        }
    }

    pub fn internal(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            response: None,
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn response(&self) -> Option<&NetworkResponse> {
        self.response.as_ref()
    }

    /// Status code of the raw response, when the failure carries one.
    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|response| response.status)
    }

    /// Whether the retry policy should get a chance at this failure.
    /// Client faults and parse failures are terminal by definition; server
    /// faults retry only for requests that opted in.
    pub(crate) fn is_retryable(&self, retry_server_errors: bool) -> bool {
        match self.kind {
            ErrorKind::Timeout | ErrorKind::AuthRequired => true,
            ErrorKind::ServerFault => retry_server_errors,
            ErrorKind::NoConnection
            | ErrorKind::ClientFault
            | ErrorKind::Parse
            | ErrorKind::Internal => false,
        }
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(Box::<dyn std::error::Error + Send + Sync>::from(err))
    }
}
