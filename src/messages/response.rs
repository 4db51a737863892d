//! Response produced by a simulated server (or by a strategy's aggregation).

use std::error;
use std::fmt;

use crate::utils::CtxError;

use tokio::time::Duration;

/// What triggered a cancellation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CancelCause {
    /// The caller's context was cancelled.
    Context,

    /// The caller's context deadline passed.
    Deadline,

    /// A `cancel()` call pre-empted the request while it was queued.
    Preempted,

    /// The server was shut down before the request got processed.
    Shutdown,
}

impl From<CtxError> for CancelCause {
    fn from(e: CtxError) -> Self {
        match e {
            CtxError::Cancelled => Self::Context,
            CtxError::DeadlineExceeded => Self::Deadline,
        }
    }
}

/// Engine-level error carried by a response. A request that was processed
/// but drew a failure outcome carries no error at all.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ResponseError {
    /// The request was cancelled before a result was produced.
    Cancelled(CancelCause),
}

impl ResponseError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cancelled(CancelCause::Context) => {
                write!(f, "request cancelled: context cancelled")
            }
            Self::Cancelled(CancelCause::Deadline) => {
                write!(f, "request cancelled: context deadline exceeded")
            }
            Self::Cancelled(CancelCause::Preempted) => {
                write!(f, "request cancelled: pre-empted while queued")
            }
            Self::Cancelled(CancelCause::Shutdown) => {
                write!(f, "request cancelled: server shut down")
            }
        }
    }
}

impl error::Error for ResponseError {}

impl From<CtxError> for ResponseError {
    fn from(e: CtxError) -> Self {
        Self::Cancelled(e.into())
    }
}

/// Outcome of one request on one server, or the aggregate outcome of a
/// fan-out. Immutable after creation.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Response {
    /// ID of the request this responds to.
    pub request_id: String,

    /// ID of the producing server, or a synthesized aggregate identity.
    pub server_id: String,

    /// True if the simulated processing succeeded.
    pub success: bool,

    /// Engine error, `None` for both success and semantic failure.
    pub err: Option<ResponseError>,

    /// Total time, i.e. `queue_wait + processing_time`; zero if cancelled.
    pub latency: Duration,

    /// Time spent in the admission queue.
    pub queue_wait: Duration,

    /// Simulated processing time.
    pub processing_time: Duration,
}

impl Response {
    /// Response for a request that went through processing.
    pub fn completed(
        request_id: impl Into<String>,
        server_id: impl Into<String>,
        success: bool,
        queue_wait: Duration,
        processing_time: Duration,
    ) -> Self {
        Response {
            request_id: request_id.into(),
            server_id: server_id.into(),
            success,
            err: None,
            latency: queue_wait + processing_time,
            queue_wait,
            processing_time,
        }
    }

    /// Response for a request that got cancelled; all timings are zero.
    pub fn cancelled(
        request_id: impl Into<String>,
        server_id: impl Into<String>,
        cause: CancelCause,
    ) -> Self {
        Response {
            request_id: request_id.into(),
            server_id: server_id.into(),
            success: false,
            err: Some(ResponseError::Cancelled(cause)),
            latency: Duration::ZERO,
            queue_wait: Duration::ZERO,
            processing_time: Duration::ZERO,
        }
    }

    /// Returns true if this response reports a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.err.is_some_and(|e| e.is_cancelled())
    }
}
