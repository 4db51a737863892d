//! Cancellable request context, carrying a "done" signal and the terminal
//! error once fired.

use std::error;
use std::fmt;
use std::future;
use std::sync::Arc;

use futures::future::BoxFuture;

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

/// Terminal error of a context that has fired.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CtxError {
    /// Explicitly cancelled by its owner (or an ancestor's owner).
    Cancelled,

    /// Deadline of the context (or of an ancestor) has passed.
    DeadlineExceeded,
}

impl fmt::Display for CtxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context cancelled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl error::Error for CtxError {}

#[derive(Debug)]
struct CtxInner {
    /// Set exactly once, by the first `cancel()`.
    state: watch::Sender<Option<CtxError>>,

    /// Optional absolute deadline.
    deadline: Option<Instant>,

    /// Parent context, whose firing also fires this one.
    parent: Option<CancelCtx>,
}

/// Cheaply cloneable cancellation context. Clones share the same signal;
/// children derived through `child()` / `with_timeout()` fire whenever their
/// parent fires, but never the other way around.
#[derive(Debug, Clone)]
pub struct CancelCtx {
    inner: Arc<CtxInner>,
}

impl Default for CancelCtx {
    fn default() -> Self {
        Self::background()
    }
}

impl CancelCtx {
    fn build(parent: Option<CancelCtx>, deadline: Option<Instant>) -> Self {
        let (state, _) = watch::channel(None);
        CancelCtx {
            inner: Arc::new(CtxInner {
                state,
                deadline,
                parent,
            }),
        }
    }

    /// Creates a root context that only fires when cancelled explicitly.
    pub fn background() -> Self {
        Self::build(None, None)
    }

    /// Derives a child context with no deadline of its own.
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), None)
    }

    /// Derives a child context that fires after `dur` from now.
    pub fn with_timeout(&self, dur: Duration) -> Self {
        self.with_deadline(Instant::now() + dur)
    }

    /// Derives a child context that fires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self::build(Some(self.clone()), Some(deadline))
    }

    /// Returns this context's own deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    #[inline]
    fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fires this context (and all its children). Only the first firing
    /// sticks; later calls are no-ops.
    pub fn cancel(&self) {
        let cause = if self.deadline_passed() {
            CtxError::DeadlineExceeded
        } else {
            CtxError::Cancelled
        };
        self.inner.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(cause);
                true
            } else {
                false
            }
        });
    }

    /// Returns the terminal error if this context has fired, else `None`.
    pub fn err(&self) -> Option<CtxError> {
        if let Some(e) = *self.inner.state.borrow() {
            return Some(e);
        }
        if self.deadline_passed() {
            return Some(CtxError::DeadlineExceeded);
        }
        self.inner.parent.as_ref().and_then(|parent| parent.err())
    }

    /// Returns true if this context has fired.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Waits until this context fires, returning its terminal error.
    /// Typically used as a branch of a `tokio::select!`.
    pub fn done(&self) -> BoxFuture<'_, CtxError> {
        Box::pin(async move {
            let mut rx = self.inner.state.subscribe();
            let own = async move {
                loop {
                    if let Some(e) = *rx.borrow_and_update() {
                        return e;
                    }
                    if rx.changed().await.is_err() {
                        // sender lives as long as `self`
                        return future::pending().await;
                    }
                }
            };

            let deadline = async {
                match self.inner.deadline {
                    Some(deadline) => {
                        time::sleep_until(deadline).await;
                        CtxError::DeadlineExceeded
                    }
                    None => future::pending().await,
                }
            };

            let parent = async {
                match self.inner.parent {
                    Some(ref parent) => parent.done().await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                e = own => e,
                e = deadline => e,
                e = parent => e,
            }
        })
    }
}
