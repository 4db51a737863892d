//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given duration. Supports being
/// kicked off again with a different duration once the previous wait has
/// been consumed.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Duration used by the last kick-off.
    last_dur: Duration,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates a new timer utility that immediately times-out after a
    /// zero-length duration.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
        }
    }

    /// Get the last duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Kicks off the timer with the given duration, counting from now. A
    /// zero duration makes the next `timeout()` complete immediately.
    pub fn kickoff(&mut self, dur: Duration) {
        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
    }

    /// Waits for the timer to fire. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}
