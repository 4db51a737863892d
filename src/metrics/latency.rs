//! Bounded rolling window of observed latencies with percentile queries.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use statistical::{mean, standard_deviation};

use tokio::time::Duration;

/// Point-in-time percentiles computed from one consistent sample set.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub struct LatencySummary {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub p999: Duration,
}

/// Ring buffer state, protected by the tracker's mutex.
#[derive(Debug)]
struct Window {
    /// Fixed-capacity sample slots.
    samples: Vec<Duration>,

    /// Next slot to write.
    cursor: usize,

    /// True once the cursor has wrapped around at least once.
    wrapped: bool,
}

impl Window {
    /// Number of valid samples.
    #[inline]
    fn len(&self) -> usize {
        if self.wrapped {
            self.samples.len()
        } else {
            self.cursor
        }
    }
}

/// Thread-safe rolling window of the most recent `capacity` latencies.
///
/// The mutex is held only to write one slot or to copy the valid samples
/// out; sorting for percentile queries happens on the copy, so readers never
/// block writers for the duration of a sort.
#[derive(Debug)]
pub struct LatencyTracker {
    window: Mutex<Window>,
}

impl LatencyTracker {
    /// Creates a tracker keeping at most `capacity` samples. A zero-capacity
    /// tracker ignores all records.
    pub fn new(capacity: usize) -> Self {
        LatencyTracker {
            window: Mutex::new(Window {
                samples: vec![Duration::ZERO; capacity],
                cursor: 0,
                wrapped: false,
            }),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Window> {
        // a panicking recorder cannot leave the window half-written
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records one sample, overwriting the oldest once full.
    pub fn record(&self, d: Duration) {
        let mut window = self.lock();
        let capacity = window.samples.len();
        if capacity == 0 {
            return;
        }
        let cursor = window.cursor;
        window.samples[cursor] = d;
        window.cursor += 1;
        if window.cursor >= capacity {
            window.cursor = 0;
            window.wrapped = true;
        }
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().samples.len()
    }

    /// Copies the valid samples out under the lock, then sorts the copy
    /// after releasing it.
    fn sorted_snapshot(&self) -> Vec<Duration> {
        let mut sorted = {
            let window = self.lock();
            let len = window.len();
            window.samples[..len].to_vec()
        };
        sorted.sort_unstable();
        sorted
    }

    /// Returns the `p`-th percentile (`p` in [0, 1]), linearly interpolated
    /// between the two nearest ranks. Returns zero if `p` is out of range or
    /// there are no samples.
    pub fn percentile(&self, p: f64) -> Duration {
        if !(0.0..=1.0).contains(&p) {
            return Duration::ZERO;
        }
        let sorted = self.sorted_snapshot();
        percentile_of_sorted(&sorted, p)
    }

    /// Computes p50, p95, p99 and p99.9 over the same snapshot.
    pub fn summary(&self) -> LatencySummary {
        let sorted = self.sorted_snapshot();
        if sorted.is_empty() {
            return LatencySummary::default();
        }
        LatencySummary {
            p50: percentile_of_sorted(&sorted, 0.50),
            p95: percentile_of_sorted(&sorted, 0.95),
            p99: percentile_of_sorted(&sorted, 0.99),
            p999: percentile_of_sorted(&sorted, 0.999),
        }
    }

    /// Returns (mean, stdev) of the current window in microsecs, or `None`
    /// if fewer than two samples are present.
    pub fn mean_stdev(&self) -> Option<(f64, f64)> {
        let us: Vec<f64> = {
            let window = self.lock();
            let len = window.len();
            window.samples[..len]
                .iter()
                .map(|d| d.as_secs_f64() * 1_000_000.0)
                .collect()
        };
        if us.len() < 2 {
            return None;
        }
        let avg = mean(&us);
        Some((avg, standard_deviation(&us, Some(avg))))
    }
}

/// Linear interpolation at position `p * (n - 1)` of a sorted slice.
fn percentile_of_sorted(sorted: &[Duration], p: f64) -> Duration {
    match sorted.len() {
        0 => return Duration::ZERO,
        1 => return sorted[0],
        _ => {}
    }

    let pos = p * (sorted.len() - 1) as f64;
    let lower = pos as usize;
    let upper = lower + 1;
    if upper >= sorted.len() {
        return sorted[sorted.len() - 1];
    }

    let fraction = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]).mul_f64(fraction)
}
