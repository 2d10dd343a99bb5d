//! Counters and quantile timers, keyed by string.
//!
//! Execution and dispatch-latency timers are recorded from whichever worker thread
//! finishes a job, while `response_served`/`pool_overflow` are recorded from the
//! reactor thread; [`crate::app::Application`] holds one [`TelemetryRegistry`] behind
//! a `Mutex` so both sides can record without racing. The struct itself stays a plain
//! owned value with no internal locking, so it is equally usable un-wrapped in tests.
//!
//! The field set mirrors `thriftworker.utils.stats.counters.Counters.to_dict()` from
//! the original Python implementation: `count`, `sum`, `min`, `max`, `mean`, `stddev`,
//! `squared_sum`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A running count/sum/min/max/variance accumulator for a named event.
#[derive(Debug, Clone)]
pub struct Counter {
    count: u64,
    sum: f64,
    sum_of_squares: f64,
    min: f64,
    max: f64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_of_squares: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Counter {
    /// Records one sample (default weight `1.0` when called via [`Counter::increment`]).
    pub fn add(&mut self, sample: f64) {
        self.count += 1;
        self.sum += sample;
        self.sum_of_squares += sample * sample;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
    }

    /// Records a single unit-weighted event. Equivalent to `add(1.0)`.
    pub fn increment(&mut self) {
        self.add(1.0);
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn stddev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            let mean = self.mean();
            ((self.sum_of_squares / self.count as f64) - mean * mean).max(0.0).sqrt()
        }
    }

    /// Snapshots the current accumulator for reporting.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            count: self.count,
            sum: self.sum,
            squared_sum: self.sum_of_squares,
            min: if self.count == 0 { 0.0 } else { self.min },
            max: if self.count == 0 { 0.0 } else { self.max },
            mean: self.mean(),
            stddev: self.stddev(),
        }
    }
}

/// Point-in-time view of a [`Counter`], matching the wire shape exposed by
/// `counters.to_dict()` (§6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSnapshot {
    /// Samples recorded.
    pub count: u64,
    /// Sum of all samples.
    pub sum: f64,
    /// Sum of squares of all samples, kept for downstream variance recomputation.
    pub squared_sum: f64,
    /// Smallest sample seen.
    pub min: f64,
    /// Largest sample seen.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedF64(f64);

impl Eq for OrderedF64 {}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A [`Counter`] plus an exact p95 tracker built from a pair of heaps: a max-heap
/// holding the lower ~95% of samples and a min-heap holding the upper ~5%. The max of
/// the low heap is always the 95th percentile of everything seen so far. This trades
/// unbounded memory (every sample is retained) for an exact answer; acceptable for the
/// per-method execution timers this runtime keeps, which are not expected to run for
/// the lifetime of a long-lived process without a restart.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    counter: Counter,
    low: BinaryHeap<OrderedF64>,
    high: BinaryHeap<Reverse<OrderedF64>>,
}

impl Timer {
    /// Records one duration sample, in seconds.
    pub fn add(&mut self, sample_seconds: f64) {
        self.counter.add(sample_seconds);

        match self.low.peek() {
            Some(OrderedF64(max_low)) if sample_seconds > *max_low => {
                self.high.push(Reverse(OrderedF64(sample_seconds)))
            }
            _ => self.low.push(OrderedF64(sample_seconds)),
        }

        // keep `low` at ceil(0.95 * n) so its max is exactly the p95 boundary.
        let n = self.low.len() + self.high.len();
        let target_low = ((n as f64) * 0.95).ceil() as usize;

        while self.low.len() > target_low {
            if let Some(OrderedF64(v)) = self.low.pop() {
                self.high.push(Reverse(OrderedF64(v)));
            }
        }
        while self.low.len() < target_low {
            if let Some(Reverse(OrderedF64(v))) = self.high.pop() {
                self.low.push(OrderedF64(v));
            } else {
                break;
            }
        }
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.counter.count()
    }

    fn p95(&self) -> f64 {
        self.low.peek().map(|OrderedF64(v)| *v).unwrap_or(0.0)
    }

    /// Snapshots the current accumulator and p95 estimate for reporting.
    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot { counter: self.counter.snapshot(), distribution95: self.p95() }
    }
}

/// Point-in-time view of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerSnapshot {
    /// The underlying counter fields (count, sum, min, max, mean, stddev, squared_sum).
    pub counter: CounterSnapshot,
    /// The 95th percentile of all samples recorded so far.
    pub distribution95: f64,
}

/// Counter name for successfully answered requests (§6).
pub const RESPONSE_SERVED: &str = "response_served";
/// Counter name for upward crossings of the worker pool's saturation threshold (§6).
pub const POOL_OVERFLOW: &str = "pool_overflow";

/// The application's counters and timers, keyed by name.
///
/// Execution timers live in `timers`, keyed `"<service>::<method>"`. Dispatch-late
/// timers (§4.5, §7) live in the separate `timeouts` map, keyed the same way, matching
/// the spec's `timeouts["<service>::<method>"]` notation.
#[derive(Debug, Default)]
pub struct TelemetryRegistry {
    counters: HashMap<String, Counter>,
    timers: HashMap<String, Timer>,
    timeouts: HashMap<String, Timer>,
}

impl TelemetryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for `name`, creating it on first use.
    pub fn counter(&mut self, name: &str) -> &mut Counter {
        self.counters.entry(name.to_owned()).or_default()
    }

    /// Returns the execution timer for `"<service>::<method>"`, creating it on first use.
    pub fn timer(&mut self, key: &str) -> &mut Timer {
        self.timers.entry(key.to_owned()).or_default()
    }

    /// Returns the dispatch-late timer for `"<service>::<method>"`, creating it on first use.
    pub fn timeout_timer(&mut self, key: &str) -> &mut Timer {
        self.timeouts.entry(key.to_owned()).or_default()
    }

    /// Snapshots every counter, matching `counters.to_dict()` (§6).
    pub fn counters_snapshot(&self) -> HashMap<String, CounterSnapshot> {
        self.counters.iter().map(|(k, v)| (k.clone(), v.snapshot())).collect()
    }

    /// Snapshots every execution timer, matching `timers.to_dict()` (§6).
    pub fn timers_snapshot(&self) -> HashMap<String, TimerSnapshot> {
        self.timers.iter().map(|(k, v)| (k.clone(), v.snapshot())).collect()
    }

    /// Snapshots every dispatch-late timer.
    pub fn timeouts_snapshot(&self) -> HashMap<String, TimerSnapshot> {
        self.timeouts.iter().map(|(k, v)| (k.clone(), v.snapshot())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_tracks_basic_statistics() {
        let mut c = Counter::default();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            c.add(v);
        }
        let snap = c.snapshot();
        assert_eq!(snap.count, 5);
        assert_eq!(snap.sum, 15.0);
        assert_eq!(snap.min, 1.0);
        assert_eq!(snap.max, 5.0);
        assert_eq!(snap.mean, 3.0);
        assert!((snap.stddev - std::f64::consts::SQRT_2).abs() < 1e-9);
    }

    #[test]
    fn timer_p95_matches_known_distribution() {
        let mut t = Timer::default();
        for v in 1..=100 {
            t.add(v as f64);
        }
        // the 95th of 1..=100 sits at the 95th value.
        assert!((t.snapshot().distribution95 - 95.0).abs() <= 1.0);
    }

    #[test]
    fn registry_creates_entries_lazily() {
        let mut reg = TelemetryRegistry::new();
        reg.counter(RESPONSE_SERVED).increment();
        reg.counter(RESPONSE_SERVED).increment();
        reg.timer("Echo::echo").add(0.001);

        assert_eq!(reg.counters_snapshot()[RESPONSE_SERVED].count, 2);
        assert_eq!(reg.timers_snapshot()["Echo::echo"].counter.count, 1);
        assert!(reg.timeouts_snapshot().is_empty());
    }
}
