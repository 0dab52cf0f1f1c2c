//! Atomic metric primitives.
//!
//! Process-scoped counters are plain atomics behind `Arc`, created
//! explicitly at boot and passed through an injected context so tests
//! stay deterministic. Snapshots are taken lock-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge (queue depths and the like).
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter family with one free label (e.g. `messages_total{result=...}`).
///
/// Label values are created on first use; callers keep the returned
/// `Counter` when they are on a hot path.
#[derive(Debug, Clone, Default)]
pub struct LabeledCounter {
    values: Arc<Mutex<HashMap<String, Counter>>>,
}

impl LabeledCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(&self, label_value: &str) -> Counter {
        let mut values = self.values.lock().unwrap();
        values.entry(label_value.to_string()).or_default().clone()
    }

    pub fn inc(&self, label_value: &str) {
        self.with_value(label_value).inc();
    }

    pub fn get(&self, label_value: &str) -> u64 {
        self.values
            .lock()
            .unwrap()
            .get(label_value)
            .map(|c| c.get())
            .unwrap_or(0)
    }

    /// Snapshot of `(label_value, count)` pairs, sorted by label for
    /// stable exposition output.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .values
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect();
        out.sort();
        out
    }
}

/// Fixed-bucket histogram of seconds.
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds: Arc<Vec<f64>>,
    /// One slot per bound plus the +Inf overflow slot.
    buckets: Arc<Vec<AtomicU64>>,
    count: Arc<AtomicU64>,
    /// Sum of observations, stored as f64 bits.
    sum_bits: Arc<AtomicU64>,
}

/// Default latency buckets for write/flush timings (seconds).
pub const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

impl Histogram {
    pub fn new(bounds: &[f64]) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds: Arc::new(bounds.to_vec()),
            buckets: Arc::new(buckets),
            count: Arc::new(AtomicU64::new(0)),
            sum_bits: Arc::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.sum_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    /// Cumulative `(upper_bound, count)` pairs ending with the +Inf bucket.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            running += bucket.load(Ordering::Relaxed);
            let bound = self.bounds.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((bound, running));
        }
        out
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(LATENCY_BUCKETS)
    }
}
