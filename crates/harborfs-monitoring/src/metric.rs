//! Metric cells and the handles that observe them.
//!
//! A cell is the shared atomic storage for one (name, label-set) sample;
//! handles are thin `Arc` wrappers that can be cloned into any thread.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Label key/value pairs identifying one sample within a family.
///
/// Label sets are normalised (sorted by key) at registration time so that the
/// same logical set always resolves to the same cell.
pub type Labels = Vec<(String, String)>;

/// The kind of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonically increasing counter.
    Counter,
    /// Gauge that can move in both directions.
    Gauge,
    /// Histogram over integer observations.
    HistogramInt,
    /// Histogram over floating-point observations.
    HistogramFloat,
}

#[derive(Debug, Default)]
pub(crate) struct CounterCell {
    value: AtomicU64,
}

impl CounterCell {
    pub(crate) fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct GaugeCell {
    value: AtomicI64,
}

impl GaugeCell {
    pub(crate) fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub(crate) struct HistogramIntCell {
    bounds: Vec<i64>,
    /// One slot per bound plus the overflow slot; non-cumulative.
    counts: Vec<AtomicU64>,
    sum: AtomicI64,
    count: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct HistogramFloatCell {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// f64 bits, updated with a compare-exchange loop.
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl HistogramIntCell {
    pub(crate) fn new(bounds: &[i64]) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds: bounds.to_vec(),
            counts,
            sum: AtomicI64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: i64) {
        let idx = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative per-bucket counts, excluding the +Inf slot.
    pub(crate) fn cumulative(&self) -> Vec<(i64, u64)> {
        let mut acc = 0u64;
        self.bounds
            .iter()
            .enumerate()
            .map(|(i, &b)| {
                acc += self.counts[i].load(Ordering::Relaxed);
                (b, acc)
            })
            .collect()
    }

    pub(crate) fn sum(&self) -> i64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl HistogramFloatCell {
    pub(crate) fn new(bounds: &[f64]) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds: bounds.to_vec(),
            counts,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        let mut old = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let new = (f64::from_bits(old) + value).to_bits();
            match self
                .sum_bits
                .compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut acc = 0u64;
        self.bounds
            .iter()
            .enumerate()
            .map(|(i, &b)| {
                acc += self.counts[i].load(Ordering::Relaxed);
                (b, acc)
            })
            .collect()
    }

    pub(crate) fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Handle to a monotonically increasing counter.
#[derive(Debug, Clone)]
pub struct Counter {
    pub(crate) cell: Arc<CounterCell>,
}

impl Counter {
    /// Increments the counter by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Adds `delta` to the counter.
    pub fn add(&self, delta: u64) {
        self.cell.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.cell.value.load(Ordering::Relaxed)
    }
}

/// Handle to a gauge.
#[derive(Debug, Clone)]
pub struct Gauge {
    pub(crate) cell: Arc<GaugeCell>,
}

impl Gauge {
    /// Increments the gauge by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Decrements the gauge by one.
    pub fn dec(&self) {
        self.sub(1);
    }

    /// Adds `delta` to the gauge.
    pub fn add(&self, delta: i64) {
        self.cell.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Subtracts `delta` from the gauge.
    pub fn sub(&self, delta: i64) {
        self.cell.value.fetch_sub(delta, Ordering::Relaxed);
    }

    /// Sets the gauge to an absolute value.
    pub fn set(&self, value: i64) {
        self.cell.value.store(value, Ordering::Relaxed);
    }

    /// Current gauge value.
    pub fn value(&self) -> i64 {
        self.cell.value.load(Ordering::Relaxed)
    }
}

/// Handle to a histogram over integer observations.
///
/// Bucket boundaries are frozen when the histogram is first registered.
#[derive(Debug, Clone)]
pub struct HistogramInt {
    pub(crate) cell: Arc<HistogramIntCell>,
}

impl HistogramInt {
    /// Records one observation.
    pub fn observe(&self, value: i64) {
        self.cell.observe(value);
    }

    /// Number of observations recorded so far.
    pub fn sample_count(&self) -> u64 {
        self.cell.count()
    }

    /// Sum of all observations recorded so far.
    pub fn sample_sum(&self) -> i64 {
        self.cell.sum()
    }
}

/// Handle to a histogram over floating-point observations.
#[derive(Debug, Clone)]
pub struct HistogramFloat {
    pub(crate) cell: Arc<HistogramFloatCell>,
}

impl HistogramFloat {
    /// Records one observation.
    pub fn observe(&self, value: f64) {
        self.cell.observe(value);
    }

    /// Number of observations recorded so far.
    pub fn sample_count(&self) -> u64 {
        self.cell.count()
    }

    /// Sum of all observations recorded so far.
    pub fn sample_sum(&self) -> f64 {
        self.cell.sum()
    }
}
