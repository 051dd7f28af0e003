//! Process-wide metric registry.
//!
//! Registration is idempotent: the same (name, label-set) pair always
//! resolves to the same cell, so modules can re-register their metrics
//! without coordinating initialisation order. Registrations take the write
//! lock; collection takes the read lock; observations go straight to the
//! cells and take no registry lock at all.

use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{MonitoringError, Result};
use crate::metric::{
    Counter, CounterCell, Gauge, GaugeCell, HistogramFloat, HistogramFloatCell, HistogramInt,
    HistogramIntCell, Labels, MetricKind,
};

enum Cell {
    Counter(Arc<CounterCell>),
    Gauge(Arc<GaugeCell>),
    HistogramInt(Arc<HistogramIntCell>),
    HistogramFloat(Arc<HistogramFloatCell>),
}

struct Sample {
    labels: Labels,
    cell: Cell,
}

struct Family {
    name: String,
    help: String,
    kind: MetricKind,
    samples: Vec<Sample>,
}

/// Registry of metric families.
///
/// A single instance is shared by the whole process; [`Registry::global`]
/// returns it. Independent instances can still be created for tests.
pub struct Registry {
    families: RwLock<Vec<Family>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of one metric family.
#[derive(Debug, Clone)]
pub struct FamilySnapshot {
    /// Family name.
    pub name: String,
    /// Help text.
    pub help: String,
    /// Family kind.
    pub kind: MetricKind,
    /// One entry per registered label-set, in registration order.
    pub samples: Vec<SampleSnapshot>,
}

/// Point-in-time snapshot of one sample.
#[derive(Debug, Clone)]
pub struct SampleSnapshot {
    /// Normalised label set.
    pub labels: Labels,
    /// Observed value.
    pub value: SampleValue,
}

/// The value of a sample at collection time.
#[derive(Debug, Clone)]
pub enum SampleValue {
    /// Counter value.
    Counter(u64),
    /// Gauge value.
    Gauge(i64),
    /// Integer histogram: cumulative bucket counts, sum and count.
    HistogramInt {
        /// (upper bound, cumulative count) pairs, excluding +Inf.
        buckets: Vec<(i64, u64)>,
        /// Sum of observations.
        sum: i64,
        /// Number of observations.
        count: u64,
    },
    /// Floating-point histogram: cumulative bucket counts, sum and count.
    HistogramFloat {
        /// (upper bound, cumulative count) pairs, excluding +Inf.
        buckets: Vec<(f64, u64)>,
        /// Sum of observations.
        sum: f64,
        /// Number of observations.
        count: u64,
    },
}

impl SampleSnapshot {
    /// True when the sample holds the null element for its kind.
    ///
    /// Untouched counters and histograms are elided from scrape output;
    /// gauges are never considered empty since zero is a meaningful reading.
    pub fn is_empty(&self) -> bool {
        match &self.value {
            SampleValue::Counter(v) => *v == 0,
            SampleValue::Gauge(_) => false,
            SampleValue::HistogramInt { count, .. } => *count == 0,
            SampleValue::HistogramFloat { count, .. } => *count == 0,
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn normalize_labels(labels: &[(&str, &str)]) -> Result<Labels> {
    for (key, _) in labels {
        if !is_valid_name(key) {
            return Err(MonitoringError::InvalidLabelKey {
                key: (*key).to_string(),
            });
        }
    }
    let mut normalized: Labels = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    normalized.sort();
    Ok(normalized)
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            families: RwLock::new(Vec::new()),
        }
    }

    /// The shared process-wide registry.
    pub fn global() -> &'static Arc<Registry> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Registry::new()))
    }

    fn with_sample<T>(
        &self,
        name: &str,
        help: &str,
        labels: &[(&str, &str)],
        kind: MetricKind,
        reuse: impl Fn(&Cell) -> Option<T>,
        create: impl FnOnce() -> (Cell, T),
    ) -> Result<T> {
        if !is_valid_name(name) {
            return Err(MonitoringError::InvalidName {
                name: name.to_string(),
            });
        }
        let labels = normalize_labels(labels)?;
        let mut families = self.families.write().unwrap();

        let index = match families.iter().position(|f| f.name == name) {
            Some(index) => {
                if families[index].kind != kind {
                    return Err(MonitoringError::KindMismatch {
                        name: name.to_string(),
                        existing: families[index].kind,
                    });
                }
                index
            }
            None => {
                families.push(Family {
                    name: name.to_string(),
                    help: help.to_string(),
                    kind,
                    samples: Vec::new(),
                });
                families.len() - 1
            }
        };
        let family = &mut families[index];

        if let Some(sample) = family.samples.iter().find(|s| s.labels == labels) {
            if let Some(handle) = reuse(&sample.cell) {
                return Ok(handle);
            }
        }

        let (cell, handle) = create();
        family.samples.push(Sample { labels, cell });
        Ok(handle)
    }

    /// Registers (or looks up) a counter.
    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        labels: &[(&str, &str)],
    ) -> Result<Counter> {
        self.with_sample(
            name,
            help,
            labels,
            MetricKind::Counter,
            |cell| match cell {
                Cell::Counter(c) => Some(Counter { cell: c.clone() }),
                _ => None,
            },
            || {
                let cell = Arc::new(CounterCell::default());
                (Cell::Counter(cell.clone()), Counter { cell })
            },
        )
    }

    /// Registers (or looks up) a gauge.
    pub fn register_gauge(&self, name: &str, help: &str, labels: &[(&str, &str)]) -> Result<Gauge> {
        self.with_sample(
            name,
            help,
            labels,
            MetricKind::Gauge,
            |cell| match cell {
                Cell::Gauge(c) => Some(Gauge { cell: c.clone() }),
                _ => None,
            },
            || {
                let cell = Arc::new(GaugeCell::default());
                (Cell::Gauge(cell.clone()), Gauge { cell })
            },
        )
    }

    /// Registers (or looks up) an integer histogram.
    ///
    /// Bucket boundaries are taken from the first registration; later
    /// registrations of the same (name, label-set) reuse the existing cell.
    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        labels: &[(&str, &str)],
        bounds: &[i64],
    ) -> Result<HistogramInt> {
        self.with_sample(
            name,
            help,
            labels,
            MetricKind::HistogramInt,
            |cell| match cell {
                Cell::HistogramInt(c) => Some(HistogramInt { cell: c.clone() }),
                _ => None,
            },
            || {
                let cell = Arc::new(HistogramIntCell::new(bounds));
                (Cell::HistogramInt(cell.clone()), HistogramInt { cell })
            },
        )
    }

    /// Registers (or looks up) a floating-point histogram.
    pub fn register_histogram_f64(
        &self,
        name: &str,
        help: &str,
        labels: &[(&str, &str)],
        bounds: &[f64],
    ) -> Result<HistogramFloat> {
        self.with_sample(
            name,
            help,
            labels,
            MetricKind::HistogramFloat,
            |cell| match cell {
                Cell::HistogramFloat(c) => Some(HistogramFloat { cell: c.clone() }),
                _ => None,
            },
            || {
                let cell = Arc::new(HistogramFloatCell::new(bounds));
                (Cell::HistogramFloat(cell.clone()), HistogramFloat { cell })
            },
        )
    }

    /// Collects a snapshot of every family in registration order.
    pub fn collect(&self) -> Vec<FamilySnapshot> {
        let families = self.families.read().unwrap();
        families
            .iter()
            .map(|family| FamilySnapshot {
                name: family.name.clone(),
                help: family.help.clone(),
                kind: family.kind,
                samples: family
                    .samples
                    .iter()
                    .map(|sample| SampleSnapshot {
                        labels: sample.labels.clone(),
                        value: match &sample.cell {
                            Cell::Counter(c) => SampleValue::Counter(c.get()),
                            Cell::Gauge(c) => SampleValue::Gauge(c.get()),
                            Cell::HistogramInt(c) => SampleValue::HistogramInt {
                                buckets: c.cumulative(),
                                sum: c.sum(),
                                count: c.count(),
                            },
                            Cell::HistogramFloat(c) => SampleValue::HistogramFloat {
                                buckets: c.cumulative(),
                                sum: c.sum(),
                                count: c.count(),
                            },
                        },
                    })
                    .collect(),
            })
            .collect()
    }
}
