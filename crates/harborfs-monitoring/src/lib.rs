#![warn(missing_docs)]

//! HarborFS monitoring subsystem: metric registry, Prometheus text exposition,
//! and the scrape endpoint.
//!
//! Metrics are registered once against a [`Registry`] and observed through
//! cheap clonable handles from any thread. The [`Exposer`] serves the
//! registry's contents in Prometheus text format over a bare HTTP socket,
//! eliding samples that have never been touched so that scrape payloads stay
//! small on servers with wide label spaces.

/// Histogram bucket ladder generators.
pub mod buckets;
/// Error types for the monitoring subsystem.
pub mod error;
/// HTTP scrape endpoint.
pub mod exposer;
/// Metric cells and handles.
pub mod metric;
/// Process-wide metric registry.
pub mod registry;
/// Prometheus text-format serialisation.
pub mod text;

pub use buckets::{buckets_exp2, buckets_exp2_compact};
pub use error::{MonitoringError, Result};
pub use exposer::Exposer;
pub use metric::{Counter, Gauge, HistogramFloat, HistogramInt, Labels, MetricKind};
pub use registry::{FamilySnapshot, Registry, SampleSnapshot, SampleValue};
pub use text::render;
