//! Prometheus text-format serialisation.
//!
//! Most samples on a quiet server are untouched (consider a latency histogram
//! labelled with a rare status code), so rendering elides samples whose value
//! is the null element for their kind. This shrinks scrape payloads from
//! megabytes to kilobytes. One elided sample per family is kept as a
//! representative so the family stays visible to queries.

use std::fmt::Write;

use crate::metric::{Labels, MetricKind};
use crate::registry::{FamilySnapshot, SampleSnapshot, SampleValue};

fn kind_str(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Counter => "counter",
        MetricKind::Gauge => "gauge",
        MetricKind::HistogramInt | MetricKind::HistogramFloat => "histogram",
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn format_labels(labels: &Labels, extra: Option<(&str, &str)>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    if let Some((k, v)) = extra {
        parts.push(format!("{}=\"{}\"", k, v));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn format_f64(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Selects the samples to render: every non-empty sample, plus the first
/// empty one as a representative of the elided remainder.
fn compact(samples: &[SampleSnapshot]) -> Vec<&SampleSnapshot> {
    let mut kept = Vec::with_capacity(samples.len());
    let mut empty_kept = false;
    for sample in samples {
        if sample.is_empty() {
            if !empty_kept {
                kept.push(sample);
                empty_kept = true;
            }
        } else {
            kept.push(sample);
        }
    }
    kept
}

fn render_sample(out: &mut String, name: &str, sample: &SampleSnapshot) {
    match &sample.value {
        SampleValue::Counter(v) => {
            let _ = writeln!(out, "{}{} {}", name, format_labels(&sample.labels, None), v);
        }
        SampleValue::Gauge(v) => {
            let _ = writeln!(out, "{}{} {}", name, format_labels(&sample.labels, None), v);
        }
        SampleValue::HistogramInt { buckets, sum, count } => {
            for (bound, cumulative) in buckets {
                let _ = writeln!(
                    out,
                    "{}_bucket{} {}",
                    name,
                    format_labels(&sample.labels, Some(("le", &bound.to_string()))),
                    cumulative
                );
            }
            let _ = writeln!(
                out,
                "{}_bucket{} {}",
                name,
                format_labels(&sample.labels, Some(("le", "+Inf"))),
                count
            );
            let _ = writeln!(out, "{}_sum{} {}", name, format_labels(&sample.labels, None), sum);
            let _ = writeln!(
                out,
                "{}_count{} {}",
                name,
                format_labels(&sample.labels, None),
                count
            );
        }
        SampleValue::HistogramFloat { buckets, sum, count } => {
            for (bound, cumulative) in buckets {
                let _ = writeln!(
                    out,
                    "{}_bucket{} {}",
                    name,
                    format_labels(&sample.labels, Some(("le", &format_f64(*bound)))),
                    cumulative
                );
            }
            let _ = writeln!(
                out,
                "{}_bucket{} {}",
                name,
                format_labels(&sample.labels, Some(("le", "+Inf"))),
                count
            );
            let _ = writeln!(
                out,
                "{}_sum{} {}",
                name,
                format_labels(&sample.labels, None),
                format_f64(*sum)
            );
            let _ = writeln!(
                out,
                "{}_count{} {}",
                name,
                format_labels(&sample.labels, None),
                count
            );
        }
    }
}

/// Renders a collected snapshot as Prometheus text format, with elision.
pub fn render(families: &[FamilySnapshot]) -> String {
    let mut out = String::new();
    for family in families {
        let samples = compact(&family.samples);
        if samples.is_empty() {
            continue;
        }
        let _ = writeln!(out, "# HELP {} {}", family.name, family.help);
        let _ = writeln!(out, "# TYPE {} {}", family.name, kind_str(family.kind));
        for sample in samples {
            render_sample(&mut out, &family.name, sample);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn test_counter_rendering() {
        let registry = Registry::new();
        let counter = registry
            .register_counter("rpcs_total", "Total RPCs.", &[("version", "v4")])
            .unwrap();
        counter.add(3);

        let text = render(&registry.collect());
        assert!(text.contains("# HELP rpcs_total Total RPCs."));
        assert!(text.contains("# TYPE rpcs_total counter"));
        assert!(text.contains("rpcs_total{version=\"v4\"} 3"));
    }

    #[test]
    fn test_histogram_rendering_cumulative() {
        let registry = Registry::new();
        let hist = registry
            .register_histogram("latency_ms", "Latency.", &[], &[1, 2, 4])
            .unwrap();
        hist.observe(1);
        hist.observe(3);

        let text = render(&registry.collect());
        assert!(text.contains("latency_ms_bucket{le=\"1\"} 1"));
        assert!(text.contains("latency_ms_bucket{le=\"2\"} 1"));
        assert!(text.contains("latency_ms_bucket{le=\"4\"} 2"));
        assert!(text.contains("latency_ms_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("latency_ms_sum 4"));
        assert!(text.contains("latency_ms_count 2"));
    }

    #[test]
    fn test_zero_counters_elided() {
        let registry = Registry::new();
        let touched = registry
            .register_counter("ops_total", "Ops.", &[("op", "read")])
            .unwrap();
        registry
            .register_counter("ops_total", "Ops.", &[("op", "write")])
            .unwrap();
        registry
            .register_counter("ops_total", "Ops.", &[("op", "remove")])
            .unwrap();
        touched.inc();

        let text = render(&registry.collect());
        assert!(text.contains("ops_total{op=\"read\"} 1"));
        // Exactly one empty representative survives.
        assert!(text.contains("ops_total{op=\"write\"} 0"));
        assert!(!text.contains("op=\"remove\""));
    }

    #[test]
    fn test_all_empty_family_keeps_one_sample() {
        let registry = Registry::new();
        registry
            .register_counter("quiet_total", "Quiet.", &[("op", "a")])
            .unwrap();
        registry
            .register_counter("quiet_total", "Quiet.", &[("op", "b")])
            .unwrap();

        let text = render(&registry.collect());
        assert!(text.contains("quiet_total{op=\"a\"} 0"));
        assert!(!text.contains("op=\"b\""));
    }

    #[test]
    fn test_gauges_never_elided() {
        let registry = Registry::new();
        registry
            .register_gauge("clients", "Clients.", &[("state", "drained")])
            .unwrap();
        registry
            .register_gauge("clients", "Clients.", &[("state", "active")])
            .unwrap();

        let text = render(&registry.collect());
        assert!(text.contains("clients{state=\"drained\"} 0"));
        assert!(text.contains("clients{state=\"active\"} 0"));
    }

    #[test]
    fn test_label_value_escaping() {
        let registry = Registry::new();
        let counter = registry
            .register_counter("paths_total", "Paths.", &[("path", "a\"b\\c")])
            .unwrap();
        counter.inc();

        let text = render(&registry.collect());
        assert!(text.contains("paths_total{path=\"a\\\"b\\\\c\"} 1"));
    }

    #[test]
    fn test_histogram_elision_keeps_family_member() {
        let registry = Registry::new();
        let ok = registry
            .register_histogram(
                "op_latency_ms",
                "Latency.",
                &[("op", "READ"), ("status", "OK")],
                &[1, 2],
            )
            .unwrap();
        registry
            .register_histogram(
                "op_latency_ms",
                "Latency.",
                &[("op", "READ"), ("status", "ERR")],
                &[1, 2],
            )
            .unwrap();
        ok.observe(1);

        let text = render(&registry.collect());
        assert!(text.contains("op_latency_ms_bucket{op=\"READ\",status=\"OK\",le=\"1\"} 1"));
        // The untouched label-set keeps exactly one empty representative.
        assert!(text.contains("op_latency_ms_count{op=\"READ\",status=\"ERR\"} 0"));
    }
}
