//! Bucket boundary ladders shared by histogram users.

/// Powers-of-two ladder: 1, 2, 4, ... 2^30.
///
/// The default for latency and size histograms where a wide dynamic range
/// matters more than resolution.
pub fn buckets_exp2() -> Vec<i64> {
    (0..=30).map(|shift| 1i64 << shift).collect()
}

/// Decimal-compact doubling ladder: 10, 20, 40, ... 327680.
///
/// Half the slots of [`buckets_exp2`] with round decimal anchors, for metrics
/// scraped at high frequency.
pub fn buckets_exp2_compact() -> Vec<i64> {
    (0..16).map(|shift| 10i64 << shift).collect()
}
