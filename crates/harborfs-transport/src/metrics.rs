//! Connection-manager metrics.
//!
//! Three families: a gauge of clients per state, and duration histograms for
//! the two entry points, labelled by result so failed admits and timed-out
//! drains can be graphed apart from the happy path.

use std::time::Instant;

use harborfs_monitoring::{buckets_exp2, Gauge, HistogramInt, Registry};

use crate::client::ClientState;
use crate::connmgr::{Admission, DrainOutcome};
use crate::error::Result;

const CLIENTS_GAUGE: &str = "connection_manager_clients";
const STARTED_HISTOGRAM: &str = "connection_manager_connection_started_duration_ms";
const DRAIN_HISTOGRAM: &str = "connection_manager_drain_local_duration_ms";

fn state_gauge(registry: &Registry, state: ClientState) -> Result<Gauge> {
    Ok(registry.register_gauge(
        CLIENTS_GAUGE,
        "Connection manager clients per state.",
        &[("state", state.as_label())],
    )?)
}

fn started_histogram(registry: &Registry, result: Admission) -> Result<HistogramInt> {
    Ok(registry.register_histogram(
        STARTED_HISTOGRAM,
        "Connection admission duration per result.",
        &[("result", result.as_label())],
        &buckets_exp2(),
    )?)
}

fn drain_histogram(registry: &Registry, result: DrainOutcome) -> Result<HistogramInt> {
    Ok(registry.register_histogram(
        DRAIN_HISTOGRAM,
        "Local client drain duration per result.",
        &[("result", result.as_label())],
        &buckets_exp2(),
    )?)
}

/// Handles for every connection-manager metric.
pub struct ConnMgrMetrics {
    clients: [Gauge; 4],
    connection_started: [HistogramInt; 2],
    drain_local: [HistogramInt; 4],
}

impl ConnMgrMetrics {
    /// Registers all families against the given registry.
    pub fn register(registry: &Registry) -> Result<Self> {
        Ok(Self {
            clients: [
                state_gauge(registry, ClientState::Drained)?,
                state_gauge(registry, ClientState::Activating)?,
                state_gauge(registry, ClientState::Active)?,
                state_gauge(registry, ClientState::Draining)?,
            ],
            connection_started: [
                started_histogram(registry, Admission::Allow)?,
                started_histogram(registry, Admission::Drop)?,
            ],
            drain_local: [
                drain_histogram(registry, DrainOutcome::Success)?,
                drain_histogram(registry, DrainOutcome::SuccessNoConnections)?,
                drain_histogram(registry, DrainOutcome::Failed)?,
                drain_histogram(registry, DrainOutcome::FailedTimeout)?,
            ],
        })
    }

    pub(crate) fn client_state_inc(&self, state: ClientState) {
        self.clients[state.index()].inc();
    }

    pub(crate) fn client_state_dec(&self, state: ClientState) {
        self.clients[state.index()].dec();
    }

    /// Number of clients currently in the given state.
    pub fn clients_in_state(&self, state: ClientState) -> i64 {
        self.clients[state.index()].value()
    }

    pub(crate) fn connection_started_done(&self, result: Admission, start: Instant) {
        self.connection_started[result.index()].observe(elapsed_ms(start));
    }

    pub(crate) fn drain_local_done(&self, result: DrainOutcome, start: Instant) {
        self.drain_local[result.index()].observe(elapsed_ms(start));
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_creates_families() {
        let registry = Registry::new();
        let metrics = ConnMgrMetrics::register(&registry).unwrap();
        metrics.client_state_inc(ClientState::Drained);
        metrics.client_state_inc(ClientState::Active);
        metrics.client_state_dec(ClientState::Drained);

        assert_eq!(metrics.clients_in_state(ClientState::Drained), 0);
        assert_eq!(metrics.clients_in_state(ClientState::Active), 1);
        assert_eq!(registry.collect().len(), 3);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = Registry::new();
        let first = ConnMgrMetrics::register(&registry).unwrap();
        let second = ConnMgrMetrics::register(&registry).unwrap();
        first.client_state_inc(ClientState::Drained);
        assert_eq!(second.clients_in_state(ClientState::Drained), 1);
    }

    #[test]
    fn test_duration_observations() {
        let registry = Registry::new();
        let metrics = ConnMgrMetrics::register(&registry).unwrap();
        metrics.connection_started_done(Admission::Allow, Instant::now());
        metrics.drain_local_done(DrainOutcome::FailedTimeout, Instant::now());

        let text = harborfs_monitoring::render(&registry.collect());
        assert!(text.contains(
            "connection_manager_connection_started_duration_ms_count{result=\"ALLOW\"} 1"
        ));
        assert!(text.contains(
            "connection_manager_drain_local_duration_ms_count{result=\"FAILED_TIMEOUT\"} 1"
        ));
    }
}
