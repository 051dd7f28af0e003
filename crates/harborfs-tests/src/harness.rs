//! Shared scaffolding for multi-replica scenarios.

use std::sync::Arc;
use std::time::Instant;

use harborfs_grace::{GraceConfig, GraceCoordinator, GraceStore};
use harborfs_monitoring::Registry;
use harborfs_transport::{
    ClientAddr, ConnectionManager, ConnectionManagerConfig, DrainOutcome, PeerDrain,
};
use tracing::debug;

/// Installs a subscriber printing spans/events for the current test run.
/// Repeat calls are fine; only the first wins.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// One in-process HarborFS replica: its own registry, connection manager,
/// and a grace coordinator bound to the shared cluster store.
pub struct Replica {
    /// Member identifier in the grace object.
    pub id: String,
    /// The replica's metric registry.
    pub registry: Arc<Registry>,
    /// The replica's connection manager.
    pub manager: Arc<ConnectionManager>,
    /// Coordinator bound to the cluster-shared grace object.
    pub grace: GraceCoordinator,
}

impl Replica {
    /// Builds a replica around the shared store.
    pub fn new(id: &str, store: Arc<dyn GraceStore>, config: ConnectionManagerConfig) -> Self {
        init_test_logging();
        let registry = Arc::new(Registry::new());
        let manager = Arc::new(ConnectionManager::new(config, &registry).unwrap());
        let grace = GraceCoordinator::new(store, &GraceConfig::default());
        debug!(replica = id, "test replica ready");
        Self {
            id: id.to_string(),
            registry,
            manager,
            grace,
        }
    }
}

/// Peer-drain callback that forwards the drain to another replica's
/// connection manager, the way the cluster RPC layer would.
pub struct ForwardingPeerDrain {
    peers: Vec<Arc<ConnectionManager>>,
}

impl ForwardingPeerDrain {
    /// Builds a callback draining the given peer managers.
    pub fn new(peers: Vec<Arc<ConnectionManager>>) -> Arc<Self> {
        Arc::new(Self { peers })
    }
}

impl PeerDrain for ForwardingPeerDrain {
    fn drain_peers(&self, client: &ClientAddr, _deadline: Instant) -> DrainOutcome {
        let mut worst = DrainOutcome::SuccessNoConnections;
        for peer in &self.peers {
            let outcome = peer.drain_and_disconnect_local(client);
            if !outcome.is_success() {
                return outcome;
            }
            if outcome == DrainOutcome::Success {
                worst = DrainOutcome::Success;
            }
        }
        worst
    }
}
