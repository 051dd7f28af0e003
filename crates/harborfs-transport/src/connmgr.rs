//! Connection-manager state machine.
//!
//! Keeps each client connected to a single replica at a time. The first
//! connection from a client transitions its record DRAINED -> ACTIVATING and
//! runs the registered peer-drain callback, which asks every other replica
//! to destroy its connections from that client; only after the callback
//! succeeds is the connection admitted (ACTIVE). A drain request arriving
//! from a peer runs the mirror image locally: ACTIVE -> DRAINING, forced
//! destruction of every connection, and back to DRAINED once the last one
//! finishes.
//!
//! All transitions happen under the client mutex. The two operations that
//! can block for seconds — the peer-drain callback and the
//! forced-destruction sweep — run with the mutex released; nothing else may
//! change the state out of ACTIVATING while the callback is in flight, and a
//! DRAINING state may be flipped back to ACTIVE by a new admit, which the
//! drain loop observes on its next wake.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::addr::ClientAddr;
use crate::client::{Client, ClientDirectory, ClientSnapshot, ClientState};
use crate::config::ConnectionManagerConfig;
use crate::error::Result;
use crate::metrics::ConnMgrMetrics;
use crate::xprt::Transport;

use harborfs_monitoring::Registry;

/// Verdict for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The connection may be created and execute requests.
    Allow,
    /// Peer draining failed; the caller must destroy the transport.
    Drop,
}

impl Admission {
    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            Admission::Allow => "ALLOW",
            Admission::Drop => "DROP",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

/// Outcome of a drain, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection was destroyed.
    Success,
    /// Vacuously successful: the client had no connections here.
    SuccessNoConnections,
    /// The drain was aborted, most likely by a new incoming connection, or
    /// because this replica was busy draining peers for the same client.
    Failed,
    /// The deadline expired with connections still open.
    FailedTimeout,
}

impl DrainOutcome {
    /// True for both success variants.
    pub fn is_success(&self) -> bool {
        matches!(self, DrainOutcome::Success | DrainOutcome::SuccessNoConnections)
    }

    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            DrainOutcome::Success => "SUCCESS",
            DrainOutcome::SuccessNoConnections => "SUCCESS_NO_CONNECTIONS",
            DrainOutcome::Failed => "FAILED",
            DrainOutcome::FailedTimeout => "FAILED_TIMEOUT",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

/// Cluster side of an admit: asks every other replica to drain the client.
///
/// Implementations typically send one request per peer carrying the client's
/// address and the deadline, and wait for acknowledgements. The call is
/// synchronous; expiry of the deadline counts as failure.
pub trait PeerDrain: Send + Sync {
    /// Drains the client's connections on every other replica.
    fn drain_peers(&self, client: &ClientAddr, deadline: Instant) -> DrainOutcome;
}

/// Observer of the lease extension owed after a successful local drain.
///
/// Draining a client hands it to another replica, which may wait on further
/// peers before admitting it. The client's reclaimable state must survive
/// that whole window, so the lease is extended by the lease lifetime plus
/// the maximum time the cluster waits before declaring a replica dead.
pub trait LeaseHook: Send + Sync {
    /// Extends the client's state lease by `extension` from now.
    fn extend_lease(&self, client: &ClientAddr, extension: std::time::Duration);
}

/// The per-transport manager state: which client the connection belongs to.
///
/// The transport owns this struct through its state slot, so transport
/// destruction drives connection teardown. The held client refcount is the
/// only strong edge from the connection side; the client's set keeps weak
/// references back to the transports.
pub(crate) struct Connection {
    is_managed: bool,
    client: Option<Arc<Client>>,
    directory: Option<Arc<ClientDirectory>>,
}

impl Connection {
    fn unmanaged() -> Self {
        Self {
            is_managed: false,
            client: None,
            directory: None,
        }
    }

    fn managed(client: Arc<Client>, directory: Arc<ClientDirectory>) -> Self {
        Self {
            is_managed: true,
            client: Some(client),
            directory: Some(directory),
        }
    }

    pub(crate) fn is_managed(&self) -> bool {
        self.is_managed
    }

    pub(crate) fn client(&self) -> Option<&Arc<Client>> {
        self.client.as_ref()
    }
}

/// Runs the finished path for a transport's connection, if it has one.
///
/// Invoked from transport destruction and from the public entry point.
/// Idempotent: the slot is emptied on the first call, and unmanaged
/// connections only log. For managed connections the transport is removed
/// from its client's set, the waiters are woken, and the client reference is
/// released.
pub(crate) fn finish_connection(xprt: &Transport) {
    let Some(connection) = xprt.take_connection() else {
        debug!(id = xprt.id(), "connection is not managed");
        return;
    };
    if !connection.is_managed {
        debug!(id = xprt.id(), "connection is not managed");
        return;
    }
    let client = connection.client.expect("managed connection without client");
    let directory = connection
        .directory
        .expect("managed connection without directory");
    debug!(client = %client.addr(), id = xprt.id(), "connection finished");

    {
        let mut state = client.lock_state();
        if state.connections.remove(&xprt.id()).is_none() {
            error!(
                client = %client.addr(),
                id = xprt.id(),
                "finishing a connection that is not in its client's set"
            );
            panic!("finishing a connection that is not in its client's set");
        }
        state.connections_count -= 1;
        debug_assert_eq!(state.connections_count as usize, state.connections.len());
        client.notify_change();
    }
    directory.put(&client);
}

/// The connection manager: admission control plus local draining.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    directory: Arc<ClientDirectory>,
    metrics: Arc<ConnMgrMetrics>,
    peer_drain: RwLock<Option<Arc<dyn PeerDrain>>>,
    lease_hook: RwLock<Option<Arc<dyn LeaseHook>>>,
}

impl ConnectionManager {
    /// Creates a manager and registers its metrics.
    pub fn new(config: ConnectionManagerConfig, registry: &Registry) -> Result<Self> {
        let metrics = Arc::new(ConnMgrMetrics::register(registry)?);
        Ok(Self {
            config,
            directory: Arc::new(ClientDirectory::new(metrics.clone())),
            metrics,
            peer_drain: RwLock::new(None),
            lease_hook: RwLock::new(None),
        })
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }

    /// The manager's metric handles.
    pub fn metrics(&self) -> &ConnMgrMetrics {
        &self.metrics
    }

    /// Registers the peer-drain callback. Must be called exactly once before
    /// re-registration; wiring it twice is a defect.
    pub fn set_peer_drain(&self, callback: Arc<dyn PeerDrain>) {
        let mut slot = self.peer_drain.write().unwrap();
        if slot.is_some() {
            error!("peer drain callback registered twice");
            panic!("peer drain callback registered twice");
        }
        *slot = Some(callback);
    }

    /// Clears the peer-drain callback and hands the previous one back.
    /// Clearing an unset callback is a defect.
    pub fn clear_peer_drain(&self) -> Arc<dyn PeerDrain> {
        let mut slot = self.peer_drain.write().unwrap();
        match slot.take() {
            Some(callback) => callback,
            None => {
                error!("peer drain callback cleared while unset");
                panic!("peer drain callback cleared while unset");
            }
        }
    }

    /// Registers the lease-extension hook invoked after successful local
    /// drains.
    pub fn set_lease_hook(&self, hook: Arc<dyn LeaseHook>) {
        *self.lease_hook.write().unwrap() = Some(hook);
    }

    /// Point-in-time view of a client, for stats and tests.
    pub fn client_snapshot(&self, addr: &ClientAddr) -> Option<ClientSnapshot> {
        self.directory.snapshot(addr)
    }

    /// Number of client records currently tracked.
    pub fn client_count(&self) -> usize {
        self.directory.len()
    }

    fn invoke_peer_drain(&self, client: &ClientAddr, deadline: Instant) -> DrainOutcome {
        // The read lock is held across the call so the callback cannot be
        // cleared out from under a drain in flight.
        let guard = self.peer_drain.read().unwrap();
        match guard.as_ref() {
            Some(callback) => callback.drain_peers(client, deadline),
            None => {
                warn!(
                    client = %client,
                    "client connected before the peer drain callback was registered"
                );
                DrainOutcome::Failed
            }
        }
    }

    fn extend_lease_after_drain(&self, client: &ClientAddr) {
        let extension = self.config.lease_extension();
        if let Some(hook) = self.lease_hook.read().unwrap().as_ref() {
            debug!(client = %client, ?extension, "extending client lease after drain");
            hook.extend_lease(client, extension);
        }
    }

    /// Entry point for a new connection, once the peer address is known.
    ///
    /// Blocks until the client may run requests on this replica: for the
    /// first connection of a client that means a full peer drain bounded by
    /// the manager timeout. On `Drop` the caller must destroy the transport;
    /// nothing persistent was changed.
    pub fn connection_started(&self, xprt: &Arc<Transport>) -> Admission {
        let start = Instant::now();
        let addr = ClientAddr::from_socket(xprt.peer_addr());
        debug!(client = %addr, id = xprt.id(), "connection started");

        if !self.config.enable_connection_manager || addr.is_loopback() {
            debug!(client = %addr, id = xprt.id(), "connection is not managed");
            xprt.set_connection(Connection::unmanaged());
            self.metrics.connection_started_done(Admission::Allow, start);
            return Admission::Allow;
        }

        let client = self
            .directory
            .get(&addr, true)
            .expect("create-mode lookup always yields a client");
        // The slot is filled before the connection becomes visible in the
        // client's set, so a forced destroy arriving right after admission
        // always finds its way back to the set entry.
        xprt.set_connection(Connection::managed(client.clone(), self.directory.clone()));

        let mut state = client.lock_state();
        loop {
            match state.state {
                ClientState::Drained => {
                    debug!(client = %addr, "client is drained, activating");
                    client.change_state(&mut state, ClientState::Activating);
                    drop(state);

                    // Nothing else can leave ACTIVATING while this thread
                    // runs the callback, so the mutex can be released for
                    // the slow part.
                    let deadline = Instant::now() + self.config.manager_timeout();
                    let outcome = self.invoke_peer_drain(&addr, deadline);

                    state = client.lock_state();
                    assert_eq!(state.state, ClientState::Activating);
                    if outcome.is_success() {
                        client.change_state(&mut state, ClientState::Active);
                    } else {
                        client.change_state(&mut state, ClientState::Drained);
                    }
                    break;
                }
                ClientState::Activating => {
                    debug!(client = %addr, "client is activating in another thread, waiting");
                    state = client.wait_for_state_change(state);
                    // Re-classify whatever state the activator left behind.
                }
                ClientState::Active => {
                    debug!(client = %addr, "client is already active");
                    break;
                }
                ClientState::Draining => {
                    debug!(client = %addr, "canceling ongoing drain");
                    client.change_state(&mut state, ClientState::Active);
                    break;
                }
            }
        }

        if state.state != ClientState::Active {
            warn!(client = %addr, id = xprt.id(), state = ?state.state, "admission failed");
            drop(state);
            // Roll the slot back to unmanaged; the caller destroys the
            // transport and the finished path must not touch the client.
            xprt.take_connection();
            xprt.set_connection(Connection::unmanaged());
            self.directory.put(&client);
            self.metrics.connection_started_done(Admission::Drop, start);
            return Admission::Drop;
        }

        state.connections.insert(xprt.id(), Arc::downgrade(xprt));
        state.connections_count += 1;
        debug_assert_eq!(state.connections_count as usize, state.connections.len());
        drop(state);
        debug!(client = %addr, id = xprt.id(), "admitted");
        self.metrics.connection_started_done(Admission::Allow, start);
        Admission::Allow
    }

    /// Entry point for a closed connection. Idempotent; unmanaged
    /// connections are a no-op.
    pub fn connection_finished(&self, xprt: &Transport) {
        finish_connection(xprt);
    }

    /// Drains this replica's connections from the given client, on behalf of
    /// a peer replica taking the client over.
    pub fn drain_and_disconnect_local(&self, addr: &ClientAddr) -> DrainOutcome {
        let start = Instant::now();
        let Some(client) = self.directory.get(addr, false) else {
            debug!(client = %addr, "client not found");
            self.metrics
                .drain_local_done(DrainOutcome::SuccessNoConnections, start);
            return DrainOutcome::SuccessNoConnections;
        };

        let state = client.lock_state();
        let result = match state.state {
            ClientState::Drained => {
                debug!(client = %addr, "already drained");
                drop(state);
                DrainOutcome::SuccessNoConnections
            }
            ClientState::Activating => {
                debug!(client = %addr, "busy draining peer replicas");
                drop(state);
                DrainOutcome::Failed
            }
            ClientState::Active => {
                debug!(client = %addr, "starting local drain");
                self.drain_client(&client, state)
            }
            ClientState::Draining => {
                debug!(client = %addr, "already draining, waiting");
                let state = client.wait_for_state_change(state);
                if state.state == ClientState::Drained {
                    DrainOutcome::Success
                } else {
                    DrainOutcome::Failed
                }
            }
        };
        // The state guard is gone by now; releasing the directory reference
        // may destroy the record, which re-takes the client mutex.
        self.directory.put(&client);

        if result.is_success() {
            debug!(client = %addr, ?result, "drain was successful");
        } else {
            warn!(client = %addr, ?result, "drain failed");
        }
        self.metrics.drain_local_done(result, start);
        result
    }

    /// Destroys every connection of an ACTIVE client and waits for the set
    /// to empty. Takes the state guard, releases it around the destruction
    /// sweep (finishing a connection re-acquires it), and loops on the
    /// condvar until drained, cancelled, or past the deadline.
    fn drain_client(
        &self,
        client: &Arc<Client>,
        mut state: std::sync::MutexGuard<'_, crate::client::ConnState>,
    ) -> DrainOutcome {
        assert_eq!(state.state, ClientState::Active);
        client.change_state(&mut state, ClientState::Draining);

        let targets: Vec<Arc<Transport>> = state
            .connections
            .values()
            .filter_map(std::sync::Weak::upgrade)
            .collect();
        drop(state);

        for transport in targets {
            debug!(
                client = %client.addr(),
                id = transport.id(),
                refs = transport.refs(),
                "destroying connection"
            );
            transport.force_destroy();
        }

        let timeout = self.config.manager_timeout();
        let deadline = Instant::now() + timeout;
        let mut state = client.lock_state();
        debug!(
            client = %client.addr(),
            connections = state.connections_count,
            ?timeout,
            "waiting for connections to terminate"
        );

        let mut timed_out = false;
        while state.connections_count != 0 && state.state == ClientState::Draining {
            // The mutex is released while waiting; another thread may cancel
            // the drain meanwhile.
            let (guard, expired) = client.wait_until(state, deadline);
            state = guard;
            if expired {
                timed_out = true;
                break;
            }
        }
        debug!(
            client = %client.addr(),
            state = ?state.state,
            connections = state.connections_count,
            timed_out,
            "finished waiting"
        );

        if state.state == ClientState::Draining {
            // Holding the mutex in DRAINING entitles this thread to settle
            // the outcome, even if the drain was cancelled and restarted by
            // others in between.
            if state.connections_count == 0 {
                client.change_state(&mut state, ClientState::Drained);
                self.extend_lease_after_drain(client.addr());
            } else {
                client.change_state(&mut state, ClientState::Active);
            }
        }

        if state.state == ClientState::Drained {
            DrainOutcome::Success
        } else if timed_out {
            DrainOutcome::FailedTimeout
        } else {
            DrainOutcome::Failed
        }
    }
}
