//! Client records and the client directory.
//!
//! A client is keyed by its normalised source address and carries the
//! connection-manager state machine: the state word, the set of live
//! connections, and the mutex/condvar pair that serialises every transition.
//! The directory refcounts clients explicitly; a record dies only when its
//! count returns to zero while the state machine sits in the DRAINED
//! terminal state with no connections left.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;
use tracing::{debug, error};

use crate::addr::ClientAddr;
use crate::metrics::ConnMgrMetrics;
use crate::xprt::Transport;

/// Connection-manager state of one client.
///
/// DRAINED and ACTIVE are the steady states; ACTIVATING and DRAINING are the
/// transitions between them, reverting on failure:
///
/// ```text
///         +-----------+            +----------+
///   +----->  DRAINED  <---success--+ DRAINING +-----+
///   |     +----+------+            +----^-----+     |
/// failed       |                        |           |
///   |     new connection          drain request     |
///   |          |                        |        failed
///   |     +----v-------+           +----+-----+     |
///   +-----+ ACTIVATING +--success-->  ACTIVE  <-----+
///         +------------+           +----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connections and no drain in flight. New connections start peer
    /// draining from here.
    Drained,
    /// One thread is draining the peer replicas; other new connections wait.
    Activating,
    /// Connections are admitted immediately.
    Active,
    /// A local drain is destroying this client's connections. A new
    /// connection cancels it.
    Draining,
}

impl ClientState {
    pub(crate) fn as_label(&self) -> &'static str {
        match self {
            ClientState::Drained => "DRAINED",
            ClientState::Activating => "ACTIVATING",
            ClientState::Active => "ACTIVE",
            ClientState::Draining => "DRAINING",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

fn is_transition_valid(from: ClientState, to: ClientState) -> bool {
    match from {
        ClientState::Drained => to == ClientState::Activating,
        ClientState::Activating => to == ClientState::Active || to == ClientState::Drained,
        ClientState::Active => to == ClientState::Draining,
        ClientState::Draining => to == ClientState::Active || to == ClientState::Drained,
    }
}

/// Mutable connection-manager state, guarded by the client mutex.
pub(crate) struct ConnState {
    pub(crate) state: ClientState,
    pub(crate) connections: HashMap<u64, Weak<Transport>>,
    pub(crate) connections_count: u32,
}

/// One client record: address, refcount, and the guarded state machine.
pub struct Client {
    addr: ClientAddr,
    refs: AtomicU32,
    state: Mutex<ConnState>,
    changed: Condvar,
    metrics: Arc<ConnMgrMetrics>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("state", &snapshot.state)
            .field("connections", &snapshot.connections)
            .field("refs", &snapshot.refs)
            .finish()
    }
}

/// Point-in-time view of a client, for stats and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSnapshot {
    /// Current state-machine state.
    pub state: ClientState,
    /// Number of live connections.
    pub connections: u32,
    /// Current refcount.
    pub refs: u32,
}

impl Client {
    fn new(addr: ClientAddr, metrics: Arc<ConnMgrMetrics>) -> Self {
        debug!(client = %addr, "client init");
        metrics.client_state_inc(ClientState::Drained);
        Self {
            addr,
            refs: AtomicU32::new(0),
            state: Mutex::new(ConnState {
                state: ClientState::Drained,
                connections: HashMap::new(),
                connections_count: 0,
            }),
            changed: Condvar::new(),
            metrics,
        }
    }

    /// The client's normalised address.
    pub fn addr(&self) -> &ClientAddr {
        &self.addr
    }

    /// Current refcount.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Point-in-time view of the state machine.
    pub fn snapshot(&self) -> ClientSnapshot {
        let state = self.state.lock().unwrap();
        ClientSnapshot {
            state: state.state,
            connections: state.connections_count,
            refs: self.refs(),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap()
    }

    /// Transitions the state machine. The guard proves the mutex is held;
    /// every observer is woken because they wait on different predicates.
    pub(crate) fn change_state(&self, guard: &mut MutexGuard<'_, ConnState>, to: ClientState) {
        let from = guard.state;
        debug!(client = %self.addr, ?from, ?to, "changing state");
        if !is_transition_valid(from, to) {
            error!(client = %self.addr, ?from, ?to, "invalid client state transition");
            panic!("invalid client state transition {from:?} -> {to:?}");
        }
        self.metrics.client_state_inc(to);
        self.metrics.client_state_dec(from);
        guard.state = to;
        self.changed.notify_all();
    }

    /// Wakes every waiter on the state condvar.
    pub(crate) fn notify_change(&self) {
        self.changed.notify_all();
    }

    /// Blocks until the state differs from what the guard currently shows.
    pub(crate) fn wait_for_state_change<'a>(
        &self,
        mut guard: MutexGuard<'a, ConnState>,
    ) -> MutexGuard<'a, ConnState> {
        let initial = guard.state;
        debug!(client = %self.addr, ?initial, "waiting for state change");
        while guard.state == initial {
            guard = self.changed.wait(guard).unwrap();
        }
        guard
    }

    /// Waits on the state condvar until the deadline. Returns the guard and
    /// whether the deadline passed; the caller re-examines the state either
    /// way.
    pub(crate) fn wait_until<'a>(
        &self,
        guard: MutexGuard<'a, ConnState>,
        deadline: Instant,
    ) -> (MutexGuard<'a, ConnState>, bool) {
        let now = Instant::now();
        if now >= deadline {
            return (guard, true);
        }
        let (guard, result) = self
            .changed
            .wait_timeout(guard, deadline.saturating_duration_since(now))
            .unwrap();
        (guard, result.timed_out())
    }

    fn fini(&self) {
        debug!(client = %self.addr, "client fini");
        let state = self.state.lock().unwrap();
        if state.state != ClientState::Drained || state.connections_count != 0 {
            error!(
                client = %self.addr,
                state = ?state.state,
                connections = state.connections_count,
                "destroying a client that is not drained"
            );
            panic!("destroying a client that is not drained");
        }
        self.metrics.client_state_dec(ClientState::Drained);
    }
}

/// Sharded lookup table of clients keyed by normalised address.
pub struct ClientDirectory {
    clients: DashMap<IpAddr, Arc<Client>>,
    metrics: Arc<ConnMgrMetrics>,
}

impl ClientDirectory {
    /// Creates an empty directory.
    pub fn new(metrics: Arc<ConnMgrMetrics>) -> Self {
        Self {
            clients: DashMap::new(),
            metrics,
        }
    }

    /// Looks a client up, bumping its refcount. With `create` set an absent
    /// record is created in DRAINED; a concurrent creator winning the race
    /// simply hands the loser its record.
    pub fn get(&self, addr: &ClientAddr, create: bool) -> Option<Arc<Client>> {
        match self.clients.entry(addr.ip()) {
            Entry::Occupied(entry) => {
                let client = entry.get().clone();
                client.refs.fetch_add(1, Ordering::SeqCst);
                Some(client)
            }
            Entry::Vacant(entry) => {
                if !create {
                    return None;
                }
                let client = Arc::new(Client::new(addr.clone(), self.metrics.clone()));
                client.refs.fetch_add(1, Ordering::SeqCst);
                entry.insert(client.clone());
                Some(client)
            }
        }
    }

    /// Releases one reference. The reference that hits zero destroys the
    /// record, provided the state machine has reached DRAINED with no
    /// connections; otherwise the record stays in the table for the next
    /// admit or drain to pick up.
    pub fn put(&self, client: &Arc<Client>) {
        let prev = client.refs.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            error!(client = %client.addr, "client refcount underflow");
            panic!("client refcount underflow");
        }
        if prev != 1 {
            return;
        }
        let destroyable = {
            let state = client.lock_state();
            state.state == ClientState::Drained && state.connections_count == 0
        };
        if !destroyable {
            return;
        }
        // Re-check under the shard entry so a concurrent get() cannot see
        // the record vanish after bumping it.
        if let Entry::Occupied(entry) = self.clients.entry(client.addr().ip()) {
            if Arc::ptr_eq(entry.get(), client) && client.refs.load(Ordering::SeqCst) == 0 {
                entry.remove();
                client.fini();
            }
        }
    }

    /// Point-in-time view of a client without touching its refcount.
    pub fn snapshot(&self, addr: &ClientAddr) -> Option<ClientSnapshot> {
        self.clients.get(&addr.ip()).map(|c| c.snapshot())
    }

    /// Number of client records currently in the table.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True when no client records exist.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
