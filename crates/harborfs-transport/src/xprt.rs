//! Transport objects and their destruction discipline.
//!
//! There is no central transport registry: every transport carries its own
//! refcount and its own destroy path. The refcount governs the file
//! descriptor, not the memory (the surrounding `Arc` does that): while the
//! count is positive the socket is open and usable, and the release that
//! takes it to zero runs destruction exactly once. Destruction first routes
//! the manager slot's connection through the finished path, then shuts the
//! socket down and closes it.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, error, warn};

use crate::connmgr::{self, Connection};
use crate::error::Result;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// One RPC endpoint: a socket, its peer, a refcount, and the
/// connection-manager state slot.
pub struct Transport {
    id: u64,
    peer: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    refs: AtomicU32,
    /// Guards the registration reference: both the normal close path and a
    /// forced destroy may try to drop it, and only the first may.
    base_released: AtomicBool,
    destroyed: AtomicBool,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("refs", &self.refs.load(Ordering::SeqCst))
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Transport {
    /// Wraps an accepted socket. The transport starts with one reference and
    /// an empty manager slot.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            stream: Mutex::new(Some(stream)),
            refs: AtomicU32::new(1),
            base_released: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            conn: Mutex::new(None),
        })
    }

    /// Builds a transport with no socket behind it. Destruction runs the
    /// same lifecycle minus the socket teardown; tests and loopback-free
    /// harnesses use this.
    pub fn detached(peer: SocketAddr) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            stream: Mutex::new(None),
            refs: AtomicU32::new(1),
            base_released: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            conn: Mutex::new(None),
        }
    }

    /// Unique transport id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Current refcount.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// True once destruction has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Takes an additional reference.
    pub fn hold(&self) {
        let prev = self.refs.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            error!(id = self.id, "hold on a transport with zero refcount");
            panic!("hold on a transport with zero refcount");
        }
    }

    /// Drops one reference; the reference that hits zero runs the teardown.
    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            error!(id = self.id, "transport refcount underflow");
            panic!("transport refcount underflow");
        }
        if prev == 1 {
            self.tear_down();
        }
    }

    /// Drops the registration reference taken at accept time. Idempotent:
    /// the normal close path and a forced destroy may race here, and only
    /// the first caller releases.
    pub fn destroy(&self) {
        if self.base_released.swap(true, Ordering::SeqCst) {
            debug!(id = self.id, "transport already being destroyed");
            return;
        }
        self.release();
    }

    /// Forced destruction: re-arm linger so the peer sees RST instead of
    /// FIN, shut both directions down, and drop the registration reference.
    ///
    /// The RST matters after a load-balancer migration: a FIN would let an
    /// in-flight request whose reply was never observed be replayed against
    /// the replica that now owns the client.
    pub fn force_destroy(&self) {
        self.update_socket_linger();
        if let Some(stream) = self.stream.lock().unwrap().as_ref() {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                debug!(id = self.id, error = %err, "shutdown on forced destroy failed");
            }
        }
        self.destroy();
    }

    /// Sets linger-on with a zero timeout so close() sends RST. Failure is
    /// logged and ignored; the rest of the teardown still runs.
    fn update_socket_linger(&self) {
        let guard = self.stream.lock().unwrap();
        let Some(stream) = guard.as_ref() else {
            debug!(id = self.id, "no socket to re-arm linger on");
            return;
        };
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(
                id = self.id,
                peer = %self.peer,
                error = %std::io::Error::last_os_error(),
                "could not set linger for connection"
            );
        }
    }

    /// Runs the final teardown once: drives the finished path for the
    /// manager slot, then shuts down and closes the socket. The latch makes
    /// the first caller win.
    fn tear_down(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = self.id, peer = %self.peer, "destroying transport");
        connmgr::finish_connection(self);
        if let Some(stream) = self.stream.lock().unwrap().take() {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                debug!(id = self.id, error = %err, "shutdown on destroy failed");
            }
            // Dropping the stream closes the descriptor.
        }
    }

    /// Stores the manager's connection in the per-transport state slot. The
    /// slot must be empty.
    pub(crate) fn set_connection(&self, connection: Connection) {
        let mut slot = self.conn.lock().unwrap();
        if slot.is_some() {
            error!(id = self.id, "transport state slot already occupied");
            panic!("transport state slot already occupied");
        }
        *slot = Some(connection);
    }

    /// Takes the connection out of the state slot, if any.
    pub(crate) fn take_connection(&self) -> Option<Connection> {
        self.conn.lock().unwrap().take()
    }

    /// Runs `f` against the connection in the state slot.
    pub(crate) fn with_connection<T>(&self, f: impl FnOnce(Option<&Connection>) -> T) -> T {
        f(self.conn.lock().unwrap().as_ref())
    }
}
