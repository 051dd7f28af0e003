#![warn(missing_docs)]

//! HarborFS transport subsystem: RPC transport lifecycle, client directory,
//! and the cluster connection manager.
//!
//! When HarborFS runs as one of several interchangeable replicas behind a
//! load balancer, a request replayed on a second replica before the first
//! finished processing it can corrupt state: the replicas do not share an
//! exactly-once reply cache. The connection manager closes that hole by
//! keeping each client (all connections from one source address) bound to a
//! single replica at a time. Admitting a client here first drains its
//! connections everywhere else; a drain request from a peer replica drains
//! it here.

/// TCP accept loop feeding the connection manager.
pub mod accept;
/// Client address normalisation.
pub mod addr;
/// Client records and the client directory.
pub mod client;
/// Configuration for the transport subsystem.
pub mod config;
/// Connection-manager state machine.
pub mod connmgr;
/// Error types for the transport subsystem.
pub mod error;
/// Connection-manager metrics.
pub mod metrics;
/// Transport objects and their destruction discipline.
pub mod xprt;

pub use accept::Acceptor;
pub use addr::ClientAddr;
pub use client::{Client, ClientDirectory, ClientSnapshot, ClientState};
pub use config::ConnectionManagerConfig;
pub use connmgr::{Admission, ConnectionManager, DrainOutcome, LeaseHook, PeerDrain};
pub use error::{Result, TransportError};
pub use xprt::Transport;
