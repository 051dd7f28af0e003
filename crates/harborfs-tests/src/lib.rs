//! HarborFS integration test infrastructure.
//!
//! Cross-crate scenarios for the connection-manager and grace cores: admit
//! and drain races across threads, two-replica migration with the grace
//! coordinator in the loop, and scrapes of the metrics endpoint over real
//! sockets.

pub mod connmgr_scenarios;
pub mod grace_scenarios;
pub mod harness;
pub mod migration;
pub mod monitoring_scenarios;

pub use harness::Replica;
