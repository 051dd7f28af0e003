//! Two-replica migration: a client moves between in-process replicas with
//! the peer-drain callback and the grace coordinator in the loop.

use std::sync::Arc;
use std::time::Duration;

use harborfs_grace::MemoryGraceStore;
use harborfs_transport::{
    Admission, ClientAddr, ClientState, ConnectionManagerConfig, Transport,
};

use crate::harness::{ForwardingPeerDrain, Replica};

fn addr(text: &str) -> ClientAddr {
    ClientAddr::new(text.parse().unwrap())
}

fn transport(peer: &str) -> Arc<Transport> {
    Arc::new(Transport::detached(peer.parse().unwrap()))
}

/// Builds two replicas whose peer-drain callbacks target each other, sharing
/// one grace store.
fn two_replicas() -> (Replica, Replica) {
    let store = Arc::new(MemoryGraceStore::new());
    let a = Replica::new("replica-a", store.clone(), ConnectionManagerConfig::default());
    let b = Replica::new("replica-b", store, ConnectionManagerConfig::default());
    a.manager
        .set_peer_drain(ForwardingPeerDrain::new(vec![b.manager.clone()]));
    b.manager
        .set_peer_drain(ForwardingPeerDrain::new(vec![a.manager.clone()]));
    (a, b)
}

mod failover {
    use super::*;

    #[test]
    fn test_client_migrates_between_replicas() {
        let (a, b) = two_replicas();

        // The client lands on replica A.
        let on_a = transport("198.51.100.7:720");
        assert_eq!(a.manager.connection_started(&on_a), Admission::Allow);
        assert_eq!(
            a.manager.client_snapshot(&addr("198.51.100.7")).unwrap().state,
            ClientState::Active
        );

        // The load balancer moves it to replica B; B's admit drains A.
        let on_b = transport("198.51.100.7:721");
        assert_eq!(b.manager.connection_started(&on_b), Admission::Allow);

        assert!(on_a.is_destroyed());
        assert_eq!(a.manager.client_count(), 0);
        assert_eq!(
            b.manager.client_snapshot(&addr("198.51.100.7")).unwrap().state,
            ClientState::Active
        );

        // And back again.
        let back_on_a = transport("198.51.100.7:722");
        assert_eq!(a.manager.connection_started(&back_on_a), Admission::Allow);
        assert!(on_b.is_destroyed());
        assert_eq!(b.manager.client_count(), 0);

        back_on_a.destroy();
    }

    #[test]
    fn test_migration_is_blocked_by_held_request() {
        let store = Arc::new(MemoryGraceStore::new());
        let a = Replica::new(
            "replica-a",
            store.clone(),
            ConnectionManagerConfig {
                connection_manager_timeout_secs: 1,
                ..ConnectionManagerConfig::default()
            },
        );
        let b = Replica::new(
            "replica-b",
            store,
            ConnectionManagerConfig {
                connection_manager_timeout_secs: 1,
                ..ConnectionManagerConfig::default()
            },
        );
        a.manager
            .set_peer_drain(ForwardingPeerDrain::new(vec![b.manager.clone()]));
        b.manager
            .set_peer_drain(ForwardingPeerDrain::new(vec![a.manager.clone()]));

        let on_a = transport("198.51.100.7:720");
        a.manager.connection_started(&on_a);
        // An in-flight request pins the connection on A.
        on_a.hold();

        // B cannot take the client over until A's drain succeeds.
        let on_b = transport("198.51.100.7:721");
        assert_eq!(b.manager.connection_started(&on_b), Admission::Drop);
        assert_eq!(
            a.manager.client_snapshot(&addr("198.51.100.7")).unwrap().state,
            ClientState::Active
        );

        // The request completes; the next attempt goes through.
        on_a.release();
        let retry_on_b = transport("198.51.100.7:722");
        assert_eq!(b.manager.connection_started(&retry_on_b), Admission::Allow);

        on_b.destroy();
        retry_on_b.destroy();
    }

    #[test]
    fn test_unrelated_clients_are_independent() {
        let (a, b) = two_replicas();

        let first = transport("198.51.100.7:720");
        let second = transport("203.0.113.9:720");
        assert_eq!(a.manager.connection_started(&first), Admission::Allow);
        assert_eq!(b.manager.connection_started(&second), Admission::Allow);

        // Draining one client leaves the other untouched.
        let moved = transport("198.51.100.7:721");
        assert_eq!(b.manager.connection_started(&moved), Admission::Allow);
        assert!(first.is_destroyed());
        assert_eq!(
            b.manager.client_snapshot(&addr("203.0.113.9")).unwrap().state,
            ClientState::Active
        );

        second.destroy();
        moved.destroy();
    }
}

mod grace_during_migration {
    use super::*;

    #[test]
    fn test_restarted_replica_joins_and_lifts_grace() {
        let (a, b) = two_replicas();
        a.grace.create().unwrap();
        a.grace.add(&["replica-a", "replica-b"]).unwrap();

        // Replica B restarts and wants its clients to reclaim.
        let joined = b.grace.join(&["replica-b"], true).unwrap();
        assert_eq!(joined.current, 2);
        assert_eq!(joined.reclaim, 1);

        // Both replicas see the same epochs through the shared object.
        assert_eq!(a.grace.epochs().unwrap(), joined);
        a.grace.enforcing_check("replica-a").unwrap();

        // Recovery done: B lifts and the window closes cluster-wide.
        let lifted = b.grace.lift(&["replica-b"], false).unwrap();
        assert_eq!(lifted.reclaim, 0);
        assert_eq!(a.grace.epochs().unwrap().reclaim, 0);
    }

    #[test]
    fn test_migrated_client_reclaims_within_grace_window() {
        let (a, b) = two_replicas();
        a.grace.create().unwrap();
        a.grace.add(&["replica-a", "replica-b"]).unwrap();

        // Client holds state on A.
        let on_a = transport("198.51.100.7:720");
        a.manager.connection_started(&on_a);

        // B takes over: join grace so the client may reclaim, then drain A.
        let joined = b.grace.join(&["replica-b"], true).unwrap();
        let on_b = transport("198.51.100.7:721");
        assert_eq!(b.manager.connection_started(&on_b), Admission::Allow);
        assert!(on_a.is_destroyed());

        // The reclaim window is open exactly for the pre-join epoch.
        assert_eq!(joined.reclaim, 1);
        assert_eq!(joined.current, 2);

        b.grace.lift(&["replica-b"], false).unwrap();
        assert_eq!(b.grace.epochs().unwrap().reclaim, 0);

        on_b.destroy();
    }
}

mod timing {
    use super::*;

    #[test]
    fn test_drain_deadline_bounds_migration() {
        let store = Arc::new(MemoryGraceStore::new());
        let a = Replica::new(
            "replica-a",
            store.clone(),
            ConnectionManagerConfig {
                connection_manager_timeout_secs: 1,
                ..ConnectionManagerConfig::default()
            },
        );
        let b = Replica::new(
            "replica-b",
            store,
            ConnectionManagerConfig {
                connection_manager_timeout_secs: 1,
                ..ConnectionManagerConfig::default()
            },
        );
        a.manager
            .set_peer_drain(ForwardingPeerDrain::new(vec![b.manager.clone()]));
        b.manager
            .set_peer_drain(ForwardingPeerDrain::new(vec![a.manager.clone()]));

        let on_a = transport("198.51.100.7:720");
        a.manager.connection_started(&on_a);
        on_a.hold();

        let started = std::time::Instant::now();
        let on_b = transport("198.51.100.7:721");
        assert_eq!(b.manager.connection_started(&on_b), Admission::Drop);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(5));

        // The timed-out drain already force-destroyed one reference.
        on_a.release();
        on_b.destroy();
    }
}
