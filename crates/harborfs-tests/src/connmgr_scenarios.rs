//! Admission and drain races across threads, on one replica.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use harborfs_monitoring::Registry;
use harborfs_transport::{
    Admission, ClientAddr, ClientState, ConnectionManager, ConnectionManagerConfig, DrainOutcome,
    PeerDrain, Transport,
};

fn manager() -> Arc<ConnectionManager> {
    let registry = Registry::new();
    Arc::new(ConnectionManager::new(ConnectionManagerConfig::default(), &registry).unwrap())
}

fn addr(text: &str) -> ClientAddr {
    ClientAddr::new(text.parse().unwrap())
}

fn transport(peer: &str) -> Arc<Transport> {
    Arc::new(Transport::detached(peer.parse().unwrap()))
}

fn wait_for_state(manager: &ConnectionManager, client: &ClientAddr, state: ClientState) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(snapshot) = manager.client_snapshot(client) {
            if snapshot.state == state {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "client never reached {state:?}"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

struct ScriptedPeerDrain {
    outcome: DrainOutcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedPeerDrain {
    fn new(outcome: DrainOutcome, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

impl PeerDrain for ScriptedPeerDrain {
    fn drain_peers(&self, _client: &ClientAddr, _deadline: Instant) -> DrainOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.outcome
    }
}

mod solo_admit {
    use super::*;

    #[test]
    fn test_first_connection_activates_client() {
        let manager = manager();
        let peers = ScriptedPeerDrain::new(DrainOutcome::SuccessNoConnections, Duration::ZERO);
        manager.set_peer_drain(peers.clone());

        let xprt = transport("10.0.0.1:2049");
        assert_eq!(manager.connection_started(&xprt), Admission::Allow);

        let snapshot = manager.client_snapshot(&addr("10.0.0.1")).unwrap();
        assert_eq!(snapshot.state, ClientState::Active);
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.refs, 1);
        assert_eq!(peers.calls.load(Ordering::SeqCst), 1);

        xprt.destroy();
    }
}

mod admit_during_slow_peer_drain {
    use super::*;

    #[test]
    fn test_local_drain_fails_while_activating() {
        let manager = manager();
        manager.set_peer_drain(ScriptedPeerDrain::new(
            DrainOutcome::Success,
            Duration::from_millis(200),
        ));

        let admit_started = Instant::now();
        let xprt = transport("10.0.0.1:2049");
        let admit = {
            let manager = manager.clone();
            let xprt = xprt.clone();
            std::thread::spawn(move || manager.connection_started(&xprt))
        };
        wait_for_state(&manager, &addr("10.0.0.1"), ClientState::Activating);

        // A peer's drain request arriving mid-activation must not wait out
        // the callback.
        let drain_started = Instant::now();
        assert_eq!(
            manager.drain_and_disconnect_local(&addr("10.0.0.1")),
            DrainOutcome::Failed
        );
        assert!(drain_started.elapsed() < Duration::from_millis(150));

        assert_eq!(admit.join().unwrap(), Admission::Allow);
        // The admit still took the full callback time.
        assert!(admit_started.elapsed() >= Duration::from_millis(200));

        xprt.destroy();
    }
}

mod drain_cancelled_by_admit {
    use super::*;

    #[test]
    fn test_new_connection_takes_precedence() {
        let manager = manager();
        manager.set_peer_drain(ScriptedPeerDrain::new(DrainOutcome::Success, Duration::ZERO));

        let first = transport("10.0.0.1:700");
        assert_eq!(manager.connection_started(&first), Admission::Allow);
        // An in-flight request keeps the connection from closing while the
        // drain's forced destroy fires.
        first.hold();

        let drain = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.drain_and_disconnect_local(&addr("10.0.0.1")))
        };
        wait_for_state(&manager, &addr("10.0.0.1"), ClientState::Draining);

        let second = transport("10.0.0.1:701");
        assert_eq!(manager.connection_started(&second), Admission::Allow);

        // The drain observes the cancellation without waiting out its
        // timeout.
        let outcome = drain.join().unwrap();
        assert_eq!(outcome, DrainOutcome::Failed);

        let snapshot = manager.client_snapshot(&addr("10.0.0.1")).unwrap();
        assert_eq!(snapshot.state, ClientState::Active);

        first.release();
        second.destroy();
    }
}

mod lease_extension {
    use super::*;
    use harborfs_transport::LeaseHook;

    struct CapturingHook {
        seen: Mutex<Vec<(String, Duration)>>,
    }

    impl LeaseHook for CapturingHook {
        fn extend_lease(&self, client: &ClientAddr, extension: Duration) {
            self.seen
                .lock()
                .unwrap()
                .push((client.to_string(), extension));
        }
    }

    #[test]
    fn test_successful_drain_extends_lease_past_peer_eviction() {
        let registry = Registry::new();
        let config = ConnectionManagerConfig {
            lease_lifetime_secs: 60,
            peer_eviction_timeout_secs: 45,
            ..ConnectionManagerConfig::default()
        };
        let manager = Arc::new(ConnectionManager::new(config, &registry).unwrap());
        manager.set_peer_drain(ScriptedPeerDrain::new(DrainOutcome::Success, Duration::ZERO));
        let hook = Arc::new(CapturingHook {
            seen: Mutex::new(Vec::new()),
        });
        manager.set_lease_hook(hook.clone());

        let xprt = transport("10.0.0.7:2049");
        manager.connection_started(&xprt);
        assert_eq!(
            manager.drain_and_disconnect_local(&addr("10.0.0.7")),
            DrainOutcome::Success
        );

        // Lease outlives the slowest cluster-wide drain: lifetime plus the
        // peer-eviction window, not merely one lifetime.
        let seen = hook.seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[("10.0.0.7".to_string(), Duration::from_secs(105))]
        );
    }

    #[test]
    fn test_failed_drain_does_not_extend_lease() {
        let registry = Registry::new();
        let manager = Arc::new(
            ConnectionManager::new(
                ConnectionManagerConfig {
                    connection_manager_timeout_secs: 1,
                    ..ConnectionManagerConfig::default()
                },
                &registry,
            )
            .unwrap(),
        );
        manager.set_peer_drain(ScriptedPeerDrain::new(DrainOutcome::Success, Duration::ZERO));
        let hook = Arc::new(CapturingHook {
            seen: Mutex::new(Vec::new()),
        });
        manager.set_lease_hook(hook.clone());

        let xprt = transport("10.0.0.7:2049");
        manager.connection_started(&xprt);
        xprt.hold();
        assert_eq!(
            manager.drain_and_disconnect_local(&addr("10.0.0.7")),
            DrainOutcome::FailedTimeout
        );
        assert!(hook.seen.lock().unwrap().is_empty());

        xprt.release();
    }
}

mod connection_bookkeeping {
    use super::*;

    #[test]
    fn test_counts_match_set_through_churn() {
        let manager = manager();
        manager.set_peer_drain(ScriptedPeerDrain::new(DrainOutcome::Success, Duration::ZERO));

        let mut transports = Vec::new();
        for port in 0..16u16 {
            let xprt = transport(&format!("10.0.0.1:{}", 1000 + port));
            assert_eq!(manager.connection_started(&xprt), Admission::Allow);
            transports.push(xprt);
        }
        assert_eq!(
            manager.client_snapshot(&addr("10.0.0.1")).unwrap().connections,
            16
        );

        for xprt in transports.drain(..8) {
            xprt.destroy();
        }
        let snapshot = manager.client_snapshot(&addr("10.0.0.1")).unwrap();
        assert_eq!(snapshot.connections, 8);
        assert_eq!(snapshot.refs, 8);
        assert_eq!(snapshot.state, ClientState::Active);

        for xprt in transports {
            xprt.destroy();
        }
        let snapshot = manager.client_snapshot(&addr("10.0.0.1")).unwrap();
        assert_eq!(snapshot.connections, 0);
        assert_eq!(snapshot.refs, 0);
    }

    #[test]
    fn test_parallel_admissions_single_activation() {
        let manager = manager();
        let peers = ScriptedPeerDrain::new(
            DrainOutcome::SuccessNoConnections,
            Duration::from_millis(50),
        );
        manager.set_peer_drain(peers.clone());

        let mut admits = Vec::new();
        for port in 0..8u16 {
            let manager = manager.clone();
            admits.push(std::thread::spawn(move || {
                let xprt = transport(&format!("10.2.0.1:{}", 2000 + port));
                let admission = manager.connection_started(&xprt);
                (admission, xprt)
            }));
        }

        let mut kept = Vec::new();
        for admit in admits {
            let (admission, xprt) = admit.join().unwrap();
            assert_eq!(admission, Admission::Allow);
            kept.push(xprt);
        }
        // Only the thread that won the DRAINED->ACTIVATING race ran the
        // callback; everyone else waited and re-classified.
        assert_eq!(peers.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.client_snapshot(&addr("10.2.0.1")).unwrap().connections,
            8
        );

        for xprt in kept {
            xprt.destroy();
        }
    }
}
