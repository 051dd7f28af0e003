//! Scrapes of the metrics endpoint over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use harborfs_monitoring::{buckets_exp2, Exposer, Registry};

fn scrape(port: u16) -> String {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

mod elision {
    use super::*;

    #[test]
    fn test_untouched_label_set_keeps_one_empty_member() {
        let registry = Arc::new(Registry::new());
        let ok = registry
            .register_histogram(
                "op_latency_ms",
                "Operation latency.",
                &[("op", "READ"), ("status", "OK")],
                &buckets_exp2(),
            )
            .unwrap();
        registry
            .register_histogram(
                "op_latency_ms",
                "Operation latency.",
                &[("op", "READ"), ("status", "ERR")],
                &buckets_exp2(),
            )
            .unwrap();
        ok.observe(7);

        let exposer = Exposer::new(registry);
        let addr = exposer.start(0).unwrap();
        let response = scrape(addr.port());
        exposer.stop();

        // The observed histogram's samples are present.
        assert!(response.contains("op_latency_ms_bucket{op=\"READ\",status=\"OK\",le=\"8\"} 1"));
        assert!(response.contains("op_latency_ms_count{op=\"READ\",status=\"OK\"} 1"));
        // Exactly one empty family member survives for the other label set:
        // 31 bucket lines, the +Inf bucket, the sum, and the count.
        assert!(response.contains("op_latency_ms_count{op=\"READ\",status=\"ERR\"} 0"));
        assert_eq!(response.matches("status=\"ERR\"").count(), 34);
    }
}

mod scrape_protocol {
    use super::*;

    #[test]
    fn test_any_path_and_method_served() {
        let registry = Arc::new(Registry::new());
        let counter = registry
            .register_counter("served_total", "Served.", &[])
            .unwrap();
        counter.inc();

        let exposer = Exposer::new(registry);
        let addr = exposer.start(0).unwrap();

        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        for request in ["GET / HTTP/1.1\r\n\r\n", "POST /anything HTTP/1.0\r\n\r\n"] {
            let mut stream = TcpStream::connect(target).unwrap();
            stream.write_all(request.as_bytes()).unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n\r\n"));
            assert!(response.contains("served_total 1"));
        }
        exposer.stop();
    }

    #[test]
    fn test_connection_closed_after_response() {
        let registry = Arc::new(Registry::new());
        let exposer = Exposer::new(registry);
        let addr = exposer.start(0).unwrap();

        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        let mut stream = TcpStream::connect(target).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut response = Vec::new();
        // read_to_end only returns once the server closes the connection.
        stream.read_to_end(&mut response).unwrap();
        exposer.stop();
    }
}

mod connection_manager_metrics {
    use super::*;
    use harborfs_transport::{
        ClientAddr, ConnectionManager, ConnectionManagerConfig, DrainOutcome, PeerDrain, Transport,
    };
    use std::time::Instant;

    struct AlwaysSucceed;

    impl PeerDrain for AlwaysSucceed {
        fn drain_peers(&self, _client: &ClientAddr, _deadline: Instant) -> DrainOutcome {
            DrainOutcome::SuccessNoConnections
        }
    }

    #[test]
    fn test_admission_visible_in_scrape() {
        let registry = Arc::new(Registry::new());
        let manager =
            Arc::new(ConnectionManager::new(ConnectionManagerConfig::default(), &registry).unwrap());
        manager.set_peer_drain(Arc::new(AlwaysSucceed));

        let xprt = Arc::new(Transport::detached("10.0.0.1:2049".parse().unwrap()));
        manager.connection_started(&xprt);

        let exposer = Exposer::new(registry);
        let addr = exposer.start(0).unwrap();
        let response = scrape(addr.port());
        exposer.stop();

        assert!(response.contains("connection_manager_clients{state=\"ACTIVE\"} 1"));
        assert!(response.contains("connection_manager_clients{state=\"DRAINED\"} 0"));
        assert!(response.contains(
            "connection_manager_connection_started_duration_ms_count{result=\"ALLOW\"} 1"
        ));

        xprt.destroy();
    }
}
