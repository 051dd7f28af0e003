//! Client address normalisation.
//!
//! A client is all the connections arriving from one source IP address. Dual
//! stack listeners report IPv4 peers as IPv4-mapped IPv6 addresses
//! (`::ffff:a.b.c.d`), which would split one client into two records; the
//! mapped form is folded back to IPv4 so the same client cannot appear
//! twice. Loopback peers are recognised so callers can skip management for
//! local tooling entirely.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Normalised client key plus its textual debug form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientAddr {
    ip: IpAddr,
    text: String,
}

impl ClientAddr {
    /// Builds a key from a raw peer IP, folding IPv4-mapped IPv6 to IPv4.
    pub fn new(ip: IpAddr) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self {
            text: ip.to_string(),
            ip,
        }
    }

    /// Builds a key from a peer socket address; the port is irrelevant to
    /// client identity.
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::new(addr.ip())
    }

    /// The normalised IP.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Textual form for logs.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True for 127.0.0.0/8 and ::1 peers.
    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

impl fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ipv4_passthrough() {
        let addr = ClientAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(addr.as_str(), "10.0.0.1");
    }

    #[test]
    fn test_mapped_ipv6_folds_to_ipv4() {
        let mapped: Ipv6Addr = "::ffff:10.0.0.1".parse().unwrap();
        let addr = ClientAddr::new(IpAddr::V6(mapped));
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(addr.as_str(), "10.0.0.1");
    }

    #[test]
    fn test_mapped_and_plain_share_key() {
        let plain = ClientAddr::new("10.1.2.3".parse().unwrap());
        let mapped = ClientAddr::new("::ffff:10.1.2.3".parse().unwrap());
        assert_eq!(plain, mapped);
    }

    #[test]
    fn test_native_ipv6_untouched() {
        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let addr = ClientAddr::new(IpAddr::V6(v6));
        assert_eq!(addr.ip(), IpAddr::V6(v6));
    }

    #[test]
    fn test_loopback_detection() {
        assert!(ClientAddr::new("127.0.0.1".parse().unwrap()).is_loopback());
        assert!(ClientAddr::new("127.5.5.5".parse().unwrap()).is_loopback());
        assert!(ClientAddr::new("::1".parse().unwrap()).is_loopback());
        assert!(ClientAddr::new("::ffff:127.0.0.1".parse().unwrap()).is_loopback());
        assert!(!ClientAddr::new("10.0.0.1".parse().unwrap()).is_loopback());
    }

    #[test]
    fn test_port_is_irrelevant() {
        let a = ClientAddr::from_socket("10.0.0.1:2049".parse().unwrap());
        let b = ClientAddr::from_socket("10.0.0.1:40000".parse().unwrap());
        assert_eq!(a, b);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_mapped_always_folds(a in any::<u8>(), b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) {
                let v4 = Ipv4Addr::new(a, b, c, d);
                let mapped = v4.to_ipv6_mapped();
                let folded = ClientAddr::new(IpAddr::V6(mapped));
                prop_assert_eq!(folded, ClientAddr::new(IpAddr::V4(v4)));
            }

            #[test]
            fn test_normalisation_idempotent(a in any::<u8>(), b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) {
                let first = ClientAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)));
                let second = ClientAddr::new(first.ip());
                prop_assert_eq!(first, second);
            }
        }
    }
}
