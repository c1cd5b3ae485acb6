//! Synprobe: raw-socket TCP SYN scan worker.
//!
//! Receives scan jobs from a Redis Streams consumer group, sends hand-built
//! SYN segments to every requested port of the target, collects SYN-ACK
//! replies on a raw listening socket, and republishes the job with the ports
//! found open. Usable as a library, as a one-shot CLI, or as the bus worker.

pub mod bus;
pub mod cli;
pub mod config;
pub mod engine;
pub mod netinfo;
pub mod request;
pub mod scanner;
pub mod worker;

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Re-export the types most callers need.
pub use engine::ScanCoordinator;
pub use request::{expand_ports, ScanRequest, ScanRequestHandler};
pub use scanner::syn_sender::ScanError;

// ─────────────────────────────────────────────────────────────────────────────
// Network protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Address family used for the raw sockets of a scan.
///
/// IPv6 is carried through the socket layer, but the checksum and the
/// reply parsing are only exercised end to end for IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    /// IPv4 (`ip4`).
    #[default]
    Ipv4,
    /// IPv6 (`ip6`).
    Ipv6,
}

impl NetworkProtocol {
    /// Short network name, as used in raw-socket network strings (`ip4:tcp`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipv4 => "ip4",
            Self::Ipv6 => "ip6",
        }
    }

    /// Protocol matching the family of `addr`.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Whether `addr` belongs to this family.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        Self::of(addr) == *self
    }
}

impl std::fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scan options
// ─────────────────────────────────────────────────────────────────────────────

/// Per-scan tuning: address family, idle timeout and packet rate.
///
/// Immutable once a scan starts. Job overrides are applied with
/// [`ScanOptions::with_overrides`], which ignores zero values so an override
/// can never produce an unusable configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Raw-socket address family.
    pub protocol: NetworkProtocol,
    /// Idle window: the scan ends once no reply arrived for this long.
    pub timeout: Duration,
    /// Upper bound on SYN probes emitted per second.
    pub packets_per_second: u32,
}

impl ScanOptions {
    /// Default idle timeout in seconds.
    pub const DEFAULT_TIMEOUT_SECS: u64 = 3;
    /// Default probe rate.
    pub const DEFAULT_PACKETS_PER_SECOND: u32 = 10_000;
    /// Longest idle window a scan accepts.
    pub const MAX_TIMEOUT_SECS: u64 = 3_600;

    /// Apply optional per-job overrides. `None` and `0` leave the current value.
    pub fn with_overrides(
        mut self,
        packets_per_second: Option<u32>,
        timeout_seconds: Option<u64>,
    ) -> Self {
        if let Some(pps) = packets_per_second.filter(|&v| v > 0) {
            self.packets_per_second = pps;
        }
        if let Some(secs) = timeout_seconds.filter(|&v| v > 0) {
            self.timeout = Duration::from_secs(secs);
        }
        self
    }

    /// Reject options a scan cannot run with.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.packets_per_second == 0 {
            return Err(ScanError::InvalidOptions(
                "packets_per_second must be greater than zero".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ScanError::InvalidOptions(
                "timeout must be greater than zero".into(),
            ));
        }
        if self.timeout > Duration::from_secs(Self::MAX_TIMEOUT_SECS) {
            return Err(ScanError::InvalidOptions(format!(
                "timeout of {}s exceeds the {}s maximum",
                self.timeout.as_secs(),
                Self::MAX_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            protocol: NetworkProtocol::Ipv4,
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            packets_per_second: Self::DEFAULT_PACKETS_PER_SECOND,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovered port
// ─────────────────────────────────────────────────────────────────────────────

/// A port confirmed open by a matching SYN-ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredPort {
    /// Port number on the target.
    pub port: u16,
    /// Always `true` for ports produced by the receiver.
    pub found: bool,
}

impl DiscoveredPort {
    /// An open port.
    pub fn open(port: u16) -> Self {
        Self { port, found: true }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_network_protocol_as_str() {
        assert_eq!(NetworkProtocol::Ipv4.as_str(), "ip4");
        assert_eq!(NetworkProtocol::Ipv6.as_str(), "ip6");
        assert_eq!(NetworkProtocol::Ipv6.to_string(), "ip6");
    }

    #[test]
    fn test_network_protocol_matches_family() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(NetworkProtocol::Ipv4.matches(&v4));
        assert!(!NetworkProtocol::Ipv4.matches(&v6));
        assert_eq!(NetworkProtocol::of(&v6), NetworkProtocol::Ipv6);
    }

    #[test]
    fn test_scan_options_defaults() {
        let opts = ScanOptions::default();
        assert_eq!(opts.protocol, NetworkProtocol::Ipv4);
        assert_eq!(opts.timeout, Duration::from_secs(3));
        assert_eq!(opts.packets_per_second, 10_000);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_scan_options_overrides_applied() {
        let opts = ScanOptions::default().with_overrides(Some(6_000), Some(2));
        assert_eq!(opts.packets_per_second, 6_000);
        assert_eq!(opts.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_scan_options_zero_overrides_ignored() {
        let opts = ScanOptions::default().with_overrides(Some(0), Some(0));
        assert_eq!(opts, ScanOptions::default());
        let opts = ScanOptions::default().with_overrides(None, None);
        assert_eq!(opts, ScanOptions::default());
    }

    #[test]
    fn test_scan_options_validate_rejects_zero_rate() {
        let opts = ScanOptions {
            packets_per_second: 0,
            ..ScanOptions::default()
        };
        assert!(matches!(opts.validate(), Err(ScanError::InvalidOptions(_))));
    }

    #[test]
    fn test_scan_options_validate_bounds_timeout() {
        let at_limit = ScanOptions::default().with_overrides(None, Some(ScanOptions::MAX_TIMEOUT_SECS));
        assert!(at_limit.validate().is_ok());

        let huge = ScanOptions::default().with_overrides(None, Some(u64::MAX));
        assert!(matches!(huge.validate(), Err(ScanError::InvalidOptions(_))));
    }

    #[test]
    fn test_discovered_port_open() {
        let p = DiscoveredPort::open(443);
        assert_eq!(p.port, 443);
        assert!(p.found);
    }
}
