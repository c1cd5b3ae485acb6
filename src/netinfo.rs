//! Local network facts needed before any scan can run.

use std::net::IpAddr;

use crate::scanner::syn_sender::ScanError;
use crate::scanner::transport::RawTransport;
use crate::NetworkProtocol;

/// Error discovering the local address.
#[derive(Debug, thiserror::Error)]
pub enum NetInfoError {
    #[error("unable to list network interfaces: {0}")]
    Interfaces(#[from] std::io::Error),

    #[error("unable to find a non-loopback local address")]
    NoAddress,
}

/// First non-loopback address of this host, IPv4 preferred.
pub fn local_address() -> Result<IpAddr, NetInfoError> {
    let addrs = if_addrs::get_if_addrs()?;
    pick_local_address(addrs.iter().map(|iface| iface.ip())).ok_or(NetInfoError::NoAddress)
}

/// Pick the scan source address out of interface addresses.
pub fn pick_local_address(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for addr in addrs {
        if addr.is_loopback() || addr.is_unspecified() {
            continue;
        }
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}

/// Check that a raw listening socket can be bound on `local`.
///
/// Opens and immediately drops the socket. Run once at startup so a missing
/// `CAP_NET_RAW` fails the process before any job is consumed.
pub fn check_bind_permission(transport: &dyn RawTransport, local: IpAddr) -> Result<(), ScanError> {
    transport.listen(local, NetworkProtocol::of(&local)).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::transport::SimulatedTarget;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_pick_prefers_ipv4() {
        let v6: IpAddr = "2001:db8::2".parse().unwrap();
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(
            pick_local_address([IpAddr::V4(Ipv4Addr::LOCALHOST), v6, v4]),
            Some(v4)
        );
    }

    #[test]
    fn test_pick_falls_back_to_ipv6() {
        let v6: IpAddr = "2001:db8::2".parse().unwrap();
        assert_eq!(
            pick_local_address([IpAddr::V6(Ipv6Addr::LOCALHOST), v6]),
            Some(v6)
        );
    }

    #[test]
    fn test_pick_only_loopback() {
        assert_eq!(
            pick_local_address([
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            ]),
            None
        );
    }

    #[test]
    fn test_check_bind_permission() {
        let local = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
        let target = SimulatedTarget::new(local);
        assert!(check_bind_permission(&target, local).is_ok());

        let denied = SimulatedTarget::new(local).failing_listen();
        assert!(matches!(
            check_bind_permission(&denied, local),
            Err(ScanError::Listen(_))
        ));
    }

    #[test]
    #[ignore] // Depends on the host's interfaces
    fn test_local_address_on_host() {
        let addr = local_address().expect("host has a non-loopback address");
        assert!(!addr.is_loopback());
    }
}
