//! Scan jobs: wire payload, port expansion and the request handler.

use serde::{Deserialize, Deserializer, Serialize};

use std::net::IpAddr;

use crate::engine::ScanCoordinator;
use crate::scanner::syn_sender::ScanError;
use crate::{NetworkProtocol, ScanOptions};

/// A scan job as carried on the bus.
///
/// `ports` is replaced in place by the discovered subset before the job is
/// republished. Fields this worker does not know about are kept in `extra`
/// and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    /// Target hostname or IP literal.
    #[serde(alias = "ip")]
    pub target_address: String,
    /// Ports to probe; empty (or absent, or null) means all 65,536.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ports: Vec<u16>,
    /// Per-job probe rate; `None` or `0` keeps the worker default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets_per_second: Option<u32>,
    /// Per-job idle timeout; `None` or `0` keeps the worker default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<u16>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ScanRequest {
    /// A full-sweep request for `target` with no overrides.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target_address: target.into(),
            ports: Vec::new(),
            packets_per_second: None,
            timeout_seconds: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }
}

/// Ports to probe for a requested list: the list itself, or every port when empty.
pub fn expand_ports(requested: &[u16]) -> Vec<u16> {
    if requested.is_empty() {
        (0..=u16::MAX).collect()
    } else {
        requested.to_vec()
    }
}

/// Runs scan jobs against the local host's address.
#[derive(Clone)]
pub struct ScanRequestHandler {
    coordinator: ScanCoordinator,
    local_address: String,
    defaults: ScanOptions,
}

impl ScanRequestHandler {
    /// Handler scanning from `local_address`.
    ///
    /// Scans use the local address's family, whatever `defaults.protocol` says.
    pub fn new(coordinator: ScanCoordinator, local_address: impl Into<String>, mut defaults: ScanOptions) -> Self {
        let local_address = local_address.into();
        if let Ok(ip) = local_address.parse::<IpAddr>() {
            defaults.protocol = NetworkProtocol::of(&ip);
        }
        Self {
            coordinator,
            local_address,
            defaults,
        }
    }

    pub fn protocol(&self) -> NetworkProtocol {
        self.defaults.protocol
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Scan the job's target and replace its ports with the open ones, sorted.
    ///
    /// On error the request is left untouched so the job can be retried.
    pub async fn process(&self, request: &mut ScanRequest) -> Result<(), ScanError> {
        let ports = expand_ports(&request.ports);
        if request.ports.is_empty() {
            tracing::info!(target = %request.target_address, "no ports requested, scanning all 65536");
        }

        let options = self
            .defaults
            .clone()
            .with_overrides(request.packets_per_second, request.timeout_seconds);

        let discovered = self
            .coordinator
            .scan(&ports, &request.target_address, &self.local_address, Some(&options))
            .await?;

        let mut open: Vec<u16> = discovered.into_iter().map(|p| p.port).collect();
        open.sort_unstable();
        request.ports = open;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::transport::SimulatedTarget;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    const REMOTE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn handler(target: &SimulatedTarget) -> ScanRequestHandler {
        let defaults = ScanOptions {
            timeout: Duration::from_millis(300),
            ..ScanOptions::default()
        };
        ScanRequestHandler::new(
            ScanCoordinator::new(Arc::new(target.clone())),
            "192.168.1.100",
            defaults,
        )
    }

    #[test]
    fn test_expand_empty_is_full_sweep() {
        let ports = expand_ports(&[]);
        assert_eq!(ports.len(), 65_536);
        assert_eq!(ports.first(), Some(&0));
        assert_eq!(ports.last(), Some(&65_535));
    }

    #[test]
    fn test_expand_explicit_list_verbatim() {
        assert_eq!(expand_ports(&[443, 22, 80]), vec![443, 22, 80]);
        assert_eq!(expand_ports(&[0]), vec![0]);
    }

    #[test]
    fn test_decode_full_payload() {
        let req: ScanRequest = serde_json::from_value(json!({
            "targetAddress": "10.0.0.5",
            "ports": [22, 80],
            "packetsPerSecond": 8000,
            "timeoutSeconds": 2
        }))
        .unwrap();
        assert_eq!(req.target_address, "10.0.0.5");
        assert_eq!(req.ports, vec![22, 80]);
        assert_eq!(req.packets_per_second, Some(8000));
        assert_eq!(req.timeout_seconds, Some(2));
        assert!(req.extra.is_empty());
    }

    #[test]
    fn test_decode_minimal_payload_and_ip_alias() {
        let req: ScanRequest = serde_json::from_str(r#"{"ip": "10.0.0.5"}"#).unwrap();
        assert_eq!(req.target_address, "10.0.0.5");
        assert!(req.ports.is_empty());
        assert_eq!(req.packets_per_second, None);

        let req: ScanRequest =
            serde_json::from_str(r#"{"targetAddress": "h", "ports": null}"#).unwrap();
        assert!(req.ports.is_empty());
    }

    #[test]
    fn test_decode_rejects_out_of_range_port() {
        let result: Result<ScanRequest, _> =
            serde_json::from_str(r#"{"targetAddress": "h", "ports": [70000]}"#);
        assert!(result.is_err());
        let result: Result<ScanRequest, _> = serde_json::from_str(r#"{"ports": [22]}"#);
        assert!(result.is_err(), "target is required");
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let input = json!({
            "targetAddress": "10.0.0.5",
            "ports": [22],
            "requestId": "abc-123",
            "meta": {"tenant": 7}
        });
        let req: ScanRequest = serde_json::from_value(input).unwrap();
        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["requestId"], "abc-123");
        assert_eq!(out["meta"]["tenant"], 7);
        assert_eq!(out["targetAddress"], "10.0.0.5");
        assert!(out.get("packetsPerSecond").is_none());
    }

    #[tokio::test]
    async fn test_process_replaces_ports_with_open_subset() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([80, 22]);
        let mut req = ScanRequest::new(REMOTE.to_string()).with_ports(vec![21, 22, 23, 80, 443]);
        req.packets_per_second = Some(5_000);

        handler(&target).process(&mut req).await.unwrap();

        assert_eq!(req.ports, vec![22, 80]);
        assert_eq!(req.packets_per_second, Some(5_000), "overrides are republished as-is");
        assert_eq!(target.sent_count(), 5);
    }

    #[tokio::test]
    async fn test_process_is_idempotent() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([22, 8080, 3306]);
        let handler = handler(&target);
        let original = ScanRequest::new(REMOTE.to_string()).with_ports((1..=4000).collect());

        let mut first = original.clone();
        let mut second = original.clone();
        handler.process(&mut first).await.unwrap();
        handler.process(&mut second).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.ports, vec![22, 3306], "8080 was not requested");
    }

    #[tokio::test]
    async fn test_process_rejects_oversized_timeout() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).with_open_ports([80]);
        let mut req: ScanRequest = serde_json::from_str(
            r#"{"targetAddress":"10.0.0.5","ports":[80],"timeoutSeconds":18446744073709551615}"#,
        )
        .unwrap();
        let original = req.clone();

        let err = handler(&target).process(&mut req).await.unwrap_err();

        assert!(matches!(err, ScanError::InvalidOptions(_)));
        assert_eq!(req, original);
        assert_eq!(target.sent_count(), 0, "rejected before any probe");
    }

    #[tokio::test]
    async fn test_process_scans_ipv6_from_ipv6_local_address() {
        let remote: IpAddr = "2001:db8::5".parse().unwrap();
        let target = SimulatedTarget::new(remote).with_open_ports([443]);
        let handler = ScanRequestHandler::new(
            ScanCoordinator::new(Arc::new(target.clone())),
            "2001:db8::2",
            ScanOptions {
                timeout: Duration::from_millis(300),
                ..ScanOptions::default()
            },
        );
        assert_eq!(handler.protocol(), NetworkProtocol::Ipv6);

        let mut req = ScanRequest::new(remote.to_string()).with_ports(vec![22, 443]);
        handler.process(&mut req).await.unwrap();

        assert_eq!(req.ports, vec![443]);
    }

    #[tokio::test]
    async fn test_process_error_leaves_request_untouched() {
        let target = SimulatedTarget::new(IpAddr::V4(REMOTE)).failing_dial();
        let original = ScanRequest::new(REMOTE.to_string()).with_ports(vec![22]);
        let mut req = original.clone();

        let err = handler(&target).process(&mut req).await.unwrap_err();
        assert!(err.is_setup());
        assert_eq!(req, original);
    }
}
