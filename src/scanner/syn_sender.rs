//! SYN probe sender.
//!
//! Owns the outbound raw socket of a scan. Destination ports arrive on the
//! dispatch queue at the coordinator's pace; each one becomes a single SYN
//! segment with a fresh sequence number. The half-open handshake is never
//! completed.

use std::net::IpAddr;

use rand::Rng;
use tokio::sync::mpsc;

use super::packet::{build_syn_segment, TcpOptions, DEFAULT_WINDOW, SEGMENT_LEN};
use super::transport::{PacketSink, RawTransport};
use crate::NetworkProtocol;

/// Ephemeral range the per-scan source port is drawn from.
pub const SRC_PORT_RANGE: (u16, u16) = (49152, 65535);

/// Error from scanner operations.
///
/// `InvalidAddress`, `Dial` and `Listen` are setup failures and abort a scan.
/// `Send` and `Read` are per-packet and only ever logged by the workers.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("raw socket dial failed (requires CAP_NET_RAW): {0}")]
    Dial(String),

    #[error("raw socket listen failed (requires CAP_NET_RAW): {0}")]
    Listen(String),

    #[error("packet send failed: {0}")]
    Send(String),

    #[error("packet read failed: {0}")]
    Read(String),

    #[error("invalid scan options: {0}")]
    InvalidOptions(String),

    #[error("scan worker failed: {0}")]
    Worker(String),
}

impl ScanError {
    /// Whether this error means the scan could not be set up at all.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress(_) | Self::Dial(_) | Self::Listen(_) | Self::InvalidOptions(_)
        )
    }
}

/// Draw a random source port for one scan.
pub fn random_src_port() -> u16 {
    rand::thread_rng().gen_range(SRC_PORT_RANGE.0..=SRC_PORT_RANGE.1)
}

/// Counters reported by [`SynSender::run`] when the dispatch queue closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendSummary {
    /// Probes written to the socket.
    pub sent: u64,
    /// Probes whose write failed and were skipped.
    pub failed: u64,
}

/// Sends SYN probes for one scan over a single outbound raw socket.
pub struct SynSender {
    sink: Box<dyn PacketSink>,
    local: IpAddr,
    remote: IpAddr,
    src_port: u16,
    window: u16,
    options: TcpOptions,
}

impl SynSender {
    /// Dial the outbound raw socket toward `remote`.
    ///
    /// Dialing only selects the route and interface; no packet is exchanged.
    ///
    /// # Errors
    /// `ScanError::InvalidAddress` if either address is not of `protocol`'s
    /// family, `ScanError::Dial` if the socket cannot be opened.
    pub fn open(
        transport: &dyn RawTransport,
        local: IpAddr,
        remote: IpAddr,
        protocol: NetworkProtocol,
        src_port: u16,
    ) -> Result<Self, ScanError> {
        for addr in [local, remote] {
            if !protocol.matches(&addr) {
                return Err(ScanError::InvalidAddress(format!(
                    "{addr} is not an {protocol} address"
                )));
            }
        }
        let sink = transport.dial(local, remote, protocol)?;
        Ok(Self {
            sink,
            local,
            remote,
            src_port,
            window: DEFAULT_WINDOW,
            options: TcpOptions::default(),
        })
    }

    /// Source port stamped on every probe.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Build the probe for `dst_port`. Returns the segment and its sequence number.
    pub fn build_probe(&self, dst_port: u16) -> ([u8; SEGMENT_LEN], u32) {
        build_syn_segment(
            self.local,
            self.remote,
            self.src_port,
            dst_port,
            self.window,
            &self.options,
        )
    }

    /// Build and write one probe.
    pub fn send_probe(&mut self, dst_port: u16) -> Result<u32, ScanError> {
        let (segment, isn) = self.build_probe(dst_port);
        self.sink.send(&segment)?;
        Ok(isn)
    }

    /// Send a probe for every port on `ports` until the queue is closed and drained.
    ///
    /// Blocking: run on a blocking thread. Write failures are logged and
    /// skipped; an unanswered probe and a lost one end the same way, in the
    /// idle timeout.
    pub fn run(mut self, mut ports: mpsc::Receiver<u16>) -> SendSummary {
        let mut summary = SendSummary::default();
        while let Some(dst_port) = ports.blocking_recv() {
            match self.send_probe(dst_port) {
                Ok(_) => summary.sent += 1,
                Err(e) => {
                    tracing::debug!(port = dst_port, error = %e, "unable to write probe, skipping");
                    summary.failed += 1;
                }
            }
        }
        tracing::debug!(
            sent = summary.sent,
            failed = summary.failed,
            "finished sending probes"
        );
        summary
    }
}
