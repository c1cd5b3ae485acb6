//! SYN-ACK receiver.
//!
//! Owns the listening raw socket of a scan and turns matching replies into
//! [`DiscoveredPort`]s. Matching is stateless: a reply counts when it comes
//! from the target, carries exactly SYN+ACK, is addressed to the scan's
//! source port, and its source port is one of the probed ports.

use std::collections::HashSet;
use std::net::IpAddr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::packet::{be_u16, FLAGS_OFFSET, FLAGS_SYN_ACK};
use super::syn_sender::ScanError;
use super::transport::{PacketSource, RawTransport};
use crate::{DiscoveredPort, NetworkProtocol};

/// Capture buffer size; large enough for any datagram the kernel hands over.
const RECV_BUF_LEN: usize = 65_535;

/// Counters reported by [`SynAckReceiver::run`] on exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    /// Packets read off the socket.
    pub captured: u64,
    /// Replies that confirmed an open port.
    pub matched: u64,
    /// Retransmitted SYN-ACKs for ports already reported.
    pub duplicates: u64,
    /// Failed or malformed reads.
    pub read_errors: u64,
}

/// Listens for SYN-ACK replies to one scan's probes.
pub struct SynAckReceiver {
    source: Box<dyn PacketSource>,
    remote: IpAddr,
    src_port: u16,
    /// Sorted and deduplicated, for binary search.
    probed: Vec<u16>,
    reported: HashSet<u16>,
}

impl SynAckReceiver {
    /// Bind the listening raw socket to `local`.
    ///
    /// # Errors
    /// `ScanError::InvalidAddress` on a family mismatch, `ScanError::Listen`
    /// if the socket cannot be opened or bound.
    pub fn open(
        transport: &dyn RawTransport,
        local: IpAddr,
        remote: IpAddr,
        protocol: NetworkProtocol,
        src_port: u16,
        ports: &[u16],
    ) -> Result<Self, ScanError> {
        for addr in [local, remote] {
            if !protocol.matches(&addr) {
                return Err(ScanError::InvalidAddress(format!(
                    "{addr} is not an {protocol} address"
                )));
            }
        }
        let source = transport.listen(local, protocol)?;

        let mut probed = ports.to_vec();
        probed.sort_unstable();
        probed.dedup();

        Ok(Self {
            source,
            remote,
            src_port,
            probed,
            reported: HashSet::new(),
        })
    }

    /// Port confirmed open by `payload` (a TCP header captured from `from`), if any.
    pub fn match_syn_ack(&self, from: IpAddr, payload: &[u8]) -> Option<u16> {
        if from != self.remote {
            return None;
        }
        if *payload.get(FLAGS_OFFSET)? != FLAGS_SYN_ACK {
            return None;
        }
        if be_u16(payload, 2)? != self.src_port {
            return None;
        }
        // Source and destination are reflected in the reply.
        let port = be_u16(payload, 0)?;
        self.probed.binary_search(&port).ok().map(|_| port)
    }

    /// Read replies until `cancel` fires, forwarding each newly opened port.
    ///
    /// Blocking: run on a blocking thread. Cancellation is checked once per
    /// read, so the exit latency is bounded by the socket read timeout.
    /// Dropping `results` on return closes the result queue.
    pub fn run(
        mut self,
        results: mpsc::Sender<DiscoveredPort>,
        cancel: CancellationToken,
    ) -> ReceiveSummary {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut summary = ReceiveSummary::default();

        while !cancel.is_cancelled() {
            let (n, from) = match self.source.recv(&mut buf) {
                Ok(Some(read)) => read,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable packet");
                    summary.read_errors += 1;
                    continue;
                }
            };
            summary.captured += 1;

            let Some(port) = self.match_syn_ack(from, &buf[..n]) else {
                tracing::trace!(%from, len = n, "ignoring packet");
                continue;
            };
            if !self.reported.insert(port) {
                summary.duplicates += 1;
                continue;
            }

            tracing::debug!(port, "received SYN-ACK");
            if results.blocking_send(DiscoveredPort::open(port)).is_err() {
                // Coordinator is gone; nobody is left to report to.
                break;
            }
            summary.matched += 1;
        }

        tracing::debug!(
            captured = summary.captured,
            matched = summary.matched,
            duplicates = summary.duplicates,
            read_errors = summary.read_errors,
            "receiver stopped"
        );
        summary
    }
}
