//! Raw-socket seam between the scan workers and the operating system.
//!
//! `RawTransport` opens the two sockets a scan owns: an outbound
//! [`PacketSink`] dialed toward the target and an inbound [`PacketSource`]
//! bound to the local address. The real implementation lives in
//! `raw_socket` (Linux, `CAP_NET_RAW`); [`SimulatedTarget`] is an in-memory
//! double that answers probes the way a host with a given set of open ports
//! would, so the whole scan path is testable without privileges.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;

use super::packet::{
    compute_checksum, encode_segment, TcpHeader, TcpOptions, CHECKSUM_OFFSET, FLAGS_SYN_ACK,
    FLAG_SYN,
};
use super::syn_sender::ScanError;
use crate::NetworkProtocol;

/// Outbound half of a scan: writes complete TCP segments.
pub trait PacketSink: Send {
    /// Write one segment. The kernel prepends the IP header.
    fn send(&mut self, segment: &[u8]) -> Result<usize, ScanError>;
}

/// Inbound half of a scan: yields transport-layer payloads.
pub trait PacketSource: Send {
    /// Read one packet into `buf`, starting with its TCP header.
    ///
    /// Returns `Ok(None)` when the read timed out with nothing captured, so
    /// callers can check for cancellation between reads.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, IpAddr)>, ScanError>;
}

/// Opens the raw sockets of a scan.
pub trait RawTransport: Send + Sync {
    /// Open an outbound socket routed toward `remote`.
    fn dial(
        &self,
        local: IpAddr,
        remote: IpAddr,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn PacketSink>, ScanError>;

    /// Open an inbound socket bound to `local`.
    fn listen(
        &self,
        local: IpAddr,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn PacketSource>, ScanError>;
}

// =============================================================================
// Simulated target
// =============================================================================

/// How long an idle simulated read waits before reporting a timeout.
const SIMULATED_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// In-memory target host.
///
/// Every probe is recorded. A SYN to one of the open ports queues a SYN-ACK
/// from the target address, released at once or after the port's reply
/// delay; released replies are handed to the listener in random order. Extra packets can be injected with
/// [`with_packet`](Self::with_packet) to check that the receiver ignores them.
#[derive(Debug, Clone)]
pub struct SimulatedTarget {
    address: IpAddr,
    open_ports: HashSet<u16>,
    reply_delays: HashMap<u16, Duration>,
    fail_dial: bool,
    fail_listen: bool,
    failing_port: Option<u16>,
    state: Arc<Mutex<SimState>>,
}

#[derive(Debug, Default)]
struct SimState {
    probed: Vec<u16>,
    pending: Vec<Pending>,
}

#[derive(Debug)]
struct Pending {
    from: IpAddr,
    payload: Vec<u8>,
    ready_at: Instant,
}

impl SimulatedTarget {
    /// A target at `address` with every port closed.
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            open_ports: HashSet::new(),
            reply_delays: HashMap::new(),
            fail_dial: false,
            fail_listen: false,
            failing_port: None,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Answer SYNs to `ports` with SYN-ACK.
    pub fn with_open_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.open_ports.extend(ports);
        self
    }

    /// Open `port`, answering its probe only `delay` after it was sent.
    pub fn with_delayed_reply(mut self, port: u16, delay: Duration) -> Self {
        self.open_ports.insert(port);
        self.reply_delays.insert(port, delay);
        self
    }

    /// Queue an arbitrary packet for the listener, as if captured from `from`.
    pub fn with_packet(self, from: IpAddr, payload: Vec<u8>) -> Self {
        self.lock().pending.push(Pending {
            from,
            payload,
            ready_at: Instant::now(),
        });
        self
    }

    /// Make `dial` fail.
    pub fn failing_dial(mut self) -> Self {
        self.fail_dial = true;
        self
    }

    /// Make `listen` fail.
    pub fn failing_listen(mut self) -> Self {
        self.fail_listen = true;
        self
    }

    /// Make writes of probes aimed at `port` fail.
    pub fn failing_sends_to(mut self, port: u16) -> Self {
        self.failing_port = Some(port);
        self
    }

    /// Destination ports of every probe written so far, in order.
    pub fn probed_ports(&self) -> Vec<u16> {
        self.lock().probed.clone()
    }

    /// Number of probes written so far.
    pub fn sent_count(&self) -> usize {
        self.lock().probed.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn syn_ack(&self, local: IpAddr, probe: &TcpHeader) -> Vec<u8> {
        let seq: u32 = rand::random();
        let header = TcpHeader {
            src_port: probe.dst_port,
            dst_port: probe.src_port,
            seq,
            ack: probe.seq.wrapping_add(1),
            offset_flags: (probe.offset_flags & 0xF000) | FLAGS_SYN_ACK as u16,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
        };
        let mut segment = encode_segment(&header, &TcpOptions::default());
        if let (IpAddr::V4(src), IpAddr::V4(dst)) = (self.address, local) {
            let checksum = compute_checksum(&segment, src, dst);
            segment[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
        }
        segment.to_vec()
    }
}

impl RawTransport for SimulatedTarget {
    fn dial(
        &self,
        local: IpAddr,
        remote: IpAddr,
        _protocol: NetworkProtocol,
    ) -> Result<Box<dyn PacketSink>, ScanError> {
        if self.fail_dial {
            return Err(ScanError::Dial(format!("simulated dial failure to {remote}")));
        }
        Ok(Box::new(SimulatedSink {
            target: self.clone(),
            local,
        }))
    }

    fn listen(
        &self,
        local: IpAddr,
        _protocol: NetworkProtocol,
    ) -> Result<Box<dyn PacketSource>, ScanError> {
        if self.fail_listen {
            return Err(ScanError::Listen(format!("simulated listen failure on {local}")));
        }
        Ok(Box::new(SimulatedSource {
            target: self.clone(),
        }))
    }
}

struct SimulatedSink {
    target: SimulatedTarget,
    local: IpAddr,
}

impl PacketSink for SimulatedSink {
    fn send(&mut self, segment: &[u8]) -> Result<usize, ScanError> {
        let probe = TcpHeader::decode(segment)
            .ok_or_else(|| ScanError::Send(format!("short segment: {} bytes", segment.len())))?;
        if self.target.failing_port == Some(probe.dst_port) {
            return Err(ScanError::Send("simulated write failure".into()));
        }

        let reply = (probe.flags() & FLAG_SYN != 0
            && self.target.open_ports.contains(&probe.dst_port))
        .then(|| self.target.syn_ack(self.local, &probe));

        let delay = self
            .target
            .reply_delays
            .get(&probe.dst_port)
            .copied()
            .unwrap_or_default();

        let mut state = self.target.lock();
        state.probed.push(probe.dst_port);
        if let Some(payload) = reply {
            state.pending.push(Pending {
                from: self.target.address,
                payload,
                ready_at: Instant::now() + delay,
            });
        }
        Ok(segment.len())
    }
}

struct SimulatedSource {
    target: SimulatedTarget,
}

impl PacketSource for SimulatedSource {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, IpAddr)>, ScanError> {
        let next = {
            let mut state = self.target.lock();
            let now = Instant::now();
            let ready: Vec<usize> = state
                .pending
                .iter()
                .enumerate()
                .filter(|(_, p)| p.ready_at <= now)
                .map(|(i, _)| i)
                .collect();
            if ready.is_empty() {
                None
            } else {
                let idx = ready[rand::thread_rng().gen_range(0..ready.len())];
                Some(state.pending.swap_remove(idx))
            }
        };

        match next {
            Some(Pending { from, payload, .. }) => {
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok(Some((len, from)))
            }
            None => {
                std::thread::sleep(SIMULATED_READ_TIMEOUT);
                Ok(None)
            }
        }
    }
}
