//! Scan coordinator: drives one SYN scan from socket setup to result.
//!
//! A scan moves through four phases:
//!
//! 1. **Init**: resolve options and addresses, open the listening socket and
//!    then the outbound socket, create the dispatch and result queues.
//! 2. **Running**: sender and receiver run on blocking threads; the
//!    coordinator feeds every port into the dispatch queue through the pacer
//!    while draining any results that already arrived.
//! 3. **Idle-wait**: once the dispatch queue is closed, results are collected
//!    until no new reply arrived for a full `timeout`. Every result restarts
//!    the timer.
//! 4. **Done**: the receiver is cancelled, both workers are joined, and the
//!    discovered ports are returned in arrival order.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::Clock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scanner::pacing::PacketPacer;
use crate::scanner::receiver::SynAckReceiver;
use crate::scanner::syn_sender::{random_src_port, ScanError, SynSender};
use crate::scanner::transport::RawTransport;
use crate::{DiscoveredPort, NetworkProtocol, ScanOptions};

/// Capacity of the coordinator → sender queue.
pub const DISPATCH_QUEUE_DEPTH: usize = 100;

/// Capacity of the receiver → coordinator queue.
pub const RESULT_QUEUE_DEPTH: usize = 100;

/// Deadline used when `now + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ─────────────────────────────────────────────────────────────────────────────
// Address resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve a hostname or IP literal to an address of `protocol`'s family.
pub async fn resolve_target(target: &str, protocol: NetworkProtocol) -> Result<IpAddr, ScanError> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        if !protocol.matches(&ip) {
            return Err(ScanError::InvalidAddress(format!(
                "{target} is not an {protocol} address"
            )));
        }
        return Ok(ip);
    }

    let addrs = tokio::net::lookup_host(format!("{target}:0"))
        .await
        .map_err(|e| ScanError::InvalidAddress(format!("{target}: DNS resolution failed: {e}")))?;
    addrs
        .map(|sa| sa.ip())
        .find(|ip| protocol.matches(ip))
        .ok_or_else(|| ScanError::InvalidAddress(format!("no {protocol} address found for '{target}'")))
}

fn parse_local(local: &str, protocol: NetworkProtocol) -> Result<IpAddr, ScanError> {
    let ip: IpAddr = local
        .parse()
        .map_err(|_| ScanError::InvalidAddress(local.to_string()))?;
    if !protocol.matches(&ip) {
        return Err(ScanError::InvalidAddress(format!(
            "{local} is not an {protocol} address"
        )));
    }
    Ok(ip)
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Runs SYN scans over a [`RawTransport`].
///
/// Stateless between scans: every call to [`scan`](Self::scan) owns its own
/// socket pair, queues and cancellation token, so one coordinator can serve
/// concurrent scans.
#[derive(Clone)]
pub struct ScanCoordinator {
    transport: Arc<dyn RawTransport>,
}

impl ScanCoordinator {
    pub fn new(transport: Arc<dyn RawTransport>) -> Self {
        Self { transport }
    }

    /// Coordinator on real raw sockets.
    #[cfg(target_os = "linux")]
    pub fn raw() -> Self {
        Self::new(Arc::new(crate::scanner::raw_socket::RawSocketTransport::new()))
    }

    /// SYN-scan `ports` on `remote` from the local address `local`.
    ///
    /// `options` falls back to [`ScanOptions::default`] when `None`. Returns
    /// the ports confirmed open, in the order their replies arrived, each at
    /// most once.
    ///
    /// # Errors
    /// Setup failures only: bad addresses or options, socket dial or listen
    /// failures, or a worker that died. Per-packet send and read errors are
    /// logged and absorbed by the idle timeout.
    pub async fn scan(
        &self,
        ports: &[u16],
        remote: &str,
        local: &str,
        options: Option<&ScanOptions>,
    ) -> Result<Vec<DiscoveredPort>, ScanError> {
        let start = Instant::now();
        let options = options.cloned().unwrap_or_default();
        options.validate()?;
        let protocol = options.protocol;

        let remote_ip = resolve_target(remote, protocol).await?;
        let local_ip = parse_local(local, protocol)?;
        let src_port = random_src_port();

        // Listen before the first probe leaves so no early reply is missed.
        let receiver = SynAckReceiver::open(
            self.transport.as_ref(),
            local_ip,
            remote_ip,
            protocol,
            src_port,
            ports,
        )?;
        let sender = SynSender::open(self.transport.as_ref(), local_ip, remote_ip, protocol, src_port)?;
        let pacer = PacketPacer::new(options.packets_per_second)?;

        let cancel = CancellationToken::new();
        // Stops the receiver even if this future is dropped mid-scan.
        let _cancel_on_drop = cancel.clone().drop_guard();
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<u16>(DISPATCH_QUEUE_DEPTH);
        let (results_tx, mut results_rx) = mpsc::channel::<DiscoveredPort>(RESULT_QUEUE_DEPTH);

        tracing::info!(
            target = %remote_ip,
            local = %local_ip,
            src_port,
            ports = ports.len(),
            pps = options.packets_per_second,
            timeout_ms = options.timeout.as_millis() as u64,
            "starting SYN scan"
        );

        let receiver_task = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || receiver.run(results_tx, cancel)
        });
        let sender_task = tokio::task::spawn_blocking(move || sender.run(dispatch_rx));

        let mut discovered = Vec::new();

        // Running: dispatch at the paced rate, draining early replies meanwhile.
        let dispatched = {
            let dispatch = dispatch_ports(ports, &pacer, dispatch_tx);
            tokio::pin!(dispatch);
            loop {
                tokio::select! {
                    biased;
                    Some(found) = results_rx.recv() => discovered.push(found),
                    n = &mut dispatch => break n,
                }
            }
        };
        tracing::debug!(dispatched, found = discovered.len(), "dispatch complete");

        // Idle-wait: the deadline moves with every reply.
        let idle = tokio::time::sleep_until(idle_deadline(options.timeout));
        tokio::pin!(idle);
        loop {
            tokio::select! {
                next = results_rx.recv() => match next {
                    Some(found) => {
                        discovered.push(found);
                        idle.as_mut().reset(idle_deadline(options.timeout));
                    }
                    None => break,
                },
                _ = &mut idle => {
                    tracing::debug!(found = discovered.len(), "idle timeout reached");
                    break;
                }
            }
        }

        // Done.
        cancel.cancel();
        drop(results_rx);
        let sent = join_worker(sender_task, "sender").await?;
        let received = join_worker(receiver_task, "receiver").await?;

        tracing::info!(
            target = %remote_ip,
            found = discovered.len(),
            sent = sent.sent,
            send_failures = sent.failed,
            captured = received.captured,
            duration_ms = start.elapsed().as_millis() as u64,
            "scan complete"
        );
        Ok(discovered)
    }
}

/// Feed `ports` into the dispatch queue, one pacer permit each.
///
/// Consumes the queue's only producer, so the queue is closed on return.
/// Returns how many ports were handed to the sender.
async fn dispatch_ports<C: Clock>(
    ports: &[u16],
    pacer: &PacketPacer<C>,
    queue: mpsc::Sender<u16>,
) -> usize {
    let mut dispatched = 0;
    for &port in ports {
        pacer.take().await;
        if queue.send(port).await.is_err() {
            tracing::warn!(dispatched, "sender exited early, stopping dispatch");
            break;
        }
        dispatched += 1;
    }
    dispatched
}

/// `timeout` from now, saturating at a far-future instant.
fn idle_deadline(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

async fn join_worker<T>(task: JoinHandle<T>, name: &str) -> Result<T, ScanError> {
    task.await
        .map_err(|e| ScanError::Worker(format!("{name} task failed: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
