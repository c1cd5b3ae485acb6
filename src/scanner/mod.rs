//! Raw-socket SYN scanner.
//!
//! Probes are hand-built TCP segments written on a raw outbound socket;
//! replies are captured on a raw listening socket and matched statelessly.
//! The handshake is never completed: the kernel answers the target's SYN-ACK
//! with a RST on its own.

pub mod packet;
pub mod pacing;
#[cfg(target_os = "linux")]
pub mod raw_socket;
pub mod receiver;
pub mod syn_sender;
pub mod transport;

pub use pacing::PacketPacer;
#[cfg(target_os = "linux")]
pub use raw_socket::RawSocketTransport;
pub use receiver::{ReceiveSummary, SynAckReceiver};
pub use syn_sender::{ScanError, SendSummary, SynSender};
pub use transport::{PacketSink, PacketSource, RawTransport, SimulatedTarget};
