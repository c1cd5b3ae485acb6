//! CLI entrypoint for synprobe.
//!
//! Runs one scan locally through the same request path the worker uses and
//! formats the open ports. Raw sockets need `CAP_NET_RAW` (sudo) on Linux.

pub mod output;

use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::engine::ScanCoordinator;
use crate::netinfo::{self, NetInfoError};
use crate::request::{expand_ports, ScanRequest, ScanRequestHandler};
use crate::scanner::syn_sender::ScanError;
use crate::ScanOptions;

pub use output::{format_json, format_pretty};

// ─────────────────────────────────────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────────────────────────────────────

/// synprobe: paced raw-socket TCP SYN port discovery.
#[derive(Parser, Debug)]
#[command(name = "synprobe", version, about)]
#[command(
    long_about = "synprobe sends one SYN per port from a raw socket, listens for SYN-ACKs \
    and reports the ports that answered. The same engine backs the synprobe-worker \
    message-bus consumer. Requires CAP_NET_RAW (sudo) on Linux."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Port discovery scan
    Scan(ScanArgs),
}

/// Arguments for the `scan` subcommand.
#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Target IP address or hostname
    pub target: String,
    /// Port specification: "80", "1-1024", "22,80,8000-8100", "all"
    #[arg(long, default_value = "all")]
    pub ports: String,
    /// Probes per second (default 10000)
    #[arg(long)]
    pub pps: Option<u32>,
    /// Seconds to wait for replies after the last probe (default 3)
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Source address (first non-loopback interface address if omitted)
    #[arg(long)]
    pub source: Option<IpAddr>,
    /// Output format
    #[arg(long, default_value = "pretty", value_enum)]
    pub output: OutputFmt,
}

/// Output format argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFmt {
    Pretty,
    Json,
}

// ─────────────────────────────────────────────────────────────────────────────
// Port specification
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a port spec into an explicit list.
///
/// Accepts single ports, inclusive ranges and comma-separated mixes of both.
/// `all`, `full` and `0-65535` return an empty list, which the request path
/// expands to every port. Duplicates are removed; order is kept.
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>, String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err("empty port specification".into());
    }
    if matches!(spec, "all" | "full" | "0-65535") {
        return Ok(Vec::new());
    }

    let mut seen = std::collections::HashSet::new();
    let mut ports = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (parse_port(a)?, parse_port(b)?),
            None => {
                let p = parse_port(part)?;
                (p, p)
            }
        };
        if start > end {
            return Err(format!("invalid range '{part}': start > end"));
        }
        for port in start..=end {
            if seen.insert(port) {
                ports.push(port);
            }
        }
    }
    Ok(ports)
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("invalid port '{}'", s.trim()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Scan execution
// ─────────────────────────────────────────────────────────────────────────────

/// Error running a one-shot scan.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid port specification: {0}")]
    Ports(String),

    #[error(transparent)]
    LocalAddress(#[from] NetInfoError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("raw-socket scanning is only supported on Linux")]
    Unsupported,
}

/// Outcome of a one-shot scan, ready for formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub target: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub ports_scanned: usize,
    /// Open ports, ascending.
    pub open_ports: Vec<u16>,
    pub duration_ms: u64,
}

/// Scan with raw sockets from `--source` or the first local address.
pub async fn run_scan(args: &ScanArgs) -> Result<ScanReport, CliError> {
    let local = match args.source {
        Some(addr) => addr,
        None => netinfo::local_address()?,
    };
    run_scan_with(raw_coordinator()?, local, args).await
}

#[cfg(target_os = "linux")]
fn raw_coordinator() -> Result<ScanCoordinator, CliError> {
    Ok(ScanCoordinator::raw())
}

#[cfg(not(target_os = "linux"))]
fn raw_coordinator() -> Result<ScanCoordinator, CliError> {
    Err(CliError::Unsupported)
}

/// Scan through `coordinator` from `local`.
pub async fn run_scan_with(
    coordinator: ScanCoordinator,
    local: IpAddr,
    args: &ScanArgs,
) -> Result<ScanReport, CliError> {
    let ports = parse_port_spec(&args.ports).map_err(CliError::Ports)?;
    let ports_scanned = expand_ports(&ports).len();

    let mut request = ScanRequest::new(args.target.clone()).with_ports(ports);
    request.packets_per_second = args.pps;
    request.timeout_seconds = args.timeout;

    let handler = ScanRequestHandler::new(coordinator, local.to_string(), ScanOptions::default());

    tracing::info!(
        target = %args.target,
        source = %local,
        ports = ports_scanned,
        "starting scan"
    );

    let started_at = Utc::now();
    let start = Instant::now();
    handler.process(&mut request).await?;

    Ok(ScanReport {
        target: args.target.clone(),
        source: handler.local_address().to_string(),
        started_at,
        ports_scanned,
        open_ports: request.ports,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
