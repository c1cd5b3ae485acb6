//! Output formatters for scan reports.
//!
//! Supports pretty (nmap-style) and JSON output formats.

use super::ScanReport;

/// Format a scan report as nmap-style pretty text.
pub fn format_pretty(report: &ScanReport) -> String {
    let mut out = String::new();

    let version = env!("CARGO_PKG_VERSION");
    out.push_str(&format!(
        "Starting synprobe {version} at {}\n",
        report.started_at.format("%Y-%m-%d %H:%M UTC")
    ));
    out.push_str(&format!(
        "Scan report for {} (from {})\n",
        report.target, report.source
    ));
    out.push('\n');

    if report.open_ports.is_empty() {
        out.push_str("No open ports found\n");
    } else {
        out.push_str(&format!("{:<10}{}\n", "PORT", "STATE"));
        for port in &report.open_ports {
            out.push_str(&format!("{:<10}{}\n", format!("{port}/tcp"), "open"));
        }
    }
    out.push('\n');

    let duration_s = report.duration_ms as f64 / 1000.0;
    out.push_str(&format!(
        "{} ports scanned in {duration_s:.2}s ({} open)\n",
        report.ports_scanned,
        report.open_ports.len()
    ));

    out
}

/// Format a scan report as JSON.
pub fn format_json(report: &ScanReport) -> String {
    serde_json::to_string_pretty(&JsonOutput::from(report))
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}

/// JSON output structure.
#[derive(serde::Serialize)]
struct JsonOutput<'a> {
    target: &'a str,
    source: &'a str,
    started_at: String,
    duration_ms: u64,
    ports_scanned: usize,
    open_ports: &'a [u16],
}

impl<'a> From<&'a ScanReport> for JsonOutput<'a> {
    fn from(r: &'a ScanReport) -> Self {
        Self {
            target: &r.target,
            source: &r.source,
            started_at: r.started_at.to_rfc3339(),
            duration_ms: r.duration_ms,
            ports_scanned: r.ports_scanned,
            open_ports: &r.open_ports,
        }
    }
}
