//! synprobe-worker: Redis Streams consumer running SYN scans.
//!
//! Reads scan jobs from the request stream through a consumer group, scans
//! each target from this host's address and publishes the job back, ports
//! replaced by the open subset, to the result stream. Publish happens before
//! the ACK; a failed job is left pending and reclaimed after the redelivery
//! window, while a running one keeps its claim fresh. Configuration is read from `SYNPROBE_*` variables (see
//! `synprobe::config`).

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use synprobe::bus::RedisStreamBus;
use synprobe::config::WorkerConfig;
use synprobe::engine::ScanCoordinator;
use synprobe::netinfo;
use synprobe::worker::run_worker;
use synprobe::ScanRequestHandler;

#[tokio::main]
async fn main() {
    let cfg = match WorkerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| cfg.log_filter().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cfg).await {
        tracing::error!(error = %e, "synprobe-worker stopped");
        std::process::exit(1);
    }
}

#[cfg(target_os = "linux")]
async fn run(cfg: WorkerConfig) -> Result<(), Box<dyn std::error::Error>> {
    use synprobe::scanner::RawSocketTransport;

    let local = netinfo::local_address()?;
    netinfo::check_bind_permission(&RawSocketTransport::new(), local)?;

    tracing::info!(
        consumer = %cfg.consumer_name,
        group = %cfg.consumer_group,
        bus = %cfg.bus_url(),
        local = %local,
        pps = cfg.scan_defaults.packets_per_second,
        timeout_ms = cfg.scan_defaults.timeout.as_millis() as u64,
        "synprobe-worker starting"
    );

    let handler = ScanRequestHandler::new(ScanCoordinator::raw(), local.to_string(), cfg.scan_defaults.clone());
    let mut bus = RedisStreamBus::connect(cfg.stream_settings()).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    run_worker(&mut bus, &handler, shutdown).await?;
    tracing::info!("synprobe-worker shut down");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_cfg: WorkerConfig) -> Result<(), Box<dyn std::error::Error>> {
    Err("raw-socket scanning is only supported on Linux".into())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
#[cfg(target_os = "linux")]
async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "unable to watch SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received, finishing current job"),
        _ = term.recv() => tracing::info!("SIGTERM received, finishing current job"),
    }
    shutdown.cancel();
}
