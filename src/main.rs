//! synprobe: one-shot raw-socket SYN scan.
//!
//! Usage:
//!   synprobe scan <TARGET> [--ports <SPEC>] [--pps <N>] [--timeout <SECS>]
//!                 [--source <ADDR>] [--output json|pretty]

use clap::Parser;
use synprobe::cli::{self, Cli, Commands, OutputFmt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialise logging (RUST_LOG=debug etc.)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan(args) => match cli::run_scan(&args).await {
            Ok(report) => match args.output {
                OutputFmt::Pretty => print!("{}", cli::format_pretty(&report)),
                OutputFmt::Json => println!("{}", cli::format_json(&report)),
            },
            Err(e) => {
                eprintln!("Scan failed: {e}");
                std::process::exit(1);
            }
        },
    }
}
