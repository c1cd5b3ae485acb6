//! Worker configuration from `SYNPROBE_*` environment variables.
//!
//! | Variable                    | Default                           |
//! |-----------------------------|-----------------------------------|
//! | `SYNPROBE_BUS_HOST`         | required                          |
//! | `SYNPROBE_BUS_PORT`         | required                          |
//! | `SYNPROBE_LOG_LEVEL`        | info                              |
//! | `SYNPROBE_REQUEST_STREAM`   | discovery.requests                |
//! | `SYNPROBE_RESULT_STREAM`    | scan-engine.scans                 |
//! | `SYNPROBE_CONSUMER_GROUP`   | discovery                         |
//! | `SYNPROBE_CONSUMER_NAME`    | hostname, else `synprobe-<pid>`   |
//! | `SYNPROBE_REDELIVERY_MS`    | 30000                             |
//! | `SYNPROBE_PPS`              | 10000                             |
//! | `SYNPROBE_TIMEOUT_SECS`     | 3 (at most 3600)                  |
//!
//! A job still being scanned has its claim refreshed every third of the
//! redelivery window (100 ms at the least), so other consumers do not
//! reclaim it while it runs.

use std::str::FromStr;
use std::time::Duration;

use crate::bus::StreamSettings;
use crate::ScanOptions;

pub const ENV_PREFIX: &str = "SYNPROBE_";

pub const DEFAULT_REQUEST_STREAM: &str = "discovery.requests";
pub const DEFAULT_RESULT_STREAM: &str = "scan-engine.scans";
pub const DEFAULT_CONSUMER_GROUP: &str = "discovery";
pub const DEFAULT_REDELIVERY_MS: u64 = 30_000;

/// Error loading the worker configuration. Fatal at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),

    #[error("invalid value '{value}' for {var}")]
    Invalid { var: String, value: String },
}

/// Everything the worker binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub bus_host: String,
    pub bus_port: u16,
    pub log_level: String,
    pub request_stream: String,
    pub result_stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub redelivery: Duration,
    /// Scan options applied when a job carries no overrides.
    pub scan_defaults: ScanOptions,
}

impl WorkerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup`, which maps a full variable name to its value.
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let var = format!("{ENV_PREFIX}{name}");
            let value = lookup(&var).filter(|v| !v.trim().is_empty());
            (var, value)
        };
        let required = |name: &str| match get(name) {
            (_, Some(value)) => Ok(value),
            (var, None) => Err(ConfigError::Missing(var)),
        };
        let or_default = |name: &str, default: &str| get(name).1.unwrap_or_else(|| default.to_string());

        let bus_host = required("BUS_HOST")?;
        let (port_var, _) = get("BUS_PORT");
        let bus_port: u16 = parse_value(&port_var, &required("BUS_PORT")?)?;

        let consumer_name = get("CONSUMER_NAME").1.unwrap_or_else(default_consumer_name);

        let redelivery_ms: u64 = parse_optional(get("REDELIVERY_MS"), DEFAULT_REDELIVERY_MS)?;
        let pps: u32 = parse_optional(get("PPS"), ScanOptions::DEFAULT_PACKETS_PER_SECOND)?;
        let timeout_entry = get("TIMEOUT_SECS");
        let timeout_secs: u64 = parse_optional(timeout_entry.clone(), ScanOptions::DEFAULT_TIMEOUT_SECS)?;
        if timeout_secs > ScanOptions::MAX_TIMEOUT_SECS {
            let (var, value) = timeout_entry;
            return Err(ConfigError::Invalid {
                var,
                value: value.unwrap_or_default(),
            });
        }

        Ok(Self {
            bus_host,
            bus_port,
            log_level: or_default("LOG_LEVEL", "info"),
            request_stream: or_default("REQUEST_STREAM", DEFAULT_REQUEST_STREAM),
            result_stream: or_default("RESULT_STREAM", DEFAULT_RESULT_STREAM),
            consumer_group: or_default("CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP),
            consumer_name,
            redelivery: Duration::from_millis(redelivery_ms),
            scan_defaults: ScanOptions {
                timeout: Duration::from_secs(timeout_secs),
                packets_per_second: pps,
                ..ScanOptions::default()
            },
        })
    }

    /// `redis://host:port/`
    pub fn bus_url(&self) -> String {
        format!("redis://{}:{}/", self.bus_host, self.bus_port)
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            url: self.bus_url(),
            request_stream: self.request_stream.clone(),
            result_stream: self.result_stream.clone(),
            group: self.consumer_group.clone(),
            consumer: self.consumer_name.clone(),
            redelivery: self.redelivery,
        }
    }

    /// Default tracing filter: `debug` when asked for, `info` otherwise.
    pub fn log_filter(&self) -> &'static str {
        if self.log_level.trim().eq_ignore_ascii_case("debug") {
            "debug"
        } else {
            "info"
        }
    }
}

fn default_consumer_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("synprobe-{}", std::process::id()))
}

fn parse_value<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
    })
}

/// Parse an optional positive number, falling back to `default` when unset.
fn parse_optional<T>(entry: (String, Option<String>), default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let (var, value) = entry;
    let Some(value) = value else {
        return Ok(default);
    };
    let parsed: T = parse_value(&var, &value)?;
    if parsed == T::default() {
        return Err(ConfigError::Invalid { var, value });
    }
    Ok(parsed)
}
