//! Configuration options.
//!
//! The sensor reads an optional TOML configuration file that defines capture, session, service
//! discovery, content filtering and output options. Every option has a default, so an empty file
//! (or no file at all) yields a working configuration. Command line arguments of the sensor
//! binary override values read from the file.
//!
//! The sensor can run in either "online" mode (reading packets from a live network interface) or
//! "offline" mode (reading packets from a capture file, when `capture.pcap` is set).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: RuntimeConfig = toml::from_str(&config_str)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Returns the default configuration.
///
/// Equivalent to loading an empty file:
/// ```toml
/// [capture]
///     device = "any"
///     filter = "tcp and (port 80 or port 443)"
///
/// [session]
///     max_body_size = 1_048_576
///     join_timeout_ms = 120_000
///
/// [services]
///     enabled = true
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("capture filter must not be empty")]
    EmptyFilter,
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Packet capture and reassembly settings.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Per-connection session settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Service address allow-list settings.
    #[serde(default)]
    pub services: ServicesConfig,

    /// Content filtering settings.
    #[serde(default)]
    pub content: ContentConfig,

    /// Output settings.
    #[serde(default)]
    pub sink: SinkConfig,
}

impl RuntimeConfig {
    /// Checks that sizes and intervals are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.snaplen <= 0 {
            return Err(ConfigError::Zero("capture.snaplen"));
        }
        let nonzero = [
            ("capture.read_timeout_ms", self.capture.read_timeout_ms),
            ("capture.flush_interval_ms", self.capture.flush_interval_ms),
            ("capture.max_age_ms", self.capture.max_age_ms),
            ("capture.max_out_of_order", self.capture.max_out_of_order as u64),
            ("session.max_body_size", self.session.max_body_size as u64),
            ("session.join_timeout_ms", self.session.join_timeout_ms),
            ("session.queue_capacity", self.session.queue_capacity as u64),
            ("services.refresh_interval_ms", self.services.refresh_interval_ms),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.capture.filter.trim().is_empty() {
            return Err(ConfigError::EmptyFilter);
        }
        Ok(())
    }
}

/* --------------------------------------------------------------------------------- */

/// Packet capture options.
///
/// ## Example
/// ```toml
/// [capture]
///     device = "eth0"
///     filter = "tcp port 8080"
///     flush_interval_ms = 60_000
///     max_age_ms = 120_000
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CaptureConfig {
    /// Network interface to capture from. Defaults to `"any"`.
    #[serde(default = "default_device")]
    pub device: String,

    /// BPF filter expression applied to the capture handle. Defaults to
    /// `"tcp and (port 80 or port 443)"`.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Maximum number of bytes captured per packet. Defaults to `65535`.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,

    /// Whether to put the interface in promiscuous mode. Defaults to `true`.
    #[serde(default = "default_promisc")]
    pub promisc: bool,

    /// Upper bound on a single blocking read from the capture handle (in milliseconds). Defaults
    /// to `1000`.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Frequency of reassembly maintenance (in milliseconds). Defaults to `60_000` (1 minute).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// A stream direction can be idle for up to this amount of time (in milliseconds) before its
    /// buffered data is delivered and it is closed. Defaults to `120_000` (2 minutes).
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,

    /// Maximum number of out-of-order segments buffered per stream direction before the
    /// direction is closed. Defaults to `100`.
    #[serde(default = "default_max_out_of_order")]
    pub max_out_of_order: usize,

    /// Capture file to replay instead of capturing live traffic.
    #[serde(default)]
    pub pcap: Option<PathBuf>,
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            device: default_device(),
            filter: default_filter(),
            snaplen: default_snaplen(),
            promisc: default_promisc(),
            read_timeout_ms: default_read_timeout_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            max_age_ms: default_max_age_ms(),
            max_out_of_order: default_max_out_of_order(),
            pcap: None,
        }
    }
}

fn default_device() -> String {
    "any".to_string()
}

fn default_filter() -> String {
    "tcp and (port 80 or port 443)".to_string()
}

fn default_snaplen() -> i32 {
    65535
}

fn default_promisc() -> bool {
    true
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_flush_interval_ms() -> u64 {
    60_000
}

fn default_max_age_ms() -> u64 {
    120_000
}

fn default_max_out_of_order() -> usize {
    100
}

/* --------------------------------------------------------------------------------- */

/// Bidirectional session options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of bytes read from each direction of a connection. Defaults to `1_048_576`
    /// (1 MiB).
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Time budget for decoding both directions, measured from session start (in milliseconds).
    /// Defaults to `120_000` (2 minutes).
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Number of transactions that can wait for the consumer before sessions block. Defaults to
    /// `1024`.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl SessionConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_body_size: default_max_body_size(),
            join_timeout_ms: default_join_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_max_body_size() -> usize {
    1 << 20
}

fn default_join_timeout_ms() -> u64 {
    120_000
}

fn default_queue_capacity() -> usize {
    1024
}

/* --------------------------------------------------------------------------------- */

/// Service address allow-list options.
///
/// When enabled, service addresses are periodically read from the Kubernetes API and traffic
/// that does not involve a service is dropped.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServicesConfig {
    /// Whether service address filtering is enabled. Defaults to `true`.
    #[serde(default = "default_services_enabled")]
    pub enabled: bool,

    /// Refresh period of the service address set (in milliseconds). Defaults to `1000`.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl ServicesConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        ServicesConfig {
            enabled: default_services_enabled(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

fn default_services_enabled() -> bool {
    true
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

/* --------------------------------------------------------------------------------- */

/// Content filtering options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ContentConfig {
    /// Forward only transactions that carry JSON. Defaults to `false`.
    #[serde(default)]
    pub json_only: bool,

    /// Bodies larger than this (in bytes) are not sniffed for JSON. Defaults to `1_048_576`.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        ContentConfig {
            json_only: false,
            max_content_length: default_max_content_length(),
        }
    }
}

fn default_max_content_length() -> usize {
    1 << 20
}

/* --------------------------------------------------------------------------------- */

/// Output options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SinkConfig {
    /// File that transactions are appended to, one JSON object per line. Defaults to stdout.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.capture.device, "any");
        assert_eq!(config.capture.filter, "tcp and (port 80 or port 443)");
        assert_eq!(config.session.join_timeout(), Duration::from_secs(120));
        assert_eq!(config.capture.read_timeout(), Duration::from_secs(1));
        assert!(config.services.enabled);
        assert!(!config.content.json_only);
        assert!(config.capture.pcap.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [capture]
                filter = "tcp port 8080"
                pcap = "./traces/http.pcap"

            [content]
                json_only = true
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.filter, "tcp port 8080");
        assert_eq!(config.capture.device, "any");
        assert_eq!(config.capture.pcap, Some(PathBuf::from("./traces/http.pcap")));
        assert!(config.content.json_only);
        assert_eq!(config.content.max_content_length, 1 << 20);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut config = default_config();
        config.session.max_body_size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("session.max_body_size"))
        );

        let mut config = default_config();
        config.capture.filter = "  ".to_owned();
        assert_eq!(config.validate(), Err(ConfigError::EmptyFilter));
    }

    #[test]
    fn negative_snaplen_is_rejected() {
        let mut config = default_config();
        config.capture.snaplen = -1;
        assert_eq!(config.validate(), Err(ConfigError::Zero("capture.snaplen")));
    }
}
