//! Configuration module for Dredge
//!
//! This module handles loading and validating configuration from TOML files.
//! Command line arguments are applied on top by the binary.

use crate::capture::ANY_INTERFACE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure for Dredge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DredgeConfig {
    pub general: GeneralConfig,
    pub capture: CaptureConfig,
    pub mongodb: MongoConfig,
    pub publish: PublishConfig,
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Number of flow workers
    pub workers: usize,
    /// Packets queued per worker before hand-off blocks
    pub queue_depth: usize,
    /// How long the capture loop waits on a full worker queue
    pub enqueue_timeout_ms: u64,
    /// Seconds before an idle flow buffer is evicted
    pub flow_timeout: u64,
}

/// Capture backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Generic live capture through libpcap
    #[default]
    Pcap,
    /// Linux memory-mapped packet ring
    Ring,
}

/// Packet capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub pcap_file: Option<String>,
    pub bpf_filter: Option<String>,
    pub promiscuous: bool,
    /// Maximum bytes captured per frame
    pub snaplen: u32,
    pub poll_timeout_ms: u64,
    /// Target ring size for the ring backend
    pub buffer_size_mb: usize,
    pub backend: CaptureBackend,
}

/// MongoDB decoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    /// Server port; traffic towards it is decoded as client requests
    pub port: u16,
    /// Largest wire message accepted before a stream is reset
    pub max_message_size: usize,
}

/// Record publishing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Records buffered before new ones are dropped
    pub buffer_size: usize,
    /// Output file for JSON records; stdout when unset
    pub output: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging and statistics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub format: LogFormat,
    pub log_file: Option<String>,
    /// Seconds between statistics lines
    pub stats_interval: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_depth: 1024,
            enqueue_timeout_ms: 10,
            flow_timeout: 60,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            pcap_file: None,
            bpf_filter: None,
            promiscuous: true,
            snaplen: 65535,
            poll_timeout_ms: 1000,
            buffer_size_mb: 30,
            backend: CaptureBackend::Pcap,
        }
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            port: 27017,
            max_message_size: 48 * 1024 * 1024,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            output: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Text,
            log_file: None,
            stats_interval: 60,
        }
    }
}

impl CaptureConfig {
    /// Interface to capture on, falling back to `any`
    pub fn interface_name(&self) -> &str {
        match self.interface.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => ANY_INTERFACE,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl DredgeConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_str: String = std::fs::read_to_string(path)?;
        Self::from_toml(&config_str)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self, ConfigError> {
        let config: DredgeConfig = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate general config
        if self.general.workers == 0 {
            return Err(ConfigError::ValidationError(
                "Number of workers must be greater than 0".to_string(),
            ));
        }
        if self.general.queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "Worker queue depth must be greater than 0".to_string(),
            ));
        }
        if self.general.flow_timeout == 0 {
            return Err(ConfigError::ValidationError(
                "Flow timeout must be greater than 0".to_string(),
            ));
        }

        // Validate capture config
        let capture: &CaptureConfig = &self.capture;
        if capture.snaplen == 0 {
            return Err(ConfigError::ValidationError(
                "Snapshot length must be greater than 0".to_string(),
            ));
        }
        if capture.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Poll timeout must be greater than 0".to_string(),
            ));
        }
        if capture.buffer_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "Ring buffer size must be greater than 0".to_string(),
            ));
        }
        if capture.backend == CaptureBackend::Ring {
            if capture.pcap_file.is_some() {
                return Err(ConfigError::ValidationError(
                    "The ring backend cannot read capture files".to_string(),
                ));
            }
            if capture.bpf_filter.is_some() {
                return Err(ConfigError::ValidationError(
                    "The ring backend does not support packet filters".to_string(),
                ));
            }
        }

        // Validate protocol and output config
        if self.mongodb.max_message_size < 16 {
            return Err(ConfigError::ValidationError(
                "MongoDB max_message_size must hold at least a message header".to_string(),
            ));
        }
        if self.publish.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "Publish buffer size must be greater than 0".to_string(),
            ));
        }
        if self.logging.stats_interval == 0 {
            return Err(ConfigError::ValidationError(
                "Statistics interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
