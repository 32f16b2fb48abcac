//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files, and
//! every field has a default so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TapConfig {
    /// Prefix of every stage name this interceptor installs.
    pub owner: String,

    /// Reference host settings (demo binary only).
    pub host: HostConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            owner: "pipetap".to_string(),
            host: HostConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Reference host configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    /// TCP bind address (e.g., "127.0.0.1:7000").
    pub listen: String,

    /// Name of the host's core message handler stage.
    pub anchor: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7000".to_string(),
            anchor: "packet_handler".to_string(),
        }
    }
}

/// Logging and metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON.
    pub log_json: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
