//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses, names and levels
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TapConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::TapConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// One semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("owner {0:?} must be non-empty ASCII letters, digits, '-' or '_'")]
    InvalidOwner(String),

    #[error("host.anchor must not be empty")]
    EmptyAnchor,

    #[error("host.listen {0:?} is not a socket address")]
    InvalidListenAddress(String),

    #[error("observability.log_level {0:?} is not one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("observability.metrics_address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Whether `owner` can prefix stage names.
pub fn is_valid_owner(owner: &str) -> bool {
    !owner.is_empty()
        && owner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Check `config`, collecting every problem.
pub fn validate_config(config: &TapConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !is_valid_owner(&config.owner) {
        errors.push(ValidationError::InvalidOwner(config.owner.clone()));
    }
    if config.host.anchor.trim().is_empty() {
        errors.push(ValidationError::EmptyAnchor);
    }
    if config.host.listen.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidListenAddress(config.host.listen.clone()));
    }

    let obs = &config.observability;
    if !LOG_LEVELS.iter().any(|l| l.eq_ignore_ascii_case(&obs.log_level)) {
        errors.push(ValidationError::InvalidLogLevel(obs.log_level.clone()));
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidMetricsAddress(obs.metrics_address.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
