//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TapConfig (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - Config is read once at startup; handlers are swapped through the API,
//!   not through configuration
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{HostConfig, ObservabilityConfig, TapConfig};
pub use validation::{validate_config, ValidationError};
