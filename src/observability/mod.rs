//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via `metrics`)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or the configured level)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Recording a metric without an installed recorder is a no-op, so the
//!   library records unconditionally and only the binary installs an exporter
//! - Message contents are never logged, only connection ids and type names

pub mod logging;
pub mod metrics;
