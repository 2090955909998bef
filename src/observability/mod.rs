//! Logs and metrics.
//!
//! # Data Flow
//! ```text
//! gateway requests, rate limiter, allow-list, relay sessions
//!     → logging.rs (tracing subscriber, pretty or JSON on stdout)
//!     → metrics.rs (metrics facade, Prometheus exporter when enabled)
//! ```
//!
//! # Design Decisions
//! - The library only emits; the binary installs the subscriber and exporter
//! - Every request span carries its `x-request-id`

pub mod logging;
pub mod metrics;
