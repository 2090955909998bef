//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Request (after the filter chain)
//!     → router.rs (API namespace? diagnostic namespace? static asset?)
//!     → access_control (API namespaces only)
//!     → handler capability or ServeDir
//!
//! Prefix matching (shared with the rewrite and rate-limit stages):
//!     → matcher.rs (reserved prefixes, OR semantics)
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route

pub mod matcher;
pub mod router;

pub use matcher::{AnyPrefix, Matcher, PathPrefixMatcher};
pub use router::build_router;
