//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Configuration (at startup):
//!     allow-list entries
//!     → subnet.rs (parse addresses, CIDR blocks, host names)
//!     → access_control.rs (AllowedHostSet, read-only afterwards)
//!
//! Incoming request:
//!     → rate_limit.rs (throttle per client, API namespace only)
//!     → access_control.rs (API namespaces only)
//!     → Pass to handler
//! ```
//!
//! # Design Decisions
//! - A bad allow-list entry degrades the set, never the startup
//! - Fail closed: an unknown caller is denied unless the set is unrestricted

pub mod access_control;
pub mod rate_limit;
pub mod subnet;

pub use access_control::{AccessDenied, AllowedHostSet};
pub use rate_limit::RateLimiter;
pub use subnet::{Subnet, SubnetError};
