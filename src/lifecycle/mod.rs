//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (coordinator.rs):
//!     Build chain → Start gateway → [Bootstrap overlay → Start relay]
//!
//! Shutdown (coordinator.rs, shutdown.rs):
//!     Signal received → Stop relay → Tear down overlay → Drain gateway
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: filters are wired before the listener accepts
//! - Ordered shutdown: reverse of startup, relay before gateway
//! - Every drain is bounded by a grace period

pub mod coordinator;
pub mod shutdown;
pub mod signals;

pub use coordinator::{LifecycleCoordinator, LifecycleError, Phase};
pub use shutdown::{Shutdown, ShutdownSignal};
