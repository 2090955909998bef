//! Hidden-service relay subsystem.
//!
//! # Data Flow
//! ```text
//! Overlay connection
//!     → hidden.rs (accept under a session permit)
//!     → session.rs (connect to the gateway's local port)
//!         → pump.rs upload:   client → gateway, half-close on EOF
//!         → pump.rs download: gateway → client, ends the session
//!     → errors → hidden.rs logging task
//! ```
//!
//! # Design Decisions
//! - Two tasks per session on the shared runtime, no dedicated threads
//! - Bounded by a session cap and an idle watchdog
//! - Session errors are logged and never propagated to siblings

pub mod hidden;
pub mod pump;
pub mod session;

pub use hidden::{HiddenRelay, RelayHandle};
pub use pump::Direction;
pub use session::{RelaySession, RelaySessionError, SessionEnd, SessionId, SessionSettings};
