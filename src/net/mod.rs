//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerConfig
//!     → tls.rs (load keystore, exclude weak suites/protocols)
//!     → listener.rs (resolve, reuse-address, bind, connection limits)
//!
//! Incoming TCP connection
//!     → listener.rs (accept under a connection permit)
//!     → connection.rs (idle timeout, lifecycle tracking)
//!     → tls.rs (optional TLS handshake)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Accept waits for a connection permit once `max_connections` are open
//! - Open connections are counted so shutdown knows when they have drained
//! - TLS is optional and terminated before any filter sees plaintext

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{
    ConnectionGuard, ConnectionId, ConnectionTracker, IdleTimeoutStream, InFlight, InFlightGuard,
};
pub use listener::{ConnectionPermit, Listener, ListenerBuilder, ListenerStartError};
pub use tls::{load_tls_acceptor, TlsError};
