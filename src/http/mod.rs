//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (accept loop, hyper auto HTTP/1.1 + HTTP/2)
//!     → request.rs (request ID, metrics)
//!     → chain.rs (stages in fixed order)
//!         → rewrite.rs (single-page-app fallback)
//!         → security::rate_limit (throttling)
//!         → compression.rs (gzip on the way out)
//!     → routing (API handler or static assets)
//!     → Send to client
//! ```

pub mod chain;
pub mod compression;
pub mod request;
pub mod rewrite;
pub mod server;

pub use chain::{build_app, wrap_app, FilterChain, Stage};
pub use request::X_REQUEST_ID;
pub use rewrite::RequestedPath;
pub use server::{GatewayError, GatewayServer, ServerState};
