//! HTTP gateway with an optional hidden-service relay.
//!
//! A local API and static assets are served over HTTP(S) through an ordered
//! filter chain. When enabled, an anonymity overlay publishes a hidden
//! service whose connections are relayed byte-for-byte to the same gateway.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;

// Hidden service
pub mod overlay;
pub mod relay;

// Cross-cutting concerns
pub mod handler;
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::GatewayConfig;
pub use http::GatewayServer;
pub use lifecycle::{LifecycleCoordinator, Shutdown};
