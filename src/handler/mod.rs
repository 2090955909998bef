//! Handler capability bound into the API namespace.
//!
//! The gateway never interprets what a handler does: it hands over the
//! request path, method, parameters and client address, and renders the
//! returned status and JSON body. Failures are opaque.

pub mod status;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

use axum::http::{Method, StatusCode};
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

pub use status::StatusHandler;

/// A request dispatched to the API namespace.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Path below the namespace prefix, always starting with `/`.
    pub path: String,
    pub method: Method,
    /// Query-string and form parameters; the first value of a repeated key wins.
    pub parameters: HashMap<String, String>,
    pub client: SocketAddr,
}

impl ApiRequest {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Status code and JSON body produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(StatusCode::OK, body)
    }
}

/// Opaque handler failure. Logged, never shown to the caller.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// The capability serving the API namespace.
pub trait ApiHandler: Send + Sync + 'static {
    fn handle(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, HandlerError>>;
}

impl<F, Fut> ApiHandler for F
where
    F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ApiResponse, HandlerError>> + Send + 'static,
{
    fn handle(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, HandlerError>> {
        Box::pin(self(request))
    }
}

impl fmt::Debug for dyn ApiHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiHandler")
    }
}
