//! Built-in status capability.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use serde_json::json;

use super::{ApiHandler, ApiRequest, ApiResponse, HandlerError};

/// Answers `requestType=getState` with application name, version, time and uptime.
#[derive(Debug, Clone)]
pub struct StatusHandler {
    application: String,
    version: String,
    started: Instant,
}

impl StatusHandler {
    pub fn new(application: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            version: version.into(),
            started: Instant::now(),
        }
    }

    fn respond(&self, request: &ApiRequest) -> ApiResponse {
        match request.parameter("requestType") {
            Some("getState") => {
                let time = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                ApiResponse::ok(json!({
                    "application": self.application,
                    "version": self.version,
                    "time": time,
                    "uptimeSeconds": self.started.elapsed().as_secs(),
                }))
            }
            _ => ApiResponse::new(
                StatusCode::BAD_REQUEST,
                json!({ "errorCode": 1, "errorDescription": "Incorrect request" }),
            ),
        }
    }
}

impl Default for StatusHandler {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

impl ApiHandler for StatusHandler {
    fn handle(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, HandlerError>> {
        Box::pin(async move { Ok(self.respond(&request)) })
    }
}
