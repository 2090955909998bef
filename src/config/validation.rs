//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ports, buffer sizes, rates)
//! - Detect duplicate filter stages
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Malformed allow-list entries are not validation errors; they are
//!   dropped (and logged) when the allow-list is built

use std::collections::HashSet;

use axum::http::Method;
use thiserror::Error;

use crate::config::schema::{GatewayConfig, StageConfig, StageKind};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.port must be between 1 and 65535")]
    InvalidPort,

    #[error("listener.tls_keystore_path is required when TLS is enabled")]
    MissingKeystore,

    #[error("{field} must start with '/', not be '/' and not end with '/': {value:?}")]
    InvalidPrefix { field: &'static str, value: String },

    #[error("filter stage {0} is configured more than once")]
    DuplicateStage(StageKind),

    #[error("{field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.port == 0 {
        errors.push(ValidationError::InvalidPort);
    }
    if config.listener.tls_enabled && config.listener.tls_keystore_path.trim().is_empty() {
        errors.push(ValidationError::MissingKeystore);
    }
    if config.listener.max_connections == 0 {
        errors.push(invalid("listener.max_connections", "must be at least 1"));
    }

    check_prefix(&mut errors, "api.path", &config.api.path);
    check_prefix(&mut errors, "api.test_path", &config.api.test_path);
    if config.api.path == config.api.test_path {
        errors.push(invalid("api.test_path", "must differ from api.path"));
    }
    if config.api.welcome_file.contains('/') || config.api.welcome_file.is_empty() {
        errors.push(invalid("api.welcome_file", "must be a plain file name"));
    }

    let mut seen = HashSet::new();
    for stage in &config.filters {
        if !seen.insert(stage.kind()) {
            errors.push(ValidationError::DuplicateStage(stage.kind()));
        }
        match stage {
            StageConfig::Rewrite(rewrite) => {
                for prefix in &rewrite.reserved_prefixes {
                    check_prefix(&mut errors, "filters.rewrite.reserved_prefixes", prefix);
                }
            }
            StageConfig::RateLimit(limit) => {
                if limit.max_requests_per_second == 0 {
                    errors.push(invalid(
                        "filters.rate_limit.max_requests_per_second",
                        "must be at least 1",
                    ));
                }
                if limit.track_sessions && limit.session_cookie.is_empty() {
                    errors.push(invalid(
                        "filters.rate_limit.session_cookie",
                        "is required when track_sessions is on",
                    ));
                }
            }
            StageConfig::Gzip(gzip) => {
                for method in &gzip.methods {
                    if method.parse::<Method>().is_err() {
                        errors.push(invalid(
                            "filters.gzip.methods",
                            format!("{method:?} is not an HTTP method"),
                        ));
                    }
                }
            }
        }
    }

    let relay = &config.relay;
    if relay.upload_buffer_bytes == 0 || relay.download_buffer_bytes == 0 {
        errors.push(invalid("relay", "pump buffers must be at least one byte"));
    }
    if relay.max_sessions == 0 {
        errors.push(invalid("relay.max_sessions", "must be at least 1"));
    }
    if relay.enabled && relay.service_id.trim().is_empty() {
        errors.push(invalid("relay.service_id", "is required when the relay is enabled"));
    }
    if relay.hidden_port == Some(0) {
        errors.push(invalid("relay.hidden_port", "must be between 1 and 65535"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

fn check_prefix(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if !value.starts_with('/') || value == "/" || value.ends_with('/') {
        errors.push(ValidationError::InvalidPrefix {
            field,
            value: value.to_string(),
        });
    }
}
