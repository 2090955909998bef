//! API allow-list enforcement.
//!
//! Every request routed to the API namespace (and its diagnostic variant)
//! passes through [`access_control_middleware`] before reaching the handler.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::observability::metrics;
use crate::security::subnet::Subnet;

/// Client subnets permitted to reach the API namespace.
///
/// Read-only after construction; shared across workers via `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedHostSet {
    /// Every client is allowed.
    Unrestricted,
    /// Only clients inside one of these subnets are allowed.
    Restricted(Vec<Subnet>),
}

impl AllowedHostSet {
    /// Build the set from configuration entries.
    ///
    /// A `*` entry anywhere yields [`AllowedHostSet::Unrestricted`]. Entries
    /// that fail to parse or resolve are logged and dropped.
    pub async fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut subnets = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" {
                return AllowedHostSet::Unrestricted;
            }
            match Subnet::resolve(entry).await {
                Ok(resolved) => subnets.extend(resolved),
                Err(e) => {
                    tracing::error!(entry = %entry, error = %e, "Error adding allowed host/subnet, entry ignored");
                }
            }
        }
        subnets.dedup();
        AllowedHostSet::Restricted(subnets)
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, AllowedHostSet::Unrestricted)
    }

    /// Whether `ip` may call the API.
    pub fn permits(&self, ip: IpAddr) -> bool {
        match self {
            AllowedHostSet::Unrestricted => true,
            AllowedHostSet::Restricted(subnets) => subnets.iter().any(|s| s.contains(ip)),
        }
    }
}

/// Rejection returned to callers outside the allow-list.
#[derive(Debug, Clone, Copy)]
pub struct AccessDenied;

impl IntoResponse for AccessDenied {
    fn into_response(self) -> Response {
        (
            StatusCode::FORBIDDEN,
            Json(json!({
                "errorCode": 7,
                "errorDescription": "Not allowed",
            })),
        )
            .into_response()
    }
}

pub async fn access_control_middleware(
    State(allowed): State<Arc<AllowedHostSet>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if allowed.is_unrestricted() {
        return next.run(request).await;
    }

    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match client {
        Some(ip) if allowed.permits(ip) => next.run(request).await,
        _ => {
            tracing::debug!(client = ?client, path = %request.uri().path(), "Access denied");
            metrics::record_access_denied();
            AccessDenied.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn subnet_allow_list() {
        let set = AllowedHostSet::from_entries(["10.0.0.0/8"]).await;
        assert!(set.permits(ip("10.1.2.3")));
        assert!(!set.permits(ip("11.0.0.1")));
    }

    #[tokio::test]
    async fn malformed_entries_are_dropped() {
        let set = AllowedHostSet::from_entries(["10.0.0.0/99", "garbage/entry", "", "192.168.1.1"]).await;
        assert_eq!(
            set,
            AllowedHostSet::Restricted(vec!["192.168.1.1".parse().unwrap()])
        );
        assert!(set.permits(ip("192.168.1.1")));
        assert!(!set.permits(ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn only_malformed_entries_deny_everyone() {
        let set = AllowedHostSet::from_entries(["300.1.1.1"]).await;
        assert_eq!(set, AllowedHostSet::Restricted(Vec::new()));
        assert!(!set.permits(ip("127.0.0.1")));
    }

    #[tokio::test]
    async fn wildcard_is_unrestricted() {
        let set = AllowedHostSet::from_entries(["127.0.0.1", "*"]).await;
        assert!(set.is_unrestricted());
        assert!(set.permits(ip("8.8.8.8")));
    }

    #[tokio::test]
    async fn host_names_resolve_inside_the_runtime() {
        let set = AllowedHostSet::from_entries(["localhost"]).await;
        assert!(set.permits(ip("127.0.0.1")));
        assert!(!set.permits(ip("192.0.2.1")));
    }
}
