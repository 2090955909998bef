//! Filter chain assembly.
//!
//! # Responsibilities
//! - Turn the configured stage descriptors into an ordered list of stages
//! - Wrap the terminal router so stages run in that order
//! - Add the ambient layers (request ID, tracing, metrics) around the chain
//!
//! # Design Decisions
//! - Stage order is fixed by kind, not by position in the configuration:
//!   rewrite, then rate limit, then routing with compression on the response
//! - Disabling a stage never reorders the others
//! - Each stage wraps its inner router in a fresh router, so a rewrite is
//!   visible to the routing done below it

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::{GatewayConfig, StageConfig, StageKind};
use crate::handler::ApiHandler;
use crate::http::compression::GzipStage;
use crate::http::request::{record_metrics, GatewayRequestId, X_REQUEST_ID};
use crate::http::rewrite::{rewrite_middleware, RewriteRule};
use crate::routing::build_router;
use crate::routing::matcher::AnyPrefix;
use crate::security::rate_limit::{rate_limit_middleware, RateLimiter};

/// One built stage of the chain.
#[derive(Clone)]
pub enum Stage {
    Rewrite(Arc<RewriteRule>),
    RateLimit(Arc<RateLimiter>),
    Gzip(GzipStage),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Rewrite(_) => StageKind::Rewrite,
            Stage::RateLimit(_) => StageKind::RateLimit,
            Stage::Gzip(_) => StageKind::Gzip,
        }
    }

    fn wrap(&self, inner: Router) -> Router {
        match self {
            Stage::Rewrite(rule) => Router::new()
                .fallback_service(inner)
                .layer(middleware::from_fn_with_state(Arc::clone(rule), rewrite_middleware)),
            Stage::RateLimit(limiter) => Router::new()
                .fallback_service(inner)
                .layer(middleware::from_fn_with_state(Arc::clone(limiter), rate_limit_middleware)),
            Stage::Gzip(stage) => stage.wrap(inner),
        }
    }
}

/// Ordered request-processing stages wrapping the router.
#[derive(Clone, Default)]
pub struct FilterChain {
    stages: Vec<Stage>,
}

impl FilterChain {
    /// Build the stages described by `config.filters`.
    pub async fn from_config(config: &GatewayConfig) -> Self {
        let api_prefixes = config.api.reserved_prefixes();
        let mut descriptors: Vec<&StageConfig> = config.filters.iter().collect();
        descriptors.sort_by_key(|stage| stage.kind().rank());

        let mut stages = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match descriptor {
                StageConfig::Rewrite(rewrite) => {
                    let Some(root) = &config.api.ui_dir else {
                        tracing::info!("No static root configured, rewrite stage skipped");
                        continue;
                    };
                    let reserved = if rewrite.reserved_prefixes.is_empty() {
                        api_prefixes.clone()
                    } else {
                        rewrite.reserved_prefixes.clone()
                    };
                    stages.push(Stage::Rewrite(Arc::new(RewriteRule::new(
                        root.clone(),
                        AnyPrefix::new(reserved),
                    ))));
                }
                StageConfig::RateLimit(limit) => {
                    stages.push(Stage::RateLimit(Arc::new(RateLimiter::new(
                        limit.clone(),
                        &api_prefixes,
                    )
                    .await)));
                }
                StageConfig::Gzip(gzip) => {
                    stages.push(Stage::Gzip(GzipStage::new(gzip, &api_prefixes)));
                }
            }
        }

        let chain = Self { stages };
        tracing::info!(stages = ?chain.kinds(), "Filter chain built");
        chain
    }

    /// Stage kinds in execution order.
    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(Stage::kind).collect()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Wrap `router` so the first stage is outermost.
    pub fn wrap(&self, router: Router) -> Router {
        self.stages
            .iter()
            .rev()
            .fold(router, |inner, stage| stage.wrap(inner))
    }
}

/// Build the complete application: router, filter chain and ambient layers.
///
/// Allow-list host names are resolved here.
pub async fn build_app(config: &GatewayConfig, handler: Arc<dyn ApiHandler>) -> Router {
    let chain = FilterChain::from_config(config).await;
    wrap_app(&chain, build_router(&config.api, handler).await)
}

/// Add the ambient layers around an already-built chain.
pub fn wrap_app(chain: &FilterChain, router: Router) -> Router {
    chain
        .wrap(router)
        .layer(middleware::from_fn(record_metrics))
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, GatewayRequestId))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GzipConfig, RateLimitConfig, RewriteConfig};
    use crate::handler::{ApiRequest, ApiResponse, HandlerError};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    fn handler() -> Arc<dyn ApiHandler> {
        Arc::new(|request: ApiRequest| async move {
            Ok::<_, HandlerError>(ApiResponse::ok(json!({ "path": request.path })))
        })
    }

    fn config_with(filters: Vec<StageConfig>, ui_dir: Option<std::path::PathBuf>) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.filters = filters;
        config.api.ui_dir = ui_dir;
        config.api.allowed_hosts = vec!["*".to_string()];
        config
    }

    #[tokio::test]
    async fn stages_run_in_fixed_order() {
        let root = tempfile::tempdir().unwrap();
        let config = config_with(
            vec![
                StageConfig::Gzip(GzipConfig::default()),
                StageConfig::RateLimit(RateLimitConfig::default()),
                StageConfig::Rewrite(RewriteConfig::default()),
            ],
            Some(root.path().to_path_buf()),
        );
        let chain = FilterChain::from_config(&config).await;
        assert_eq!(
            chain.kinds(),
            vec![StageKind::Rewrite, StageKind::RateLimit, StageKind::Gzip]
        );
    }

    #[tokio::test]
    async fn disabled_stage_keeps_relative_order() {
        let config = config_with(
            vec![
                StageConfig::Gzip(GzipConfig::default()),
                StageConfig::Rewrite(RewriteConfig::default()),
            ],
            None,
        );
        assert_eq!(FilterChain::from_config(&config).await.kinds(), vec![StageKind::Gzip]);
    }

    #[tokio::test]
    async fn rewrite_happens_before_routing() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), "app shell").unwrap();
        let config = config_with(
            vec![StageConfig::Rewrite(RewriteConfig::default())],
            Some(root.path().to_path_buf()),
        );
        let app = build_app(&config, handler()).await;

        let response = app
            .clone()
            .oneshot(Request::get("/client/side/route").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"app shell");

        let api = app
            .oneshot(Request::get("/burst/anything").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(api.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["path"], "/anything");
    }
}
