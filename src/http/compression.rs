//! Gzip stage.
//!
//! Responses are compressed only when the request method is whitelisted,
//! the path lies in the API namespace and the body reaches the minimum size.
//! Eligibility is decided on the request and carried to the compression
//! predicate as a response extension.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Extensions, HeaderMap, Method, Request, StatusCode, Version},
    middleware::{self, Next},
    response::Response,
    Router,
};
use tower::{ServiceBuilder, ServiceExt};
use tower_http::compression::predicate::{NotForContentType, Predicate, SizeAbove};
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::GzipConfig;
use crate::routing::matcher::{AnyPrefix, Matcher};

/// Marks a response as allowed to be compressed.
#[derive(Debug, Clone, Copy)]
struct CompressionEligible;

/// The compression stage, built once from configuration.
#[derive(Debug, Clone)]
pub struct GzipStage {
    methods: Vec<Method>,
    min_size: u16,
    inflate_limit: usize,
    scope: AnyPrefix,
}

impl GzipStage {
    /// Build the stage. Only paths under `api_prefixes` are ever compressed.
    pub fn new(config: &GzipConfig, api_prefixes: &[String]) -> Self {
        let methods = config
            .methods
            .iter()
            .filter_map(|m| m.to_ascii_uppercase().parse::<Method>().ok())
            .collect();
        Self {
            methods,
            min_size: config.min_size_bytes,
            inflate_limit: config.inflate_buffer_bytes,
            scope: AnyPrefix::new(api_prefixes.iter().cloned()),
        }
    }

    /// Whether a response to this request may be compressed.
    pub fn applies(&self, method: &Method, path: &str) -> bool {
        self.methods.contains(method) && self.scope.matches(path)
    }

    /// Wrap `inner` with request inflation (when bounded) and response compression.
    ///
    /// Inflation and the body bound apply to the API namespace only.
    pub fn wrap(&self, inner: Router) -> Router {
        let predicate = SizeAbove::new(self.min_size)
            .and(NotForContentType::IMAGES)
            .and(is_eligible);

        let router = if self.inflate_limit > 0 {
            let inflating = ServiceBuilder::new()
                .layer(RequestDecompressionLayer::new())
                .layer(RequestBodyLimitLayer::new(self.inflate_limit))
                .service(inner.clone());
            let scope = self.scope.clone();
            let dispatch = tower::service_fn(move |request: Request<Body>| {
                let in_scope = scope.matches(request.uri().path());
                let inflating = inflating.clone();
                let plain = inner.clone();
                async move {
                    let response = if in_scope {
                        inflating.oneshot(request).await?.map(Body::new)
                    } else {
                        plain.oneshot(request).await?
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            Router::new().fallback_service(dispatch)
        } else {
            Router::new().fallback_service(inner)
        };

        router
            .layer(middleware::from_fn_with_state(Arc::new(self.clone()), mark_eligible))
            .layer(CompressionLayer::new().compress_when(predicate))
    }
}

fn is_eligible(_: StatusCode, _: Version, _: &HeaderMap, extensions: &Extensions) -> bool {
    extensions.get::<CompressionEligible>().is_some()
}

async fn mark_eligible(
    State(stage): State<Arc<GzipStage>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let eligible = stage.applies(request.method(), request.uri().path());
    let mut response = next.run(request).await;
    if eligible {
        response.extensions_mut().insert(CompressionEligible);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::routing::{get, post};

    fn stage(config: GzipConfig) -> GzipStage {
        GzipStage::new(&config, &["/burst".to_string(), "/test".to_string()])
    }

    fn app(stage: &GzipStage) -> Router {
        let big = "x".repeat(4096);
        let inner = Router::new()
            .route("/burst", get({
                let big = big.clone();
                move || async move { big }
            }).post(|body: String| async move { body }))
            .route("/index.html", get(move || async move { big }))
            .route(
                "/upload",
                post(|headers: HeaderMap, body: axum::body::Bytes| async move {
                    format!("{}:{}", headers.contains_key(header::CONTENT_ENCODING), body.len())
                }),
            )
            .route("/small", get(|| async { "tiny" }));
        stage.wrap(inner)
    }

    fn gzip_get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap()
    }

    fn is_gzipped(response: &Response) -> bool {
        response
            .headers()
            .get(header::CONTENT_ENCODING)
            .is_some_and(|v| v == "gzip")
    }

    #[test]
    fn methods_and_scope() {
        let stage = stage(GzipConfig::default());
        assert!(stage.applies(&Method::GET, "/burst"));
        assert!(stage.applies(&Method::POST, "/test/x"));
        assert!(!stage.applies(&Method::PUT, "/burst"));
        assert!(!stage.applies(&Method::GET, "/index.html"));
    }

    #[tokio::test]
    async fn compresses_api_responses_only() {
        let app = app(&stage(GzipConfig::default()));

        let api = app.clone().oneshot(gzip_get("/burst")).await.unwrap();
        assert!(is_gzipped(&api));

        let asset = app.oneshot(gzip_get("/index.html")).await.unwrap();
        assert!(!is_gzipped(&asset));
    }

    #[tokio::test]
    async fn small_bodies_are_not_compressed() {
        let app = app(&stage(GzipConfig {
            min_size_bytes: 8192,
            ..GzipConfig::default()
        }));
        let api = app.oneshot(gzip_get("/burst")).await.unwrap();
        assert!(!is_gzipped(&api));
    }

    #[tokio::test]
    async fn oversized_request_bodies_are_refused() {
        let app = app(&stage(GzipConfig {
            inflate_buffer_bytes: 16,
            ..GzipConfig::default()
        }));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/burst")
            .header(header::CONTENT_LENGTH, "64")
            .body(Body::from("y".repeat(64)))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn bodies_outside_the_api_are_left_alone() {
        let app = app(&stage(GzipConfig {
            inflate_buffer_bytes: 16,
            ..GzipConfig::default()
        }));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_LENGTH, "64")
            .body(Body::from(vec![0x1f; 64]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"true:64");
    }
}
