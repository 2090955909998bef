//! Route table and dispatch.
//!
//! # Responsibilities
//! - Mount the API namespace and its diagnostic variant on the bound handler
//! - Check every API caller against the allow-list before dispatch
//! - Serve static assets for everything else
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Handler failures become a generic 500; details stay in the log
//! - Directory listings are never produced; a trailing `/` serves the welcome file

use std::collections::HashMap;
use std::error::Error as _;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use http_body_util::LengthLimitError;
use serde_json::{json, Value};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use url::form_urlencoded;

use crate::config::ApiConfig;
use crate::handler::{ApiHandler, ApiRequest};
use crate::http::rewrite::with_path;
use crate::security::access_control::{access_control_middleware, AllowedHostSet};

/// Form bodies larger than this are refused.
const MAX_FORM_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
struct ApiState {
    handler: Arc<dyn ApiHandler>,
    prefix: Arc<str>,
    pretty: bool,
}

/// Build the terminal router: API namespace, diagnostic namespace, static fallback.
pub async fn build_router(api: &ApiConfig, handler: Arc<dyn ApiHandler>) -> Router {
    let mut router = Router::new();

    if api.enabled {
        let allowed = Arc::new(AllowedHostSet::from_entries(&api.allowed_hosts).await);
        if allowed.is_unrestricted() {
            tracing::warn!("API allow-list is unrestricted");
        }
        let namespaces = api_namespace(&api.path, Arc::clone(&handler), false)
            .merge(api_namespace(&api.test_path, handler, true))
            .route_layer(middleware::from_fn_with_state(allowed, access_control_middleware));
        router = router.merge(namespaces);
        tracing::info!(path = %api.path, test_path = %api.test_path, "API namespace mounted");
    } else {
        tracing::info!("API namespace disabled");
    }

    match &api.ui_dir {
        Some(root) => {
            let welcome: Arc<str> = Arc::from(api.welcome_file.as_str());
            let assets = ServeDir::new(root)
                .append_index_html_on_directories(false)
                .map_request(move |request: Request<Body>| with_welcome_file(request, &welcome));
            tracing::info!(root = %root.display(), "Serving static assets");
            router.fallback_service(assets)
        }
        None => router.fallback(|| async { StatusCode::NOT_FOUND }),
    }
}

fn api_namespace(prefix: &str, handler: Arc<dyn ApiHandler>, pretty: bool) -> Router {
    let state = ApiState {
        handler,
        prefix: Arc::from(prefix),
        pretty,
    };
    Router::new()
        .route(prefix, any(dispatch))
        .route(&format!("{prefix}/"), any(dispatch))
        .route(&format!("{prefix}/{{*rest}}"), any(dispatch))
        .with_state(state)
}

fn with_welcome_file(mut request: Request<Body>, welcome: &str) -> Request<Body> {
    if request.uri().path().ends_with('/') {
        let path = format!("{}{welcome}", request.uri().path());
        let uri = with_path(request.uri(), &path);
        *request.uri_mut() = uri;
    }
    request
}

async fn dispatch(State(state): State<ApiState>, request: Request<Body>) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    let (parts, body) = request.into_parts();
    let path = match parts.uri.path().strip_prefix(&*state.prefix) {
        Some("") | None => "/".to_string(),
        Some(rest) => rest.to_string(),
    };

    let mut parameters = HashMap::new();
    if let Some(query) = parts.uri.query() {
        collect_parameters(&mut parameters, query.as_bytes());
    }
    if is_form(&parts.headers) {
        match axum::body::to_bytes(body, MAX_FORM_BYTES).await {
            Ok(bytes) => collect_parameters(&mut parameters, &bytes),
            Err(e) if is_length_limit(&e) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
            Err(e) => {
                tracing::debug!(error = %e, "Unreadable form body");
                return StatusCode::BAD_REQUEST.into_response();
            }
        }
    }

    let api_request = ApiRequest {
        path,
        method: parts.method,
        parameters,
        client,
    };

    match state.handler.handle(api_request).await {
        Ok(response) => render(response.status, &response.body, state.pretty),
        Err(e) => {
            tracing::error!(
                prefix = %state.prefix,
                error = %e,
                cause = e.source().map(tracing::field::display),
                "API handler failed"
            );
            render(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "errorDescription": "Internal server error" }),
                state.pretty,
            )
        }
    }
}

fn collect_parameters(parameters: &mut HashMap<String, String>, input: &[u8]) {
    for (key, value) in form_urlencoded::parse(input) {
        parameters
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
}

fn is_form(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn render(status: StatusCode, body: &Value, pretty: bool) -> Response {
    let bytes = if pretty {
        serde_json::to_vec_pretty(body)
    } else {
        serde_json::to_vec(body)
    };
    match bytes {
        Ok(bytes) => (
            status,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Cannot serialize API response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ApiResponse, HandlerError};
    use axum::body::to_bytes;

    fn echo() -> Arc<dyn ApiHandler> {
        Arc::new(|request: ApiRequest| async move {
            if request.path == "/fail" {
                return Err(HandlerError::new("database unavailable"));
            }
            Ok::<_, HandlerError>(ApiResponse::ok(json!({
                "path": request.path,
                "parameters": request.parameters,
            })))
        })
    }

    fn open_api() -> ApiConfig {
        ApiConfig {
            allowed_hosts: vec!["*".to_string()],
            ..ApiConfig::default()
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn dispatches_with_sub_path_and_parameters() {
        let router = build_router(&open_api(), echo()).await;
        let response = router
            .oneshot(get("/burst/blocks?requestType=getState&requestType=ignored"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["path"], "/blocks");
        assert_eq!(body["parameters"]["requestType"], "getState");
    }

    #[tokio::test]
    async fn form_body_parameters_are_merged() {
        let router = build_router(&open_api(), echo()).await;
        let request = Request::builder()
            .method("POST")
            .uri("/burst?a=query")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("a=form&b=2"))
            .unwrap();
        let body: Value =
            serde_json::from_str(&body_string(router.oneshot(request).await.unwrap()).await).unwrap();
        assert_eq!(body["path"], "/");
        assert_eq!(body["parameters"]["a"], "query");
        assert_eq!(body["parameters"]["b"], "2");
    }

    #[tokio::test]
    async fn diagnostic_namespace_is_pretty() {
        let router = build_router(&open_api(), echo()).await;
        let compact = body_string(router.clone().oneshot(get("/burst")).await.unwrap()).await;
        let pretty = body_string(router.oneshot(get("/test")).await.unwrap()).await;
        assert!(!compact.contains('\n'));
        assert!(pretty.contains('\n'));
    }

    #[tokio::test]
    async fn handler_failure_is_generic() {
        let router = build_router(&open_api(), echo()).await;
        let response = router.oneshot(get("/burst/fail")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert!(!body.contains("database"));
    }

    #[tokio::test]
    async fn caller_outside_allow_list_is_denied() {
        let api = ApiConfig {
            allowed_hosts: vec!["10.0.0.0/8".to_string()],
            ..ApiConfig::default()
        };
        let router = build_router(&api, echo()).await;

        let mut denied = get("/burst");
        denied
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([11, 0, 0, 1], 5000))));
        let response = router.clone().oneshot(denied).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["errorCode"], 7);

        let mut allowed = get("/test/x");
        allowed
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 5000))));
        assert_eq!(router.oneshot(allowed).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn disabled_api_is_not_mounted() {
        let api = ApiConfig {
            enabled: false,
            ..open_api()
        };
        let response = build_router(&api, echo()).await.oneshot(get("/burst")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_assets_and_welcome_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::create_dir(root.path().join("docs")).unwrap();

        let api = ApiConfig {
            ui_dir: Some(root.path().to_path_buf()),
            ..open_api()
        };
        let router = build_router(&api, echo()).await;

        let home = router.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(home.status(), StatusCode::OK);
        assert_eq!(body_string(home).await, "<h1>home</h1>");

        let listing = router.clone().oneshot(get("/docs/")).await.unwrap();
        assert_eq!(listing.status(), StatusCode::NOT_FOUND);

        let missing = router.oneshot(get("/missing.js")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
