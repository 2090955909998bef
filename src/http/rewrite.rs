//! Single-page-app fallback rewrite.
//!
//! Paths outside the reserved API prefixes that name no file under the
//! static root are rewritten to `/`, so client-side routes load the app.
//! The path the client asked for stays available as [`RequestedPath`].

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{uri::PathAndQuery, Request, Uri},
    middleware::Next,
    response::Response,
};

use crate::routing::matcher::{AnyPrefix, Matcher};

const FALLBACK: &str = "/";

/// Path requested by the client, before any rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedPath(pub String);

/// Rewrite rule for the first stage of the filter chain.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    static_root: PathBuf,
    reserved: AnyPrefix,
}

impl RewriteRule {
    pub fn new(static_root: impl Into<PathBuf>, reserved: AnyPrefix) -> Self {
        Self {
            static_root: static_root.into(),
            reserved,
        }
    }

    /// Target path for `path`, or `None` when it is left alone.
    pub async fn rewrite(&self, path: &str) -> Option<&'static str> {
        if self.reserved.matches(path) {
            return None;
        }
        match self.resolve(path) {
            Some(file) if tokio::fs::try_exists(&file).await.unwrap_or(false) => None,
            _ => Some(FALLBACK),
        }
    }

    /// Map a URL path onto the static root. `None` for paths that could escape it.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let decoded = percent_decode(path)?;
        let relative = Path::new(decoded.trim_start_matches('/'));
        let mut resolved = self.static_root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(resolved)
    }
}

/// Replace the path of `uri`, keeping its query string.
pub fn with_path(uri: &Uri, path: &str) -> Uri {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    match PathAndQuery::from_maybe_shared(path_and_query) {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(_) => return uri.clone(),
    }
    Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
}

fn percent_decode(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = path.get(i + 1..i + 3)?;
            // from_str_radix would take a leading sign.
            if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let decoded = String::from_utf8(out).ok()?;
    (!decoded.contains('\0') && !decoded.contains('\\')).then_some(decoded)
}

pub async fn rewrite_middleware(
    State(rule): State<Arc<RewriteRule>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let requested = request.uri().path().to_string();
    if let Some(target) = rule.rewrite(&requested).await {
        tracing::trace!(from = %requested, to = target, "Path rewritten");
        let uri = with_path(request.uri(), target);
        *request.uri_mut() = uri;
    }
    request.extensions_mut().insert(RequestedPath(requested));
    next.run(request).await
}
