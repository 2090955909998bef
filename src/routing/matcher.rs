//! Path matching logic.
//!
//! # Responsibilities
//! - Match a request path against a reserved prefix
//! - Combine prefixes with OR semantics
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - The leading slash is optional on both sides, so `burst` and `/burst`
//!   reserve the same namespace
//! - No regex to guarantee O(n) matching

/// Trait for matching request paths against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the path matches this condition.
    fn matches(&self, path: &str) -> bool;
}

/// Matches the request path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    /// Create a new path prefix matcher.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_start_matches('/').to_string(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, path: &str) -> bool {
        path.trim_start_matches('/').starts_with(&self.prefix)
    }
}

/// Combines prefix matchers with OR semantics.
#[derive(Debug, Clone, Default)]
pub struct AnyPrefix {
    matchers: Vec<PathPrefixMatcher>,
}

impl AnyPrefix {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matchers: prefixes.into_iter().map(PathPrefixMatcher::new).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

impl Matcher for AnyPrefix {
    fn matches(&self, path: &str) -> bool {
        self.matchers.iter().any(|m| m.matches(path))
    }
}
