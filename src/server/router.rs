//! Method and path based request routing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::http::request::{Method, Request};
use crate::http::response::Response;

/// Route handler. Runs on a worker thread.
pub type Handler = Arc<dyn Fn(&Request) -> anyhow::Result<Response> + Send + Sync>;

/// Returns true when `pattern` matches `path`. A trailing `*` matches any
/// suffix; everything else must be equal.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

/// Routes keyed by (method, pattern).
///
/// Exact patterns are looked up first. Wildcard patterns are tried next,
/// longest prefix first, so `/api/*` wins over `/*`.
#[derive(Default, Clone)]
pub struct Router {
    exact: HashMap<(Method, String), Handler>,
    wildcard: Vec<(Method, String, Handler)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(&mut self, method: Method, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        if pattern.ends_with('*') {
            self.wildcard.retain(|(m, p, _)| !(*m == method && p == pattern));
            self.wildcard.push((method, pattern.to_string(), handler));
            self.wildcard
                .sort_by(|(_, a, _), (_, b, _)| b.len().cmp(&a.len()));
        } else {
            self.exact.insert((method, pattern.to_string()), handler);
        }
        self
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::POST, pattern, handler)
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::PUT, pattern, handler)
    }

    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::DELETE, pattern, handler)
    }

    pub fn find(&self, method: Method, path: &str) -> Option<&Handler> {
        if let Some(handler) = self.exact.get(&(method, path.to_string())) {
            return Some(handler);
        }
        self.wildcard
            .iter()
            .find(|(m, pattern, _)| *m == method && path_matches(pattern, path))
            .map(|(_, _, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<String> = self
            .exact
            .keys()
            .map(|(m, p)| format!("{m} {p}"))
            .chain(self.wildcard.iter().map(|(m, p, _)| format!("{m} {p}")))
            .collect();
        routes.sort();
        f.debug_struct("Router").field("routes", &routes).finish()
    }
}
