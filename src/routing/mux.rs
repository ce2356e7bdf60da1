//! Request multiplexer.
//!
//! # Responsibilities
//! - Store compiled patterns with their handlers
//! - Pick the most specific pattern for a request
//! - Answer 405 with `Allow` when only the method is wrong
//!
//! # Design Decisions
//! - Immutable after construction (shared without locks)
//! - Lookup scans all routes; route counts are small and the winner is
//!   defined by precedence rather than registration order
//! - Duplicate patterns are a build error

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request};

use super::pattern::{clean_path, MethodMatch, Pattern};
use crate::error::{ErrorContext, ErrorHandler, GatewayError};
use crate::http::handler::{handler_fn, serve, Handler};
use crate::http::request_host;

/// The wildcard capture of the matched pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    params: Vec<(String, String)>,
}

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// The pattern a request was dispatched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPattern(pub String);

struct Route {
    pattern: Pattern,
    handler: Handler,
}

/// Result of a lookup.
pub enum Lookup<'a> {
    Found {
        pattern: &'a Pattern,
        handler: &'a Handler,
        capture: Option<(String, String)>,
    },
    MethodNotAllowed(Vec<String>),
    NotFound,
}

#[derive(Default)]
pub struct Mux {
    routes: Vec<Route>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. The same pattern cannot be registered twice.
    pub fn handle(&mut self, pattern: &str, handler: Handler) -> Result<(), GatewayError> {
        let pattern = Pattern::parse(pattern)?;
        if self.routes.iter().any(|r| same_route(&r.pattern, &pattern)) {
            return Err(GatewayError::create_component(
                "mux",
                format!("pattern {:?} registered twice", pattern.as_str()),
            ));
        }
        tracing::debug!(pattern = %pattern.as_str(), "Pattern registered");
        self.routes.push(Route { pattern, handler });
        Ok(())
    }

    /// Registered pattern strings in registration order.
    pub fn patterns(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.pattern.as_str()).collect()
    }

    pub fn has_catch_all(&self) -> bool {
        self.routes
            .iter()
            .any(|r| r.pattern.is_catch_all() && r.pattern.method().is_none() && r.pattern.host().is_none())
    }

    pub fn lookup(&self, method: &Method, host: &str, path: &str) -> Lookup<'_> {
        let mut best: Option<(&Route, MethodMatch, Option<(String, String)>)> = None;
        let mut allow = BTreeSet::new();

        for route in &self.routes {
            if !route.pattern.matches_host(host) {
                continue;
            }
            let Some(capture) = route.pattern.match_path(path) else {
                continue;
            };
            let Some(mm) = route.pattern.match_method(method) else {
                if let Some(m) = route.pattern.method() {
                    allow.insert(m.to_string());
                    if *m == Method::GET {
                        allow.insert(Method::HEAD.to_string());
                    }
                }
                continue;
            };
            let better = match &best {
                None => true,
                Some((cur, cur_mm, _)) => {
                    route.pattern.precedence(mm, &cur.pattern, *cur_mm) == Ordering::Greater
                }
            };
            if better {
                best = Some((route, mm, capture));
            }
        }

        match best {
            Some((route, _, capture)) => Lookup::Found {
                pattern: &route.pattern,
                handler: &route.handler,
                capture,
            },
            None if !allow.is_empty() => Lookup::MethodNotAllowed(allow.into_iter().collect()),
            None => Lookup::NotFound,
        }
    }

    /// Freeze the mux into a handler.
    pub fn into_handler(self, error_handler: Arc<dyn ErrorHandler>) -> Handler {
        let mux = Arc::new(self);
        handler_fn(move |mut req: Request<Body>| {
            let mux = mux.clone();
            let error_handler = error_handler.clone();
            async move {
                let host = request_host(&req);
                let path = clean_path(req.uri().path());
                let handler = match mux.lookup(req.method(), &host, &path) {
                    Lookup::Found {
                        pattern,
                        handler,
                        capture,
                    } => {
                        req.extensions_mut()
                            .insert(MatchedPattern(pattern.as_str().to_string()));
                        if let Some(capture) = capture {
                            req.extensions_mut().insert(PathParams {
                                params: vec![capture],
                            });
                        }
                        handler.clone()
                    }
                    Lookup::MethodNotAllowed(allow) => {
                        let err = GatewayError::MethodNotAllowed { allow };
                        return error_handler.serve_http_error(ErrorContext::from_request(&req), &err);
                    }
                    Lookup::NotFound => {
                        let err = GatewayError::NotFound {
                            pattern: String::new(),
                        };
                        return error_handler.serve_http_error(ErrorContext::from_request(&req), &err);
                    }
                };
                serve(&handler, req).await
            }
        })
    }
}

fn same_route(a: &Pattern, b: &Pattern) -> bool {
    a.method() == b.method() && a.host() == b.host() && {
        let strip = |p: &Pattern| {
            let raw = p.as_str().trim();
            let raw = raw.split_once(' ').map(|(_, r)| r.trim_start()).unwrap_or(raw);
            raw.find('/').map(|i| raw[i..].to_string()).unwrap_or_default()
        };
        strip(a) == strip(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsonErrorHandler;
    use crate::http::handler::static_handler;
    use axum::http::{header, StatusCode};
    use http_body_util::BodyExt;

    fn named(name: &'static str) -> Handler {
        static_handler(StatusCode::OK, None, name)
    }

    async fn hit(h: &Handler, method: Method, host: &str, uri: &str) -> (StatusCode, String, Option<String>) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap();
        let res = serve(h, req).await;
        let status = res.status();
        let allow = res
            .headers()
            .get(header::ALLOW)
            .map(|v| v.to_str().unwrap().to_string());
        let body = res.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap(), allow)
    }

    #[tokio::test]
    async fn most_specific_pattern_wins() {
        let mut mux = Mux::new();
        mux.handle("/", named("root")).unwrap();
        mux.handle("/api/", named("api")).unwrap();
        mux.handle("/api/users", named("users")).unwrap();
        mux.handle("GET /api/", named("get-api")).unwrap();
        mux.handle("admin.local/api/", named("admin")).unwrap();
        let h = mux.into_handler(Arc::new(JsonErrorHandler));

        assert_eq!(hit(&h, Method::GET, "x", "/api/users").await.1, "users");
        assert_eq!(hit(&h, Method::GET, "x", "/api/other").await.1, "get-api");
        assert_eq!(hit(&h, Method::POST, "x", "/api/other").await.1, "api");
        assert_eq!(hit(&h, Method::POST, "admin.local:80", "/api/x").await.1, "admin");
        assert_eq!(hit(&h, Method::GET, "x", "/else").await.1, "root");
    }

    #[tokio::test]
    async fn method_mismatch_is_405_with_allow() {
        let mut mux = Mux::new();
        mux.handle("GET /items", named("list")).unwrap();
        mux.handle("POST /items", named("create")).unwrap();
        let h = mux.into_handler(Arc::new(JsonErrorHandler));

        let (status, _, allow) = hit(&h, Method::DELETE, "x", "/items").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(allow.as_deref(), Some("GET, HEAD, POST"));

        let (status, _, _) = hit(&h, Method::GET, "x", "/nothing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn explicit_head_beats_implicit_get() {
        let mut mux = Mux::new();
        mux.handle("GET /p", named("get")).unwrap();
        mux.handle("HEAD /p", static_handler(StatusCode::NOT_FOUND, None, "")).unwrap();
        let h = mux.into_handler(Arc::new(JsonErrorHandler));
        assert_eq!(hit(&h, Method::HEAD, "x", "/p").await.0, StatusCode::NOT_FOUND);
        assert_eq!(hit(&h, Method::GET, "x", "/p").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn wildcard_capture_and_cleaning() {
        let mut mux = Mux::new();
        let echo = handler_fn(|req: Request<Body>| async move {
            let rest = req
                .extensions()
                .get::<PathParams>()
                .and_then(|p| p.get("rest"))
                .unwrap_or("-")
                .to_string();
            axum::http::Response::new(Body::from(rest))
        });
        mux.handle("/files/{rest...}", echo).unwrap();
        let h = mux.into_handler(Arc::new(JsonErrorHandler));
        assert_eq!(hit(&h, Method::GET, "x", "/files//a/./b/../c").await.1, "a/c");
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut mux = Mux::new();
        mux.handle("GET /a", named("a")).unwrap();
        assert!(mux.handle("GET  /a", named("b")).is_err());
        assert!(mux.handle("POST /a", named("c")).is_ok());
        assert!(!mux.has_catch_all());
        mux.handle("/", named("root")).unwrap();
        assert!(mux.has_catch_all());
    }
}
