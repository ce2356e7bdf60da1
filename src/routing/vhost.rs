//! Virtual hosts and pattern generation.
//!
//! A virtual host groups handlers under a set of hosts, a path prefix, a
//! method set and a middleware chain. Building the mux expands every
//! handler into concrete patterns:
//!
//! ```text
//! methods × hosts × paths  →  "[METHOD ][host]<prefix><path>"
//! ```
//!
//! When `GET` is registered for a path but `HEAD` is not, an explicit
//! `HEAD` pattern bound to a 404 handler is added so `HEAD` does not fall
//! through to the `GET` handler.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::http::Method;

use super::clean_path;
use super::mux::Mux;
use super::pattern::Pattern;
use crate::error::{ErrorHandler, GatewayError};
use crate::http::handler::{not_found_handler, Handler};
use crate::http::middleware::{chain, Middleware};

/// A handler bound inside a virtual host.
#[derive(Clone)]
pub struct HandlerBinding {
    pub name: String,
    pub handler: Handler,
    /// Paths relative to the host's prefix. Empty means `/`.
    pub paths: Vec<String>,
    /// Allowed methods. Empty means any.
    pub methods: Vec<String>,
}

#[derive(Clone)]
pub struct VirtualHost {
    pub name: String,
    /// Host names. Empty means any host.
    pub hosts: Vec<String>,
    /// Path prefix prepended to every handler path.
    pub pattern: String,
    /// Methods allowed on this host. Empty means any.
    pub methods: Vec<String>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub handlers: Vec<HandlerBinding>,
}

/// Join a prefix and a path, then clean the result: duplicate slashes
/// collapse and `.`/`..` segments resolve. A trailing slash on `path` is kept.
pub fn join_path(prefix: &str, path: &str) -> String {
    clean_path(&format!("/{}/{}", prefix.trim_matches('/'), path))
}

/// Cross product of methods, hosts and paths, sorted and deduplicated.
/// Empty `methods` or `hosts` mean "unrestricted".
pub fn generate_patterns(methods: &[String], hosts: &[String], paths: &[String]) -> Vec<String> {
    let methods: Vec<&str> = if methods.is_empty() {
        vec![""]
    } else {
        methods.iter().map(String::as_str).collect()
    };
    let hosts: Vec<&str> = if hosts.is_empty() {
        vec![""]
    } else {
        hosts.iter().map(String::as_str).collect()
    };

    let mut out = BTreeSet::new();
    for m in &methods {
        for h in &hosts {
            for p in paths {
                let m = m.trim().to_ascii_uppercase();
                let pattern = if m.is_empty() {
                    format!("{}{}", h.to_ascii_lowercase(), p)
                } else {
                    format!("{} {}{}", m, h.to_ascii_lowercase(), p)
                };
                out.insert(pattern);
            }
        }
    }
    out.into_iter().collect()
}

/// Methods allowed by both the host and the handler. Empty means any.
fn effective_methods(host: &[String], handler: &[String]) -> Result<Vec<String>, GatewayError> {
    let norm = |ms: &[String]| -> BTreeSet<String> { ms.iter().map(|m| m.trim().to_ascii_uppercase()).collect() };
    let (host, handler) = (norm(host), norm(handler));
    let methods: BTreeSet<String> = match (host.is_empty(), handler.is_empty()) {
        (true, _) => handler,
        (false, true) => host,
        (false, false) => host.intersection(&handler).cloned().collect(),
    };
    for m in &methods {
        Method::from_bytes(m.as_bytes())
            .map_err(|_| GatewayError::create_component("virtual host", format!("invalid method {m:?}")))?;
    }
    Ok(methods.into_iter().collect())
}

/// Register every virtual host on a fresh mux.
pub fn build_mux(vhosts: &[VirtualHost], error_handler: Arc<dyn ErrorHandler>) -> Result<Mux, GatewayError> {
    let mut mux = Mux::new();
    let mut registered: BTreeSet<String> = BTreeSet::new();
    let mut head_candidates: Vec<(String, String)> = Vec::new();

    for vh in vhosts {
        for binding in &vh.handlers {
            let methods = effective_methods(&vh.methods, &binding.methods)?;
            if methods.is_empty() && !vh.methods.is_empty() && !binding.methods.is_empty() {
                return Err(GatewayError::create_component(
                    "virtual host",
                    format!("{}: handler {} has no method in common with the host", vh.name, binding.name),
                ));
            }
            let paths: Vec<String> = if binding.paths.is_empty() {
                vec![join_path(&vh.pattern, "/")]
            } else {
                binding.paths.iter().map(|p| join_path(&vh.pattern, p)).collect()
            };

            let handler = chain(&vh.middleware, binding.handler.clone());
            for pattern in generate_patterns(&methods, &vh.hosts, &paths) {
                mux.handle(&pattern, handler.clone()).map_err(|e| {
                    GatewayError::create_component("virtual host", format!("{}: {}", vh.name, e))
                })?;
                registered.insert(canonical(&pattern)?);
            }

            let has = |m: &str| methods.iter().any(|x| x == m);
            if has("GET") && !has("HEAD") {
                for pattern in generate_patterns(&["HEAD".to_string()], &vh.hosts, &paths) {
                    head_candidates.push((vh.name.clone(), pattern));
                }
            }
        }
    }

    for (vh, pattern) in head_candidates {
        let key = canonical(&pattern)?;
        if registered.insert(key) {
            tracing::debug!(virtual_host = %vh, pattern = %pattern, "HEAD isolated from GET");
            mux.handle(&pattern, not_found_handler(pattern.clone(), error_handler.clone()))?;
        }
    }

    if !mux.has_catch_all() {
        mux.handle("/", not_found_handler("/", error_handler))?;
    }
    Ok(mux)
}

fn canonical(pattern: &str) -> Result<String, GatewayError> {
    let p = Pattern::parse(pattern)?;
    let method = p.method().map(|m| m.to_string()).unwrap_or_default();
    let host = p.host().unwrap_or_default();
    let raw = pattern.trim();
    let path = raw.find('/').map(|i| &raw[i..]).unwrap_or(raw);
    Ok(format!("{method} {host}{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsonErrorHandler;
    use crate::http::handler::static_handler;
    use axum::http::StatusCode;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn generates_sorted_cross_product() {
        let got = generate_patterns(&s(&["POST", "GET"]), &s(&["b.com", "a.com"]), &s(&["/x"]));
        assert_eq!(
            got,
            s(&["GET a.com/x", "GET b.com/x", "POST a.com/x", "POST b.com/x"])
        );
        assert_eq!(generate_patterns(&[], &[], &s(&["/x", "/x"])), s(&["/x"]));
        assert!(generate_patterns(&[], &[], &[]).is_empty());
    }

    #[test]
    fn joins_paths() {
        assert_eq!(join_path("/v1", "/users"), "/v1/users");
        assert_eq!(join_path("/v1/", "users/"), "/v1/users/");
        assert_eq!(join_path("", "/"), "/");
        assert_eq!(join_path("/api", "/"), "/api/");
        assert_eq!(join_path("/api", "/files/{rest...}"), "/api/files/{rest...}");
        assert_eq!(join_path("/api", "./users/../v2/x"), "/api/v2/x");
        assert_eq!(join_path("/api", "v2/./x/"), "/api/v2/x/");
        assert_eq!(join_path("/api", "/../../etc"), "/etc");
    }

    #[test]
    fn intersects_methods() {
        assert_eq!(effective_methods(&s(&["get", "post"]), &s(&["POST"])).unwrap(), s(&["POST"]));
        assert_eq!(effective_methods(&[], &s(&["GET"])).unwrap(), s(&["GET"]));
        assert!(effective_methods(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn builds_head_isolation_and_default_404() {
        let vh = VirtualHost {
            name: "api".into(),
            hosts: vec![],
            pattern: "/v1".into(),
            methods: vec![],
            middleware: vec![],
            handlers: vec![HandlerBinding {
                name: "users".into(),
                handler: static_handler(StatusCode::OK, None, "u"),
                paths: s(&["/users"]),
                methods: s(&["GET"]),
            }],
        };
        let mux = build_mux(&[vh], Arc::new(JsonErrorHandler)).unwrap();
        let patterns = mux.patterns();
        assert!(patterns.contains(&"GET /v1/users"));
        assert!(patterns.contains(&"HEAD /v1/users"));
        assert!(patterns.contains(&"/"));
    }

    #[test]
    fn duplicate_bindings_fail() {
        let binding = HandlerBinding {
            name: "h".into(),
            handler: static_handler(StatusCode::OK, None, ""),
            paths: s(&["/a"]),
            methods: vec![],
        };
        let vh = VirtualHost {
            name: "dup".into(),
            hosts: vec![],
            pattern: String::new(),
            methods: vec![],
            middleware: vec![],
            handlers: vec![binding.clone(), binding],
        };
        assert!(build_mux(&[vh], Arc::new(JsonErrorHandler)).is_err());
    }
}
