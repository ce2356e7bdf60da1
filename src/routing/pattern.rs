//! Route patterns.
//!
//! A pattern has the form `[METHOD ][HOST]/PATH`:
//!
//! ```text
//! /users            exact path
//! /static/          the subtree below /static/
//! /files/{rest...}  the subtree below /files/, remainder captured as "rest"
//! GET api.example.com/v1/  method and host restricted subtree
//! ```
//!
//! # Design Decisions
//! - Host matching is case-insensitive, path matching is case-sensitive
//! - A `GET` pattern also matches `HEAD` requests
//! - Wildcards are only allowed as the final segment

use std::cmp::Ordering;

use axum::http::Method;

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Exact,
    Subtree,
    Wildcard(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    method: Option<Method>,
    host: Option<String>,
    /// Path without the wildcard segment; ends with `/` for subtrees.
    path: String,
    shape: Shape,
}

/// How a pattern matched a request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MethodMatch {
    Any,
    HeadAsGet,
    Exact,
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let invalid = |reason: &str| GatewayError::create_component("pattern", format!("{raw:?}: {reason}"));
        let trimmed = raw.trim();

        let (method, rest) = match trimmed.split_once(' ') {
            Some((m, rest)) => {
                let method = Method::from_bytes(m.as_bytes()).map_err(|_| invalid("bad method"))?;
                (Some(method), rest.trim_start())
            }
            None => (None, trimmed),
        };

        let slash = rest.find('/').ok_or_else(|| invalid("path must start with '/'"))?;
        let host = match &rest[..slash] {
            "" => None,
            h => Some(h.to_ascii_lowercase()),
        };
        let full_path = &rest[slash..];

        let (path, shape) = match full_path.rfind('/') {
            Some(idx) if full_path[idx + 1..].starts_with('{') => {
                let seg = &full_path[idx + 1..];
                let name = seg
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix("...}"))
                    .filter(|n| !n.is_empty() && !n.contains(['{', '}', '/']))
                    .ok_or_else(|| invalid("only a trailing {name...} wildcard is supported"))?;
                (full_path[..=idx].to_string(), Shape::Wildcard(name.to_string()))
            }
            _ if full_path.ends_with('/') => (full_path.to_string(), Shape::Subtree),
            _ => (full_path.to_string(), Shape::Exact),
        };
        if path.contains(['{', '}']) {
            return Err(invalid("only a trailing {name...} wildcard is supported"));
        }

        Ok(Self {
            raw: raw.to_string(),
            method,
            host,
            path,
            shape,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// True for patterns that match every path (`/` and `/{x...}`).
    pub fn is_catch_all(&self) -> bool {
        self.path == "/" && self.shape != Shape::Exact
    }

    pub fn matches_host(&self, host: &str) -> bool {
        self.host.as_deref().is_none_or(|h| h == host)
    }

    /// Match `path`, returning the wildcard capture when there is one.
    pub fn match_path(&self, path: &str) -> Option<Option<(String, String)>> {
        match &self.shape {
            Shape::Exact => (path == self.path).then_some(None),
            Shape::Subtree => path.starts_with(&self.path).then_some(None),
            Shape::Wildcard(name) => path
                .strip_prefix(&self.path)
                .map(|rest| Some((name.clone(), rest.to_string()))),
        }
    }

    pub fn match_method(&self, method: &Method) -> Option<MethodMatch> {
        match &self.method {
            None => Some(MethodMatch::Any),
            Some(m) if m == method => Some(MethodMatch::Exact),
            Some(m) if *m == Method::GET && *method == Method::HEAD => Some(MethodMatch::HeadAsGet),
            Some(_) => None,
        }
    }

    /// Path specificity: exact paths first, then longer prefixes.
    fn path_rank(&self) -> (u8, usize) {
        match self.shape {
            Shape::Exact => (1, self.path.len()),
            _ => (0, self.path.len()),
        }
    }

    /// Order two patterns that both match a request. `Greater` wins.
    pub fn precedence(&self, a: MethodMatch, other: &Pattern, b: MethodMatch) -> Ordering {
        self.host
            .is_some()
            .cmp(&other.host.is_some())
            .then_with(|| self.path_rank().cmp(&other.path_rank()))
            .then_with(|| a.cmp(&b))
            .then_with(|| other.raw.cmp(&self.raw))
    }
}

/// Clean a request path: collapse `//`, drop `.` segments and resolve `..`.
/// A trailing slash is preserved.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut out = String::with_capacity(path.len());
    for seg in &segments {
        out.push('/');
        out.push_str(seg);
    }
    let trailing = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    if out.is_empty() || trailing {
        out.push('/');
    }
    out
}
