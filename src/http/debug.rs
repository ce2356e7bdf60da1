//! Debug endpoints.
//!
//! - `/debug/pprof/` index, `/debug/pprof/cmdline` (NUL-separated argv);
//!   CPU profiles, symbol lookup and execution traces answer 501
//! - `/debug/vars` JSON: command line, open connections and the rendered
//!   Prometheus metrics

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};

use super::handler::{handler_fn, serve, Handler};
use super::middleware::Middleware;
use crate::net::ConnectionTracker;

const PPROF_PREFIX: &str = "/debug/pprof/";
const VARS_PATH: &str = "/debug/vars";

#[derive(Clone)]
pub struct DebugEndpoints {
    pprof: bool,
    expvar: bool,
    server: String,
    tracker: ConnectionTracker,
}

impl DebugEndpoints {
    pub fn new(server: impl Into<String>, pprof: bool, expvar: bool, tracker: ConnectionTracker) -> Self {
        Self {
            pprof,
            expvar,
            server: server.into(),
            tracker,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pprof || self.expvar
    }

    fn respond(&self, path: &str) -> Option<Response<Body>> {
        if self.pprof && (path == "/debug/pprof" || path.starts_with(PPROF_PREFIX)) {
            let name = path.strip_prefix(PPROF_PREFIX).unwrap_or("");
            return Some(match name {
                "" => text(
                    StatusCode::OK,
                    "Profiles:\n  cmdline\n  profile (unsupported)\n  symbol (unsupported)\n  trace (unsupported)\n"
                        .to_string(),
                ),
                "cmdline" => text(StatusCode::OK, std::env::args().collect::<Vec<_>>().join("\0")),
                other => text(
                    StatusCode::NOT_IMPLEMENTED,
                    format!("profile {other:?} is not available in this build\n"),
                ),
            });
        }
        if self.expvar && path == VARS_PATH {
            let vars = serde_json::json!({
                "cmdline": std::env::args().collect::<Vec<_>>(),
                "server": self.server,
                "connections": self.tracker.active_count(),
                "metrics": crate::observability::metrics::render(),
            });
            let mut res = Response::new(Body::from(vars.to_string()));
            res.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
            return Some(res);
        }
        None
    }
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

impl Middleware for DebugEndpoints {
    fn middleware(&self, next: Handler) -> Handler {
        if !self.is_enabled() {
            return next;
        }
        let this = self.clone();
        handler_fn(move |req: Request<Body>| {
            let this = this.clone();
            let next = next.clone();
            async move {
                match this.respond(req.uri().path()) {
                    Some(res) => res,
                    None => serve(&next, req).await,
                }
            }
        })
    }
}

/// Answers `OPTIONS *` with an empty 200.
pub fn general_options(next: Handler) -> Handler {
    handler_fn(move |req: Request<Body>| {
        let next = next.clone();
        async move {
            if req.method() == axum::http::Method::OPTIONS && req.uri() == "*" {
                let mut res = Response::new(Body::empty());
                res.headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                return res;
            }
            serve(&next, req).await
        }
    })
}
