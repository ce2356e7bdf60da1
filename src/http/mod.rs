//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (HTTP/1.1, HTTP/2)      QUIC connection (HTTP/3)
//!     → server.rs (hyper-util auto builder)      → h3.rs
//!     → RequestContext installed (context.rs)
//!     → Recoverer (recover.rs)
//!     → debug endpoints, server middleware
//!     → mux (routing/) → virtual host middleware → handler
//!     → proxy.rs round-trips upstream through tripperware
//! ```

pub mod context;
pub mod debug;
pub mod h3;
pub mod handler;
pub mod middleware;
pub mod proxy;
pub mod recover;
pub mod server;

use axum::http::{header, Request};

pub use context::{context, context_mut, RemoteAddr, RequestContext};
pub use handler::{handler_fn, round_trip, serve, tripper_fn, BoxError, Handler, Tripper};
pub use middleware::{chain, chain_trippers, Middleware, Tripperware};
pub use recover::{abort_handler, AbortHandler, Recoverer};
pub use server::HttpServer;

/// Canonical MIME header form: `content-type` becomes `Content-Type`.
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// The request host without port, lowercased. Taken from the URI authority
/// (HTTP/2, HTTP/3, absolute-form) or the `Host` header.
pub fn request_host<B>(req: &Request<B>) -> String {
    let raw = req
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    strip_port(&raw).to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_keys() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("X-API-KEY"), "X-Api-Key");
        assert_eq!(canonical_header_key("accept"), "Accept");
    }

    #[test]
    fn host_from_header_or_authority() {
        let req = Request::builder()
            .uri("/x")
            .header(header::HOST, "API.Example.com:8080")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "api.example.com");

        let req = Request::builder().uri("https://h2.example/x").body(()).unwrap();
        assert_eq!(request_host(&req), "h2.example");

        assert_eq!(strip_port("[::1]:443"), "::1");
    }
}
