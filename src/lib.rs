//! API gateway request-lifecycle engine.
//!
//! ```text
//!     Client ──▶ net (TCP/TLS, QUIC) ──▶ http server ──▶ recoverer ──▶ server middleware
//!                                                                        │
//!                                                                        ▼
//!                                        routing (virtual hosts, mux) ──▶ route middleware
//!                                                                        │  (authn, authz, logs)
//!                                                                        ▼
//!     Client ◀── response ◀──────────────────────────────── handler (reverse proxy ──▶ upstream)
//! ```
//!
//! `builder` assembles all of it from a [`config::GatewayConfig`] into a
//! [`lifecycle::Entrypoint`].

pub mod builder;
pub mod config;
pub mod error;
pub mod http;
pub mod kvs;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod security;

pub use builder::Gateway;
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
