//! Error taxonomy and HTTP error rendering.
//!
//! # Responsibilities
//! - Define the stable error kinds shared by every subsystem
//! - Map errors to HTTP status codes
//! - Render error responses through a pluggable `ErrorHandler`
//! - Keep a process-wide registry of named error handlers
//!
//! # Design Decisions
//! - Error kinds are independent of the Rust variant layout so log
//!   consumers can match on `kind` without tracking refactors
//! - `KvsError::NotFound` is never surfaced to clients as a 5xx; callers
//!   translate it before it reaches the handler
//! - The default handler renders `{"status":N,"statusText":"..."}`

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use parking_lot::RwLock;
use thiserror::Error;

use crate::kvs::KvsError;

/// Stable error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CoreGenCreateObject,
    CoreGenCreateComponent,
    CoreEntrypointRun,
    CoreServer,
    CoreServerNotFound,
    CoreServerMethodNotAllowed,
    CoreServerRecover,
    CoreLogger,
    AppAuthnAuthentication,
    AppAuthzAuthorization,
    AppStorageKVS,
    AppProxyUpstream,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CoreGenCreateObject => "CoreGenCreateObject",
            ErrorKind::CoreGenCreateComponent => "CoreGenCreateComponent",
            ErrorKind::CoreEntrypointRun => "CoreEntrypointRun",
            ErrorKind::CoreServer => "CoreServer",
            ErrorKind::CoreServerNotFound => "CoreServerNotFound",
            ErrorKind::CoreServerMethodNotAllowed => "CoreServerMethodNotAllowed",
            ErrorKind::CoreServerRecover => "CoreServerRecover",
            ErrorKind::CoreLogger => "CoreLogger",
            ErrorKind::AppAuthnAuthentication => "AppAuthnAuthentication",
            ErrorKind::AppAuthzAuthorization => "AppAuthzAuthorization",
            ErrorKind::AppStorageKVS => "AppStorageKVS",
            ErrorKind::AppProxyUpstream => "AppProxyUpstream",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A named object could not be resolved or constructed.
    #[error("failed to create object {name}: {reason}")]
    CreateObject { name: String, reason: String },

    /// A component failed to assemble (mux, server, enforcer...).
    #[error("failed to create component {component}: {reason}")]
    CreateComponent { component: String, reason: String },

    /// A runner terminated with an error.
    #[error("entrypoint runner {runner} failed: {reason}")]
    EntrypointRun { runner: String, reason: String },

    /// The serve loop failed for a reason other than shutdown.
    #[error("server {addr}: {reason}")]
    Server { addr: String, reason: String },

    /// No route matched; carries the pattern the 404 handler was bound at.
    #[error("not found (pattern {pattern})")]
    NotFound { pattern: String },

    /// The path exists but not for this method.
    #[error("method not allowed (allow {})", allow.join(", "))]
    MethodNotAllowed { allow: Vec<String> },

    /// A panic recovered from the handler chain.
    #[error("recovered from panic: {cause}")]
    Recover { cause: String },

    /// Body capture or log plumbing failure.
    #[error("logger: {0}")]
    Logger(String),

    /// Authentication rejected the request.
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },

    /// No enforcer allowed the request.
    #[error("authorization denied: {reason}")]
    Authorization { reason: String },

    /// Key-value store failure.
    #[error("kvs: {0}")]
    Kvs(#[from] KvsError),

    /// The upstream round-trip failed.
    #[error("upstream: {0}")]
    Upstream(String),
}

impl GatewayError {
    pub fn create_object(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        GatewayError::CreateObject {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn create_component(component: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        GatewayError::CreateComponent {
            component: component.into(),
            reason: reason.to_string(),
        }
    }

    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::CreateObject { .. } => ErrorKind::CoreGenCreateObject,
            GatewayError::CreateComponent { .. } => ErrorKind::CoreGenCreateComponent,
            GatewayError::EntrypointRun { .. } => ErrorKind::CoreEntrypointRun,
            GatewayError::Server { .. } => ErrorKind::CoreServer,
            GatewayError::NotFound { .. } => ErrorKind::CoreServerNotFound,
            GatewayError::MethodNotAllowed { .. } => ErrorKind::CoreServerMethodNotAllowed,
            GatewayError::Recover { .. } => ErrorKind::CoreServerRecover,
            GatewayError::Logger(_) => ErrorKind::CoreLogger,
            GatewayError::Authentication { .. } => ErrorKind::AppAuthnAuthentication,
            GatewayError::Authorization { .. } => ErrorKind::AppAuthzAuthorization,
            GatewayError::Kvs(_) => ErrorKind::AppStorageKVS,
            GatewayError::Upstream(_) => ErrorKind::AppProxyUpstream,
        }
    }

    /// HTTP status used when this error is rendered to a client.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Authentication { .. } => StatusCode::FORBIDDEN,
            GatewayError::Authorization { .. } => StatusCode::FORBIDDEN,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result alias used across the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// The request fields an error handler may inspect.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a> ErrorContext<'a> {
    pub fn from_request<B>(req: &'a Request<B>) -> Self {
        Self {
            method: req.method(),
            uri: req.uri(),
            headers: req.headers(),
        }
    }

    pub fn from_parts(parts: &'a axum::http::request::Parts) -> Self {
        Self {
            method: &parts.method,
            uri: &parts.uri,
            headers: &parts.headers,
        }
    }
}

/// Renders an error into an HTTP response.
pub trait ErrorHandler: Send + Sync {
    fn serve_http_error(&self, ctx: ErrorContext<'_>, err: &GatewayError) -> Response<Body>;
}

/// Default handler: JSON body with the status code and its canonical text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonErrorHandler;

impl ErrorHandler for JsonErrorHandler {
    fn serve_http_error(&self, ctx: ErrorContext<'_>, err: &GatewayError) -> Response<Body> {
        let status = err.status();
        let body = serde_json::json!({
            "status": status.as_u16(),
            "statusText": status.canonical_reason().unwrap_or(""),
        });

        let mut response = Response::new(if ctx.method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(body.to_string())
        });
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        response.headers_mut().insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        if let GatewayError::MethodNotAllowed { allow } = err {
            if let Ok(value) = HeaderValue::from_str(&allow.join(", ")) {
                response.headers_mut().insert(header::ALLOW, value);
            }
        }
        response
    }
}

/// Name under which the default handler is always resolvable.
pub const DEFAULT_HANDLER: &str = "default";

static HANDLERS: LazyLock<RwLock<HashMap<String, Arc<dyn ErrorHandler>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Look up a named error handler, falling back to the default.
pub fn get_handler(name: &str) -> Arc<dyn ErrorHandler> {
    let handlers = HANDLERS.read();
    handlers
        .get(name)
        .cloned()
        .unwrap_or_else(|| Arc::new(JsonErrorHandler))
}

/// Register a named error handler, replacing any previous one.
pub fn set_handler(name: impl Into<String>, handler: Arc<dyn ErrorHandler>) {
    let mut handlers = HANDLERS.write();
    handlers.insert(name.into(), handler);
}

/// Remove a named error handler. The default name keeps resolving.
pub fn delete_handler(name: &str) {
    let mut handlers = HANDLERS.write();
    handlers.remove(name);
}
