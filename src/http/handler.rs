//! Handler and round-tripper primitives.
//!
//! Server handlers are boxed `tower` services that never fail: every error
//! is rendered into a response before it leaves the handler. Client
//! round-trippers may fail with a transport error.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use bytes::Bytes;
use tower::util::BoxCloneSyncService;
use tower::{service_fn, ServiceExt};

use crate::error::{ErrorContext, ErrorHandler, GatewayError};

pub use tower::BoxError;

/// A server-side request handler.
pub type Handler = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

/// A client-side round-tripper.
pub type Tripper = BoxCloneSyncService<Request<Body>, Response<Body>, BoxError>;

/// Build a [`Handler`] from an async function.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    Handler::new(service_fn(move |req| {
        let fut = f(req);
        async move { Ok::<_, Infallible>(fut.await) }
    }))
}

/// Build a [`Tripper`] from an async function.
pub fn tripper_fn<F, Fut>(f: F) -> Tripper
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, BoxError>> + Send + 'static,
{
    Tripper::new(service_fn(f))
}

/// Dispatch a request to a handler.
pub async fn serve(handler: &Handler, req: Request<Body>) -> Response<Body> {
    match handler.clone().oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// Execute a round-trip.
pub async fn round_trip(tripper: &Tripper, req: Request<Body>) -> Result<Response<Body>, BoxError> {
    tripper.clone().oneshot(req).await
}

/// A handler that always answers with a fixed status, content type and body.
pub fn static_handler(status: StatusCode, content_type: Option<&str>, body: impl Into<Bytes>) -> Handler {
    let body: Bytes = body.into();
    let content_type = content_type.and_then(|ct| HeaderValue::from_str(ct).ok());
    handler_fn(move |_req| {
        let body = body.clone();
        let content_type = content_type.clone();
        async move {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            if let Some(ct) = content_type {
                response.headers_mut().insert(header::CONTENT_TYPE, ct);
            }
            response
        }
    })
}

/// A handler that renders [`GatewayError::NotFound`] for the pattern it was
/// registered at.
pub fn not_found_handler(pattern: impl Into<String>, error_handler: Arc<dyn ErrorHandler>) -> Handler {
    let pattern: String = pattern.into();
    handler_fn(move |req: Request<Body>| {
        let err = GatewayError::NotFound {
            pattern: pattern.clone(),
        };
        let response = error_handler.serve_http_error(ErrorContext::from_request(&req), &err);
        async move { response }
    })
}
