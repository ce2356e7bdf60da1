//! Panic recovery for the handler chain.
//!
//! # Responsibilities
//! - Turn a panic raised before the response head is produced into an
//!   error response rendered by the configured `ErrorHandler`
//! - Abort the body stream without a second status when a panic happens
//!   after the response head was handed to the connection
//! - Stay silent for the [`AbortHandler`] sentinel
//!
//! # Design Decisions
//! - A panic with the `AbortHandler` payload is resumed so the connection
//!   task unwinds and drops the client, matching a deliberate abort
//! - Recovery is idempotent: only the first failure of a stream is reported

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use futures_util::FutureExt;
use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project_lite::pin_project;

use super::handler::{handler_fn, serve, BoxError, Handler};
use super::middleware::Middleware;
use crate::error::{ErrorContext, ErrorHandler, GatewayError};

/// Sentinel panic payload for aborting a request without a log line.
#[derive(Debug, Clone, Copy)]
pub struct AbortHandler;

/// Abort the current request. The client connection is dropped and nothing
/// is logged.
pub fn abort_handler() -> ! {
    std::panic::panic_any(AbortHandler)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Middleware that recovers panics from the rest of the chain.
#[derive(Clone)]
pub struct Recoverer {
    error_handler: Arc<dyn ErrorHandler>,
}

impl Recoverer {
    pub fn new(error_handler: Arc<dyn ErrorHandler>) -> Self {
        Self { error_handler }
    }
}

impl Middleware for Recoverer {
    fn middleware(&self, next: Handler) -> Handler {
        let error_handler = self.error_handler.clone();
        handler_fn(move |req: Request<Body>| {
            let next = next.clone();
            let error_handler = error_handler.clone();
            async move {
                let method = req.method().clone();
                let uri = req.uri().clone();
                let headers = req.headers().clone();

                match AssertUnwindSafe(serve(&next, req)).catch_unwind().await {
                    Ok(response) => response.map(|body| Body::new(RecoverBody::new(body))),
                    Err(payload) => {
                        if payload.is::<AbortHandler>() {
                            std::panic::resume_unwind(payload);
                        }
                        let cause = panic_message(payload.as_ref());
                        tracing::error!(
                            kind = "CoreServerRecover",
                            method = %method,
                            uri = %uri,
                            cause = %cause,
                            stack = %Backtrace::force_capture(),
                            "Recovered from panic in handler"
                        );
                        crate::observability::metrics::record_panic();
                        let ctx = ErrorContext {
                            method: &method,
                            uri: &uri,
                            headers: &headers,
                        };
                        error_handler.serve_http_error(ctx, &GatewayError::Recover { cause })
                    }
                }
            }
        })
    }
}

pin_project! {
    /// Response body that contains panics raised while streaming.
    ///
    /// Once the head is sent the status cannot change; a panic ends the
    /// stream with an error so the connection is reset.
    pub struct RecoverBody<B> {
        #[pin]
        inner: B,
        written: bool,
        failed: bool,
    }
}

impl<B> RecoverBody<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            written: false,
            failed: false,
        }
    }
}

impl<B> HttpBody for RecoverBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.project();
        if *this.failed {
            return Poll::Ready(None);
        }

        let inner = this.inner;
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.poll_frame(cx))) {
            Ok(Poll::Ready(Some(Ok(frame)))) => {
                if frame.data_ref().is_some_and(|d| !d.is_empty()) {
                    *this.written = true;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Ok(Poll::Ready(Some(Err(e)))) => Poll::Ready(Some(Err(e.into()))),
            Ok(Poll::Ready(None)) => Poll::Ready(None),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => {
                *this.failed = true;
                if payload.is::<AbortHandler>() {
                    return Poll::Ready(Some(Err("handler aborted".into())));
                }
                let cause = panic_message(payload.as_ref());
                tracing::error!(
                    kind = "CoreServerRecover",
                    cause = %cause,
                    written = *this.written,
                    stack = %Backtrace::force_capture(),
                    "Recovered from panic after response started; aborting stream"
                );
                crate::observability::metrics::record_panic();
                Poll::Ready(Some(Err(GatewayError::Recover { cause }.into())))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.failed || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
