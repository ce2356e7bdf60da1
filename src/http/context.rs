//! Per-request context carried in request extensions.
//!
//! The server installs a [`RequestContext`] on every request before the
//! handler chain runs. It carries the cancellation token of the connection,
//! an optional deadline and a small keyed value bag that middleware use to
//! hand data (authentication claims) to later middleware.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::Request;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context-bound operation stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("request canceled")]
    Canceled,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    values: HashMap<String, Value>,
}

impl RequestContext {
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            cancel,
            deadline,
            values: HashMap::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Tighten the deadline. A later deadline never replaces an earlier one.
    pub fn set_timeout(&mut self, timeout: Duration) {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Decode a stored value into a concrete type.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Encode and store a typed value.
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.values.insert(key.into(), value);
        Ok(())
    }

    /// Run `fut` until it completes, the request is canceled or the deadline
    /// passes, whichever comes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            out = fut => Ok(out),
            _ = self.cancel.cancelled() => Err(ContextError::Canceled),
            _ = deadline => Err(ContextError::DeadlineExceeded),
        }
    }
}

/// The peer address of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

/// Marker for requests that arrived over TLS (including QUIC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Secure;

/// The context of a request, creating an empty one when absent.
pub fn context_mut<B>(req: &mut Request<B>) -> &mut RequestContext {
    req.extensions_mut().get_or_insert_default::<RequestContext>()
}

/// The context of a request, if the server installed one.
pub fn context<B>(req: &Request<B>) -> Option<&RequestContext> {
    req.extensions().get::<RequestContext>()
}
