//! Casbin authorization middleware.
//!
//! # Flow
//! ```text
//! request → AuthzClaims {auth, host, remote, method, api, query, header}
//!     → enforcers[0] allows? → next
//!     → enforcers[1] allows? → next
//!     → ... none allowed → 403
//! ```
//!
//! Each enforcer receives `(claims, path, method, extras...)`, where the
//! extras are request-context values under the configured keys (`null` when
//! absent). The model's request definition must declare that many tokens.

pub mod adapter;
pub mod format;
pub mod functions;
pub mod model;
pub mod reload;

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use casbin::{Adapter, CoreApi, Enforcer};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use self::adapter::{PolicyFeed, RowAdapter};
use self::model::ModelSource;
use crate::error::{ErrorContext, ErrorHandler, GatewayError, GatewayResult};
use crate::http::{canonical_header_key, context, handler_fn, request_host, serve, Handler, Middleware, RemoteAddr};
use crate::observability::metrics;

pub use self::adapter::{PolicySource, Refresh};
pub use self::format::{PolicyFormat, PolicyRow};
pub use self::reload::PolicyReloader;

/// Upper bound on extra enforcement arguments.
pub const MAX_EXTRA_KEYS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse {format}: {reason}")]
    Parse { format: &'static str, reason: String },
    #[error("unknown policy format: {0}")]
    UnknownFormat(String),
    #[error("http: {0}")]
    Http(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("model: {0}")]
    Model(String),
    #[error("enforcer: {0}")]
    Engine(String),
    #[error("cron: {0}")]
    Cron(String),
    #[error("{0} is not implemented by a read-only adapter")]
    NotImplemented(String),
}

pub type SharedEnforcer = Arc<RwLock<Enforcer>>;

/// Build an enforcer over a [`PolicyFeed`].
pub async fn build_enforcer(model: &ModelSource, feed: Arc<PolicyFeed>) -> Result<SharedEnforcer, PolicyError> {
    build_enforcer_with(model, RowAdapter::new(feed)).await
}

/// Build an enforcer over any Casbin adapter and register the helper
/// functions.
pub async fn build_enforcer_with<A: Adapter + 'static>(
    model: &ModelSource,
    adapter: A,
) -> Result<SharedEnforcer, PolicyError> {
    let model = model.load().await?;
    let mut enforcer = Enforcer::new(model, adapter)
        .await
        .map_err(|e| PolicyError::Engine(e.to_string()))?;
    functions::register(&mut enforcer);
    Ok(Arc::new(RwLock::new(enforcer)))
}

/// The subject handed to every enforcer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthzClaims {
    /// Authentication claims from the request context, `null` if none.
    #[serde(serialize_with = "functions::serialize_engine_value")]
    pub auth: Value,
    pub host: String,
    pub remote: String,
    pub method: String,
    pub api: String,
    pub query: BTreeMap<String, Vec<String>>,
    /// Keyed by canonical header name.
    pub header: BTreeMap<String, Vec<String>>,
}

impl Hash for AuthzClaims {
    fn hash<H: Hasher>(&self, state: &mut H) {
        serde_json::to_string(self).unwrap_or_default().hash(state);
    }
}

impl AuthzClaims {
    pub fn from_request(req: &Request<Body>, claims_key: Option<&str>) -> Self {
        let auth = claims_key
            .and_then(|key| context(req).and_then(|ctx| ctx.value(key)).cloned())
            .unwrap_or(Value::Null);

        let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(q) = req.uri().query() {
            for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
                query.entry(k.into_owned()).or_default().push(v.into_owned());
            }
        }

        let mut header: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in req.headers() {
            header
                .entry(canonical_header_key(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            auth,
            host: request_host(req),
            remote: req
                .extensions()
                .get::<RemoteAddr>()
                .map(|r| r.0.to_string())
                .unwrap_or_default(),
            method: req.method().to_string(),
            api: req.uri().path().to_string(),
            query,
            header,
        }
    }
}

/// A context value passed as an extra enforcement argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Extra(pub Value);

impl Serialize for Extra {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        functions::EngineValue(&self.0).serialize(s)
    }
}

impl Hash for Extra {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}

/// Enforcement outcome with the explanation rows, when requested.
struct Decision {
    allowed: bool,
    explain: Vec<Vec<String>>,
}

/// Call the enforcer with `(claims, path, method, extras...)`; the tuple
/// arity must match the model, so dispatch on the extras count.
fn evaluate(
    enforcer: &Enforcer,
    explain: bool,
    claims: &AuthzClaims,
    extras: &[Extra],
) -> casbin::Result<Decision> {
    macro_rules! call {
        ($($arg:expr),+) => {
            if explain {
                enforcer
                    .enforce_ex(($($arg),+))
                    .map(|(allowed, explain)| Decision { allowed, explain })
            } else {
                enforcer.enforce(($($arg),+)).map(|allowed| Decision {
                    allowed,
                    explain: Vec::new(),
                })
            }
        };
    }
    let (path, method) = (&claims.api, &claims.method);
    match extras {
        [] => call!(claims, path, method),
        [a] => call!(claims, path, method, a),
        [a, b] => call!(claims, path, method, a, b),
        [a, b, c, ..] => call!(claims, path, method, a, b, c),
    }
}

#[derive(Clone)]
pub struct CasbinAuthz {
    name: String,
    enforcers: Vec<SharedEnforcer>,
    claims_key: Option<String>,
    extra_keys: Vec<String>,
    explain: bool,
    error_handler: Arc<dyn ErrorHandler>,
}

impl CasbinAuthz {
    pub fn new(
        name: impl Into<String>,
        enforcers: Vec<SharedEnforcer>,
        claims_key: Option<String>,
        extra_keys: Vec<String>,
        explain: bool,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> GatewayResult<Self> {
        let name = name.into();
        if enforcers.is_empty() {
            return Err(GatewayError::create_object(&name, "no enforcers configured"));
        }
        if extra_keys.len() > MAX_EXTRA_KEYS {
            return Err(GatewayError::create_object(
                &name,
                format!("at most {MAX_EXTRA_KEYS} extra keys are supported, got {}", extra_keys.len()),
            ));
        }
        Ok(Self {
            name,
            enforcers,
            claims_key,
            extra_keys,
            explain,
            error_handler,
        })
    }

    fn extras(&self, req: &Request<Body>) -> Vec<Extra> {
        let ctx = context(req);
        self.extra_keys
            .iter()
            .map(|key| Extra(ctx.and_then(|c| c.value(key)).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    /// Index of the first enforcer that allows the request.
    async fn authorize(&self, claims: &AuthzClaims, extras: &[Extra]) -> Option<usize> {
        for (i, enforcer) in self.enforcers.iter().enumerate() {
            let decision = {
                let guard = enforcer.read().await;
                evaluate(&guard, self.explain, claims, extras)
            };
            match decision {
                Ok(decision) => {
                    if self.explain {
                        tracing::info!(
                            target: "audit",
                            middleware = %self.name,
                            enforcer = i,
                            allowed = decision.allowed,
                            method = %claims.method,
                            path = %claims.api,
                            explain = ?decision.explain,
                            "Authorization decision"
                        );
                    }
                    if decision.allowed {
                        return Some(i);
                    }
                    tracing::debug!(middleware = %self.name, enforcer = i, "Enforcer denied");
                }
                Err(e) => {
                    tracing::debug!(middleware = %self.name, enforcer = i, error = %e, "Enforcer failed");
                }
            }
        }
        None
    }

    async fn handle(&self, req: Request<Body>, next: &Handler) -> Response<Body> {
        let claims = AuthzClaims::from_request(&req, self.claims_key.as_deref());
        let extras = self.extras(&req);
        if self.authorize(&claims, &extras).await.is_some() {
            return serve(next, req).await;
        }

        metrics::record_authz_denied();
        let err = GatewayError::Authorization {
            reason: format!("{} {} denied", claims.method, claims.api),
        };
        tracing::debug!(middleware = %self.name, kind = %err.kind(), path = %claims.api, "Authorization denied");
        self.error_handler
            .serve_http_error(ErrorContext::from_request(&req), &err)
    }
}

impl Middleware for CasbinAuthz {
    fn middleware(&self, next: Handler) -> Handler {
        let this = Arc::new(self.clone());
        handler_fn(move |req: Request<Body>| {
            let this = this.clone();
            let next = next.clone();
            async move { this.handle(req, &next).await }
        })
    }
}
