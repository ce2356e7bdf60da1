//! API-key and ID+Key authentication middleware.
//!
//! # Flow
//! ```text
//! header(s) → lookup id → store.get(id) → codec.verify(secret, key)
//!     → claims on the request context → next
//! ```
//!
//! Every rejection answers 403 through the error handler. Store failures
//! other than `NotFound` answer 500.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderName, Request, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::credential::{Credential, SecretCodec};
use crate::error::{ErrorContext, ErrorHandler, GatewayError};
use crate::http::{context, context_mut, handler_fn, serve, Handler, Middleware, RequestContext};
use crate::kvs::{KvsError, Store};
use crate::observability::metrics;

pub const METHOD_API_KEY: &str = "APIKey";
pub const METHOD_ID_KEY: &str = "IDKey";

/// The verified authentication result handed to later middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthnClaims {
    pub method: String,
    pub auth_time: DateTime<Utc>,
    pub key: String,
    #[serde(default)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

/// Where the presented credential comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// A single header carrying the key; the store is keyed by the derived id.
    ApiKey { header: HeaderName },
    /// An id header and a key header; the store is keyed by the id.
    IdKey { id_header: HeaderName, key_header: HeaderName },
}

impl KeySource {
    fn method(&self) -> &'static str {
        match self {
            KeySource::ApiKey { .. } => METHOD_API_KEY,
            KeySource::IdKey { .. } => METHOD_ID_KEY,
        }
    }
}

#[derive(Clone)]
pub struct KeyAuth {
    name: String,
    source: KeySource,
    store: Arc<dyn Store<Credential>>,
    codec: Arc<SecretCodec>,
    claims_key: String,
    keep: bool,
    error_handler: Arc<dyn ErrorHandler>,
}

/// Why a request was rejected, before rendering.
enum Denial {
    Missing,
    Unregistered,
    Invalid,
    Store(KvsError),
}

impl Denial {
    fn reason(&self) -> &'static str {
        match self {
            Denial::Missing => "missing",
            Denial::Unregistered => "unregistered",
            Denial::Invalid => "invalid",
            Denial::Store(_) => "store",
        }
    }

    fn into_error(self) -> GatewayError {
        match self {
            Denial::Store(e) => GatewayError::Kvs(e),
            other => GatewayError::Authentication {
                reason: other.reason().to_string(),
            },
        }
    }
}

fn header_str<'a>(req: &'a Request<Body>, name: &HeaderName) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

impl KeyAuth {
    pub fn new(
        name: impl Into<String>,
        source: KeySource,
        store: Arc<dyn Store<Credential>>,
        codec: Arc<SecretCodec>,
        claims_key: impl Into<String>,
        keep: bool,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            store,
            codec,
            claims_key: claims_key.into(),
            keep,
            error_handler,
        }
    }

    /// The presented (id, key) pair. Request bodies are not `Sync`, so nothing
    /// borrowed from the request is held across the store lookup.
    fn presented(&self, req: &Request<Body>) -> Result<(String, String), Denial> {
        match &self.source {
            KeySource::ApiKey { header } => {
                let key = header_str(req, header).ok_or(Denial::Missing)?;
                Ok((self.codec.lookup_id(key.as_bytes()), key.to_string()))
            }
            KeySource::IdKey { id_header, key_header } => {
                let id = header_str(req, id_header).ok_or(Denial::Missing)?;
                let key = header_str(req, key_header).ok_or(Denial::Missing)?;
                Ok((id.to_string(), key.to_string()))
            }
        }
    }

    async fn authenticate(&self, id: String, key: String, ctx: RequestContext) -> Result<AuthnClaims, Denial> {
        let cred = match ctx.run(self.store.get(&id)).await {
            Ok(Ok(cred)) => cred,
            Ok(Err(KvsError::NotFound)) => return Err(Denial::Unregistered),
            Ok(Err(e)) => return Err(Denial::Store(e)),
            Err(e) => return Err(Denial::Store(KvsError::Backend(e.to_string()))),
        };

        match self.codec.verify(&cred.secret, key.as_bytes()) {
            Ok(true) => {}
            Ok(false) => return Err(Denial::Invalid),
            Err(e) => {
                tracing::debug!(middleware = %self.name, error = %e, "Stored secret could not be opened");
                return Err(Denial::Invalid);
            }
        }

        Ok(AuthnClaims {
            method: self.source.method().to_string(),
            auth_time: Utc::now(),
            key: match &self.source {
                KeySource::ApiKey { .. } => key,
                KeySource::IdKey { .. } => id,
            },
            attrs: cred.attrs,
        })
    }

    fn strip_headers(&self, req: &mut Request<Body>) {
        if self.keep {
            return;
        }
        match &self.source {
            KeySource::ApiKey { header } => {
                req.headers_mut().remove(header);
            }
            KeySource::IdKey { id_header, key_header } => {
                req.headers_mut().remove(id_header);
                req.headers_mut().remove(key_header);
            }
        }
    }

    async fn handle(&self, mut req: Request<Body>, next: &Handler) -> Response<Body> {
        let presented = self.presented(&req);
        let ctx = context(&req).cloned().unwrap_or_default();
        let outcome = match presented {
            Ok((id, key)) => self.authenticate(id, key, ctx).await,
            Err(denial) => Err(denial),
        };
        let claims = match outcome {
            Ok(claims) => claims,
            Err(denial) => {
                let reason = denial.reason();
                metrics::record_authn_denied(reason);
                let err = denial.into_error();
                tracing::debug!(
                    middleware = %self.name,
                    kind = %err.kind(),
                    reason = reason,
                    path = %req.uri().path(),
                    "Authentication failed"
                );
                return self.error_handler.serve_http_error(ErrorContext::from_request(&req), &err);
            }
        };

        if let Err(e) = context_mut(&mut req).put(self.claims_key.clone(), &claims) {
            tracing::error!(middleware = %self.name, error = %e, "Failed to store claims");
            let err = GatewayError::Authentication {
                reason: "claims".to_string(),
            };
            return self.error_handler.serve_http_error(ErrorContext::from_request(&req), &err);
        }
        req.extensions_mut().insert(claims);
        self.strip_headers(&mut req);
        serve(next, req).await
    }
}

impl Middleware for KeyAuth {
    fn middleware(&self, next: Handler) -> Handler {
        let this = Arc::new(self.clone());
        handler_fn(move |req: Request<Body>| {
            let this = this.clone();
            let next = next.clone();
            async move { this.handle(req, &next).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsonErrorHandler;
    use crate::kvs::MemoryStore;
    use crate::security::credential::{Encoding, HashAlg, Transform};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HEADER: &str = "x-api-key";

    async fn seeded_store() -> Arc<MemoryStore<Credential>> {
        let store = Arc::new(MemoryStore::new());
        store.open().await.unwrap();
        let mut attrs = serde_json::Map::new();
        attrs.insert("name".into(), "alice".into());
        store
            .set(
                &hex::encode(Sha256::digest(b"s3cret")),
                Credential {
                    secret: Sha256::digest(b"s3cret").to_vec(),
                    attrs,
                },
            )
            .await
            .unwrap();
        store
    }

    fn api_key_auth(store: Arc<dyn Store<Credential>>, keep: bool) -> KeyAuth {
        let codec = SecretCodec::new(Transform::Hash(HashAlg::Sha256), Encoding::Hex, None).unwrap();
        KeyAuth::new(
            "apikey",
            KeySource::ApiKey {
                header: HeaderName::from_static(HEADER),
            },
            store,
            Arc::new(codec),
            "authn",
            keep,
            Arc::new(JsonErrorHandler),
        )
    }

    /// Echoes the claims and whether the key header is still present.
    fn inspector(calls: Arc<AtomicUsize>) -> Handler {
        handler_fn(move |req: Request<Body>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let claims: Option<AuthnClaims> = context(&req).and_then(|c| c.get("authn"));
                let body = serde_json::json!({
                    "claims": claims,
                    "header": req.headers().contains_key(HEADER),
                });
                Response::new(Body::from(body.to_string()))
            }
        })
    }

    fn request(key: Option<&str>) -> Request<Body> {
        let mut builder = Request::get("/x");
        if let Some(key) = key {
            builder = builder.header(HEADER, key);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut().insert(RequestContext::default());
        req
    }

    async fn body_text(res: Response<Body>) -> String {
        String::from_utf8(res.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn valid_key_sets_claims_and_strips_header() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = api_key_auth(seeded_store().await, false).middleware(inspector(calls.clone()));

        let res = serve(&h, request(Some("s3cret"))).await;
        assert_eq!(res.status(), StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body_text(res).await).unwrap();
        assert_eq!(v["claims"]["method"], "APIKey");
        assert_eq!(v["claims"]["key"], "s3cret");
        assert_eq!(v["claims"]["attrs"]["name"], "alice");
        assert_eq!(v["header"], false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keep_leaves_header() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = api_key_auth(seeded_store().await, true).middleware(inspector(calls));
        let v: serde_json::Value = serde_json::from_str(&body_text(serve(&h, request(Some("s3cret"))).await).await).unwrap();
        assert_eq!(v["header"], true);
    }

    #[tokio::test]
    async fn wrong_or_missing_key_is_forbidden() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = api_key_auth(seeded_store().await, false).middleware(inspector(calls.clone()));

        let res = serve(&h, request(Some("wrong"))).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(res).await, r#"{"status":403,"statusText":"Forbidden"}"#);

        assert_eq!(serve(&h, request(Some(""))).await.status(), StatusCode::FORBIDDEN);
        assert_eq!(serve(&h, request(None)).await.status(), StatusCode::FORBIDDEN);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tampered_secret_is_invalid() {
        let store = seeded_store().await;
        let id = hex::encode(Sha256::digest(b"s3cret"));
        store
            .set(&id, Credential { secret: b"not the digest".to_vec(), attrs: Default::default() })
            .await
            .unwrap();
        let h = api_key_auth(store, false).middleware(inspector(Arc::default()));
        assert_eq!(serve(&h, request(Some("s3cret"))).await.status(), StatusCode::FORBIDDEN);
    }

    struct BrokenStore;

    #[async_trait]
    impl Store<Credential> for BrokenStore {
        async fn open(&self) -> Result<(), KvsError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), KvsError> {
            Ok(())
        }
        async fn get(&self, _key: &str) -> Result<Credential, KvsError> {
            Err(KvsError::Backend("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: Credential) -> Result<(), KvsError> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<(), KvsError> {
            Ok(())
        }
        async fn exists(&self, _key: &str) -> Result<bool, KvsError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn store_failure_is_internal_error() {
        let h = api_key_auth(Arc::new(BrokenStore), false).middleware(inspector(Arc::default()));
        assert_eq!(
            serve(&h, request(Some("s3cret"))).await.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn id_key_looks_up_by_id() {
        let store = Arc::new(MemoryStore::new());
        store.open().await.unwrap();
        let codec = Arc::new(SecretCodec::new(Transform::Hash(HashAlg::Sha256), Encoding::Hex, None).unwrap());
        store
            .set("alice", Credential { secret: codec.seal(b"pw").unwrap(), attrs: Default::default() })
            .await
            .unwrap();
        let auth = KeyAuth::new(
            "idkey",
            KeySource::IdKey {
                id_header: HeaderName::from_static("x-api-id"),
                key_header: HeaderName::from_static("x-api-key"),
            },
            store,
            codec,
            "authn",
            false,
            Arc::new(JsonErrorHandler),
        );
        let h = auth.middleware(inspector(Arc::default()));

        let req = |id: &str, key: &str| {
            Request::get("/x")
                .header("x-api-id", id)
                .header("x-api-key", key)
                .body(Body::empty())
                .unwrap()
        };
        let res = serve(&h, req("alice", "pw")).await;
        assert_eq!(res.status(), StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body_text(res).await).unwrap();
        assert_eq!(v["claims"]["method"], "IDKey");
        assert_eq!(v["claims"]["key"], "alice");

        assert_eq!(serve(&h, req("alice", "nope")).await.status(), StatusCode::FORBIDDEN);
        assert_eq!(serve(&h, req("bob", "pw")).await.status(), StatusCode::FORBIDDEN);
    }
}
