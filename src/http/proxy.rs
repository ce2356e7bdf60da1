//! Reverse proxy terminal handler and client-side tripperware.
//!
//! # Responsibilities
//! - Rewrite the request URI onto the upstream (scheme, authority, joined path)
//! - Strip hop-by-hop headers both ways
//! - Add X-Forwarded-For / X-Forwarded-Host / X-Forwarded-Proto
//! - Run the round-trip through the configured tripperware chain
//! - Render transport failures as 502 through the error handler

use std::sync::Arc;

use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use super::context::{RemoteAddr, Secure};
use super::handler::{handler_fn, round_trip, tripper_fn, BoxError, Handler, Tripper};
use super::middleware::{chain_trippers, Tripperware};
use crate::error::{ErrorContext, ErrorHandler, GatewayError, GatewayResult};

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// The default round-tripper: a pooled hyper client over plain HTTP.
pub fn client_tripper() -> Tripper {
    let client: Client<HttpConnector, Body> = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    tripper_fn(move |req: Request<Body>| {
        let client = client.clone();
        async move {
            let res = client.request(req).await.map_err(BoxError::from)?;
            Ok(res.map(Body::new))
        }
    })
}

/// Remove hop-by-hop headers, including those named by `Connection`.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Join two URL paths with exactly one slash between them.
fn join_url_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

pub struct ReverseProxy {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
    tripper: Tripper,
    error_handler: Arc<dyn ErrorHandler>,
}

impl ReverseProxy {
    /// `tripperware` wraps `tripper` in declaration order.
    pub fn new(
        upstream: &str,
        tripper: Tripper,
        tripperware: &[Arc<dyn Tripperware>],
        error_handler: Arc<dyn ErrorHandler>,
    ) -> GatewayResult<Self> {
        let url = url::Url::parse(upstream)
            .map_err(|e| GatewayError::create_object(upstream, format!("invalid upstream url: {e}")))?;
        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => {
                return Err(GatewayError::create_object(
                    upstream,
                    format!("unsupported upstream scheme {other:?}"),
                ))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::create_object(upstream, "upstream url has no host"))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let authority = Authority::try_from(authority.as_str())
            .map_err(|e| GatewayError::create_object(upstream, e))?;

        Ok(Self {
            scheme,
            authority,
            base_path: url.path().to_string(),
            base_query: url.query().map(str::to_string),
            tripper: chain_trippers(tripperware, tripper),
            error_handler,
        })
    }

    fn target_uri(&self, uri: &Uri) -> Result<Uri, axum::http::Error> {
        let path = join_url_path(&self.base_path, uri.path());
        let query = match (self.base_query.as_deref(), uri.query()) {
            (Some(base), Some(q)) if !base.is_empty() => Some(format!("{base}&{q}")),
            (Some(base), None) => Some(base.to_string()),
            (_, q) => q.map(str::to_string),
        };
        let path_and_query = match query {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(PathAndQuery::try_from(path_and_query)?)
            .build()
    }

    /// Turn an inbound request into the outbound one.
    fn rewrite(&self, mut req: Request<Body>) -> Result<Request<Body>, axum::http::Error> {
        let original_host = req
            .headers()
            .get(header::HOST)
            .cloned()
            .or_else(|| req.uri().authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
        let proto = if req.extensions().get::<Secure>().is_some() {
            "https"
        } else {
            "http"
        };
        let peer = req.extensions().get::<RemoteAddr>().map(|r| r.0.ip());

        *req.uri_mut() = self.target_uri(req.uri())?;
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        remove_hop_headers(headers);
        if let Some(ip) = peer {
            let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(v) = HeaderValue::from_str(&forwarded) {
                headers.insert(X_FORWARDED_FOR, v);
            }
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        if let Ok(v) = HeaderValue::from_str(self.authority.as_str()) {
            headers.insert(header::HOST, v);
        }
        Ok(req)
    }

    pub fn into_handler(self) -> Handler {
        let this = Arc::new(self);
        handler_fn(move |req: Request<Body>| {
            let this = this.clone();
            async move {
                let (parts, body) = req.into_parts();
                let ctx = parts.clone();
                let outbound = match this.rewrite(Request::from_parts(parts, body)) {
                    Ok(req) => req,
                    Err(e) => {
                        let err = GatewayError::Upstream(e.to_string());
                        return this.error_handler.serve_http_error(ErrorContext::from_parts(&ctx), &err);
                    }
                };
                match round_trip(&this.tripper, outbound).await {
                    Ok(mut res) => {
                        remove_hop_headers(res.headers_mut());
                        res
                    }
                    Err(e) => {
                        tracing::warn!(
                            upstream = %this.authority,
                            path = %ctx.uri.path(),
                            error = %e,
                            "Upstream request failed"
                        );
                        let err = GatewayError::Upstream(e.to_string());
                        this.error_handler.serve_http_error(ErrorContext::from_parts(&ctx), &err)
                    }
                }
            }
        })
    }
}

/// Tripperware that sets fixed headers on every outbound request.
#[derive(Debug, Clone, Default)]
pub struct HeaderInjector {
    headers: HeaderMap,
}

impl HeaderInjector {
    pub fn new<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> GatewayResult<Self> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| GatewayError::create_object("header-injector", format!("{name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::create_object("header-injector", format!("{name}: {e}")))?;
            map.insert(name, value);
        }
        Ok(Self { headers: map })
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl Tripperware for HeaderInjector {
    fn tripperware(&self, next: Tripper) -> Tripper {
        if self.headers.is_empty() {
            return next;
        }
        let headers = self.headers.clone();
        tripper_fn(move |mut req: Request<Body>| {
            let next = next.clone();
            for (name, value) in &headers {
                req.headers_mut().insert(name.clone(), value.clone());
            }
            async move { round_trip(&next, req).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsonErrorHandler;
    use crate::http::handler::serve;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;

    /// Upstream stand-in that echoes what it received as JSON.
    fn echo_tripper() -> Tripper {
        tripper_fn(|req: Request<Body>| async move {
            let headers: serde_json::Map<String, serde_json::Value> = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").into()))
                .collect();
            let echo = serde_json::json!({ "uri": req.uri().to_string(), "headers": headers });
            let mut res = Response::new(Body::from(echo.to_string()));
            res.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
            Ok(res)
        })
    }

    async fn json(res: Response<Body>) -> serde_json::Value {
        let body = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn joins_paths() {
        assert_eq!(join_url_path("/api/", "/x"), "/api/x");
        assert_eq!(join_url_path("/api", "/x"), "/api/x");
        assert_eq!(join_url_path("/", "/x"), "/x");
        assert_eq!(join_url_path("/api", "x"), "/api/x");
    }

    #[tokio::test]
    async fn rewrites_request_onto_upstream() {
        let proxy = ReverseProxy::new("http://backend:9000/api?v=1", echo_tripper(), &[], Arc::new(JsonErrorHandler))
            .unwrap()
            .into_handler();

        let mut req = Request::builder()
            .uri("/users?id=7")
            .header(header::HOST, "gw.example")
            .header(header::CONNECTION, "keep-alive, x-drop")
            .header("x-drop", "1")
            .header("x-forwarded-for", "10.0.0.1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(RemoteAddr("192.0.2.9:5555".parse::<SocketAddr>().unwrap()));

        let res = serve(&proxy, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get(header::CONNECTION).is_none());

        let echo = json(res).await;
        assert_eq!(echo["uri"], "http://backend:9000/api/users?v=1&id=7");
        let headers = &echo["headers"];
        assert_eq!(headers["host"], "backend:9000");
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1, 192.0.2.9");
        assert_eq!(headers["x-forwarded-host"], "gw.example");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert!(headers.get("x-drop").is_none());
        assert!(headers.get("connection").is_none());
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway() {
        let failing = tripper_fn(|_req| async { Err::<Response<Body>, BoxError>("connection refused".into()) });
        let proxy = ReverseProxy::new("http://backend", failing, &[], Arc::new(JsonErrorHandler))
            .unwrap()
            .into_handler();
        let res = serve(&proxy, Request::new(Body::empty())).await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn header_injector_runs_in_chain() {
        let injector: Arc<dyn Tripperware> = Arc::new(HeaderInjector::new([("Authorization", "Bearer t")]).unwrap());
        let proxy = ReverseProxy::new("http://backend", echo_tripper(), &[injector], Arc::new(JsonErrorHandler))
            .unwrap()
            .into_handler();
        let echo = json(serve(&proxy, Request::new(Body::empty())).await).await;
        assert_eq!(echo["headers"]["authorization"], "Bearer t");
    }

    #[test]
    fn rejects_bad_upstreams() {
        assert!(ReverseProxy::new("ftp://x", client_tripper(), &[], Arc::new(JsonErrorHandler)).is_err());
        assert!(ReverseProxy::new("not a url", client_tripper(), &[], Arc::new(JsonErrorHandler)).is_err());
        assert!(HeaderInjector::new([("bad header", "v")]).is_err());
    }
}
