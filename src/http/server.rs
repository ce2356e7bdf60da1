//! HTTP/1.1 and HTTP/2 server runner.
//!
//! # Responsibilities
//! - Bind the listener and accept connections until canceled
//! - Terminate TLS (ALPN selects h2 or http/1.1) or serve cleartext,
//!   optionally with h2c. Cleartext HTTP/2 is prior-knowledge only; an
//!   HTTP/1.1 `Upgrade: h2c` request is served as plain HTTP/1.1
//! - Install the per-request context and dispatch to the root handler
//! - Drain open connections on shutdown, force-close after the timeout
//!
//! # Root handler
//! ```text
//! Recoverer → Alt-Svc → write timeout → OPTIONS * → debug endpoints → handler
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Layer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;

use super::context::{RemoteAddr, RequestContext, Secure};
use super::debug::{general_options, DebugEndpoints};
use super::handler::{serve, Handler};
use super::middleware::Middleware;
use super::recover::Recoverer;
use crate::error::{ErrorHandler, GatewayError, GatewayResult};
use crate::lifecycle::Runner;
use crate::net::{ConnectionGuard, ConnectionTracker, Listener};
use crate::observability::metrics;

/// HTTP/2 tuning. `None` keeps the hyper default.
#[derive(Debug, Clone, Default)]
pub struct Http2Settings {
    pub max_concurrent_streams: Option<u32>,
    pub max_read_frame_size: Option<u32>,
    pub max_upload_buffer_per_stream: Option<u32>,
    pub max_upload_buffer_per_connection: Option<u32>,
    pub max_send_buf_size: Option<usize>,
}

#[derive(Clone)]
pub struct HttpSettings {
    pub name: String,
    pub addr: String,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub allow_http2: bool,
    pub enable_h2c: bool,
    pub read_timeout: Option<Duration>,
    pub read_header_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub max_header_bytes: Option<usize>,
    pub disable_keep_alive: bool,
    pub max_connections: Option<usize>,
    pub http2: Http2Settings,
    pub alt_svc: Option<String>,
    pub enable_general_options_handler: bool,
    pub pprof: bool,
    pub expvar: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            addr: "127.0.0.1:0".to_string(),
            tls: None,
            allow_http2: true,
            enable_h2c: false,
            read_timeout: None,
            read_header_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            max_header_bytes: None,
            disable_keep_alive: false,
            max_connections: None,
            http2: Http2Settings::default(),
            alt_svc: None,
            enable_general_options_handler: true,
            pprof: false,
            expvar: false,
        }
    }
}

/// Wrap a handler with the Alt-Svc header when configured.
pub fn alt_svc(value: Option<&str>, next: Handler) -> GatewayResult<Handler> {
    let Some(value) = value else {
        return Ok(next);
    };
    let value = HeaderValue::from_str(value)
        .map_err(|e| GatewayError::create_component("alt-svc", format!("invalid header value: {e}")))?;
    Ok(Handler::new(
        SetResponseHeaderLayer::appending(header::ALT_SVC, value).layer(next),
    ))
}

/// Wrap the handler stack every server shares in front of the mux.
pub(crate) fn root_handler(
    name: &str,
    alt_svc_value: Option<&str>,
    write_timeout: Option<Duration>,
    general_options_handler: bool,
    debug: DebugEndpoints,
    handler: Handler,
    error_handler: Arc<dyn ErrorHandler>,
) -> GatewayResult<Handler> {
    let mut root = debug.middleware(handler);
    if general_options_handler {
        root = general_options(root);
    }
    if let Some(timeout) = write_timeout {
        #[allow(deprecated)]
        let layer = TimeoutLayer::new(timeout);
        root = Handler::new(layer.layer(root));
    }
    root = alt_svc(alt_svc_value, root)?;
    let root = Recoverer::new(error_handler).middleware(root);
    tracing::debug!(server = %name, "Root handler assembled");
    Ok(root)
}

/// Serves HTTP/1.1 and HTTP/2 on one TCP listener.
pub struct HttpServer {
    settings: HttpSettings,
    root: Handler,
    tracker: ConnectionTracker,
    listener: Mutex<Option<Listener>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl HttpServer {
    pub fn new(settings: HttpSettings, handler: Handler, error_handler: Arc<dyn ErrorHandler>) -> GatewayResult<Self> {
        let tracker = ConnectionTracker::new(settings.name.clone());
        let debug = DebugEndpoints::new(settings.name.clone(), settings.pprof, settings.expvar, tracker.clone());
        let root = root_handler(
            &settings.name,
            settings.alt_svc.as_deref(),
            settings.write_timeout,
            settings.enable_general_options_handler,
            debug,
            handler,
            error_handler,
        )?;
        Ok(Self {
            settings,
            root,
            tracker,
            listener: Mutex::new(None),
            bound: Mutex::new(None),
        })
    }

    /// Bind ahead of [`Runner::run`] so the address is known early.
    pub async fn bind(&self) -> GatewayResult<SocketAddr> {
        let listener = Listener::bind(&self.settings.addr, self.settings.max_connections)
            .await
            .map_err(|e| self.server_error(e))?;
        let addr = listener.local_addr().map_err(|e| self.server_error(e))?;
        *self.bound.lock() = Some(addr);
        *self.listener.lock() = Some(listener);
        Ok(addr)
    }

    /// The bound address, once bound.
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    fn server_error(&self, reason: impl std::fmt::Display) -> GatewayError {
        GatewayError::Server {
            addr: self.settings.addr.clone(),
            reason: reason.to_string(),
        }
    }

    fn connection_builder(&self) -> Builder<TokioExecutor> {
        let s = &self.settings;
        let mut builder = Builder::new(TokioExecutor::new());

        {
            let mut http1 = builder.http1();
            http1.timer(TokioTimer::new()).keep_alive(!s.disable_keep_alive);
            if let Some(timeout) = s.read_header_timeout.or(s.read_timeout).or(s.idle_timeout) {
                http1.header_read_timeout(timeout);
            }
            if let Some(max) = s.max_header_bytes {
                http1.max_buf_size(max.max(8192));
            }
        }

        {
            let mut http2 = builder.http2();
            http2
                .timer(TokioTimer::new())
                .max_concurrent_streams(s.http2.max_concurrent_streams)
                .max_frame_size(s.http2.max_read_frame_size)
                .initial_stream_window_size(s.http2.max_upload_buffer_per_stream)
                .initial_connection_window_size(s.http2.max_upload_buffer_per_connection)
                .keep_alive_interval(s.idle_timeout);
            if let Some(max) = s.max_header_bytes {
                http2.max_header_list_size(u32::try_from(max).unwrap_or(u32::MAX));
            }
            if let Some(max) = s.http2.max_send_buf_size {
                http2.max_send_buf_size(max);
            }
        }

        let h2_available = s.allow_http2 && (s.tls.is_some() || s.enable_h2c);
        if h2_available {
            builder
        } else {
            builder.http1_only()
        }
    }

    /// Accept until `cancel` fires, then drain.
    pub async fn serve(&self, cancel: CancellationToken) -> GatewayResult<()> {
        let existing = self.listener.lock().take();
        let listener = match existing {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                let bound = self.listener.lock().take();
                bound.ok_or_else(|| self.server_error("listener missing after bind"))?
            }
        };
        let addr = listener.local_addr().map_err(|e| self.server_error(e))?;
        tracing::info!(
            server = %self.settings.name,
            address = %addr,
            tls = self.settings.tls.is_some(),
            http2 = self.settings.allow_http2,
            "HTTP server starting"
        );

        let drain = CancellationToken::new();
        let force = CancellationToken::new();
        let shared = Arc::new(ConnShared {
            builder: self.connection_builder(),
            root: self.root.clone(),
            tls: self.settings.tls.clone().map(TlsAcceptor::from),
            handshake_timeout: self.settings.tls_handshake_timeout,
            write_timeout: self.settings.write_timeout,
            requests: cancel.child_token(),
            drain: drain.clone(),
            force: force.clone(),
        });

        let mut failure = None;
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer, permit)) => {
                    let _ = stream.set_nodelay(true);
                    let guard = self.tracker.track();
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        shared.handle(stream, peer, guard).await;
                    });
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(server = %self.settings.name, error = %e, "Transient accept error");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => {
                    tracing::error!(server = %self.settings.name, error = %e, "Accept loop failed");
                    failure = Some(self.server_error(e));
                    break;
                }
            }
        }
        drop(listener);

        self.shutdown(&drain, &force).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn shutdown(&self, drain: &CancellationToken, force: &CancellationToken) {
        tracing::info!(
            server = %self.settings.name,
            open_connections = self.tracker.active_count(),
            timeout = ?self.settings.shutdown_timeout,
            "Draining connections"
        );
        drain.cancel();
        if !self.tracker.wait_for_drain(self.settings.shutdown_timeout).await {
            tracing::warn!(
                server = %self.settings.name,
                open_connections = self.tracker.active_count(),
                "Shutdown timeout exceeded, closing remaining connections"
            );
            force.cancel();
            self.tracker.wait_for_drain(Duration::from_secs(1)).await;
        }
        tracing::info!(server = %self.settings.name, "HTTP server stopped");
    }
}

#[async_trait::async_trait]
impl Runner for HttpServer {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn run(&self, cancel: CancellationToken) -> GatewayResult<()> {
        self.serve(cancel).await
    }
}

/// State shared by every connection task of one server.
struct ConnShared {
    builder: Builder<TokioExecutor>,
    root: Handler,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    write_timeout: Option<Duration>,
    /// Parent of every request context; follows the server's cancel token.
    requests: CancellationToken,
    drain: CancellationToken,
    force: CancellationToken,
}

impl ConnShared {
    async fn handle(&self, stream: tokio::net::TcpStream, peer: SocketAddr, guard: ConnectionGuard) {
        let connection_id = guard.id();
        match &self.tls {
            None => self.serve_connection(stream, peer, false).await,
            Some(acceptor) => {
                match tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => self.serve_connection(tls, peer, true).await,
                    Ok(Err(e)) => {
                        tracing::debug!(connection_id = %connection_id, peer_addr = %peer, error = %e, "TLS handshake failed")
                    }
                    Err(_) => {
                        tracing::debug!(connection_id = %connection_id, peer_addr = %peer, "TLS handshake timed out")
                    }
                }
            }
        }
        drop(guard);
    }

    async fn serve_connection<I>(&self, io: I, peer: SocketAddr, secure: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Request contexts are canceled with the server or when the client goes away.
        let conn_token = self.requests.child_token();
        let _cancel_on_close = conn_token.clone().drop_guard();

        let root = self.root.clone();
        let write_timeout = self.write_timeout;
        let service = service_fn(move |req: Request<Incoming>| {
            let root = root.clone();
            let token = conn_token.child_token();
            async move {
                let mut req = req.map(Body::new);
                let mut ctx = RequestContext::new(token, None);
                if let Some(timeout) = write_timeout {
                    ctx.set_timeout(timeout);
                }
                req.extensions_mut().insert(ctx);
                req.extensions_mut().insert(RemoteAddr(peer));
                if secure {
                    req.extensions_mut().insert(Secure);
                }
                let res = serve(&root, req).await;
                metrics::record_request(res.status().as_u16());
                Ok::<_, Infallible>(res)
            }
        });

        let conn = self
            .builder
            .serve_connection_with_upgrades(TokioIo::new(io), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.drain.cancelled() => {
                conn.as_mut().graceful_shutdown();
                tokio::select! {
                    result = conn.as_mut() => result,
                    _ = self.force.cancelled() => {
                        tracing::debug!(peer_addr = %peer, "Connection force-closed");
                        Ok(())
                    }
                }
            }
        };
        if let Err(e) = result {
            tracing::debug!(peer_addr = %peer, error = %e, "Connection ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsonErrorHandler;
    use crate::http::handler::{handler_fn, static_handler};
    use axum::http::{Response, StatusCode};

    async fn start(settings: HttpSettings, handler: Handler) -> (Arc<HttpServer>, SocketAddr, CancellationToken, tokio::task::JoinHandle<GatewayResult<()>>) {
        let server = Arc::new(HttpServer::new(settings, handler, Arc::new(JsonErrorHandler)).unwrap());
        let addr = server.bind().await.unwrap();
        let cancel = CancellationToken::new();
        let task = {
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { server.run(cancel).await })
        };
        (server, addr, cancel, task)
    }

    #[tokio::test]
    async fn serves_and_appends_alt_svc() {
        let settings = HttpSettings {
            alt_svc: Some(r#"h3=":8443"; ma=86400"#.to_string()),
            ..Default::default()
        };
        let (server, addr, cancel, task) = start(settings, static_handler(StatusCode::OK, None, "hi")).await;
        assert_eq!(server.addr(), Some(addr));

        let res = reqwest::get(format!("http://{addr}/")).await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.headers()["alt-svc"], r#"h3=":8443"; ma=86400"#);
        assert_eq!(res.text().await.unwrap(), "hi");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn request_carries_context_and_remote_addr() {
        let handler = handler_fn(|req: Request<Body>| async move {
            let has_ctx = req.extensions().get::<RequestContext>().is_some();
            let remote = req.extensions().get::<RemoteAddr>().map(|r| r.0.ip().to_string());
            Response::new(Body::from(format!("{has_ctx} {}", remote.unwrap_or_default())))
        });
        let (_server, addr, cancel, task) = start(HttpSettings::default(), handler).await;
        let body = reqwest::get(format!("http://{addr}/")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "true 127.0.0.1");
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn in_flight_request_completes_during_shutdown() {
        let handler = handler_fn(|_req| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Response::new(Body::from("slow"))
        });
        let settings = HttpSettings {
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (_server, addr, cancel, task) = start(settings, handler).await;

        let request = tokio::spawn(async move { reqwest::get(format!("http://{addr}/")).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        cancel.cancel();

        let res = request.await.unwrap().unwrap();
        assert_eq!(res.text().await.unwrap(), "slow");
        task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn server_cancel_reaches_request_context() {
        let handler = handler_fn(|req: Request<Body>| async move {
            let ctx = req.extensions().get::<RequestContext>().cloned().unwrap();
            let outcome = ctx.run(tokio::time::sleep(Duration::from_secs(30))).await;
            Response::new(Body::from(if outcome.is_err() { "canceled" } else { "slept" }))
        });
        let settings = HttpSettings {
            shutdown_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let (_server, addr, cancel, task) = start(settings, handler).await;

        let request = tokio::spawn(async move { reqwest::get(format!("http://{addr}/")).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        cancel.cancel();

        let res = request.await.unwrap().unwrap();
        assert_eq!(res.text().await.unwrap(), "canceled");
        task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn shutdown_timeout_forces_close() {
        let handler = handler_fn(|_req| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Response::new(Body::empty())
        });
        let settings = HttpSettings {
            shutdown_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (server, addr, cancel, task) = start(settings, handler).await;

        let request = tokio::spawn(async move { reqwest::get(format!("http://{addr}/")).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert!(request.await.unwrap().is_err());
        assert_eq!(server.tracker().active_count(), 0);
    }

    #[test]
    fn invalid_alt_svc_is_rejected() {
        let err = alt_svc(Some("bad\nvalue"), static_handler(StatusCode::OK, None, "")).err();
        assert!(matches!(err, Some(GatewayError::CreateComponent { .. })));
    }
}
