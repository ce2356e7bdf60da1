//! HTTP/3 server runner over QUIC.
//!
//! TLS is mandatory. Request bodies are buffered before dispatch; response
//! bodies stream frame by frame. The root handler is assembled exactly like
//! the TCP server's, so Alt-Svc, the recoverer and debug endpoints behave
//! the same on both.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use bytes::{Buf, Bytes, BytesMut};
use h3::server::RequestStream;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use quinn::crypto::rustls::QuicServerConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::context::{RemoteAddr, RequestContext, Secure};
use super::debug::DebugEndpoints;
use super::handler::{serve, Handler};
use super::server::root_handler;
use crate::error::{ErrorHandler, GatewayError, GatewayResult};
use crate::lifecycle::Runner;
use crate::net::ConnectionTracker;
use crate::observability::metrics;

#[derive(Clone)]
pub struct Http3Settings {
    pub name: String,
    pub addr: String,
    /// QUIC TLS config (TLS 1.3, ALPN `h3`).
    pub tls: rustls::ServerConfig,
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub max_header_bytes: Option<u64>,
    pub alt_svc: Option<String>,
    pub pprof: bool,
    pub expvar: bool,
}

pub struct Http3Server {
    settings: Http3Settings,
    root: Handler,
    tracker: ConnectionTracker,
    endpoint: Mutex<Option<quinn::Endpoint>>,
}

impl Http3Server {
    pub fn new(settings: Http3Settings, handler: Handler, error_handler: Arc<dyn ErrorHandler>) -> GatewayResult<Self> {
        let tracker = ConnectionTracker::new(settings.name.clone());
        let debug = DebugEndpoints::new(settings.name.clone(), settings.pprof, settings.expvar, tracker.clone());
        let root = root_handler(
            &settings.name,
            settings.alt_svc.as_deref(),
            settings.write_timeout,
            false,
            debug,
            handler,
            error_handler,
        )?;
        Ok(Self {
            settings,
            root,
            tracker,
            endpoint: Mutex::new(None),
        })
    }

    fn server_error(&self, reason: impl std::fmt::Display) -> GatewayError {
        GatewayError::Server {
            addr: self.settings.addr.clone(),
            reason: reason.to_string(),
        }
    }

    fn server_config(&self) -> GatewayResult<quinn::ServerConfig> {
        let crypto = QuicServerConfig::try_from(self.settings.tls.clone()).map_err(|e| self.server_error(e))?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        let mut transport = quinn::TransportConfig::default();
        if let Some(idle) = self.settings.idle_timeout {
            let idle = quinn::IdleTimeout::try_from(idle).map_err(|e| self.server_error(e))?;
            transport.max_idle_timeout(Some(idle));
        }
        config.transport_config(Arc::new(transport));
        Ok(config)
    }

    /// Open the UDP endpoint. Called by `run` when not done ahead of time.
    pub fn bind(&self) -> GatewayResult<SocketAddr> {
        let addr: SocketAddr = self
            .settings
            .addr
            .parse()
            .map_err(|e| self.server_error(format!("invalid address: {e}")))?;
        let endpoint = quinn::Endpoint::server(self.server_config()?, addr).map_err(|e| self.server_error(e))?;
        let local = endpoint.local_addr().map_err(|e| self.server_error(e))?;
        *self.endpoint.lock() = Some(endpoint);
        Ok(local)
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .lock()
            .as_ref()
            .and_then(|e| e.local_addr().ok())
    }

    pub async fn serve(&self, cancel: CancellationToken) -> GatewayResult<()> {
        if self.addr().is_none() {
            self.bind()?;
        }
        let endpoint = self
            .endpoint
            .lock()
            .clone()
            .ok_or_else(|| self.server_error("endpoint missing after bind"))?;
        tracing::info!(
            server = %self.settings.name,
            address = ?endpoint.local_addr().ok(),
            "HTTP/3 server starting"
        );

        let requests = cancel.child_token();
        let drain = CancellationToken::new();
        let force = CancellationToken::new();
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                break;
            };
            let conn = H3Conn {
                root: self.root.clone(),
                write_timeout: self.settings.write_timeout,
                max_header_bytes: self.settings.max_header_bytes,
                requests: requests.clone(),
                drain: drain.clone(),
                force: force.clone(),
            };
            let guard = self.tracker.track();
            tokio::spawn(async move {
                let peer = incoming.remote_address();
                match incoming.await {
                    Ok(quic) => conn.serve(quic, peer).await,
                    Err(e) => tracing::debug!(peer_addr = %peer, error = %e, "QUIC handshake failed"),
                }
                drop(guard);
            });
        }

        // Refuse new connections while the open ones drain.
        endpoint.set_server_config(None);
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
        }
        endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        endpoint.wait_idle().await;
        tracing::info!(server = %self.settings.name, "HTTP/3 server stopped");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Runner for Http3Server {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn run(&self, cancel: CancellationToken) -> GatewayResult<()> {
        self.serve(cancel).await
    }
}

struct H3Conn {
    root: Handler,
    write_timeout: Option<Duration>,
    max_header_bytes: Option<u64>,
    /// Parent of every request context; follows the server's cancel token.
    requests: CancellationToken,
    drain: CancellationToken,
    force: CancellationToken,
}

type H3Stream = RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

impl H3Conn {
    async fn serve(self, quic: quinn::Connection, peer: SocketAddr) {
        let mut builder = h3::server::builder();
        if let Some(max) = self.max_header_bytes {
            builder.max_field_section_size(max);
        }
        let mut conn = match builder.build::<_, Bytes>(h3_quinn::Connection::new(quic)).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(peer_addr = %peer, error = %e, "HTTP/3 setup failed");
                return;
            }
        };

        let conn_token = self.requests.child_token();
        let _cancel_on_close = conn_token.clone().drop_guard();
        let mut requests = JoinSet::new();
        let mut draining = false;
        loop {
            let accepted = tokio::select! {
                accepted = conn.accept() => accepted,
                _ = self.drain.cancelled(), if !draining => {
                    draining = true;
                    if let Err(e) = conn.shutdown(0).await {
                        tracing::debug!(peer_addr = %peer, error = %e, "HTTP/3 GOAWAY failed");
                    }
                    continue;
                }
                _ = self.force.cancelled() => break,
            };
            match accepted {
                Ok(Some((head, stream))) => {
                    let root = self.root.clone();
                    let token = conn_token.child_token();
                    let write_timeout = self.write_timeout;
                    requests.spawn(async move {
                        if let Err(e) = handle_request(root, head, stream, peer, token, write_timeout).await {
                            tracing::debug!(peer_addr = %peer, error = %e, "HTTP/3 request failed");
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer_addr = %peer, error = %e, "HTTP/3 connection closed");
                    break;
                }
            }
        }

        tokio::select! {
            _ = async { while requests.join_next().await.is_some() {} } => {}
            _ = self.force.cancelled() => requests.abort_all(),
        }
    }
}

async fn handle_request(
    root: Handler,
    head: Request<()>,
    mut stream: H3Stream,
    peer: SocketAddr,
    token: CancellationToken,
    write_timeout: Option<Duration>,
) -> Result<(), h3::Error> {
    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        while chunk.has_remaining() {
            let part = chunk.chunk();
            let len = part.len();
            body.extend_from_slice(part);
            chunk.advance(len);
        }
    }

    let (parts, ()) = head.into_parts();
    let mut req = Request::from_parts(parts, Body::from(body.freeze()));
    let mut ctx = RequestContext::new(token, None);
    if let Some(timeout) = write_timeout {
        ctx.set_timeout(timeout);
    }
    req.extensions_mut().insert(ctx);
    req.extensions_mut().insert(RemoteAddr(peer));
    req.extensions_mut().insert(Secure);

    let res = serve(&root, req).await;
    metrics::record_request(res.status().as_u16());

    let (parts, mut body) = res.into_parts();
    stream.send_response(Response::from_parts(parts, ())).await?;
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(peer_addr = %peer, error = %e, "Response body failed");
                break;
            }
        };
        match frame.into_data() {
            Ok(data) => stream.send_data(data).await?,
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    stream.send_trailers(trailers).await?;
                    return Ok(());
                }
            }
        }
    }
    stream.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsonErrorHandler;
    use crate::http::handler::static_handler;
    use axum::http::StatusCode;

    #[test]
    fn rejects_invalid_address() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new()));
        let settings = Http3Settings {
            name: "h3".into(),
            addr: "not an address".into(),
            tls,
            idle_timeout: None,
            write_timeout: None,
            shutdown_timeout: Duration::from_secs(1),
            max_header_bytes: None,
            alt_svc: None,
            pprof: false,
            expvar: false,
        };
        let server = Http3Server::new(settings, static_handler(StatusCode::OK, None, ""), Arc::new(JsonErrorHandler)).unwrap();
        assert!(matches!(server.bind(), Err(GatewayError::Server { .. })));
        assert!(server.addr().is_none());
    }
}
