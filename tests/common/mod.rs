//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use api_gateway::config::parse_config;
use api_gateway::{Gateway, GatewayResult};
use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Scratch directory under `TEST_DIR` when set, the system temp dir otherwise.
pub fn fixture_dir() -> tempfile::TempDir {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix("gateway-test-");
        b
    };
    match std::env::var_os("TEST_DIR") {
        Some(dir) => builder.tempdir_in(dir).unwrap(),
        None => builder.tempdir().unwrap(),
    }
}

/// Start a backend that answers every connection with a fixed response.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let response_str = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    response.len(),
                    response
                );
                let _ = socket.write_all(response_str.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Echo of what the backend received.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Echo {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

async fn echo(req: Request) -> Response {
    let (parts, body) = req.into_parts();
    if parts.uri.path().starts_with("/slow") {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let body = to_bytes(body, 1 << 20).await.unwrap_or_default();
    let echo = Echo {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: parts
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let json = serde_json::to_vec(&echo).unwrap();
    ([(header::CONTENT_TYPE, "application/json")], Body::from(json)).into_response()
}

/// Start a backend that echoes requests as JSON. Paths under `/slow` answer
/// after 500ms.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = axum::Router::new().fallback(echo);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

pub struct RunningGateway {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<GatewayResult<()>>,
}

impl RunningGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn stop(self) -> GatewayResult<()> {
        self.cancel.cancel();
        self.handle.await.unwrap()
    }
}

/// Build a gateway from TOML, bind its first server and run it.
pub async fn start_gateway(toml: &str) -> RunningGateway {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = parse_config(toml).unwrap();
    let gateway = Gateway::build(&config).await.unwrap();
    gateway.bind().await.unwrap();
    let addr = gateway.http_servers()[0].addr().unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { gateway.run(cancel).await }
    });
    RunningGateway { addr, cancel, handle }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
