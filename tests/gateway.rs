//! End-to-end tests: a gateway built from TOML in front of a local backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use api_gateway::observability::{set_sink, WriterSink};
use common::{client, fixture_dir, start_echo_backend, start_gateway, start_mock_backend, Echo};
use reqwest::StatusCode;

const KEYS: &str = "s3cret:{\"name\":\"alice\"}\nb0b:{\"name\":\"bob\"}\n";

const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(authValue(r.sub, "attrs.name"), p.sub) && keyMatch(r.obj, p.obj) && r.act == p.act
"#;

const POLICY: &str = "p, admin, /foo/*, POST\ng, alice, admin\n";

fn api_key_config(backend: std::net::SocketAddr, keys: &std::path::Path, vhost_middleware: &str, extra: &str) -> String {
    format!(
        r#"
[[servers]]
name = "front"
addr = "127.0.0.1:0"
virtual_hosts = ["api"]

[virtual_hosts.api]
middleware = [{vhost_middleware}]
handlers = [{{ handler = "up", paths = ["/x", "/foo/{{rest...}}"] }}]

[stores.keys]
type = "memory"

[middleware.keys]
type = "api_key"
store = "keys"
codec = {{ hash = "sha256" }}
providers = [{{ type = "file", paths = ["{keys}"] }}]

[handlers.up]
type = "proxy"
upstream = "http://{backend}"
{extra}
"#,
        keys = keys.display(),
    )
}

#[tokio::test]
async fn api_key_passes_and_strips_the_credential_header() {
    let dir = fixture_dir();
    let keys = dir.path().join("keys.txt");
    std::fs::write(&keys, KEYS).unwrap();
    let backend = start_echo_backend().await;
    let gw = start_gateway(&api_key_config(backend, &keys, "\"keys\"", "")).await;

    let res = client()
        .get(gw.url("/x"))
        .header("X-Api-Key", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let echo: Echo = res.json().await.unwrap();
    assert_eq!(echo.path, "/x");
    assert!(!echo.headers.contains_key("x-api-key"));

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn api_key_denial_is_a_json_403() {
    let dir = fixture_dir();
    let keys = dir.path().join("keys.txt");
    std::fs::write(&keys, KEYS).unwrap();
    let backend = start_echo_backend().await;
    let gw = start_gateway(&api_key_config(backend, &keys, "\"keys\"", "")).await;

    for key in [Some("wrong"), None] {
        let mut req = client().get(gw.url("/x"));
        if let Some(key) = key {
            req = req.header("X-Api-Key", key);
        }
        let res = req.send().await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(res.text().await.unwrap(), r#"{"status":403,"statusText":"Forbidden"}"#);
    }

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn casbin_authorizes_on_authentication_attributes() {
    let dir = fixture_dir();
    let keys = dir.path().join("keys.txt");
    let model = dir.path().join("model.conf");
    let policy = dir.path().join("policy.csv");
    std::fs::write(&keys, KEYS).unwrap();
    std::fs::write(&model, MODEL).unwrap();
    std::fs::write(&policy, POLICY).unwrap();

    let backend = start_echo_backend().await;
    let authz = format!(
        r#"
[middleware.authz]
type = "casbin"
claims_key = "authn"
enforcers = [{{ model = "{}", policy = "{}" }}]
"#,
        model.display(),
        policy.display()
    );
    let gw = start_gateway(&api_key_config(backend, &keys, "\"keys\", \"authz\"", &authz)).await;

    let alice = client()
        .post(gw.url("/foo/123"))
        .header("X-Api-Key", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(alice.status(), StatusCode::OK);

    let bob = client()
        .post(gw.url("/foo/123"))
        .header("X-Api-Key", "b0b")
        .send()
        .await
        .unwrap();
    assert_eq!(bob.status(), StatusCode::FORBIDDEN);

    let wrong_method = client()
        .get(gw.url("/foo/123"))
        .header("X-Api-Key", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_method.status(), StatusCode::FORBIDDEN);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn journal_log_captures_request_and_response_bodies() {
    let dir = fixture_dir();
    let log_path = dir.path().join("journal.log");
    set_sink("journal-test", Arc::new(WriterSink::append(&log_path).unwrap()));

    let backend = start_echo_backend().await;
    let config = format!(
        r#"
[[servers]]
name = "front"
addr = "127.0.0.1:0"
middleware = ["journal"]
virtual_hosts = ["api"]

[virtual_hosts.api]
handlers = [{{ handler = "up", paths = ["/p"] }}]

[middleware.journal]
type = "journal_log"
sink = "journal-test"
mimes = ["text/plain", "application/json"]

[handlers.up]
type = "proxy"
upstream = "http://{backend}"
"#
    );
    let gw = start_gateway(&config).await;

    let res = client()
        .post(gw.url("/p"))
        .header("Content-Type", "text/plain")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let received = res.text().await.unwrap();

    // The response record is written once the body has been relayed.
    let mut records = Vec::new();
    for _ in 0..50 {
        let text = std::fs::read_to_string(&log_path).unwrap_or_default();
        records = text
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
            .collect::<Vec<_>>();
        if records.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["type"], "svr.req");
    assert_eq!(records[0]["body"], "hello");
    assert_eq!(records[1]["type"], "svr.res");
    assert_eq!(records[1]["status"], 200);
    assert_eq!(records[1]["body"], received.as_str());
    assert_eq!(records[0]["id"], records[1]["id"]);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn head_on_a_get_route_is_not_found() {
    let config = r#"
[[servers]]
name = "front"
addr = "127.0.0.1:0"
virtual_hosts = ["api"]

[virtual_hosts.api]
handlers = [{ handler = "pong", paths = ["/ping"], methods = ["GET"] }]

[handlers.pong]
type = "static"
content_type = "text/plain"
body = "pong"
"#;
    let gw = start_gateway(config).await;

    let get = client().get(gw.url("/ping")).send().await.unwrap();
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(get.text().await.unwrap(), "pong");

    let head = client().head(gw.url("/ping")).send().await.unwrap();
    assert_eq!(head.status(), StatusCode::NOT_FOUND);

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn proxies_to_a_raw_backend() {
    let backend = start_mock_backend("plain backend").await;
    let config = format!(
        r#"
[[servers]]
name = "front"
addr = "127.0.0.1:0"
virtual_hosts = ["api"]

[virtual_hosts.api]
handlers = [{{ handler = "up" }}]

[handlers.up]
type = "proxy"
upstream = "http://{backend}"
"#
    );
    let gw = start_gateway(&config).await;

    let res = client().get(gw.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "plain backend");

    gw.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_lets_in_flight_requests_finish() {
    let backend = start_echo_backend().await;
    let config = format!(
        r#"
[[servers]]
name = "front"
addr = "127.0.0.1:0"
shutdown_timeout_ms = 5000
virtual_hosts = ["api"]

[virtual_hosts.api]
handlers = [{{ handler = "up", paths = ["/slow"] }}]

[handlers.up]
type = "proxy"
upstream = "http://{backend}"
"#
    );
    let gw = start_gateway(&config).await;

    let url = gw.url("/slow");
    let in_flight = tokio::spawn(async move { client().get(url).send().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), gw.stop()).await;
    assert!(stopped.unwrap().is_ok());

    let res = in_flight.await.unwrap().unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let echo: Echo = res.json().await.unwrap();
    assert_eq!(echo.path, "/slow");
}
