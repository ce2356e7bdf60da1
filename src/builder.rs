//! Named-reference resolution.
//!
//! Turns a validated [`GatewayConfig`] into an [`Entrypoint`]: stores are
//! opened by initializers and closed by finalizers, credential loaders run
//! after their store opens, each server becomes a runner, and each enforcer
//! with a reload schedule adds a reload runner.
//!
//! ```text
//! servers → virtual hosts → handlers → tripperware
//!         ↘ middleware → stores / enforcers
//! ```
//!
//! Every named object is built once and shared by all its users.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderName, StatusCode, Uri};
use tokio_util::sync::CancellationToken;

use crate::config::schema::*;
use crate::error::{get_handler, ErrorHandler, GatewayError, GatewayResult, DEFAULT_HANDLER};
use crate::http::h3::{Http3Server, Http3Settings};
use crate::http::handler::{not_found_handler, static_handler};
use crate::http::proxy::{client_tripper, HeaderInjector, ReverseProxy};
use crate::http::server::{Http2Settings, HttpSettings};
use crate::http::{chain, chain_trippers, Handler, HttpServer, Middleware, Tripper, Tripperware};
use crate::kvs::{KvsError, MemoryStore, RedisStore, Store};
use crate::lifecycle::{Entrypoint, Finalizer, Initializer, Runner, WaitPolicy};
use crate::net::tls;
use crate::observability::capture::JournalConfig;
use crate::observability::{get_sink, HttpLogger, Redactor, Template};
use crate::routing::{build_mux, HandlerBinding, VirtualHost};
use crate::security::authz::adapter::PolicyFeed;
use crate::security::authz::model::ModelSource;
use crate::security::authz::{build_enforcer, CasbinAuthz, PolicyReloader, PolicySource, SharedEnforcer};
use crate::security::credential::{Cipher, Credential, Encoding, HashAlg, SecretCodec, Transform};
use crate::security::provider::{CredentialLoader, CredentialProvider, EnvProvider, FileProvider};
use crate::security::{KeyAuth, KeySource};

type CredentialStore = Arc<dyn Store<Credential>>;

/// Opens a store at startup and closes it at teardown.
struct StoreLifecycle {
    name: String,
    store: CredentialStore,
}

#[async_trait]
impl Initializer for StoreLifecycle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> GatewayResult<()> {
        self.store.open().await?;
        tracing::debug!(store = %self.name, "Store opened");
        Ok(())
    }
}

#[async_trait]
impl Finalizer for StoreLifecycle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn finalize(&self) -> GatewayResult<()> {
        match self.store.close().await {
            Ok(()) | Err(KvsError::Closed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A built gateway, ready to run.
pub struct Gateway {
    entrypoint: Entrypoint,
    http: Vec<Arc<HttpServer>>,
    http3: Vec<Arc<Http3Server>>,
}

impl Gateway {
    pub async fn build(config: &GatewayConfig) -> GatewayResult<Self> {
        Builder::new(config).build().await
    }

    pub fn http_servers(&self) -> &[Arc<HttpServer>] {
        &self.http
    }

    pub fn http3_servers(&self) -> &[Arc<Http3Server>] {
        &self.http3
    }

    /// Bind every listener so addresses are known before [`Gateway::run`].
    pub async fn bind(&self) -> GatewayResult<()> {
        for server in &self.http {
            let addr = server.bind().await?;
            tracing::debug!(server = %server.name(), address = %addr, "Listener bound");
        }
        for server in &self.http3 {
            server.bind()?;
        }
        Ok(())
    }

    pub async fn run(self, cancel: CancellationToken) -> GatewayResult<()> {
        self.entrypoint.run(cancel).await
    }
}

struct Builder<'a> {
    config: &'a GatewayConfig,
    error_handler: Arc<dyn ErrorHandler>,
    entrypoint: Entrypoint,
    stores: HashMap<String, CredentialStore>,
    middleware: HashMap<String, Arc<dyn Middleware>>,
    tripperware: HashMap<String, Arc<dyn Tripperware>>,
    handlers: HashMap<String, Handler>,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn header_name(owner: &str, name: &str) -> GatewayResult<HeaderName> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| GatewayError::create_object(owner, format!("{name}: {e}")))
}

fn encoding(owner: &str, name: &str) -> GatewayResult<Encoding> {
    name.parse().map_err(|e| GatewayError::create_object(owner, e))
}

impl<'a> Builder<'a> {
    fn new(config: &'a GatewayConfig) -> Self {
        let policy = if config.entrypoint.wait_all {
            WaitPolicy::WaitAll
        } else {
            WaitPolicy::FirstDone
        };
        Self {
            config,
            error_handler: get_handler(DEFAULT_HANDLER),
            entrypoint: Entrypoint::new(policy),
            stores: HashMap::new(),
            middleware: HashMap::new(),
            tripperware: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    async fn build(mut self) -> GatewayResult<Gateway> {
        let mut http = Vec::new();
        let mut http3 = Vec::new();
        for server in &self.config.servers {
            let handler = self.server_handler(server).await?;
            match server.protocol {
                Protocol::Http => {
                    let s = Arc::new(HttpServer::new(self.http_settings(server)?, handler, self.error_handler.clone())?);
                    self.entrypoint.add_runner(s.clone());
                    http.push(s);
                }
                Protocol::Http3 => {
                    let s = Arc::new(Http3Server::new(self.http3_settings(server)?, handler, self.error_handler.clone())?);
                    self.entrypoint.add_runner(s.clone());
                    http3.push(s);
                }
            }
        }
        tracing::info!(
            servers = self.config.servers.len(),
            runners = ?self.entrypoint.runner_names(),
            "Gateway built"
        );
        Ok(Gateway {
            entrypoint: self.entrypoint,
            http,
            http3,
        })
    }

    async fn server_handler(&mut self, server: &ServerConfig) -> GatewayResult<Handler> {
        let mut vhosts = Vec::with_capacity(server.virtual_hosts.len());
        for name in &server.virtual_hosts {
            vhosts.push(self.virtual_host(name).await?);
        }
        let mux = build_mux(&vhosts, self.error_handler.clone())?;
        let middleware = self.middleware_list(&server.name, &server.middleware).await?;
        Ok(chain(&middleware, mux.into_handler(self.error_handler.clone())))
    }

    async fn virtual_host(&mut self, name: &str) -> GatewayResult<VirtualHost> {
        let cfg = self
            .config
            .virtual_hosts
            .get(name)
            .ok_or_else(|| GatewayError::create_object(name, "unknown virtual host"))?;
        let middleware = self.middleware_list(name, &cfg.middleware).await?;
        let mut handlers = Vec::with_capacity(cfg.handlers.len());
        for binding in &cfg.handlers {
            handlers.push(HandlerBinding {
                name: binding.handler.clone(),
                handler: self.handler(&binding.handler)?,
                paths: binding.paths.clone(),
                methods: binding.methods.clone(),
            });
        }
        Ok(VirtualHost {
            name: name.to_string(),
            hosts: cfg.hosts.clone(),
            pattern: cfg.pattern.clone(),
            methods: cfg.methods.clone(),
            middleware,
            handlers,
        })
    }

    async fn middleware_list(&mut self, owner: &str, names: &[String]) -> GatewayResult<Vec<Arc<dyn Middleware>>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.middleware(name).await.map_err(|e| {
                GatewayError::create_component(owner, format!("middleware {name}: {e}"))
            })?);
        }
        Ok(out)
    }

    async fn middleware(&mut self, name: &str) -> GatewayResult<Arc<dyn Middleware>> {
        if let Some(m) = self.middleware.get(name) {
            return Ok(m.clone());
        }
        let cfg = self
            .config
            .middleware
            .get(name)
            .ok_or_else(|| GatewayError::create_object(name, "unknown middleware"))?;
        let built: Arc<dyn Middleware> = match cfg {
            MiddlewareConfig::ApiKey(c) => {
                let source = KeySource::ApiKey {
                    header: header_name(name, &c.header)?,
                };
                Arc::new(self.key_auth(name, source, &c.store, &c.codec, &c.providers, c.keep, &c.claims_key)?)
            }
            MiddlewareConfig::IdKey(c) => {
                let source = KeySource::IdKey {
                    id_header: header_name(name, &c.id_header)?,
                    key_header: header_name(name, &c.key_header)?,
                };
                Arc::new(self.key_auth(name, source, &c.store, &c.codec, &c.providers, c.keep, &c.claims_key)?)
            }
            MiddlewareConfig::Casbin(c) => Arc::new(self.casbin(name, c).await?),
            MiddlewareConfig::AccessLog(log) => Arc::new(self.logger(name, log, None)?),
            MiddlewareConfig::JournalLog(j) => Arc::new(self.logger(name, &j.log, Some(journal(j)))?),
        };
        self.middleware.insert(name.to_string(), built.clone());
        Ok(built)
    }

    fn store(&mut self, name: &str) -> GatewayResult<CredentialStore> {
        if let Some(store) = self.stores.get(name) {
            return Ok(store.clone());
        }
        let cfg = self
            .config
            .stores
            .get(name)
            .ok_or_else(|| GatewayError::create_object(name, "unknown store"))?;
        let store: CredentialStore = match cfg {
            StoreConfig::Memory => Arc::new(MemoryStore::<Credential>::new()),
            StoreConfig::Redis { url, prefix, timeout_ms } => Arc::new(
                RedisStore::<Credential>::new(url, prefix.clone(), millis(*timeout_ms))
                    .map_err(|e| GatewayError::create_object(name, e))?,
            ),
        };
        let lifecycle = Arc::new(StoreLifecycle {
            name: format!("store/{name}"),
            store: store.clone(),
        });
        self.entrypoint.add_initializer(lifecycle.clone());
        self.entrypoint.add_finalizer(lifecycle);
        self.stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    #[allow(clippy::too_many_arguments)]
    fn key_auth(
        &mut self,
        name: &str,
        source: KeySource,
        store: &str,
        codec: &CodecConfig,
        providers: &[ProviderConfig],
        keep: bool,
        claims_key: &str,
    ) -> GatewayResult<KeyAuth> {
        let with_id = matches!(source, KeySource::IdKey { .. });
        let store = self.store(store)?;
        let codec = Arc::new(secret_codec(name, codec)?);

        let mut built: Vec<Box<dyn CredentialProvider>> = Vec::with_capacity(providers.len());
        for (i, provider) in providers.iter().enumerate() {
            let pname = format!("{name}/provider[{i}]");
            built.push(match provider {
                ProviderConfig::Env {
                    key_prefix,
                    id_prefix,
                    encoding: enc,
                } => Box::new(EnvProvider::new(
                    &pname,
                    key_prefix,
                    id_prefix.clone().filter(|_| with_id),
                    encoding(&pname, enc)?,
                )),
                ProviderConfig::File { paths, encoding: enc } => Box::new(FileProvider::new(
                    &pname,
                    paths.clone(),
                    with_id,
                    encoding(&pname, enc)?,
                )),
            });
        }
        if !built.is_empty() {
            self.entrypoint.add_initializer(Arc::new(CredentialLoader::new(
                format!("credentials/{name}"),
                store.clone(),
                codec.clone(),
                built,
            )));
        }

        Ok(KeyAuth::new(
            name,
            source,
            store,
            codec,
            claims_key,
            keep,
            self.error_handler.clone(),
        ))
    }

    async fn casbin(&mut self, name: &str, cfg: &CasbinConfig) -> GatewayResult<CasbinAuthz> {
        let mut enforcers: Vec<SharedEnforcer> = Vec::with_capacity(cfg.enforcers.len());
        for (i, e) in cfg.enforcers.iter().enumerate() {
            let ename = format!("{name}/enforcer[{i}]");
            let fail = |reason: String| GatewayError::create_object(&ename, reason);

            let injector = HeaderInjector::new(e.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
            let tripper: Tripper = chain_trippers(&[Arc::new(injector) as Arc<dyn Tripperware>], client_tripper());
            let timeout = millis(e.timeout_ms);
            let parse_uri = |url: &str| url.parse::<Uri>().map_err(|err| fail(format!("{url}: {err}")));

            let model = if is_url(&e.model) {
                ModelSource::Http {
                    url: parse_uri(&e.model)?,
                    tripper: tripper.clone(),
                    timeout,
                }
            } else {
                ModelSource::File(e.model.clone().into())
            };
            let source = if is_url(&e.policy) {
                PolicySource::Http {
                    url: parse_uri(&e.policy)?,
                    tripper,
                    timeout,
                }
            } else {
                PolicySource::file(Path::new(&e.policy)).map_err(|err| fail(err.to_string()))?
            };

            let feed = Arc::new(PolicyFeed::new(source));
            let enforcer = build_enforcer(&model, feed.clone())
                .await
                .map_err(|err| fail(err.to_string()))?;
            if let Some(cron) = &e.reload_cron {
                let reloader = PolicyReloader::new(format!("reload/{ename}"), cron, enforcer.clone(), Some(feed))?;
                self.entrypoint.add_runner(Arc::new(reloader) as Arc<dyn Runner>);
            }
            tracing::info!(middleware = %name, enforcer = i, model = %e.model, policy = %e.policy, "Enforcer built");
            enforcers.push(enforcer);
        }
        CasbinAuthz::new(
            name,
            enforcers,
            cfg.claims_key.clone(),
            cfg.extra_keys.clone(),
            cfg.explain,
            self.error_handler.clone(),
        )
    }

    fn logger(&self, name: &str, cfg: &LogConfig, journal: Option<JournalConfig>) -> GatewayResult<HttpLogger> {
        let sink = get_sink(&cfg.sink).ok_or_else(|| GatewayError::create_object(name, format!("unknown log sink {:?}", cfg.sink)))?;
        let template = cfg.template.as_deref().map(Template::parse).transpose()?;
        HttpLogger::new(
            sink,
            template,
            Redactor::new(&cfg.redact)?,
            journal,
            self.error_handler.clone(),
        )
    }

    fn tripperware(&mut self, name: &str) -> GatewayResult<Arc<dyn Tripperware>> {
        if let Some(t) = self.tripperware.get(name) {
            return Ok(t.clone());
        }
        let cfg = self
            .config
            .tripperware
            .get(name)
            .ok_or_else(|| GatewayError::create_object(name, "unknown tripperware"))?;
        let built: Arc<dyn Tripperware> = match cfg {
            TripperwareConfig::Headers { headers } => {
                Arc::new(HeaderInjector::new(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))?)
            }
            TripperwareConfig::AccessLog(log) => Arc::new(self.logger(name, log, None)?),
            TripperwareConfig::JournalLog(j) => Arc::new(self.logger(name, &j.log, Some(journal(j)))?),
        };
        self.tripperware.insert(name.to_string(), built.clone());
        Ok(built)
    }

    fn handler(&mut self, name: &str) -> GatewayResult<Handler> {
        if let Some(h) = self.handlers.get(name) {
            return Ok(h.clone());
        }
        let cfg = self
            .config
            .handlers
            .get(name)
            .ok_or_else(|| GatewayError::create_object(name, "unknown handler"))?;
        let built = match cfg {
            HandlerConfig::Proxy { upstream, tripperware } => {
                let chain = tripperware
                    .iter()
                    .map(|t| self.tripperware(t))
                    .collect::<GatewayResult<Vec<_>>>()?;
                ReverseProxy::new(upstream, client_tripper(), &chain, self.error_handler.clone())?.into_handler()
            }
            HandlerConfig::Static {
                status,
                content_type,
                body,
            } => {
                let status = StatusCode::from_u16(*status).map_err(|e| GatewayError::create_object(name, e))?;
                static_handler(status, content_type.as_deref(), body.clone())
            }
            HandlerConfig::NotFound => not_found_handler(name, self.error_handler.clone()),
        };
        self.handlers.insert(name.to_string(), built.clone());
        Ok(built)
    }

    fn http_settings(&self, server: &ServerConfig) -> GatewayResult<HttpSettings> {
        let tls = match &server.tls {
            Some(t) => Some(tls::server_config(&t.cert_path, &t.key_path, &t.alpn, server.allow_http2)?),
            None => None,
        };
        Ok(HttpSettings {
            name: server.name.clone(),
            addr: server.addr.clone(),
            tls,
            allow_http2: server.allow_http2,
            enable_h2c: server.enable_h2c,
            read_timeout: millis_opt(server.read_timeout_ms),
            read_header_timeout: millis_opt(server.read_header_timeout_ms),
            write_timeout: millis_opt(server.write_timeout_ms),
            idle_timeout: millis_opt(server.idle_timeout_ms),
            shutdown_timeout: millis(server.shutdown_timeout_ms),
            max_header_bytes: server.max_header_bytes,
            disable_keep_alive: server.disable_keep_alive,
            max_connections: server.max_connections,
            http2: Http2Settings {
                max_concurrent_streams: server.http2.max_concurrent_streams,
                max_read_frame_size: server.http2.max_read_frame_size,
                max_upload_buffer_per_stream: server.http2.max_upload_buffer_per_stream,
                max_upload_buffer_per_connection: server.http2.max_upload_buffer_per_connection,
                max_send_buf_size: server.http2.max_send_buf_size,
            },
            alt_svc: server.alt_svc.clone(),
            enable_general_options_handler: server.general_options,
            pprof: server.pprof,
            expvar: server.expvar,
            ..HttpSettings::default()
        })
    }

    fn http3_settings(&self, server: &ServerConfig) -> GatewayResult<Http3Settings> {
        let t = server
            .tls
            .as_ref()
            .ok_or_else(|| GatewayError::create_object(&server.name, "http3 requires tls"))?;
        Ok(Http3Settings {
            name: server.name.clone(),
            addr: server.addr.clone(),
            tls: tls::quic_server_config(&t.cert_path, &t.key_path)?,
            idle_timeout: millis_opt(server.idle_timeout_ms),
            write_timeout: millis_opt(server.write_timeout_ms),
            shutdown_timeout: millis(server.shutdown_timeout_ms),
            max_header_bytes: server.max_header_bytes.map(|n| n as u64),
            alt_svc: server.alt_svc.clone(),
            pprof: server.pprof,
            expvar: server.expvar,
        })
    }
}

fn millis_opt(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

fn journal(cfg: &JournalLogConfig) -> JournalConfig {
    JournalConfig {
        mimes: cfg.mimes.clone(),
        max_body: cfg.max_body,
        body_path: cfg.body_path.clone(),
        base64: cfg.base64,
    }
}

fn secret_codec(name: &str, cfg: &CodecConfig) -> GatewayResult<SecretCodec> {
    let fail = |e: &dyn std::fmt::Display| GatewayError::create_object(name, e);
    let transform = match (&cfg.hash, &cfg.hmac_key) {
        (None, None) => Transform::Plain,
        (None, Some(_)) => return Err(fail(&"hmac_key requires hash")),
        (Some(alg), hmac_key) => {
            let alg: HashAlg = alg.parse().map_err(|e| fail(&e))?;
            match hmac_key {
                Some(key) => Transform::Hmac {
                    alg,
                    key: key.as_bytes().to_vec(),
                },
                None => Transform::Hash(alg),
            }
        }
    };
    let cipher = match &cfg.cipher_key {
        Some(key) => {
            let bytes = hex::decode(key).map_err(|e| fail(&e))?;
            Some(Cipher::new(&bytes).map_err(|e| fail(&e))?)
        }
        None => None,
    };
    SecretCodec::new(transform, encoding(name, &cfg.encoding)?, cipher).map_err(|e| fail(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn codecs_follow_config() {
        let plain = secret_codec("c", &CodecConfig::default()).unwrap();
        assert!(plain.verify(b"k", b"k").unwrap());

        let hashed = secret_codec(
            "c",
            &CodecConfig {
                hash: Some("sha256".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let sealed = hashed.seal(b"s3cret").unwrap();
        assert!(hashed.verify(&sealed, b"s3cret").unwrap());
        assert!(!hashed.verify(&sealed, b"wrong").unwrap());

        let bad = CodecConfig {
            cipher_key: Some("abcd".into()),
            ..Default::default()
        };
        assert!(secret_codec("c", &bad).is_err());
    }

    #[tokio::test]
    async fn builds_servers_stores_and_loaders() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join("keys.txt");
        std::fs::write(&keys, "s3cret\n").unwrap();
        let config = parse_config(&format!(
            r#"
            [[servers]]
            name = "public"
            addr = "127.0.0.1:0"
            virtual_hosts = ["api"]

            [virtual_hosts.api]
            middleware = ["keys"]
            handlers = [{{ handler = "ok", paths = ["/ping"] }}]

            [middleware.keys]
            type = "api_key"
            store = "creds"
            codec = {{ hash = "sha256" }}
            providers = [{{ type = "file", paths = [{keys:?}] }}]

            [handlers.ok]
            type = "static"
            body = "pong"

            [stores.creds]
            type = "memory"
            "#
        ))
        .unwrap();

        let gateway = Gateway::build(&config).await.unwrap();
        assert_eq!(gateway.http_servers().len(), 1);
        assert!(gateway.http3_servers().is_empty());
        assert_eq!(gateway.entrypoint.runner_names(), vec!["public"]);
    }

    #[tokio::test]
    async fn unknown_sink_fails_the_build() {
        let config = parse_config(
            r#"
            [[servers]]
            name = "public"
            addr = "127.0.0.1:0"
            middleware = ["log"]

            [middleware.log]
            type = "access_log"
            sink = "nowhere"
            "#,
        )
        .unwrap();
        assert!(matches!(
            Gateway::build(&config).await,
            Err(GatewayError::CreateComponent { .. })
        ));
    }
}
