//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Referential integrity: every named middleware, tripperware, handler,
//!   virtual host and store exists
//! - Value checks: addresses, TLS for HTTP/3, cron expressions, codec names
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: GatewayConfig → Result<(), Vec<ValidationError>>

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use axum::http::{HeaderName, StatusCode};

use crate::config::schema::*;
use crate::security::authz::reload::parse_schedule;
use crate::security::authz::{PolicyFormat, MAX_EXTRA_KEYS};
use crate::security::credential::{Encoding, HashAlg};

/// One semantic problem, located by a dotted path into the config.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

#[derive(Default)]
struct Errors(Vec<ValidationError>);

impl Errors {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn refs<V>(&mut self, path: &str, names: &[String], known: &BTreeMap<String, V>, what: &str) {
        for name in names {
            if !known.contains_key(name) {
                self.push(path, format!("unknown {what} {name:?}"));
            }
        }
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Errors::default();

    if config.servers.is_empty() {
        errors.push("servers", "at least one server is required");
    }
    let mut names = HashSet::new();
    for (i, server) in config.servers.iter().enumerate() {
        let path = format!("servers[{i}]");
        validate_server(&path, server, config, &mut errors);
        if !names.insert(server.name.as_str()) {
            errors.push(&path, format!("duplicate server name {:?}", server.name));
        }
    }

    for (name, vhost) in &config.virtual_hosts {
        let path = format!("virtual_hosts.{name}");
        errors.refs(&path, &vhost.middleware, &config.middleware, "middleware");
        for (i, h) in vhost.handlers.iter().enumerate() {
            if !config.handlers.contains_key(&h.handler) {
                errors.push(format!("{path}.handlers[{i}]"), format!("unknown handler {:?}", h.handler));
            }
        }
    }

    for (name, mw) in &config.middleware {
        validate_middleware(&format!("middleware.{name}"), mw, config, &mut errors);
    }

    for (name, tw) in &config.tripperware {
        let path = format!("tripperware.{name}");
        match tw {
            TripperwareConfig::Headers { headers } => validate_headers(&path, headers, &mut errors),
            TripperwareConfig::AccessLog(log) => validate_log(&path, log, &mut errors),
            TripperwareConfig::JournalLog(journal) => validate_log(&path, &journal.log, &mut errors),
        }
    }

    for (name, handler) in &config.handlers {
        let path = format!("handlers.{name}");
        match handler {
            HandlerConfig::Proxy { upstream, tripperware } => {
                match url::Url::parse(upstream) {
                    Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                    Ok(url) => errors.push(&path, format!("unsupported upstream scheme {:?}", url.scheme())),
                    Err(e) => errors.push(&path, format!("upstream {upstream:?}: {e}")),
                }
                errors.refs(&path, tripperware, &config.tripperware, "tripperware");
            }
            HandlerConfig::Static { status, .. } => {
                if StatusCode::from_u16(*status).is_err() {
                    errors.push(&path, format!("invalid status {status}"));
                }
            }
            HandlerConfig::NotFound => {}
        }
    }

    for (name, store) in &config.stores {
        if let StoreConfig::Redis { url, .. } = store {
            if let Err(e) = url::Url::parse(url) {
                errors.push(format!("stores.{name}"), format!("redis url {url:?}: {e}"));
            }
        }
    }

    if errors.0.is_empty() {
        Ok(())
    } else {
        Err(errors.0)
    }
}

fn validate_server(path: &str, server: &ServerConfig, config: &GatewayConfig, errors: &mut Errors) {
    if server.name.is_empty() {
        errors.push(path, "name must not be empty");
    }
    if server.addr.is_empty() {
        errors.push(path, "addr must not be empty");
    }
    if server.protocol == Protocol::Http3 && server.tls.is_none() {
        errors.push(path, "http3 requires tls");
    }
    if server.shutdown_timeout_ms == 0 {
        errors.push(path, "shutdown_timeout_ms must be > 0");
    }
    if server.max_connections == Some(0) {
        errors.push(path, "max_connections must be > 0");
    }
    errors.refs(path, &server.middleware, &config.middleware, "middleware");
    errors.refs(path, &server.virtual_hosts, &config.virtual_hosts, "virtual host");
}

fn validate_middleware(path: &str, mw: &MiddlewareConfig, config: &GatewayConfig, errors: &mut Errors) {
    match mw {
        MiddlewareConfig::ApiKey(c) => {
            validate_key_auth(path, &c.store, &[&c.header], &c.codec, &c.providers, false, config, errors)
        }
        MiddlewareConfig::IdKey(c) => validate_key_auth(
            path,
            &c.store,
            &[&c.id_header, &c.key_header],
            &c.codec,
            &c.providers,
            true,
            config,
            errors,
        ),
        MiddlewareConfig::Casbin(c) => {
            if c.enforcers.is_empty() {
                errors.push(path, "at least one enforcer is required");
            }
            if c.extra_keys.len() > MAX_EXTRA_KEYS {
                errors.push(path, format!("at most {MAX_EXTRA_KEYS} extra keys are supported"));
            }
            for (i, e) in c.enforcers.iter().enumerate() {
                let path = format!("{path}.enforcers[{i}]");
                if !is_url(&e.policy) {
                    if let Err(err) = PolicyFormat::from_path(Path::new(&e.policy)) {
                        errors.push(&path, err.to_string());
                    }
                }
                if let Some(cron) = &e.reload_cron {
                    if let Err(err) = parse_schedule(cron) {
                        errors.push(&path, err.to_string());
                    }
                }
                validate_headers(&path, &e.headers, errors);
            }
        }
        MiddlewareConfig::AccessLog(log) => validate_log(path, log, errors),
        MiddlewareConfig::JournalLog(journal) => validate_log(path, &journal.log, errors),
    }
}

#[allow(clippy::too_many_arguments)]
fn validate_key_auth(
    path: &str,
    store: &str,
    headers: &[&String],
    codec: &CodecConfig,
    providers: &[ProviderConfig],
    with_id: bool,
    config: &GatewayConfig,
    errors: &mut Errors,
) {
    if !config.stores.contains_key(store) {
        errors.push(path, format!("unknown store {store:?}"));
    }
    for header in headers {
        if HeaderName::from_bytes(header.as_bytes()).is_err() {
            errors.push(path, format!("invalid header name {header:?}"));
        }
    }
    if let Some(hash) = &codec.hash {
        if let Err(e) = hash.parse::<HashAlg>() {
            errors.push(path, e.to_string());
        }
    } else if codec.hmac_key.is_some() {
        errors.push(path, "hmac_key requires hash");
    }
    if let Err(e) = codec.encoding.parse::<Encoding>() {
        errors.push(path, e.to_string());
    }
    if let Some(key) = &codec.cipher_key {
        match hex::decode(key) {
            Ok(bytes) if matches!(bytes.len(), 16 | 32) => {}
            _ => errors.push(path, "cipher_key must be 16 or 32 hex-encoded bytes"),
        }
    }
    for (i, provider) in providers.iter().enumerate() {
        let ppath = format!("{path}.providers[{i}]");
        let encoding = match provider {
            ProviderConfig::Env { id_prefix, encoding, .. } => {
                if with_id && id_prefix.is_none() {
                    errors.push(&ppath, "id_key env providers need id_prefix");
                }
                encoding
            }
            ProviderConfig::File { encoding, .. } => encoding,
        };
        if let Err(e) = encoding.parse::<Encoding>() {
            errors.push(&ppath, e.to_string());
        }
    }
}

fn validate_headers(path: &str, headers: &BTreeMap<String, String>, errors: &mut Errors) {
    for name in headers.keys() {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(path, format!("invalid header name {name:?}"));
        }
    }
}

fn validate_log(path: &str, log: &LogConfig, errors: &mut Errors) {
    if let Some(template) = &log.template {
        if let Err(e) = crate::observability::Template::parse(template) {
            errors.push(path, e.to_string());
        }
    }
}
