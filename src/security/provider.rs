//! Credential providers: environment variables and key files.
//!
//! Providers only read key material. [`CredentialLoader`] seals every entry
//! with the shared [`SecretCodec`] and writes it to the store once the store
//! is open, failing startup on duplicate ids.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::credential::{Credential, Encoding, SecretCodec};
use crate::error::{GatewayError, GatewayResult};
use crate::kvs::Store;
use crate::lifecycle::Initializer;

/// One key as read from a provider. `id` is set for ID+Key credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEntry {
    pub id: Option<String>,
    pub key: Vec<u8>,
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &str;
    fn entries(&self) -> GatewayResult<Vec<KeyEntry>>;
}

fn provider_error(name: &str, reason: impl std::fmt::Display) -> GatewayError {
    GatewayError::create_object(name, reason)
}

fn parse_attrs(name: &str, text: &str) -> GatewayResult<serde_json::Map<String, serde_json::Value>> {
    serde_json::from_str(text).map_err(|e| provider_error(name, format!("attributes {text:?}: {e}")))
}

/// Reads `<key_prefix><n>` (and `<id_prefix><n>`) variables.
#[derive(Debug, Clone)]
pub struct EnvProvider {
    name: String,
    key_prefix: String,
    id_prefix: Option<String>,
    encoding: Encoding,
}

impl EnvProvider {
    pub fn new(name: impl Into<String>, key_prefix: impl Into<String>, id_prefix: Option<String>, encoding: Encoding) -> Self {
        Self {
            name: name.into(),
            key_prefix: key_prefix.into(),
            id_prefix,
            encoding,
        }
    }

    /// Group variables by their trailing integer.
    pub fn entries_from<I>(&self, vars: I) -> GatewayResult<Vec<KeyEntry>>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let index = |name: &str, prefix: &str| -> Option<u64> {
            name.strip_prefix(prefix).and_then(|tail| tail.parse().ok())
        };

        let mut keys = BTreeMap::new();
        let mut ids = BTreeMap::new();
        for (name, value) in vars {
            if let Some(n) = index(&name, &self.key_prefix) {
                keys.insert(n, value);
            } else if let Some(n) = self.id_prefix.as_deref().and_then(|p| index(&name, p)) {
                ids.insert(n, value);
            }
        }

        let mut entries = Vec::with_capacity(keys.len());
        for (n, value) in keys {
            let key = self
                .encoding
                .decode(&value)
                .map_err(|e| provider_error(&self.name, format!("{}{n}: {e}", self.key_prefix)))?;
            let id = match &self.id_prefix {
                None => None,
                Some(prefix) => Some(
                    ids.remove(&n)
                        .ok_or_else(|| provider_error(&self.name, format!("{}{n} has no {prefix}{n}", self.key_prefix)))?,
                ),
            };
            entries.push(KeyEntry {
                id,
                key,
                attrs: Default::default(),
            });
        }
        if let (Some(prefix), Some(n)) = (&self.id_prefix, ids.keys().next()) {
            return Err(provider_error(&self.name, format!("{prefix}{n} has no {}{n}", self.key_prefix)));
        }
        Ok(entries)
    }
}

impl CredentialProvider for EnvProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn entries(&self) -> GatewayResult<Vec<KeyEntry>> {
        self.entries_from(std::env::vars())
    }
}

/// Reads line-oriented key files.
///
/// ```text
/// # comment
/// key
/// key:{"role":"admin"}
/// id:key
/// id:key:{"role":"admin"}
/// ```
#[derive(Debug, Clone)]
pub struct FileProvider {
    name: String,
    paths: Vec<PathBuf>,
    with_id: bool,
    encoding: Encoding,
}

impl FileProvider {
    pub fn new(name: impl Into<String>, paths: Vec<PathBuf>, with_id: bool, encoding: Encoding) -> Self {
        Self {
            name: name.into(),
            paths,
            with_id,
            encoding,
        }
    }

    pub fn parse(&self, text: &str) -> GatewayResult<Vec<KeyEntry>> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let at = |reason: String| provider_error(&self.name, format!("line {}: {reason}", lineno + 1));

            let (id, key, attrs) = if self.with_id {
                let mut parts = line.splitn(3, ':');
                let id = parts.next().unwrap_or_default();
                let key = parts.next().ok_or_else(|| at("expected id:key".to_string()))?;
                (Some(id.to_string()), key, parts.next())
            } else {
                match line.split_once(':') {
                    Some((key, attrs)) => (None, key, Some(attrs)),
                    None => (None, line, None),
                }
            };
            if key.is_empty() || id.as_deref() == Some("") {
                return Err(at("empty id or key".to_string()));
            }

            let key = self.encoding.decode(key).map_err(|e| at(e.to_string()))?;
            let attrs = match attrs {
                Some(text) => parse_attrs(&self.name, text)?,
                None => Default::default(),
            };
            entries.push(KeyEntry { id, key, attrs });
        }
        Ok(entries)
    }
}

impl CredentialProvider for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn entries(&self) -> GatewayResult<Vec<KeyEntry>> {
        let mut entries = Vec::new();
        for path in &self.paths {
            let text = std::fs::read_to_string(path)
                .map_err(|e| provider_error(&self.name, format!("{}: {e}", path.display())))?;
            entries.extend(self.parse(&text)?);
        }
        Ok(entries)
    }
}

/// Startup step that fills a credential store from providers.
pub struct CredentialLoader {
    name: String,
    store: Arc<dyn Store<Credential>>,
    codec: Arc<SecretCodec>,
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialLoader {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn Store<Credential>>,
        codec: Arc<SecretCodec>,
        providers: Vec<Box<dyn CredentialProvider>>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            codec,
            providers,
        }
    }
}

#[async_trait]
impl Initializer for CredentialLoader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> GatewayResult<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            let entries = provider.entries()?;
            let count = entries.len();
            for entry in entries {
                let id = match entry.id {
                    Some(id) => id,
                    None => self.codec.lookup_id(&entry.key),
                };
                if !seen.insert(id.clone()) {
                    return Err(provider_error(
                        provider.name(),
                        format!("duplicate credential id {id:?}"),
                    ));
                }
                let secret = self
                    .codec
                    .seal(&entry.key)
                    .map_err(|e| provider_error(provider.name(), e))?;
                self.store
                    .set(&id, Credential {
                        secret,
                        attrs: entry.attrs,
                    })
                    .await?;
            }
            tracing::info!(loader = %self.name, provider = %provider.name(), credentials = count, "Credentials loaded");
        }
        Ok(())
    }
}
