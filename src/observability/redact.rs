//! Redaction of logged query values, headers and bodies.
//!
//! Replacers are applied in declaration order. Query replacers are keyed by
//! parameter name, header replacers by canonical header name and body
//! replacers by MIME type. JSON bodies may additionally be rewritten at
//! dotted paths (`user.password`, `items.0.token`).

use std::collections::{BTreeMap, HashMap};

use axum::http::HeaderMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;
use crate::http::canonical_header_key;

/// Replacer configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplacerConfig {
    /// Replace every match of `pattern` with `with` (supports `$1`).
    Regex { pattern: String, with: String },
    /// Replace the whole value.
    Fixed { with: String },
    /// Replace the whole value with its hex SHA-256 digest.
    Sha256,
}

#[derive(Debug, Clone)]
pub enum Replacer {
    Regex { re: Regex, with: String },
    Fixed(String),
    Sha256,
}

impl Replacer {
    pub fn from_config(cfg: &ReplacerConfig) -> Result<Self, GatewayError> {
        Ok(match cfg {
            ReplacerConfig::Regex { pattern, with } => Replacer::Regex {
                re: Regex::new(pattern)
                    .map_err(|e| GatewayError::create_object("replacer", e))?,
                with: with.clone(),
            },
            ReplacerConfig::Fixed { with } => Replacer::Fixed(with.clone()),
            ReplacerConfig::Sha256 => Replacer::Sha256,
        })
    }

    pub fn apply(&self, input: &str) -> String {
        match self {
            Replacer::Regex { re, with } => re.replace_all(input, with.as_str()).into_owned(),
            Replacer::Fixed(with) => with.clone(),
            Replacer::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

fn apply_all(replacers: &[Replacer], input: &str) -> String {
    replacers
        .iter()
        .fold(input.to_string(), |acc, r| r.apply(&acc))
}

fn build_all(cfgs: &[ReplacerConfig]) -> Result<Vec<Replacer>, GatewayError> {
    cfgs.iter().map(Replacer::from_config).collect()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueryRedaction {
    pub name: String,
    pub replacers: Vec<ReplacerConfig>,
}

/// A header to emit. `name = "*"` emits every header.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HeaderRedaction {
    pub name: String,
    #[serde(default)]
    pub replacers: Vec<ReplacerConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BodyRedaction {
    pub mime: String,
    #[serde(default)]
    pub replacers: Vec<ReplacerConfig>,
    #[serde(default)]
    pub json_paths: Vec<JsonPathRedaction>,
}

/// Rewrite the JSON value at `path`: its JSON text is matched against
/// `pattern` and replaced with `with`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JsonPathRedaction {
    pub path: String,
    #[serde(default = "match_all")]
    pub pattern: String,
    pub with: String,
}

fn match_all() -> String {
    "^.*$".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RedactConfig {
    #[serde(default)]
    pub queries: Vec<QueryRedaction>,
    #[serde(default)]
    pub headers: Vec<HeaderRedaction>,
    #[serde(default)]
    pub bodies: Vec<BodyRedaction>,
}

#[derive(Debug, Clone)]
struct JsonPathReplacer {
    path: Vec<String>,
    re: Regex,
    with: String,
}

impl JsonPathReplacer {
    fn apply(&self, root: &mut Value) {
        let mut cur = root;
        for key in &self.path {
            let next = match cur {
                Value::Object(map) => map.get_mut(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
                _ => None,
            };
            match next {
                Some(v) => cur = v,
                None => return,
            }
        }
        let raw = cur.to_string();
        let replaced = self.re.replace_all(&raw, self.with.as_str());
        *cur = serde_json::from_str(&replaced).unwrap_or_else(|_| Value::String(replaced.into_owned()));
    }
}

#[derive(Debug, Clone, Default)]
struct BodyRules {
    replacers: Vec<Replacer>,
    json: Vec<JsonPathReplacer>,
}

#[derive(Debug, Clone, Default)]
pub struct Redactor {
    queries: HashMap<String, Vec<Replacer>>,
    all_headers: bool,
    headers: HashMap<String, Vec<Replacer>>,
    bodies: HashMap<String, BodyRules>,
}

impl Redactor {
    pub fn new(cfg: &RedactConfig) -> Result<Self, GatewayError> {
        let mut redactor = Redactor::default();
        for q in &cfg.queries {
            redactor.queries.insert(q.name.clone(), build_all(&q.replacers)?);
        }
        for h in &cfg.headers {
            if h.name == "*" {
                redactor.all_headers = true;
                continue;
            }
            redactor
                .headers
                .insert(canonical_header_key(&h.name), build_all(&h.replacers)?);
        }
        for b in &cfg.bodies {
            let mut rules = BodyRules {
                replacers: build_all(&b.replacers)?,
                json: Vec::new(),
            };
            for jp in &b.json_paths {
                rules.json.push(JsonPathReplacer {
                    path: jp.path.split('.').map(str::to_string).collect(),
                    re: Regex::new(&jp.pattern).map_err(|e| GatewayError::create_object("replacer", e))?,
                    with: jp.with.clone(),
                });
            }
            redactor.bodies.insert(b.mime.to_ascii_lowercase(), rules);
        }
        Ok(redactor)
    }

    /// Redact the raw query string. Parameter order is preserved.
    pub fn query(&self, raw: &str) -> String {
        if self.queries.is_empty() || raw.is_empty() {
            return raw.to_string();
        }
        let mut out = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
            match self.queries.get(k.as_ref()) {
                Some(replacers) => out.append_pair(&k, &apply_all(replacers, &v)),
                None => out.append_pair(&k, &v),
            };
        }
        out.finish()
    }

    /// The headers selected for logging, keyed by canonical name.
    pub fn headers(&self, headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            let key = canonical_header_key(name.as_str());
            let replacers = self.headers.get(&key);
            if replacers.is_none() && !self.all_headers {
                continue;
            }
            let value = String::from_utf8_lossy(value.as_bytes());
            let value = match replacers {
                Some(r) => apply_all(r, &value),
                None => value.into_owned(),
            };
            out.entry(key).or_default().push(value);
        }
        out
    }

    /// Redact a captured body of the given MIME type.
    pub fn body(&self, mime: &str, body: &[u8]) -> Vec<u8> {
        let Some(rules) = self.bodies.get(&mime.to_ascii_lowercase()) else {
            return body.to_vec();
        };
        let mut out = body.to_vec();
        if !rules.json.is_empty() {
            if let Ok(mut value) = serde_json::from_slice::<Value>(&out) {
                for jp in &rules.json {
                    jp.apply(&mut value);
                }
                out = value.to_string().into_bytes();
            }
        }
        if !rules.replacers.is_empty() {
            out = apply_all(&rules.replacers, &String::from_utf8_lossy(&out)).into_bytes();
        }
        out
    }
}

/// The MIME essence of a Content-Type value: `text/html; charset=utf-8`
/// becomes `text/html`.
pub fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
