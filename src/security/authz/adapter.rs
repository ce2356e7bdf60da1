//! Policy persistence for the Casbin enforcer.
//!
//! A [`PolicyFeed`] owns the fetch: it reads rows from a file or an HTTP
//! endpoint and keeps the last good set. [`RowAdapter`] is the engine-facing
//! side and only replays the cached rows into the model, so the enforcer's
//! write lock is never held across network I/O.
//!
//! ```text
//! reload tick → feed.refresh() (no lock) → Updated? → enforcer.write().load_policy()
//!                                                        → adapter replays cached rows
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode, Uri};
use bytes::Bytes;
use casbin::{Adapter, Filter, Model};
use http_body_util::BodyExt;
use parking_lot::Mutex;

use super::format::{PolicyFormat, PolicyRow};
use super::PolicyError;
use crate::http::{round_trip, Tripper};

/// Where policy rows come from.
#[derive(Clone)]
pub enum PolicySource {
    File { path: PathBuf, format: PolicyFormat },
    Http { url: Uri, tripper: Tripper, timeout: Duration },
}

impl PolicySource {
    /// A file source; the format follows the extension.
    pub fn file(path: impl Into<PathBuf>) -> Result<Self, PolicyError> {
        let path = path.into();
        let format = PolicyFormat::from_path(&path)?;
        Ok(PolicySource::File { path, format })
    }

    pub fn describe(&self) -> String {
        match self {
            PolicySource::File { path, .. } => path.display().to_string(),
            PolicySource::Http { url, .. } => url.to_string(),
        }
    }
}

/// Result of a conditional GET.
pub(crate) enum Fetched {
    NotModified,
    Body { body: Bytes, headers: HeaderMap },
}

/// GET `url` through `tripper`. Non-2xx answers other than 304 are errors.
pub(crate) async fn http_get(
    tripper: &Tripper,
    url: &Uri,
    timeout: Duration,
    validators: &HeaderMap,
) -> Result<Fetched, PolicyError> {
    let mut req = Request::get(url.clone())
        .body(Body::empty())
        .map_err(|e| PolicyError::Http(e.to_string()))?;
    req.headers_mut().extend(validators.clone());

    let fetch = async {
        let res = round_trip(tripper, req)
            .await
            .map_err(|e| PolicyError::Http(e.to_string()))?;
        if res.status() == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        if !res.status().is_success() {
            return Err(PolicyError::Status(res.status().as_u16()));
        }
        let (parts, body) = res.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| PolicyError::Http(e.to_string()))?
            .to_bytes();
        Ok(Fetched::Body {
            body,
            headers: parts.headers,
        })
    };
    tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| PolicyError::Timeout(timeout))?
}

/// Essence of a `Content-Type` header: `text/csv; charset=utf-8` → `text/csv`.
pub(crate) fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Whether a refresh produced rows different from the cached ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Updated,
    Unchanged,
}

pub struct PolicyFeed {
    source: PolicySource,
    rows: ArcSwap<Vec<PolicyRow>>,
    /// `If-None-Match` / `If-Modified-Since` for the next HTTP fetch.
    validators: Mutex<HeaderMap>,
    loaded: AtomicBool,
    fetches: AtomicU64,
}

impl PolicyFeed {
    pub fn new(source: PolicySource) -> Self {
        Self {
            source,
            rows: ArcSwap::from_pointee(Vec::new()),
            validators: Mutex::new(HeaderMap::new()),
            loaded: Default::default(),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &PolicySource {
        &self.source
    }

    /// The last successfully fetched rows.
    pub fn rows(&self) -> Arc<Vec<PolicyRow>> {
        self.rows.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Number of fetch attempts so far, successful or not.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Fetch rows from the source. On error the cached rows stay in place.
    pub async fn refresh(&self) -> Result<Refresh, PolicyError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let rows = match &self.source {
            PolicySource::File { path, format } => {
                let data = tokio::fs::read(path)
                    .await
                    .map_err(|e| PolicyError::Io(format!("{}: {e}", path.display())))?;
                format.parse(&data)?
            }
            PolicySource::Http { url, tripper, timeout } => {
                let validators = self.validators.lock().clone();
                match http_get(tripper, url, *timeout, &validators).await? {
                    Fetched::NotModified => {
                        tracing::debug!(source = %url, "Policy not modified");
                        return Ok(Refresh::Unchanged);
                    }
                    Fetched::Body { body, headers } => {
                        let rows = PolicyFormat::from_content_type(&content_type(&headers))?.parse(&body)?;
                        self.remember_validators(&headers);
                        rows
                    }
                }
            }
        };

        let changed = !self.is_loaded() || *self.rows.load_full() != rows;
        tracing::debug!(source = %self.source.describe(), rows = rows.len(), changed, "Policy fetched");
        self.rows.store(Arc::new(rows));
        self.loaded.store(true, Ordering::Release);
        Ok(if changed { Refresh::Updated } else { Refresh::Unchanged })
    }

    fn remember_validators(&self, headers: &HeaderMap) {
        let mut validators = HeaderMap::new();
        if let Some(etag) = headers.get(header::ETAG) {
            validators.insert(header::IF_NONE_MATCH, etag.clone());
        }
        if let Some(modified) = headers.get(header::LAST_MODIFIED) {
            validators.insert(header::IF_MODIFIED_SINCE, modified.clone());
        }
        *self.validators.lock() = validators;
    }
}

fn adapter_error(e: PolicyError) -> casbin::Error {
    casbin::Error::AdapterError(casbin::error::AdapterError(Box::new(e)))
}

/// Read-only adapter replaying a [`PolicyFeed`] into the model. Persistence
/// calls answer "not implemented": the file or endpoint is the source of truth.
pub struct RowAdapter {
    feed: Arc<PolicyFeed>,
    filtered: bool,
}

impl RowAdapter {
    pub fn new(feed: Arc<PolicyFeed>) -> Self {
        Self { feed, filtered: false }
    }

    pub fn feed(&self) -> &Arc<PolicyFeed> {
        &self.feed
    }

    async fn ensure_loaded(&self) -> casbin::Result<()> {
        if !self.feed.is_loaded() {
            self.feed.refresh().await.map_err(adapter_error)?;
        }
        Ok(())
    }

    fn replay(&self, m: &mut dyn Model, keep: impl Fn(&PolicyRow, &[String]) -> bool) -> usize {
        let mut added = 0;
        for row in self.feed.rows().iter() {
            let rule = row.rule();
            if !keep(row, &rule) {
                continue;
            }
            if m.add_policy(row.section(), &row.p_type, rule) {
                added += 1;
            }
        }
        added
    }
}

/// Casbin filter semantics: every non-empty filter value must equal the rule
/// value at the same index.
fn matches_filter(filter: &[&str], rule: &[String]) -> bool {
    filter
        .iter()
        .enumerate()
        .all(|(i, want)| want.is_empty() || rule.get(i).is_some_and(|have| have == want))
}

fn not_implemented(op: &str) -> casbin::Error {
    adapter_error(PolicyError::NotImplemented(op.to_string()))
}

#[async_trait]
impl Adapter for RowAdapter {
    async fn load_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        self.ensure_loaded().await?;
        self.filtered = false;
        let added = self.replay(m, |_, _| true);
        tracing::debug!(source = %self.feed.source().describe(), rules = added, "Policy loaded");
        Ok(())
    }

    async fn load_filtered_policy<'a>(&mut self, m: &mut dyn Model, f: Filter<'a>) -> casbin::Result<()> {
        self.ensure_loaded().await?;
        self.filtered = true;
        self.replay(m, |row, rule| match row.section() {
            "p" => matches_filter(&f.p, rule),
            "g" => matches_filter(&f.g, rule),
            _ => true,
        });
        Ok(())
    }

    async fn save_policy(&mut self, _m: &mut dyn Model) -> casbin::Result<()> {
        Err(not_implemented("save_policy"))
    }

    async fn clear_policy(&mut self) -> casbin::Result<()> {
        Err(not_implemented("clear_policy"))
    }

    fn is_filtered(&self) -> bool {
        self.filtered
    }

    async fn add_policy(&mut self, _sec: &str, _ptype: &str, _rule: Vec<String>) -> casbin::Result<bool> {
        Err(not_implemented("add_policy"))
    }

    async fn add_policies(&mut self, _sec: &str, _ptype: &str, _rules: Vec<Vec<String>>) -> casbin::Result<bool> {
        Err(not_implemented("add_policies"))
    }

    async fn remove_policy(&mut self, _sec: &str, _ptype: &str, _rule: Vec<String>) -> casbin::Result<bool> {
        Err(not_implemented("remove_policy"))
    }

    async fn remove_policies(&mut self, _sec: &str, _ptype: &str, _rules: Vec<Vec<String>>) -> casbin::Result<bool> {
        Err(not_implemented("remove_policies"))
    }

    async fn remove_filtered_policy(
        &mut self,
        _sec: &str,
        _ptype: &str,
        _field_index: usize,
        _field_values: Vec<String>,
    ) -> casbin::Result<bool> {
        Err(not_implemented("remove_filtered_policy"))
    }
}
