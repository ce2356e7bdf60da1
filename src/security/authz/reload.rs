//! Scheduled policy reload.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use casbin::CoreApi;
use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use super::adapter::{PolicyFeed, Refresh};
use super::{PolicyError, SharedEnforcer};
use crate::error::{GatewayError, GatewayResult};
use crate::lifecycle::Runner;
use crate::observability::metrics;

/// Re-loads an enforcer's policy on a cron schedule (seconds field first).
///
/// Rows are fetched without holding the enforcer lock; the write lock is
/// taken only to swap the rows in, so concurrent enforcement sees either
/// the old or the new policy. A failed fetch leaves the old policy loaded.
pub struct PolicyReloader {
    name: String,
    schedule: Schedule,
    enforcer: SharedEnforcer,
    feed: Option<Arc<PolicyFeed>>,
    reloads: AtomicU64,
}

impl PolicyReloader {
    pub fn new(
        name: impl Into<String>,
        cron: &str,
        enforcer: SharedEnforcer,
        feed: Option<Arc<PolicyFeed>>,
    ) -> GatewayResult<Self> {
        let name = name.into();
        let schedule = parse_schedule(cron).map_err(|e| GatewayError::create_object(&name, e))?;
        Ok(Self {
            name,
            schedule,
            enforcer,
            feed,
            reloads: AtomicU64::new(0),
        })
    }

    /// Successful reloads that changed the loaded policy.
    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub async fn reload(&self) -> Result<Refresh, PolicyError> {
        if let Some(feed) = &self.feed {
            if feed.refresh().await? == Refresh::Unchanged {
                return Ok(Refresh::Unchanged);
            }
        }
        let mut enforcer = self.enforcer.write().await;
        enforcer
            .load_policy()
            .await
            .map_err(|e| PolicyError::Engine(e.to_string()))?;
        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(Refresh::Updated)
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, PolicyError> {
    Schedule::from_str(expr).map_err(|e| PolicyError::Cron(format!("{expr:?}: {e}")))
}

#[async_trait]
impl Runner for PolicyReloader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken) -> GatewayResult<()> {
        tracing::info!(reloader = %self.name, "Policy reload scheduled");
        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                tracing::info!(reloader = %self.name, "Policy reload schedule exhausted");
                cancel.cancelled().await;
                return Ok(());
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }

            match self.reload().await {
                Ok(Refresh::Updated) => {
                    metrics::record_policy_reload("updated");
                    tracing::info!(reloader = %self.name, "Policy reloaded");
                }
                Ok(Refresh::Unchanged) => {
                    metrics::record_policy_reload("unchanged");
                    tracing::debug!(reloader = %self.name, "Policy unchanged");
                }
                Err(e) => {
                    metrics::record_policy_reload("error");
                    tracing::warn!(reloader = %self.name, error = %e, "Policy reload failed, keeping previous policy");
                }
            }
        }
    }
}
