//! Process entrypoint: initializers, concurrent runners, finalizers.
//!
//! # Data Flow
//! ```text
//! initializers (in order, first error aborts startup)
//!     → runners (concurrently, each with a child cancellation token)
//!     → first runner returns (or all of them, with wait_all)
//!     → cancel the rest and wait for them
//!     → finalizers (reverse order, errors logged)
//! ```
//!
//! The returned error is the first runner error; a finalizer error is only
//! surfaced when no runner failed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, GatewayResult};

#[async_trait]
pub trait Initializer: Send + Sync {
    fn name(&self) -> &str;
    async fn initialize(&self) -> GatewayResult<()>;
}

/// A long-running component. Returns when `cancel` fires or on failure.
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, cancel: CancellationToken) -> GatewayResult<()>;
}

#[async_trait]
pub trait Finalizer: Send + Sync {
    fn name(&self) -> &str;
    async fn finalize(&self) -> GatewayResult<()>;
}

/// When the entrypoint stops waiting for runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// The first runner to return stops the others.
    #[default]
    FirstDone,
    /// Wait for every runner to return.
    WaitAll,
}

#[derive(Default)]
pub struct Entrypoint {
    initializers: Vec<Arc<dyn Initializer>>,
    runners: Vec<Arc<dyn Runner>>,
    finalizers: Vec<Arc<dyn Finalizer>>,
    policy: WaitPolicy,
}

impl Entrypoint {
    pub fn new(policy: WaitPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn add_initializer(&mut self, i: Arc<dyn Initializer>) -> &mut Self {
        self.initializers.push(i);
        self
    }

    pub fn add_runner(&mut self, r: Arc<dyn Runner>) -> &mut Self {
        self.runners.push(r);
        self
    }

    pub fn add_finalizer(&mut self, f: Arc<dyn Finalizer>) -> &mut Self {
        self.finalizers.push(f);
        self
    }

    pub fn runner_names(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.name()).collect()
    }

    /// Run to completion. `parent` cancels every runner.
    pub async fn run(self, parent: CancellationToken) -> GatewayResult<()> {
        for init in &self.initializers {
            tracing::debug!(initializer = %init.name(), "Initializing");
            if let Err(e) = init.initialize().await {
                tracing::error!(initializer = %init.name(), error = %e, "Initialization failed");
                self.finalize().await;
                return Err(e);
            }
        }

        let cancel = parent.child_token();
        let mut tasks = JoinSet::new();
        for runner in &self.runners {
            let runner = runner.clone();
            let token = cancel.child_token();
            tasks.spawn(async move {
                let name = runner.name().to_string();
                tracing::info!(runner = %name, "Runner started");
                let result = runner.run(token).await;
                (name, result)
            });
        }

        let mut first_error: Option<GatewayError> = None;
        let mut record = |outcome: Result<(String, GatewayResult<()>), tokio::task::JoinError>| match outcome {
            Ok((name, Ok(()))) => tracing::info!(runner = %name, "Runner stopped"),
            Ok((name, Err(e))) => {
                tracing::error!(runner = %name, kind = %e.kind(), error = %e, "Runner failed");
                first_error.get_or_insert(GatewayError::EntrypointRun {
                    runner: name,
                    reason: e.to_string(),
                });
            }
            Err(join) => {
                tracing::error!(error = %join, "Runner task aborted");
                first_error.get_or_insert(GatewayError::EntrypointRun {
                    runner: "unknown".to_string(),
                    reason: join.to_string(),
                });
            }
        };

        if self.policy == WaitPolicy::FirstDone {
            if let Some(outcome) = tasks.join_next().await {
                record(outcome);
            }
            cancel.cancel();
        }
        while let Some(outcome) = tasks.join_next().await {
            record(outcome);
        }
        cancel.cancel();

        let finalize_error = self.finalize().await;
        match (first_error, finalize_error) {
            (Some(e), _) => Err(e),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        }
    }

    /// Run finalizers in reverse registration order. Returns the first error.
    async fn finalize(&self) -> Option<GatewayError> {
        let mut first = None;
        for fin in self.finalizers.iter().rev() {
            if let Err(e) = fin.finalize().await {
                tracing::error!(finalizer = %fin.name(), error = %e, "Finalizer failed");
                first.get_or_insert(e);
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Step(&'static str, Log, bool);

    #[async_trait]
    impl Initializer for Step {
        fn name(&self) -> &str {
            self.0
        }
        async fn initialize(&self) -> GatewayResult<()> {
            self.1.lock().unwrap().push(format!("init:{}", self.0));
            if self.2 {
                return Err(GatewayError::create_object(self.0, "boom"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Finalizer for Step {
        fn name(&self) -> &str {
            self.0
        }
        async fn finalize(&self) -> GatewayResult<()> {
            self.1.lock().unwrap().push(format!("fin:{}", self.0));
            if self.2 {
                return Err(GatewayError::create_object(self.0, "fin failed"));
            }
            Ok(())
        }
    }

    /// Returns after `after`, or waits for cancellation when `None`.
    struct Task(&'static str, Log, Option<Duration>, bool);

    #[async_trait]
    impl Runner for Task {
        fn name(&self) -> &str {
            self.0
        }
        async fn run(&self, cancel: CancellationToken) -> GatewayResult<()> {
            match self.2 {
                Some(after) => tokio::time::sleep(after).await,
                None => cancel.cancelled().await,
            }
            self.1.lock().unwrap().push(format!("done:{}", self.0));
            if self.3 {
                return Err(GatewayError::create_object(self.0, "runner failed"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_done_cancels_the_rest_then_finalizes_in_reverse() {
        let log: Log = Arc::default();
        let mut ep = Entrypoint::new(WaitPolicy::FirstDone);
        ep.add_initializer(Arc::new(Step("a", log.clone(), false)))
            .add_initializer(Arc::new(Step("b", log.clone(), false)))
            .add_runner(Arc::new(Task("quick", log.clone(), Some(Duration::from_millis(10)), false)))
            .add_runner(Arc::new(Task("server", log.clone(), None, false)))
            .add_finalizer(Arc::new(Step("x", log.clone(), false)))
            .add_finalizer(Arc::new(Step("y", log.clone(), false)));

        ep.run(CancellationToken::new()).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["init:a", "init:b", "done:quick", "done:server", "fin:y", "fin:x"]
        );
    }

    #[tokio::test]
    async fn initializer_failure_short_circuits() {
        let log: Log = Arc::default();
        let mut ep = Entrypoint::new(WaitPolicy::FirstDone);
        ep.add_initializer(Arc::new(Step("a", log.clone(), true)))
            .add_initializer(Arc::new(Step("b", log.clone(), false)))
            .add_runner(Arc::new(Task("never", log.clone(), None, false)));
        assert!(ep.run(CancellationToken::new()).await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["init:a"]);
    }

    #[tokio::test]
    async fn runner_error_wins_over_finalizer_error() {
        let log: Log = Arc::default();
        let mut ep = Entrypoint::new(WaitPolicy::WaitAll);
        ep.add_runner(Arc::new(Task("bad", log.clone(), Some(Duration::from_millis(1)), true)))
            .add_runner(Arc::new(Task("good", log.clone(), Some(Duration::from_millis(20)), false)))
            .add_finalizer(Arc::new(Step("f", log.clone(), true)));
        let err = ep.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::EntrypointRun { ref runner, .. } if runner == "bad"));
        // wait_all lets the slower runner finish on its own.
        assert!(log.lock().unwrap().contains(&"done:good".to_string()));
    }

    #[tokio::test]
    async fn finalizer_error_surfaces_without_runner_error() {
        let log: Log = Arc::default();
        let mut ep = Entrypoint::new(WaitPolicy::FirstDone);
        ep.add_runner(Arc::new(Task("r", log.clone(), None, false)))
            .add_finalizer(Arc::new(Step("f", log.clone(), true)));
        let parent = CancellationToken::new();
        parent.cancel();
        assert!(matches!(
            ep.run(parent).await,
            Err(GatewayError::CreateObject { .. })
        ));
    }
}
