use crate::config::Targets;
use crate::error::{AggregateError, RunError, TargetFailure};
use crate::runner::TargetRunner;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// One target at a time, in name order.
    Serial,
    /// Every target at once.
    Concurrent,
}

/// Runs the same command against every configured target.
pub(crate) struct FanOut {
    runner: Arc<TargetRunner>,
}

impl FanOut {
    pub(crate) fn new(runner: Arc<TargetRunner>) -> Self {
        Self { runner }
    }

    /// Always visits every target; a failing one never stops the rest.
    pub(crate) async fn run_all(
        &self,
        targets: &Targets,
        extra_args: &[String],
        mode: Mode,
    ) -> Result<(), AggregateError> {
        debug!(event = "fanout.start", targets = targets.len(), mode = ?mode, "running targets");
        let failures = match mode {
            Mode::Serial => self.run_serial(targets, extra_args).await,
            Mode::Concurrent => self.run_concurrent(targets, extra_args).await,
        };
        match AggregateError::from_failures(failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_serial(&self, targets: &Targets, extra_args: &[String]) -> Vec<TargetFailure> {
        let mut failures = Vec::new();
        for target in targets.iter() {
            if let Err(error) = self.runner.run(target, extra_args).await {
                failures.push(failure(&target.name, error));
            }
        }
        failures
    }

    async fn run_concurrent(&self, targets: &Targets, extra_args: &[String]) -> Vec<TargetFailure> {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let extra_args: Arc<[String]> = extra_args.into();
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets.iter() {
            let runner = Arc::clone(&self.runner);
            let target = Arc::clone(target);
            let extra_args = Arc::clone(&extra_args);
            let failures = Arc::clone(&failures);
            let name = target.name.clone();
            let handle = tokio::spawn(async move {
                if let Err(error) = runner.run(&target, &extra_args).await {
                    failures.lock().await.push(failure(&target.name, error));
                }
            });
            handles.push((name, handle));
        }
        for (name, handle) in handles {
            if let Err(err) = handle.await {
                let error = RunError::Task(err.to_string());
                failures.lock().await.push(failure(&name, error));
            }
        }
        let collected = std::mem::take(&mut *failures.lock().await);
        collected
    }
}

fn failure(name: &str, error: RunError) -> TargetFailure {
    debug!(event = "target.failed", target_name = %name, error = %error, "target failed");
    TargetFailure {
        name: name.to_string(),
        error,
    }
}
