//! Sequential saga execution with LIFO compensation.

use std::time::Instant;

use crate::error::SagaError;
use crate::step::{BalanceChange, SagaStep};

pub type BoxedStep = Box<dyn SagaStep>;

/// Runs saga steps in order and compensates the committed ones, newest
/// first, when a step fails.
///
/// Compensation is best-effort: a failing compensation is logged and
/// counted and the sweep continues with the next older step.
#[derive(Debug, Clone, Copy)]
pub struct SagaOrchestrator {
    saga_type: &'static str,
}

impl Default for SagaOrchestrator {
    fn default() -> Self {
        Self::new("generic")
    }
}

impl SagaOrchestrator {
    /// `saga_type` labels spans and metrics.
    pub fn new(saga_type: &'static str) -> Self {
        Self { saga_type }
    }

    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    /// Executes `steps` one at a time.
    ///
    /// On the first failing step, every previously committed step is
    /// compensated in reverse order and the step's error is returned. The
    /// failing step and the steps after it are never compensated.
    #[tracing::instrument(skip(self, steps), fields(saga_type = self.saga_type, steps = steps.len()))]
    pub async fn execute_saga(&self, steps: Vec<BoxedStep>) -> Result<CompletedSaga, SagaError> {
        metrics::counter!("saga_executions_total", "saga_type" => self.saga_type).increment(1);
        let started = Instant::now();
        let mut committed: Vec<BoxedStep> = Vec::with_capacity(steps.len());

        for mut step in steps {
            let name = step.name().to_string();
            tracing::debug!(step = %name, "saga step started");

            match step.execute().await {
                Ok(()) => {
                    tracing::debug!(step = %name, "saga step completed");
                    committed.push(step);
                }
                Err(cause) => {
                    tracing::warn!(step = %name, error = %cause, committed = committed.len(), "saga step failed, compensating");
                    let compensation_failures = compensate(self.saga_type, committed).await;

                    metrics::counter!("saga_failed_total", "saga_type" => self.saga_type).increment(1);
                    metrics::histogram!("saga_duration_seconds", "saga_type" => self.saga_type)
                        .record(started.elapsed().as_secs_f64());
                    return Err(SagaError::StepFailed {
                        step: name,
                        cause,
                        compensation_failures,
                    });
                }
            }
        }

        metrics::counter!("saga_completed_total", "saga_type" => self.saga_type).increment(1);
        metrics::histogram!("saga_duration_seconds", "saga_type" => self.saga_type)
            .record(started.elapsed().as_secs_f64());
        tracing::info!(steps = committed.len(), "saga completed");

        Ok(CompletedSaga {
            saga_type: self.saga_type,
            steps: committed,
        })
    }
}

/// Compensates `committed` newest first. Returns the number of failures.
async fn compensate(saga_type: &'static str, mut committed: Vec<BoxedStep>) -> usize {
    let mut failures = 0;
    while let Some(mut step) = committed.pop() {
        metrics::counter!("saga_compensations_total", "saga_type" => saga_type).increment(1);
        match step.compensate().await {
            Ok(()) => tracing::debug!(step = step.name(), "step compensated"),
            Err(error) => {
                failures += 1;
                metrics::counter!("saga_compensation_failures_total", "saga_type" => saga_type)
                    .increment(1);
                tracing::error!(step = step.name(), %error, "compensation failed, manual reconciliation required");
            }
        }
    }
    failures
}

/// The committed steps of a successful saga.
///
/// Dropping it keeps the saga committed; [`rollback`](Self::rollback)
/// compensates it.
pub struct CompletedSaga {
    saga_type: &'static str,
    steps: Vec<BoxedStep>,
}

impl CompletedSaga {
    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Balance changes in execution order.
    pub fn balance_changes(&self) -> Vec<BalanceChange> {
        self.steps
            .iter()
            .filter_map(|step| step.balance_change())
            .collect()
    }

    /// Compensates every step, newest first. Returns the number of
    /// compensations that failed.
    #[tracing::instrument(skip(self), fields(saga_type = self.saga_type, steps = self.steps.len()))]
    pub async fn rollback(self) -> usize {
        tracing::warn!("rolling back completed saga");
        compensate(self.saga_type, self.steps).await
    }
}

impl std::fmt::Debug for CompletedSaga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedSaga")
            .field("saga_type", &self.saga_type)
            .field("steps", &self.step_names())
            .finish()
    }
}
