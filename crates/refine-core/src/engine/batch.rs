//! Parallel execution of one batch of repair tasks.
//!
//! Every task runs in its own `tokio` task, gated by a semaphore of
//! `max_concurrent_patchers` permits. Workers see a read-only snapshot of the
//! content and return their result through their own `JoinHandle`; nothing is
//! written to shared state. An [`AbortSignal`] stops in-flight work when the
//! deadline passes or the shared token counter reaches the budget.
//!
//! A `FULL_REGENERATE` never runs next to other tasks: a worker in a shared
//! batch hands it back as [`TaskResult::Deferred`] and the controller re-runs
//! it alone once the siblings have merged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::domain::content::{LessonContent, SectionId};
use crate::domain::issue::{FixAction, Issue};
use crate::domain::outcome::TaskFailure;
use crate::domain::plan::SectionRefinementTask;
use crate::domain::rubric::Criterion;
use crate::events::{ProgressEmitter, ProgressEvent};
use crate::executors::{ExecutionOutcome, Executors, PatchResult, RestartSignal};
use crate::metrics::METRICS;
use crate::router::{RouteReason, Router, RouterDecision};
use crate::verifier::{DeltaCheck, DeltaVerifier};

/// Broadcast abort flag shared by the workers of one batch.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone: the signal can never fire.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Run-wide token counter shared with workers.
#[derive(Debug, Clone)]
pub struct TokenMeter {
    used: Arc<AtomicU64>,
    max: u64,
}

impl TokenMeter {
    pub fn new(used: u64, max: u64) -> Self {
        Self {
            used: Arc::new(AtomicU64::new(used)),
            max,
        }
    }

    /// Add usage; returns `true` once the budget is exhausted.
    pub fn add(&self, tokens: u64) -> bool {
        let total = self.used.fetch_add(tokens, Ordering::Relaxed) + tokens;
        total >= self.max
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> u64 {
        self.max.saturating_sub(self.used())
    }
}

/// Per-task input prepared by the controller.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub task: SectionRefinementTask,
    /// True while the section has not been edited in this run.
    pub prefer_surgical: bool,
    /// Criteria whose post-patch scores the verifier must report.
    pub criteria: Vec<Criterion>,
    /// Skip routing and run this action, e.g. a deferred full regeneration.
    pub pinned: Option<(FixAction, RouteReason)>,
}

/// What a worker produced.
#[derive(Debug, Clone)]
pub enum TaskResult {
    /// Patch passed verification; the controller still applies quality locks.
    Verified { patch: PatchResult, check: DeltaCheck },
    Restart(RestartSignal),
    Failed(TaskFailure),
    /// Full regeneration routed inside a shared batch; not executed.
    Deferred { action: FixAction, reason: RouteReason },
}

/// Result slot of one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub section_id: SectionId,
    pub task: SectionRefinementTask,
    pub result: TaskResult,
    pub tokens_used: u64,
    pub attempts: u32,
    /// Issues the verifier reported on the last attempt.
    pub new_issues: Vec<Issue>,
}

/// Shared, read-only dependencies of a batch.
#[derive(Clone)]
pub struct BatchContext {
    pub iteration: u32,
    pub router: Router,
    pub executors: Executors,
    pub verifier: DeltaVerifier,
    pub emitter: ProgressEmitter,
    pub source_materials: Arc<Vec<String>>,
    pub max_concurrent: usize,
    pub deadline: Instant,
}

/// Execute one batch and wait for every task to finish or abort.
///
/// Reports come back in task order.
#[instrument(skip_all, fields(iteration = ctx.iteration, tasks = inputs.len()))]
pub async fn execute_batch(
    ctx: &BatchContext,
    inputs: Vec<TaskInput>,
    content: Arc<LessonContent>,
    meter: &TokenMeter,
    abort: &AbortSignal,
) -> Vec<TaskReport> {
    let sem = Arc::new(Semaphore::new(ctx.max_concurrent.max(1)));
    let shared = inputs.len() > 1;
    let mut handles = Vec::with_capacity(inputs.len());
    let mut fallbacks = Vec::with_capacity(inputs.len());

    for input in inputs {
        fallbacks.push(input.task.clone());
        let ctx = ctx.clone();
        let content = Arc::clone(&content);
        let meter = meter.clone();
        let abort = abort.clone();
        let sem = Arc::clone(&sem);

        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let section_id = input.task.section_id.clone();
            let task = input.task.clone();

            if abort.is_triggered() {
                return cancelled(section_id, task);
            }

            let worker = Worker {
                ctx: &ctx,
                content: &content,
                meter: &meter,
                abort: &abort,
                shared,
            };
            tokio::select! {
                biased;
                _ = abort.cancelled() => cancelled(section_id, task),
                _ = tokio::time::sleep_until(ctx.deadline) => {
                    abort.trigger();
                    cancelled(section_id, task)
                }
                report = worker.run(input) => report,
            }
        }));
    }

    let joined = futures::future::join_all(handles).await;
    joined
        .into_iter()
        .zip(fallbacks)
        .map(|(res, task)| match res {
            Ok(report) => report,
            Err(e) => {
                warn!(section = %task.section_id, error = %e, "worker did not complete");
                TaskReport {
                    section_id: task.section_id.clone(),
                    result: TaskResult::Failed(TaskFailure::PatchFailed {
                        reason: format!("worker failed: {e}"),
                    }),
                    task,
                    tokens_used: 0,
                    attempts: 0,
                    new_issues: vec![],
                }
            }
        })
        .collect()
}

fn cancelled(section_id: SectionId, task: SectionRefinementTask) -> TaskReport {
    TaskReport {
        section_id,
        task,
        result: TaskResult::Failed(TaskFailure::Cancelled),
        tokens_used: 0,
        attempts: 0,
        new_issues: vec![],
    }
}

struct Worker<'a> {
    ctx: &'a BatchContext,
    content: &'a LessonContent,
    meter: &'a TokenMeter,
    abort: &'a AbortSignal,
    shared: bool,
}

impl Worker<'_> {
    fn charge(&self, tokens: u64) {
        if self.meter.add(tokens) {
            self.abort.trigger();
        }
    }

    /// Route, execute and verify, retrying once one rung up the ladder.
    async fn run(&self, input: TaskInput) -> TaskReport {
        METRICS.inc_tasks_executed();
        let task = &input.task;
        let mut decision = match input.pinned {
            Some((action, reason)) => {
                self.ctx
                    .router
                    .decide(task, action, reason, self.meter.remaining())
            }
            None => self
                .ctx
                .router
                .route(task, self.meter.remaining(), input.prefer_surgical),
        };
        let mut tokens_used = 0;
        let mut attempts = 0;
        let mut new_issues = Vec::new();

        let result = loop {
            if self.shared && decision.action == FixAction::FullRegenerate {
                break TaskResult::Deferred {
                    action: decision.action,
                    reason: decision.reason,
                };
            }
            attempts += 1;
            if !decision.fits_budget {
                break TaskResult::Failed(TaskFailure::BudgetExceeded);
            }
            self.started(&decision, attempts);

            let outcome = self
                .ctx
                .executors
                .execute(
                    &decision,
                    self.content,
                    &self.ctx.source_materials,
                    self.meter.remaining(),
                )
                .await;
            let patch = match outcome {
                ExecutionOutcome::Restart(signal) => break TaskResult::Restart(signal),
                ExecutionOutcome::Patched(patch) => patch,
            };
            tokens_used += patch.tokens_used;
            self.charge(patch.tokens_used);

            let failure = if patch.success {
                let check = self
                    .ctx
                    .verifier
                    .verify(task, &patch, input.criteria.clone())
                    .await;
                tokens_used += check.outcome.tokens_used;
                self.charge(check.outcome.tokens_used);
                self.verified(task, &check);
                new_issues = check.outcome.new_issues.clone();
                if check.accepted {
                    METRICS.inc_patches_accepted();
                    break TaskResult::Verified { patch, check };
                }
                METRICS.inc_patches_rejected();
                TaskFailure::VerificationRejected {
                    reasoning: check.outcome.reasoning,
                }
            } else {
                TaskFailure::PatchFailed {
                    reason: patch.error.unwrap_or_default(),
                }
            };

            let retry = if attempts == 1 {
                self.ctx
                    .router
                    .escalate(task, decision.action, self.meter.remaining())
            } else {
                None
            };
            match retry {
                Some(next) => decision = next,
                None => break TaskResult::Failed(failure),
            }
        };

        TaskReport {
            section_id: task.section_id.clone(),
            task: task.clone(),
            result,
            tokens_used,
            attempts,
            new_issues,
        }
    }

    fn started(&self, decision: &RouterDecision, attempt: u32) {
        crate::obs::emit_task_routed(
            self.ctx.emitter.run_id(),
            decision.task.section_id.as_str(),
            decision.action,
            decision.estimated_tokens,
        );
        self.ctx.emitter.emit(ProgressEvent::TaskStarted {
            iteration: self.ctx.iteration,
            section_id: decision.task.section_id.clone(),
            action: decision.action,
            executor: decision.executor,
            estimated_tokens: decision.estimated_tokens,
            attempt,
        });
    }

    fn verified(&self, task: &SectionRefinementTask, check: &DeltaCheck) {
        self.ctx.emitter.emit(ProgressEvent::VerificationResult {
            iteration: self.ctx.iteration,
            section_id: task.section_id.clone(),
            passed: check.outcome.passed,
            accepted: check.accepted,
            confidence: check.outcome.confidence,
            reasoning: check.outcome.reasoning.clone(),
            new_issues: check.outcome.new_issues.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_signal_wakes_waiters() {
        let abort = AbortSignal::new();
        let waiter = {
            let abort = abort.clone();
            tokio::spawn(async move { abort.cancelled().await })
        };
        abort.trigger();
        waiter.await.unwrap();
        assert!(abort.is_triggered());
    }

    #[test]
    fn test_token_meter_signals_exhaustion() {
        let meter = TokenMeter::new(900, 1_000);
        assert_eq!(meter.remaining(), 100);
        assert!(!meter.add(50));
        assert!(meter.add(50));
        assert_eq!(meter.remaining(), 0);
    }
}
