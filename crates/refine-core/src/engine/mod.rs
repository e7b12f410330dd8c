//! The refinement loop.
//!
//! evaluate -> consensus -> stop check -> plan -> batches (route, execute,
//! verify in parallel) -> merge under quality locks -> stop check -> evaluate
//! again. A single loop owns [`IterationState`] and mutates it only between
//! batches.

pub mod batch;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::arbiter::Arbiter;
use crate::best_effort::BestEffortSelector;
use crate::consensus::{ConsensusAggregator, EvaluatorPanel};
use crate::controller::{IterationController, TerminalRoute};
use crate::domain::config::RefinementConfig;
use crate::domain::content::{LessonContent, SectionId};
use crate::domain::error::{RefineError, Result};
use crate::domain::issue::Issue;
use crate::domain::outcome::{
    EscalationReason, RefinementOutcome, RefinementReport, StopReason, TaskFailure,
    UnresolvedTask,
};
use crate::domain::plan::{PlanStatus, RefinementPlan, SectionRefinementTask};
use crate::domain::rubric::{Criterion, Rubric};
use crate::domain::state::{IterationResult, IterationState, LockReason};
use crate::domain::verdict::ConsensusResult;
use crate::events::{ProgressEmitter, ProgressEnvelope, ProgressEvent, DEFAULT_EVENT_CAPACITY};
use crate::executors::{Executors, RestartSignal};
use crate::metrics::METRICS;
use crate::obs;
use crate::ports::{EvaluationRequest, GenerationService, VerificationService};
use crate::quality_lock::{LockDecision, QualityLockManager};
use crate::router::Router;
use crate::verifier::DeltaVerifier;

use batch::{execute_batch, AbortSignal, BatchContext, TaskInput, TaskReport, TaskResult, TokenMeter};

/// Input of one refinement run.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementRequest {
    pub content: LessonContent,
    pub source_materials: Vec<String>,
    pub rubric: Rubric,
}

impl RefinementRequest {
    pub fn new(content: LessonContent) -> Self {
        Self {
            content,
            source_materials: Vec::new(),
            rubric: Rubric::standard(),
        }
    }

    pub fn with_rubric(mut self, rubric: Rubric) -> Self {
        self.rubric = rubric;
        self
    }

    pub fn with_source_materials(mut self, materials: Vec<String>) -> Self {
        self.source_materials = materials;
        self
    }
}

/// Drives refinement runs against the configured services.
pub struct RefinementEngine {
    config: Arc<RefinementConfig>,
    consensus: ConsensusAggregator,
    executors: Executors,
    verifier: DeltaVerifier,
    router: Router,
    emitter: ProgressEmitter,
}

impl RefinementEngine {
    pub fn new(
        config: RefinementConfig,
        panel: EvaluatorPanel,
        generator: Arc<dyn GenerationService>,
        verification: Arc<dyn VerificationService>,
    ) -> Result<Self> {
        config.validate()?;
        panel.validate()?;
        let run_id = format!("refine-{}", Uuid::new_v4());
        Ok(Self {
            consensus: ConsensusAggregator::new(panel, config.decision_bands()),
            executors: Executors::new(generator),
            verifier: DeltaVerifier::new(verification),
            router: Router::new(),
            emitter: ProgressEmitter::new(run_id, DEFAULT_EVENT_CAPACITY),
            config: Arc::new(config),
        })
    }

    pub fn run_id(&self) -> &str {
        self.emitter.run_id()
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Subscribe before calling [`Self::run`] to see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEnvelope> {
        self.emitter.subscribe()
    }

    /// Refine `request.content` until a stop condition is reached.
    ///
    /// Only malformed input is an `Err`; every quality-related ending is a
    /// [`RefinementOutcome`] on the returned report.
    #[instrument(name = "refine.run", skip_all, fields(run_id = %self.run_id()))]
    pub async fn run(&self, request: RefinementRequest) -> Result<RefinementReport> {
        request.rubric.validate()?;
        request.content.validate()?;

        obs::emit_run_started(
            self.run_id(),
            &request.content.id,
            request.content.sections.len(),
        );
        self.emitter.emit(ProgressEvent::RefinementStart {
            content_id: request.content.id.clone(),
            sections: request.content.section_ids(),
            mode: self.config.mode,
            max_iterations: self.config.max_iterations,
            max_tokens: self.config.max_tokens,
        });

        let mut run = Run::new(self, request);
        let end = run.drive().await;
        Ok(run.finish(end))
    }
}

/// Why the loop ended.
enum RunEnd {
    Stopped(StopReason),
    EvaluatorUnavailable(RefineError),
    Restart(RestartSignal),
}

/// What merging one batch produced.
#[derive(Default)]
struct BatchSummary {
    committed: Vec<SectionId>,
    failed: Vec<SectionId>,
    deferred: Vec<TaskInput>,
    restart: Option<RestartSignal>,
}

/// Mutable state of one run. Owned by the loop; never shared with workers.
struct Run<'e> {
    engine: &'e RefinementEngine,
    request: RefinementRequest,
    content: LessonContent,
    state: IterationState,
    controller: IterationController,
    arbiter: Arbiter,
    locks: QualityLockManager,
    deadline: Instant,
    plans: Vec<RefinementPlan>,
    unresolved: Vec<UnresolvedTask>,
    requires_human_review: bool,
}

impl<'e> Run<'e> {
    fn new(engine: &'e RefinementEngine, request: RefinementRequest) -> Self {
        let config = &engine.config;
        let state = IterationState::new(&request.content);
        let deadline = state.start_instant() + std::time::Duration::from_millis(config.timeout_ms);
        let mut controller = IterationController::new(config);
        controller.start();
        Self {
            engine,
            content: request.content.clone(),
            arbiter: Arbiter::new(
                request.rubric.clone(),
                config.adjacent_section_gap,
                config.sequential_for_regenerations,
            ),
            locks: QualityLockManager::from_config(config),
            request,
            state,
            controller,
            deadline,
            plans: Vec::new(),
            unresolved: Vec::new(),
            requires_human_review: false,
        }
    }

    fn config(&self) -> &RefinementConfig {
        &self.engine.config
    }

    fn emit(&self, event: ProgressEvent) {
        self.engine.emitter.emit(event);
    }

    async fn drive(&mut self) -> RunEnd {
        loop {
            let consensus = match self.evaluate().await {
                Ok(consensus) => consensus,
                Err(end) => return end,
            };
            if let Some(reason) = self.controller.observe_iteration(&self.state) {
                return RunEnd::Stopped(reason);
            }

            let locked: BTreeSet<SectionId> = self.state.locked_sections.keys().cloned().collect();
            let mut plan = self.arbiter.plan(&consensus, &self.content, &locked);
            self.requires_human_review |= plan.requires_human_review;
            obs::emit_plan_built(
                self.engine.run_id(),
                self.state.iteration,
                plan.tasks.len(),
                plan.execution_batches.len(),
                plan.agreement_score,
            );
            self.emit(ProgressEvent::arbiter_complete(self.state.iteration, &plan));

            if plan.is_empty() {
                plan.status = PlanStatus::Completed;
                self.plans.push(plan);
                return RunEnd::Stopped(self.controller.stop(StopReason::Converged));
            }

            plan.status = PlanStatus::Executing;
            let end = self.execute_plan(&plan).await;
            plan.status = if end.is_none() {
                PlanStatus::Completed
            } else {
                PlanStatus::Failed
            };
            self.plans.push(plan);
            if let Some(end) = end {
                return end;
            }
        }
    }

    /// Evaluate the current content and record the snapshot.
    async fn evaluate(&mut self) -> std::result::Result<ConsensusResult, RunEnd> {
        let request = EvaluationRequest {
            learning_objectives: self.content.learning_objectives.clone(),
            content: self.content.clone(),
            source_materials: self.request.source_materials.clone(),
            rubric: self.request.rubric.clone(),
        };
        let consensus = match tokio::time::timeout_at(
            self.deadline,
            self.engine.consensus.evaluate(&request),
        )
        .await
        {
            Err(_) => return Err(RunEnd::Stopped(self.controller.stop(StopReason::Timeout))),
            Ok(Err(e)) => return Err(RunEnd::EvaluatorUnavailable(e)),
            Ok(Ok(consensus)) => consensus,
        };

        self.state.iteration += 1;
        self.state.add_tokens(consensus.tokens_used());
        let criteria_scores = consensus.criteria_scores();
        let raised = self
            .state
            .raise_quality_locks(&self.request.rubric, &criteria_scores);
        if !raised.is_empty() {
            debug!(?raised, "quality locks raised");
        }

        let mut unresolved_issues: Vec<Issue> = Vec::new();
        for issue in consensus.votes.iter().flat_map(|v| v.issues.iter()) {
            if !unresolved_issues.contains(issue) {
                unresolved_issues.push(issue.clone());
            }
        }
        self.state.record_result(IterationResult {
            iteration: self.state.iteration,
            score: consensus.final_score,
            content: self.content.clone(),
            criteria_scores,
            unresolved_issues,
        });

        obs::emit_consensus(
            self.engine.run_id(),
            self.state.iteration,
            consensus.final_score,
            consensus.method.as_str(),
            consensus.consensus_reached,
        );
        self.emit(ProgressEvent::IterationComplete {
            iteration: self.state.iteration,
            score: consensus.final_score,
            delta: self.state.last_delta(),
            method: consensus.method,
            consensus_reached: consensus.consensus_reached,
        });
        self.budget_warning();
        Ok(consensus)
    }

    fn budget_warning(&mut self) {
        let threshold = self.config().budget_warning_tokens();
        if self.state.take_budget_warning(threshold) {
            self.emit(ProgressEvent::BudgetWarning {
                tokens_used: self.state.tokens_used,
                max_tokens: self.config().max_tokens,
            });
        }
    }

    /// Criteria the verifier must score: every locked criterion plus the
    /// criteria the task addresses.
    fn verification_criteria(&self, task: &SectionRefinementTask) -> Vec<Criterion> {
        let mut criteria: BTreeSet<Criterion> = self.state.quality_locks.keys().copied().collect();
        criteria.extend(task.issues().map(|i| i.criterion));
        criteria.into_iter().collect()
    }

    /// Run every batch of `plan`, stopping early on a restart or a resource stop.
    async fn execute_plan(&mut self, plan: &RefinementPlan) -> Option<RunEnd> {
        let total_batches = plan.execution_batches.len();
        for (batch_index, batch) in plan.execution_batches.iter().enumerate() {
            let mut inputs = Vec::with_capacity(batch.len());
            let mut skipped = Vec::new();
            for task in batch {
                if let Some(reason) = self.state.lock_reason(&task.section_id) {
                    self.unresolve(task, TaskFailure::SectionLocked { reason });
                    skipped.push(task.section_id.clone());
                    continue;
                }
                inputs.push(TaskInput {
                    prefer_surgical: self.state.edit_count(&task.section_id) == 0,
                    criteria: self.verification_criteria(task),
                    task: task.clone(),
                    pinned: None,
                });
            }

            self.emit(ProgressEvent::BatchStarted {
                iteration: self.state.iteration,
                batch_index,
                total_batches,
                sections: inputs.iter().map(|i| i.task.section_id.clone()).collect(),
            });

            let mut summary = BatchSummary::default();
            let reports = self.run_batch(inputs).await;
            self.merge(reports, &mut summary);

            // Deferred full regenerations run alone, on content that already
            // carries this batch's commits.
            let deferred = std::mem::take(&mut summary.deferred);
            for input in deferred {
                if summary.restart.is_some() {
                    self.unresolve(&input.task, TaskFailure::Cancelled);
                    summary.failed.push(input.task.section_id.clone());
                    continue;
                }
                if let Some(reason) = self.state.lock_reason(&input.task.section_id) {
                    self.unresolve(&input.task, TaskFailure::SectionLocked { reason });
                    skipped.push(input.task.section_id.clone());
                    continue;
                }
                let reports = self.run_batch(vec![input]).await;
                self.merge(reports, &mut summary);
            }

            self.emit(ProgressEvent::BatchComplete {
                iteration: self.state.iteration,
                batch_index,
                committed: summary.committed,
                failed: summary.failed,
                skipped,
                tokens_used: self.state.tokens_used,
            });
            self.budget_warning();

            if let Some(signal) = summary.restart {
                return Some(RunEnd::Restart(signal));
            }
            if let Some(reason) = self.controller.observe_batch(&self.state) {
                return Some(RunEnd::Stopped(reason));
            }
        }
        None
    }

    /// Execute `inputs` against the current content and charge their tokens.
    async fn run_batch(&mut self, inputs: Vec<TaskInput>) -> Vec<TaskReport> {
        let ctx = BatchContext {
            iteration: self.state.iteration,
            router: self.engine.router,
            executors: self.engine.executors.clone(),
            verifier: self.engine.verifier.clone(),
            emitter: self.engine.emitter.clone(),
            source_materials: Arc::new(self.request.source_materials.clone()),
            max_concurrent: self.config().max_concurrent_patchers,
            deadline: self.deadline,
        };
        let meter = TokenMeter::new(self.state.tokens_used, self.config().max_tokens);
        let abort = AbortSignal::new();
        let reports = execute_batch(
            &ctx,
            inputs,
            Arc::new(self.content.clone()),
            &meter,
            &abort,
        )
        .await;
        let spent = meter.used().saturating_sub(self.state.tokens_used);
        self.state.add_tokens(spent);
        reports
    }

    fn unresolve(&mut self, task: &SectionRefinementTask, failure: TaskFailure) {
        self.unresolved.push(UnresolvedTask {
            iteration: self.state.iteration,
            section_id: task.section_id.clone(),
            failure,
            issues: task.issues().cloned().collect(),
        });
    }

    fn section_locked(&self, section: &SectionId, reason: LockReason) {
        METRICS.inc_sections_locked();
        obs::emit_section_locked(self.engine.run_id(), section.as_str(), reason);
        self.emit(ProgressEvent::SectionLocked {
            iteration: self.state.iteration,
            section_id: section.clone(),
            reason,
        });
    }

    /// Fold worker reports into the run state, one at a time.
    fn merge(&mut self, reports: Vec<TaskReport>, summary: &mut BatchSummary) {
        for report in reports {
            let section = report.section_id.clone();
            for issue in &report.new_issues {
                self.emit(ProgressEvent::NewIssueDetected {
                    iteration: self.state.iteration,
                    section_id: section.clone(),
                    issue: issue.clone(),
                });
            }

            match report.result {
                TaskResult::Verified { patch, check } => {
                    let decision = self.locks.review(
                        &mut self.state,
                        &section,
                        &check.outcome.criteria_scores,
                        check.outcome.section_score,
                    );
                    match decision {
                        LockDecision::Rollback { violation } => {
                            METRICS.inc_rollbacks();
                            obs::emit_regression(
                                self.engine.run_id(),
                                section.as_str(),
                                violation.criterion,
                                violation.locked,
                                violation.observed,
                            );
                            self.emit(ProgressEvent::QualityLockTriggered {
                                iteration: self.state.iteration,
                                section_id: section.clone(),
                                criterion: violation.criterion,
                                locked_score: violation.locked,
                                observed_score: violation.observed,
                            });
                            self.section_locked(&section, LockReason::Regression);
                            self.unresolve(
                                &report.task,
                                TaskFailure::RegressionViolation {
                                    criterion: violation.criterion,
                                    locked: violation.locked,
                                    observed: violation.observed,
                                },
                            );
                            summary.failed.push(section);
                        }
                        LockDecision::Commit { locked } => {
                            self.content
                                .replace_section_body(&section, patch.patched_content);
                            self.emit(ProgressEvent::PatchApplied {
                                iteration: self.state.iteration,
                                section_id: section.clone(),
                                action: patch.action,
                                diff_summary: patch.diff_summary,
                                tokens_used: report.tokens_used,
                            });
                            if let Some(reason) = locked {
                                self.section_locked(&section, reason);
                            }
                            summary.committed.push(section);
                        }
                    }
                }
                TaskResult::Restart(signal) => {
                    if summary.restart.is_none() {
                        summary.restart = Some(signal);
                    }
                    summary.failed.push(section);
                }
                TaskResult::Failed(failure) => {
                    self.unresolve(&report.task, failure);
                    summary.failed.push(section);
                }
                TaskResult::Deferred { action, reason } => {
                    debug!(section = %section, ?action, "full regeneration deferred to end of batch");
                    summary.deferred.push(TaskInput {
                        prefer_surgical: false,
                        criteria: self.verification_criteria(&report.task),
                        task: report.task,
                        pinned: Some((action, reason)),
                    });
                }
            }
        }
    }

    fn best_snapshot(&self) -> (Option<LessonContent>, Option<f64>) {
        match self.state.best_result() {
            Some(best) => (Some(best.content.clone()), Some(best.score)),
            None => (None, None),
        }
    }

    fn escalate(&self, reason: EscalationReason) -> RefinementOutcome {
        let (content, best_score) = self.best_snapshot();
        self.emit(ProgressEvent::EscalationTriggered {
            reason,
            best_score,
            requires_human_review: self.requires_human_review,
        });
        RefinementOutcome::Escalated {
            reason,
            content,
            best_score,
        }
    }

    fn finish(self, end: RunEnd) -> RefinementReport {
        let run_id = self.engine.run_id().to_string();
        let (outcome, stop_reason) = match end {
            RunEnd::Stopped(reason) => {
                obs::emit_stopped(&run_id, reason, self.state.current_score());
                let outcome = match self.controller.route(reason) {
                    TerminalRoute::Accept => match self.state.content_history.last() {
                        Some(last) => RefinementOutcome::Accepted {
                            content: last.content.clone(),
                            score: last.score,
                        },
                        None => self.escalate(EscalationReason::NoAcceptedState),
                    },
                    TerminalRoute::Escalate => self.escalate(EscalationReason::StoppedBelowThreshold),
                    TerminalRoute::BestEffort => {
                        let selector = BestEffortSelector::new(
                            self.config().accept_threshold,
                            self.config().good_enough_threshold,
                        );
                        match selector.select(&self.state.content_history) {
                            Some(result) => RefinementOutcome::BestEffort(result),
                            None => self.escalate(EscalationReason::NoAcceptedState),
                        }
                    }
                };
                (outcome, Some(reason))
            }
            RunEnd::EvaluatorUnavailable(error) => {
                obs::emit_run_error(&run_id, &error);
                (self.escalate(EscalationReason::EvaluatorUnavailable), None)
            }
            RunEnd::Restart(signal) => {
                info!(section = %signal.section_id, reason = %signal.reason, "full regeneration requested");
                (
                    RefinementOutcome::RestartRequired {
                        section_id: signal.section_id,
                        reason: signal.reason,
                        content: Some(self.content.clone()),
                    },
                    None,
                )
            }
        };

        let duration_ms = self.state.elapsed().as_millis() as u64;
        self.emit(ProgressEvent::RefinementComplete {
            outcome: outcome.kind().to_string(),
            stop_reason,
            final_score: self.state.current_score(),
            iterations: self.state.iteration,
            tokens_used: self.state.tokens_used,
            duration_ms,
        });
        obs::emit_run_finished(
            &run_id,
            outcome.kind(),
            self.state.iteration,
            self.state.tokens_used,
            duration_ms,
        );
        METRICS.flush();

        RefinementReport {
            run_id,
            outcome,
            stop_reason,
            iterations: self.state.iteration,
            score_history: self.state.score_history,
            tokens_used: self.state.tokens_used,
            locked_sections: self.state.locked_sections,
            quality_locks: self.state.quality_locks,
            requires_human_review: self.requires_human_review,
            plans: self.plans,
            unresolved: self.unresolved,
            duration_ms,
        }
    }
}
