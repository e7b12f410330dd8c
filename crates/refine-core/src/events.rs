//! Progress event stream.
//!
//! The engine publishes [`ProgressEnvelope`]s on a `tokio::sync::broadcast`
//! channel. Publishing never blocks: a consumer that falls behind observes
//! `RecvError::Lagged` and loses the oldest events.
//!
//! [`PlanDisplay`] folds the stream back into display state, so a UI never
//! needs to replay engine logic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::config::RefinementMode;
use crate::domain::content::SectionId;
use crate::domain::issue::{FixAction, Issue, Severity};
use crate::domain::outcome::{EscalationReason, StopReason};
use crate::domain::plan::{AcceptancePolicy, RefinementPlan, TokenEstimate};
use crate::domain::rubric::Criterion;
use crate::domain::state::LockReason;
use crate::domain::verdict::{Confidence, ConsensusMethod};
use crate::router::ExecutorKind;

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Display row for one planned task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub section_id: SectionId,
    pub action: FixAction,
    pub priority: Severity,
    pub issue_count: usize,
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RefinementStart {
        content_id: String,
        sections: Vec<SectionId>,
        mode: RefinementMode,
        max_iterations: u32,
        max_tokens: u64,
    },
    ArbiterComplete {
        iteration: u32,
        agreement_score: f64,
        acceptance_policy: AcceptancePolicy,
        requires_human_review: bool,
        tasks: Vec<TaskSummary>,
        batches: Vec<Vec<SectionId>>,
        conflict_resolutions: usize,
        rejected_issues: usize,
        estimated_cost: TokenEstimate,
    },
    BatchStarted {
        iteration: u32,
        batch_index: usize,
        total_batches: usize,
        sections: Vec<SectionId>,
    },
    TaskStarted {
        iteration: u32,
        section_id: SectionId,
        action: FixAction,
        executor: ExecutorKind,
        estimated_tokens: u64,
        attempt: u32,
    },
    PatchApplied {
        iteration: u32,
        section_id: SectionId,
        action: FixAction,
        diff_summary: String,
        tokens_used: u64,
    },
    VerificationResult {
        iteration: u32,
        section_id: SectionId,
        passed: bool,
        accepted: bool,
        confidence: Confidence,
        reasoning: String,
        new_issues: usize,
    },
    QualityLockTriggered {
        iteration: u32,
        section_id: SectionId,
        criterion: Criterion,
        locked_score: f64,
        observed_score: f64,
    },
    SectionLocked {
        iteration: u32,
        section_id: SectionId,
        reason: LockReason,
    },
    BatchComplete {
        iteration: u32,
        batch_index: usize,
        committed: Vec<SectionId>,
        /// Tasks that ran and ended without a commit.
        failed: Vec<SectionId>,
        /// Tasks not run because their section was already locked.
        #[serde(default)]
        skipped: Vec<SectionId>,
        tokens_used: u64,
    },
    IterationComplete {
        iteration: u32,
        score: f64,
        delta: Option<f64>,
        method: ConsensusMethod,
        consensus_reached: bool,
    },
    EscalationTriggered {
        reason: EscalationReason,
        best_score: Option<f64>,
        requires_human_review: bool,
    },
    BudgetWarning {
        tokens_used: u64,
        max_tokens: u64,
    },
    NewIssueDetected {
        iteration: u32,
        section_id: SectionId,
        issue: Issue,
    },
    RefinementComplete {
        outcome: String,
        stop_reason: Option<StopReason>,
        final_score: Option<f64>,
        iterations: u32,
        tokens_used: u64,
        duration_ms: u64,
    },
}

impl ProgressEvent {
    /// The `type` tag of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::RefinementStart { .. } => "refinement_start",
            ProgressEvent::ArbiterComplete { .. } => "arbiter_complete",
            ProgressEvent::BatchStarted { .. } => "batch_started",
            ProgressEvent::TaskStarted { .. } => "task_started",
            ProgressEvent::PatchApplied { .. } => "patch_applied",
            ProgressEvent::VerificationResult { .. } => "verification_result",
            ProgressEvent::QualityLockTriggered { .. } => "quality_lock_triggered",
            ProgressEvent::SectionLocked { .. } => "section_locked",
            ProgressEvent::BatchComplete { .. } => "batch_complete",
            ProgressEvent::IterationComplete { .. } => "iteration_complete",
            ProgressEvent::EscalationTriggered { .. } => "escalation_triggered",
            ProgressEvent::BudgetWarning { .. } => "budget_warning",
            ProgressEvent::NewIssueDetected { .. } => "new_issue_detected",
            ProgressEvent::RefinementComplete { .. } => "refinement_complete",
        }
    }

    pub fn arbiter_complete(iteration: u32, plan: &RefinementPlan) -> Self {
        ProgressEvent::ArbiterComplete {
            iteration,
            agreement_score: plan.agreement_score,
            acceptance_policy: plan.acceptance_policy,
            requires_human_review: plan.requires_human_review,
            tasks: plan
                .tasks
                .iter()
                .map(|t| TaskSummary {
                    section_id: t.section_id.clone(),
                    action: t.action_type,
                    priority: t.priority,
                    issue_count: t.source_issues.len(),
                    instructions: t.synthesized_instructions.clone(),
                })
                .collect(),
            batches: plan
                .execution_batches
                .iter()
                .map(|b| b.iter().map(|t| t.section_id.clone()).collect())
                .collect(),
            conflict_resolutions: plan.conflict_resolutions.len(),
            rejected_issues: plan.rejected_issues.len(),
            estimated_cost: plan.estimated_cost,
        }
    }
}

/// One published event with ordering metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEnvelope {
    pub run_id: String,
    /// Strictly increasing per run, starting at 0.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Cheaply cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct ProgressEmitter {
    run_id: Arc<str>,
    tx: broadcast::Sender<ProgressEnvelope>,
    seq: Arc<AtomicU64>,
}

impl ProgressEmitter {
    pub fn new(run_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            run_id: Arc::from(run_id.into()),
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEnvelope> {
        self.tx.subscribe()
    }

    /// Publish without waiting. Having no subscriber is not an error.
    pub fn emit(&self, event: ProgressEvent) {
        let envelope = ProgressEnvelope {
            run_id: self.run_id.to_string(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            event,
        };
        tracing::trace!(kind = envelope.event.name(), seq = envelope.seq, "progress event");
        let _ = self.tx.send(envelope);
    }
}

/// Display status of one section's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Applied,
    Rejected,
    RolledBack,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// No further event changes this task within its plan.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Applied | TaskStatus::RolledBack | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// Display state rebuilt purely from events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDisplay {
    pub iteration: u32,
    pub score: Option<f64>,
    pub agreement_score: Option<f64>,
    pub requires_human_review: bool,
    pub tasks: BTreeMap<SectionId, TaskStatus>,
    pub locked: BTreeMap<SectionId, LockReason>,
    pub tokens_used: u64,
    pub budget_warning: bool,
    pub finished: Option<String>,
}

impl PlanDisplay {
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ArbiterComplete {
                iteration,
                agreement_score,
                requires_human_review,
                tasks,
                ..
            } => {
                self.iteration = *iteration;
                self.agreement_score = Some(*agreement_score);
                self.requires_human_review |= *requires_human_review;
                self.tasks = tasks
                    .iter()
                    .map(|t| (t.section_id.clone(), TaskStatus::Pending))
                    .collect();
            }
            ProgressEvent::TaskStarted { section_id, .. } => {
                self.tasks.insert(section_id.clone(), TaskStatus::Running);
            }
            ProgressEvent::VerificationResult {
                section_id,
                accepted: false,
                ..
            } => {
                self.tasks.insert(section_id.clone(), TaskStatus::Rejected);
            }
            ProgressEvent::PatchApplied { section_id, .. } => {
                self.tasks.insert(section_id.clone(), TaskStatus::Applied);
            }
            ProgressEvent::QualityLockTriggered { section_id, .. } => {
                self.tasks.insert(section_id.clone(), TaskStatus::RolledBack);
            }
            ProgressEvent::SectionLocked {
                section_id, reason, ..
            } => {
                self.locked.insert(section_id.clone(), *reason);
            }
            ProgressEvent::BatchComplete {
                failed,
                skipped,
                tokens_used,
                ..
            } => {
                for section in failed {
                    if self.tasks.get(section) != Some(&TaskStatus::RolledBack) {
                        self.tasks.insert(section.clone(), TaskStatus::Failed);
                    }
                }
                for section in skipped {
                    self.tasks.insert(section.clone(), TaskStatus::Skipped);
                }
                self.tokens_used = *tokens_used;
            }
            ProgressEvent::IterationComplete {
                iteration, score, ..
            } => {
                self.iteration = *iteration;
                self.score = Some(*score);
            }
            ProgressEvent::EscalationTriggered {
                requires_human_review,
                ..
            } => {
                self.requires_human_review |= *requires_human_review;
            }
            ProgressEvent::BudgetWarning { tokens_used, .. } => {
                self.budget_warning = true;
                self.tokens_used = *tokens_used;
            }
            ProgressEvent::RefinementComplete {
                outcome,
                tokens_used,
                final_score,
                ..
            } => {
                self.tokens_used = *tokens_used;
                if final_score.is_some() {
                    self.score = *final_score;
                }
                self.finished = Some(outcome.clone());
            }
            ProgressEvent::RefinementStart { .. }
            | ProgressEvent::BatchStarted { .. }
            | ProgressEvent::VerificationResult { .. }
            | ProgressEvent::NewIssueDetected { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emitter_sequences_events() {
        let emitter = ProgressEmitter::new("run-1", 16);
        let mut rx = emitter.subscribe();
        emitter.emit(ProgressEvent::BudgetWarning {
            tokens_used: 40_000,
            max_tokens: 50_000,
        });
        emitter.clone().emit(ProgressEvent::BudgetWarning {
            tokens_used: 41_000,
            max_tokens: 50_000,
        });
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
        assert_eq!(a.run_id, "run-1");
    }

    #[tokio::test]
    async fn test_slow_consumer_loses_oldest() {
        let emitter = ProgressEmitter::new("run-2", 2);
        let mut rx = emitter.subscribe();
        for n in 0..5 {
            emitter.emit(ProgressEvent::BudgetWarning {
                tokens_used: n,
                max_tokens: 10,
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().seq, 3);
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let emitter = ProgressEmitter::new("run-3", 4);
        emitter.emit(ProgressEvent::BudgetWarning {
            tokens_used: 1,
            max_tokens: 2,
        });
    }

    #[test]
    fn test_envelope_serializes_flat_with_type_tag() {
        let envelope = ProgressEnvelope {
            run_id: "r".to_string(),
            seq: 7,
            at: Utc::now(),
            event: ProgressEvent::SectionLocked {
                iteration: 2,
                section_id: SectionId::new("intro"),
                reason: LockReason::Regression,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "section_locked");
        assert_eq!(json["section_id"], "intro");
        assert_eq!(json["reason"], "regression");
        assert_eq!(json["seq"], 7);
    }

    #[test]
    fn test_plan_display_folds_events() {
        let mut display = PlanDisplay::default();
        let s = SectionId::new("s1");
        display.apply(&ProgressEvent::ArbiterComplete {
            iteration: 1,
            agreement_score: 0.6,
            acceptance_policy: AcceptancePolicy::CriticalOnly,
            requires_human_review: true,
            tasks: vec![TaskSummary {
                section_id: s.clone(),
                action: FixAction::SurgicalEdit,
                priority: Severity::Critical,
                issue_count: 1,
                instructions: "1. fix".to_string(),
            }],
            batches: vec![vec![s.clone()]],
            conflict_resolutions: 0,
            rejected_issues: 0,
            estimated_cost: TokenEstimate::new(500, 1_000),
        });
        assert_eq!(display.tasks[&s], TaskStatus::Pending);
        display.apply(&ProgressEvent::PatchApplied {
            iteration: 1,
            section_id: s.clone(),
            action: FixAction::SurgicalEdit,
            diff_summary: String::new(),
            tokens_used: 800,
        });
        assert_eq!(display.tasks[&s], TaskStatus::Applied);
        assert!(display.requires_human_review);
    }

    #[test]
    fn test_batch_complete_settles_unfinished_tasks() {
        let mut display = PlanDisplay::default();
        let (a, b, c) = (SectionId::new("a"), SectionId::new("b"), SectionId::new("c"));
        for section in [&a, &b, &c] {
            display.tasks.insert(section.clone(), TaskStatus::Pending);
        }
        for section in [&a, &b] {
            display.apply(&ProgressEvent::TaskStarted {
                iteration: 1,
                section_id: section.clone(),
                action: FixAction::SurgicalEdit,
                executor: ExecutorKind::Patcher,
                estimated_tokens: 800,
                attempt: 1,
            });
        }
        display.apply(&ProgressEvent::QualityLockTriggered {
            iteration: 1,
            section_id: b.clone(),
            criterion: Criterion::Accuracy,
            locked_score: 0.8,
            observed_score: 0.7,
        });
        display.apply(&ProgressEvent::BatchComplete {
            iteration: 1,
            batch_index: 0,
            committed: vec![],
            failed: vec![a.clone(), b.clone()],
            skipped: vec![c.clone()],
            tokens_used: 900,
        });

        assert_eq!(display.tasks[&a], TaskStatus::Failed);
        assert_eq!(display.tasks[&b], TaskStatus::RolledBack);
        assert_eq!(display.tasks[&c], TaskStatus::Skipped);
        assert!(display.tasks.values().all(TaskStatus::is_terminal));
    }
}
