//! Terminal results of a refinement run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::content::{LessonContent, SectionId};
use crate::domain::issue::Issue;
use crate::domain::plan::RefinementPlan;
use crate::domain::rubric::Criterion;
use crate::domain::state::LockReason;

/// Why the iteration controller stopped the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    #[serde(rename = "stop_score_met")]
    ScoreMet,
    #[serde(rename = "stop_converged")]
    Converged,
    #[serde(rename = "stop_max_iterations")]
    MaxIterations,
    #[serde(rename = "stop_budget_exceeded")]
    BudgetExceeded,
    #[serde(rename = "stop_timeout")]
    Timeout,
    #[serde(rename = "stop_all_locked")]
    AllLocked,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::ScoreMet => "stop_score_met",
            StopReason::Converged => "stop_converged",
            StopReason::MaxIterations => "stop_max_iterations",
            StopReason::BudgetExceeded => "stop_budget_exceeded",
            StopReason::Timeout => "stop_timeout",
            StopReason::AllLocked => "stop_all_locked",
        };
        write!(f, "{s}")
    }
}

/// Quality classification of a best-effort result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Good,
    Acceptable,
    BelowStandard,
}

/// Best snapshot picked when a full-auto run stops below the accept threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestEffortResult {
    pub content: LessonContent,
    pub iteration: u32,
    pub best_score: f64,
    pub quality_status: QualityStatus,
    pub unresolved_issues: Vec<Issue>,
    pub improvement_hints: Vec<String>,
}

/// Why a run was handed to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Loop stopped below threshold in semi-auto mode.
    StoppedBelowThreshold,
    /// An evaluator could not be reached or returned garbage.
    EvaluatorUnavailable,
    /// Full-auto stopped without any evaluated state to fall back to.
    NoAcceptedState,
}

/// Why one repair task did not produce a committed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    PatchFailed {
        reason: String,
    },
    VerificationRejected {
        reasoning: String,
    },
    RegressionViolation {
        criterion: Criterion,
        locked: f64,
        observed: f64,
    },
    BudgetExceeded,
    Cancelled,
    SectionLocked {
        reason: LockReason,
    },
}

/// A task that ended without a committed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedTask {
    pub iteration: u32,
    pub section_id: SectionId,
    pub failure: TaskFailure,
    pub issues: Vec<Issue>,
}

/// Final result handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefinementOutcome {
    /// Score met the accept threshold.
    Accepted { content: LessonContent, score: f64 },
    /// ESCALATE_TO_HUMAN: a reviewer decides using the best snapshot.
    Escalated {
        reason: EscalationReason,
        content: Option<LessonContent>,
        best_score: Option<f64>,
    },
    /// Full-auto fallback to the best snapshot.
    BestEffort(BestEffortResult),
    /// A full regeneration was requested; the outer pipeline restarts from planning.
    RestartRequired {
        section_id: SectionId,
        reason: String,
        content: Option<LessonContent>,
    },
}

impl RefinementOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            RefinementOutcome::Accepted { .. } => "accepted",
            RefinementOutcome::Escalated { .. } => "escalated",
            RefinementOutcome::BestEffort(_) => "best_effort",
            RefinementOutcome::RestartRequired { .. } => "restart_required",
        }
    }
}

/// Auditable record of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementReport {
    pub run_id: String,
    pub outcome: RefinementOutcome,
    pub stop_reason: Option<StopReason>,
    pub iterations: u32,
    pub score_history: Vec<f64>,
    pub tokens_used: u64,
    pub locked_sections: BTreeMap<SectionId, LockReason>,
    pub quality_locks: BTreeMap<Criterion, f64>,
    /// Set when agreement fell below 0.67 at any point, regardless of score.
    pub requires_human_review: bool,
    pub plans: Vec<RefinementPlan>,
    pub unresolved: Vec<UnresolvedTask>,
    pub duration_ms: u64,
}
