//! Maps each repair task to an action and an executor under a token budget.
//!
//! The decision table is ordered; the first matching rule wins:
//!
//! | # | condition | action |
//! |---|-----------|--------|
//! | 1 | a critical issue signals structural failure | `FULL_REGENERATE` |
//! | 2 | `prefer_surgical` and the surgical cost fits the budget | `SURGICAL_EDIT` |
//! | 3 | issue density or severity above the section threshold | `REGENERATE_SECTION` |
//! | 4 | otherwise | `SURGICAL_EDIT` |

use serde::{Deserialize, Serialize};

use crate::domain::issue::{FixAction, Severity};
use crate::domain::plan::{SectionRefinementTask, TokenEstimate};

/// Issue count above which a section is rewritten rather than patched.
pub const DENSITY_THRESHOLD: usize = 3;

/// Which executor carries out an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Patcher,
    SectionRegenerator,
    FullRegenerator,
}

impl ExecutorKind {
    pub fn for_action(action: FixAction) -> Self {
        match action {
            FixAction::SurgicalEdit => ExecutorKind::Patcher,
            FixAction::RegenerateSection => ExecutorKind::SectionRegenerator,
            FixAction::FullRegenerate => ExecutorKind::FullRegenerator,
        }
    }
}

/// Which rule of the decision table fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    StructuralFailure,
    SurgicalPreferred,
    DensityThreshold,
    Default,
    /// Retry after a rejected verification.
    Escalated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterDecision {
    pub task: SectionRefinementTask,
    pub action: FixAction,
    pub executor: ExecutorKind,
    /// Upper estimate, used for budget projection.
    pub estimated_tokens: u64,
    pub reason: RouteReason,
    /// `false` when the upper estimate exceeds the remaining budget.
    pub fits_budget: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }

    pub fn route(
        &self,
        task: &SectionRefinementTask,
        remaining_tokens: u64,
        prefer_surgical: bool,
    ) -> RouterDecision {
        let issue_count = task.source_issues.len().max(1) as u64;
        let surgical_cost =
            TokenEstimate::for_action(FixAction::SurgicalEdit).max_tokens * issue_count;

        let structural_critical = task
            .issues()
            .any(|i| i.severity == Severity::Critical && i.is_structural());

        let (action, reason) = if structural_critical {
            (FixAction::FullRegenerate, RouteReason::StructuralFailure)
        } else if prefer_surgical && surgical_cost <= remaining_tokens {
            (FixAction::SurgicalEdit, RouteReason::SurgicalPreferred)
        } else if task.source_issues.len() > DENSITY_THRESHOLD || task.has_critical() {
            (FixAction::RegenerateSection, RouteReason::DensityThreshold)
        } else {
            (FixAction::SurgicalEdit, RouteReason::Default)
        };

        self.decide(task, action, reason, remaining_tokens)
    }

    /// Route a retry one rung up the escalation ladder.
    ///
    /// Returns `None` when the ladder is exhausted.
    pub fn escalate(
        &self,
        task: &SectionRefinementTask,
        from: FixAction,
        remaining_tokens: u64,
    ) -> Option<RouterDecision> {
        let action = from.escalate()?;
        Some(self.decide(task, action, RouteReason::Escalated, remaining_tokens))
    }

    /// Price a fixed action against the remaining budget.
    pub fn decide(
        &self,
        task: &SectionRefinementTask,
        action: FixAction,
        reason: RouteReason,
        remaining_tokens: u64,
    ) -> RouterDecision {
        let estimated_tokens = TokenEstimate::for_action(action).max_tokens;
        RouterDecision {
            task: task.clone(),
            action,
            executor: ExecutorKind::for_action(action),
            estimated_tokens,
            reason,
            fits_budget: estimated_tokens <= remaining_tokens,
        }
    }
}
