//! Refinement plans produced by the arbiter.

use serde::{Deserialize, Serialize};

use crate::domain::content::{ContextAnchors, SectionId};
use crate::domain::issue::{FixAction, Issue, Severity, TargetedIssue};
use crate::domain::rubric::Criterion;

/// Lifecycle of a plan within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// Token range projected for one action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub min_tokens: u64,
    pub max_tokens: u64,
}

impl TokenEstimate {
    pub const fn new(min_tokens: u64, max_tokens: u64) -> Self {
        Self {
            min_tokens,
            max_tokens,
        }
    }

    /// Fixed per-action ranges used for budget projection.
    pub fn for_action(action: FixAction) -> Self {
        match action {
            FixAction::SurgicalEdit => Self::new(500, 1_000),
            FixAction::RegenerateSection => Self::new(1_200, 2_000),
            FixAction::FullRegenerate => Self::new(5_000, 7_000),
        }
    }
}

impl std::ops::Add for TokenEstimate {
    type Output = TokenEstimate;

    fn add(self, rhs: TokenEstimate) -> TokenEstimate {
        TokenEstimate::new(
            self.min_tokens + rhs.min_tokens,
            self.max_tokens + rhs.max_tokens,
        )
    }
}

/// One repair task; at most one per section per plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRefinementTask {
    pub section_id: SectionId,
    /// 0-indexed section position, used for adjacency-safe batching.
    pub position: usize,
    pub action_type: FixAction,
    pub synthesized_instructions: String,
    pub context_anchors: ContextAnchors,
    pub priority: Severity,
    pub source_issues: Vec<TargetedIssue>,
}

impl SectionRefinementTask {
    pub fn has_critical(&self) -> bool {
        self.source_issues
            .iter()
            .any(|i| i.severity() == Severity::Critical)
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.source_issues.iter().map(|t| &t.issue)
    }
}

/// Record of one instruction discarded in favour of a higher-priority one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub section_id: SectionId,
    pub winning_criterion: Criterion,
    pub winning_instruction: String,
    pub losing_criterion: Criterion,
    pub discarded_instruction: String,
    pub rationale: String,
}

/// Acceptance band derived from inter-rater agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptancePolicy {
    /// agreement >= 0.80: every deduplicated issue is accepted.
    AcceptAll,
    /// 0.67 <= agreement < 0.80: only issues reported by two or more judges.
    MultiJudgeOnly,
    /// agreement < 0.67: only critical issues; run needs human review.
    CriticalOnly,
}

/// Output of the arbiter for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementPlan {
    pub status: PlanStatus,
    pub tasks: Vec<SectionRefinementTask>,
    pub execution_batches: Vec<Vec<SectionRefinementTask>>,
    pub agreement_score: f64,
    pub acceptance_policy: AcceptancePolicy,
    pub requires_human_review: bool,
    pub conflict_resolutions: Vec<ConflictResolution>,
    /// Issues dropped by the acceptance policy.
    pub rejected_issues: Vec<TargetedIssue>,
    /// Issues that could not be tied to any section.
    pub unplaced_issues: Vec<Issue>,
    pub estimated_cost: TokenEstimate,
}

impl RefinementPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, section: &SectionId) -> Option<&SectionRefinementTask> {
        self.tasks.iter().find(|t| &t.section_id == section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimates_per_action() {
        assert_eq!(
            TokenEstimate::for_action(FixAction::SurgicalEdit),
            TokenEstimate::new(500, 1_000)
        );
        assert_eq!(
            TokenEstimate::for_action(FixAction::RegenerateSection),
            TokenEstimate::new(1_200, 2_000)
        );
        assert_eq!(
            TokenEstimate::for_action(FixAction::FullRegenerate),
            TokenEstimate::new(5_000, 7_000)
        );
    }

    #[test]
    fn test_token_estimate_add() {
        let total = TokenEstimate::for_action(FixAction::SurgicalEdit)
            + TokenEstimate::for_action(FixAction::RegenerateSection);
        assert_eq!(total, TokenEstimate::new(1_700, 3_000));
    }
}
