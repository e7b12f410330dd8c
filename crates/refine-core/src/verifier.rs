//! Delta-Verifier: re-checks a single patched section against the issues it
//! was meant to fix.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::issue::Severity;
use crate::domain::plan::SectionRefinementTask;
use crate::domain::rubric::Criterion;
use crate::domain::verdict::Confidence;
use crate::executors::PatchResult;
use crate::ports::{VerificationOutcome, VerificationRequest, VerificationService};

/// Verification outcome plus the acceptance decision.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaCheck {
    pub accepted: bool,
    pub outcome: VerificationOutcome,
}

/// A patch is accepted only if the judge passed it and it introduced no
/// critical issue.
pub fn accepts(outcome: &VerificationOutcome) -> bool {
    outcome.passed
        && !outcome
            .new_issues
            .iter()
            .any(|i| i.severity == Severity::Critical)
}

#[derive(Clone)]
pub struct DeltaVerifier {
    service: Arc<dyn VerificationService>,
}

impl DeltaVerifier {
    pub fn new(service: Arc<dyn VerificationService>) -> Self {
        Self { service }
    }

    /// Verify one patch. Service failures reject the patch; they are never
    /// propagated.
    pub async fn verify(
        &self,
        task: &SectionRefinementTask,
        patch: &PatchResult,
        criteria: Vec<Criterion>,
    ) -> DeltaCheck {
        let request = VerificationRequest {
            section_id: task.section_id.clone(),
            original_content: patch.original_content.clone(),
            patched_content: patch.patched_content.clone(),
            addressed_issues: task.issues().cloned().collect(),
            context_anchors: task.context_anchors.clone(),
            criteria,
        };

        let outcome = match self.service.verify(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(section = %task.section_id, error = %e, "verification service failed");
                VerificationOutcome {
                    passed: false,
                    confidence: Confidence::Low,
                    reasoning: format!("verification unavailable: {e}"),
                    new_issues: vec![],
                    criteria_scores: Default::default(),
                    section_score: None,
                    tokens_used: 0,
                }
            }
        };
        let accepted = accepts(&outcome);
        debug!(
            section = %task.section_id,
            passed = outcome.passed,
            new_issues = outcome.new_issues.len(),
            accepted,
            "patch verified"
        );
        DeltaCheck { accepted, outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::issue::Issue;

    fn outcome(passed: bool, new_issues: Vec<Issue>) -> VerificationOutcome {
        VerificationOutcome {
            passed,
            confidence: Confidence::High,
            reasoning: String::new(),
            new_issues,
            criteria_scores: Default::default(),
            section_score: None,
            tokens_used: 0,
        }
    }

    #[test]
    fn test_passed_without_new_issues_is_accepted() {
        assert!(accepts(&outcome(true, vec![])));
    }

    #[test]
    fn test_minor_new_issue_still_accepted() {
        let minor = Issue::new(Criterion::Clarity, Severity::Minor, "slightly wordy");
        assert!(accepts(&outcome(true, vec![minor])));
    }

    #[test]
    fn test_critical_new_issue_rejects() {
        let critical = Issue::new(Criterion::Accuracy, Severity::Critical, "new error");
        assert!(!accepts(&outcome(true, vec![critical])));
    }

    #[test]
    fn test_failed_verification_rejects() {
        assert!(!accepts(&outcome(false, vec![])));
    }
}
