//! Issues raised by judges and their section-targeted form.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::content::{ContextAnchors, SectionId};
use crate::domain::rubric::Criterion;

/// Issue severity, ordered `Minor < Major < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Minor => "minor",
            Severity::Major => "major",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Corrective action class, ordered by cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixAction {
    SurgicalEdit,
    RegenerateSection,
    FullRegenerate,
}

impl FixAction {
    /// Next rung of the escalation ladder used when a fix fails verification.
    pub fn escalate(self) -> Option<FixAction> {
        match self {
            FixAction::SurgicalEdit => Some(FixAction::RegenerateSection),
            FixAction::RegenerateSection => Some(FixAction::FullRegenerate),
            FixAction::FullRegenerate => None,
        }
    }
}

impl fmt::Display for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixAction::SurgicalEdit => "SURGICAL_EDIT",
            FixAction::RegenerateSection => "REGENERATE_SECTION",
            FixAction::FullRegenerate => "FULL_REGENERATE",
        };
        write!(f, "{s}")
    }
}

/// Where in the content an issue applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLocation {
    #[serde(default)]
    pub section_id: Option<SectionId>,
    /// Free-form pointer reported by the judge ("paragraph 2").
    #[serde(default)]
    pub detail: Option<String>,
}

/// A problem reported by one judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub criterion: Criterion,
    pub severity: Severity,
    #[serde(default)]
    pub location: IssueLocation,
    pub description: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(default)]
    pub quoted_text: Option<String>,
    /// Judge-suggested action; `None` lets the arbiter decide.
    #[serde(default)]
    pub suggested_action: Option<FixAction>,
}

impl Issue {
    pub fn new(criterion: Criterion, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            criterion,
            severity,
            location: IssueLocation::default(),
            description: description.into(),
            suggested_fix: String::new(),
            quoted_text: None,
            suggested_action: None,
        }
    }

    pub fn in_section(mut self, section: impl Into<String>) -> Self {
        self.location.section_id = Some(SectionId::new(section));
        self
    }

    pub fn quoting(mut self, quote: impl Into<String>) -> Self {
        self.quoted_text = Some(quote.into());
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = fix.into();
        self
    }

    pub fn with_action(mut self, action: FixAction) -> Self {
        self.suggested_action = Some(action);
        self
    }

    /// Whether the issue signals a failure of the lesson's overall structure.
    pub fn is_structural(&self) -> bool {
        self.criterion == Criterion::Structure
            || self.suggested_action == Some(FixAction::FullRegenerate)
    }

    /// Default action when the judge did not suggest one.
    pub fn default_action(&self) -> FixAction {
        if let Some(action) = self.suggested_action {
            return action;
        }
        match self.severity {
            Severity::Critical if self.criterion == Criterion::Structure => {
                FixAction::FullRegenerate
            }
            Severity::Critical => FixAction::RegenerateSection,
            Severity::Major | Severity::Minor => FixAction::SurgicalEdit,
        }
    }
}

/// An issue resolved to a concrete section with a repair action attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetedIssue {
    pub id: String,
    pub issue: Issue,
    pub target_section_id: SectionId,
    pub fix_action: FixAction,
    pub context_window: ContextAnchors,
    pub fix_instructions: String,
    /// Evaluators that independently reported this issue.
    pub flagged_by: Vec<String>,
}

impl TargetedIssue {
    pub fn severity(&self) -> Severity {
        self.issue.severity
    }

    pub fn criterion(&self) -> Criterion {
        self.issue.criterion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Major);
        assert!(Severity::Major > Severity::Minor);
    }

    #[test]
    fn test_escalation_ladder() {
        assert_eq!(
            FixAction::SurgicalEdit.escalate(),
            Some(FixAction::RegenerateSection)
        );
        assert_eq!(
            FixAction::RegenerateSection.escalate(),
            Some(FixAction::FullRegenerate)
        );
        assert_eq!(FixAction::FullRegenerate.escalate(), None);
    }

    #[test]
    fn test_fix_action_serializes_screaming_case() {
        let json = serde_json::to_string(&FixAction::RegenerateSection).unwrap();
        assert_eq!(json, "\"REGENERATE_SECTION\"");
    }

    #[test]
    fn test_default_action_by_severity() {
        let minor = Issue::new(Criterion::Clarity, Severity::Minor, "wordy");
        assert_eq!(minor.default_action(), FixAction::SurgicalEdit);
        let critical = Issue::new(Criterion::Accuracy, Severity::Critical, "wrong date");
        assert_eq!(critical.default_action(), FixAction::RegenerateSection);
        let structural = Issue::new(Criterion::Structure, Severity::Critical, "no flow");
        assert_eq!(structural.default_action(), FixAction::FullRegenerate);
        assert!(structural.is_structural());
    }
}
