//! The arbiter turns a consensus result into a refinement plan.
//!
//! Pipeline, in order:
//! 1. flatten every judge's issues and resolve them to sections
//! 2. deduplicate by criterion, section and overlapping quote
//! 3. compute inter-rater agreement and pick the acceptance band
//! 4. settle contradictory instructions by criterion priority
//! 5. merge accepted issues into one task per section and batch them

pub mod agreement;
pub mod batching;
pub mod conflict;

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::domain::content::{LessonContent, SectionId};
use crate::domain::issue::{Issue, Severity, TargetedIssue};
use crate::domain::plan::{
    AcceptancePolicy, PlanStatus, RefinementPlan, SectionRefinementTask, TokenEstimate,
};
use crate::domain::rubric::Rubric;
use crate::domain::verdict::ConsensusResult;

pub use agreement::{acceptance_policy, agreement_score, krippendorff_alpha};
pub use batching::schedule_batches;
pub use conflict::{quotes_overlap, resolve_conflicts, Directive};

/// Builds [`RefinementPlan`]s. Holds only the knobs it needs from the run config.
#[derive(Debug, Clone)]
pub struct Arbiter {
    rubric: Rubric,
    adjacent_section_gap: usize,
    sequential_for_regenerations: bool,
}

impl Arbiter {
    pub fn new(rubric: Rubric, adjacent_section_gap: usize, sequential_for_regenerations: bool) -> Self {
        Self {
            rubric,
            adjacent_section_gap,
            sequential_for_regenerations,
        }
    }

    /// Plan the next round of repairs.
    ///
    /// Issues aimed at a section in `locked` are never planned; they land in
    /// `rejected_issues` alongside the ones the acceptance band dropped.
    pub fn plan(
        &self,
        consensus: &ConsensusResult,
        content: &LessonContent,
        locked: &BTreeSet<SectionId>,
    ) -> RefinementPlan {
        let (targeted, unplaced_issues) = deduplicate(consensus, content);

        let agreement_score = agreement_score(&consensus.votes, &self.rubric);
        let acceptance_policy = acceptance_policy(agreement_score);

        let mut rejected_issues = Vec::new();
        let mut by_section: BTreeMap<SectionId, Vec<TargetedIssue>> = BTreeMap::new();
        for issue in targeted {
            if locked.contains(&issue.target_section_id) || !accepts(acceptance_policy, &issue) {
                rejected_issues.push(issue);
            } else {
                by_section
                    .entry(issue.target_section_id.clone())
                    .or_default()
                    .push(issue);
            }
        }

        let mut conflict_resolutions = Vec::new();
        let mut tasks = Vec::new();
        for (section_id, issues) in by_section {
            let (kept, resolutions) = resolve_conflicts(issues);
            conflict_resolutions.extend(resolutions);
            if let Some(task) = build_task(content, section_id, kept) {
                tasks.push(task);
            }
        }
        tasks.sort_by_key(|t| t.position);

        let execution_batches = schedule_batches(
            &tasks,
            self.adjacent_section_gap,
            self.sequential_for_regenerations,
        );
        let estimated_cost = tasks
            .iter()
            .map(|t| TokenEstimate::for_action(t.action_type))
            .fold(TokenEstimate::default(), |acc, e| acc + e);

        debug!(
            agreement = agreement_score,
            policy = ?acceptance_policy,
            tasks = tasks.len(),
            rejected = rejected_issues.len(),
            unplaced = unplaced_issues.len(),
            "plan built"
        );

        RefinementPlan {
            status: PlanStatus::Pending,
            tasks,
            execution_batches,
            agreement_score,
            acceptance_policy,
            requires_human_review: acceptance_policy == AcceptancePolicy::CriticalOnly,
            conflict_resolutions,
            rejected_issues,
            unplaced_issues,
            estimated_cost,
        }
    }
}

fn accepts(policy: AcceptancePolicy, issue: &TargetedIssue) -> bool {
    match policy {
        AcceptancePolicy::AcceptAll => true,
        AcceptancePolicy::MultiJudgeOnly => issue.flagged_by.len() >= 2,
        AcceptancePolicy::CriticalOnly => issue.severity() == Severity::Critical,
    }
}

/// Resolve an issue to a section: explicit id first, then quote lookup.
fn locate(issue: &Issue, content: &LessonContent) -> Option<SectionId> {
    if let Some(id) = &issue.location.section_id {
        if content.section(id).is_some() {
            return Some(id.clone());
        }
    }
    issue
        .quoted_text
        .as_deref()
        .and_then(|q| content.find_quote(q))
        .cloned()
}

fn instruction_for(issue: &Issue) -> String {
    if issue.suggested_fix.trim().is_empty() {
        issue.description.clone()
    } else {
        issue.suggested_fix.clone()
    }
}

/// Flatten every vote's issues into deduplicated targeted issues.
fn deduplicate(
    consensus: &ConsensusResult,
    content: &LessonContent,
) -> (Vec<TargetedIssue>, Vec<Issue>) {
    let mut merged: Vec<TargetedIssue> = Vec::new();
    let mut unplaced: Vec<Issue> = Vec::new();

    for vote in &consensus.votes {
        for issue in &vote.issues {
            let Some(section) = locate(issue, content) else {
                if !unplaced.contains(issue) {
                    unplaced.push(issue.clone());
                }
                continue;
            };

            let existing = merged.iter_mut().find(|t| {
                t.target_section_id == section
                    && t.criterion() == issue.criterion
                    && quotes_overlap(t.issue.quoted_text.as_deref(), issue.quoted_text.as_deref())
            });

            match existing {
                Some(t) => {
                    if issue.severity > t.issue.severity {
                        t.issue.severity = issue.severity;
                        t.issue.description = issue.description.clone();
                        if !issue.suggested_fix.trim().is_empty() {
                            t.issue.suggested_fix = issue.suggested_fix.clone();
                            t.fix_instructions = instruction_for(issue);
                        }
                    }
                    t.fix_action = t.fix_action.max(issue.default_action());
                    if !t.flagged_by.contains(&vote.evaluator_id) {
                        t.flagged_by.push(vote.evaluator_id.clone());
                    }
                }
                None => {
                    let mut issue = issue.clone();
                    issue.location.section_id = Some(section.clone());
                    merged.push(TargetedIssue {
                        id: format!("iss-{:03}", merged.len() + 1),
                        fix_action: issue.default_action(),
                        context_window: content.context_anchors(&section),
                        fix_instructions: instruction_for(&issue),
                        flagged_by: vec![vote.evaluator_id.clone()],
                        target_section_id: section,
                        issue,
                    });
                }
            }
        }
    }
    (merged, unplaced)
}

/// Merge one section's accepted issues into a single task.
fn build_task(
    content: &LessonContent,
    section_id: SectionId,
    mut issues: Vec<TargetedIssue>,
) -> Option<SectionRefinementTask> {
    let position = content.position_of(&section_id)?;
    let action_type = issues.iter().map(|i| i.fix_action).max()?;
    let priority = issues.iter().map(TargetedIssue::severity).max()?;

    issues.sort_by(|a, b| {
        a.criterion()
            .priority_rank()
            .cmp(&b.criterion().priority_rank())
            .then(b.severity().cmp(&a.severity()))
    });
    let synthesized_instructions = issues
        .iter()
        .enumerate()
        .map(|(n, i)| {
            format!(
                "{}. [{}/{}] {}",
                n + 1,
                i.criterion(),
                i.severity(),
                i.fix_instructions
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    Some(SectionRefinementTask {
        context_anchors: content.context_anchors(&section_id),
        section_id,
        position,
        action_type,
        synthesized_instructions,
        priority,
        source_issues: issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::Section;
    use crate::domain::issue::FixAction;
    use crate::domain::rubric::Criterion;
    use crate::domain::verdict::{Confidence, ConsensusMethod, Recommendation, Verdict};
    use std::collections::HashMap;

    fn content() -> LessonContent {
        LessonContent {
            id: "l1".to_string(),
            title: "Cells".to_string(),
            learning_objectives: vec![],
            sections: vec![
                Section::new("intro", "Intro", "Cells are small. They are alive."),
                Section::new("wall", "Wall", "The cell wall is made of cellulose."),
                Section::new("end", "End", "That is all."),
            ],
        }
    }

    fn vote(id: &str, issues: Vec<Issue>) -> Verdict {
        let scores = Criterion::ALL.iter().map(|c| (*c, 0.9)).collect::<HashMap<_, _>>();
        Verdict {
            evaluator_id: id.to_string(),
            overall_score: 0.7,
            passed: false,
            confidence: Confidence::High,
            criteria_scores: scores,
            issues,
            strengths: vec![],
            recommendation: Recommendation::Revise,
            tokens_used: 0,
            duration_ms: 0,
        }
    }

    fn consensus(votes: Vec<Verdict>) -> ConsensusResult {
        ConsensusResult {
            votes,
            method: ConsensusMethod::Unanimous,
            final_score: 0.7,
            final_recommendation: Recommendation::Revise,
            consensus_reached: true,
        }
    }

    fn arbiter() -> Arbiter {
        Arbiter::new(Rubric::standard(), 1, true)
    }

    #[test]
    fn test_duplicate_issues_merge_with_max_severity() {
        let a = Issue::new(Criterion::Accuracy, Severity::Minor, "wrong")
            .in_section("wall")
            .quoting("made of cellulose");
        let b = Issue::new(Criterion::Accuracy, Severity::Major, "wrong material")
            .quoting("cellulose");
        let plan = arbiter().plan(
            &consensus(vec![vote("j1", vec![a]), vote("j2", vec![b])]),
            &content(),
            &BTreeSet::new(),
        );
        assert_eq!(plan.tasks.len(), 1);
        let task = &plan.tasks[0];
        assert_eq!(task.section_id, SectionId::new("wall"));
        assert_eq!(task.source_issues.len(), 1);
        assert_eq!(task.priority, Severity::Major);
        assert_eq!(task.source_issues[0].flagged_by, vec!["j1", "j2"]);
    }

    #[test]
    fn test_one_task_per_section() {
        let a = Issue::new(Criterion::Clarity, Severity::Minor, "wordy").in_section("intro");
        let b = Issue::new(Criterion::Engagement, Severity::Major, "dull").in_section("intro");
        let plan = arbiter().plan(
            &consensus(vec![vote("j1", vec![a, b])]),
            &content(),
            &BTreeSet::new(),
        );
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].source_issues.len(), 2);
        assert!(plan.tasks[0].synthesized_instructions.starts_with("1. [clarity/minor]"));
    }

    #[test]
    fn test_unplaced_issues_are_kept_aside() {
        let a = Issue::new(Criterion::Clarity, Severity::Minor, "vague").quoting("not in text");
        let plan = arbiter().plan(&consensus(vec![vote("j1", vec![a])]), &content(), &BTreeSet::new());
        assert!(plan.tasks.is_empty());
        assert_eq!(plan.unplaced_issues.len(), 1);
    }

    #[test]
    fn test_locked_sections_are_not_planned() {
        let a = Issue::new(Criterion::Clarity, Severity::Minor, "wordy").in_section("intro");
        let locked = BTreeSet::from([SectionId::new("intro")]);
        let plan = arbiter().plan(&consensus(vec![vote("j1", vec![a])]), &content(), &locked);
        assert!(plan.tasks.is_empty());
        assert_eq!(plan.rejected_issues.len(), 1);
    }

    #[test]
    fn test_task_action_is_strongest() {
        let a = Issue::new(Criterion::Clarity, Severity::Minor, "wordy").in_section("end");
        let b = Issue::new(Criterion::Accuracy, Severity::Critical, "false").in_section("end");
        let plan = arbiter().plan(
            &consensus(vec![vote("j1", vec![a, b])]),
            &content(),
            &BTreeSet::new(),
        );
        assert_eq!(plan.tasks[0].action_type, FixAction::RegenerateSection);
        assert_eq!(
            plan.estimated_cost,
            TokenEstimate::for_action(FixAction::RegenerateSection)
        );
    }
}
