//! Best-Effort Selector: picks the strongest snapshot when a run stops short.

use std::collections::BTreeMap;

use crate::domain::issue::Issue;
use crate::domain::outcome::{BestEffortResult, QualityStatus};
use crate::domain::rubric::Criterion;
use crate::domain::state::IterationResult;

/// Upper bound on hints attached to a result.
pub const MAX_HINTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestEffortSelector {
    accept_threshold: f64,
    good_enough_threshold: f64,
}

impl BestEffortSelector {
    pub fn new(accept_threshold: f64, good_enough_threshold: f64) -> Self {
        Self {
            accept_threshold,
            good_enough_threshold,
        }
    }

    pub fn classify(&self, score: f64) -> QualityStatus {
        if score >= self.accept_threshold {
            QualityStatus::Good
        } else if score >= self.good_enough_threshold {
            QualityStatus::Acceptable
        } else {
            QualityStatus::BelowStandard
        }
    }

    /// Pick the highest-scoring snapshot. Ties go to the earliest one.
    pub fn select(&self, history: &[IterationResult]) -> Option<BestEffortResult> {
        let best = history.iter().reduce(|best, r| if r.score > best.score { r } else { best })?;
        Some(BestEffortResult {
            content: best.content.clone(),
            iteration: best.iteration,
            best_score: best.score,
            quality_status: self.classify(best.score),
            unresolved_issues: best.unresolved_issues.clone(),
            improvement_hints: improvement_hints(&best.unresolved_issues),
        })
    }
}

/// One hint per criterion, most severe first, at most [`MAX_HINTS`].
pub fn improvement_hints(issues: &[Issue]) -> Vec<String> {
    let mut by_criterion: BTreeMap<Criterion, Vec<&Issue>> = BTreeMap::new();
    for issue in issues {
        by_criterion.entry(issue.criterion).or_default().push(issue);
    }

    let mut groups: Vec<(Criterion, Vec<&Issue>)> = by_criterion.into_iter().collect();
    for (_, group) in &mut groups {
        group.sort_by(|a, b| b.severity.cmp(&a.severity));
    }
    groups.sort_by(|(ca, a), (cb, b)| {
        b[0].severity
            .cmp(&a[0].severity)
            .then(ca.priority_rank().cmp(&cb.priority_rank()))
    });

    groups
        .into_iter()
        .take(MAX_HINTS)
        .map(|(criterion, group)| {
            let lead = group[0];
            let advice = if lead.suggested_fix.trim().is_empty() {
                &lead.description
            } else {
                &lead.suggested_fix
            };
            if group.len() > 1 {
                format!(
                    "{criterion} ({}, {} issues): {advice}",
                    lead.severity,
                    group.len()
                )
            } else {
                format!("{criterion} ({}): {advice}", lead.severity)
            }
        })
        .collect()
}
