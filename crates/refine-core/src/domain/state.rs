//! Iteration state owned by the iteration controller for the length of a run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::content::{LessonContent, SectionId};
use crate::domain::issue::Issue;
use crate::domain::rubric::{Criterion, Rubric};

/// Snapshot of the content after one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub score: f64,
    pub content: LessonContent,
    pub criteria_scores: HashMap<Criterion, f64>,
    /// Issues judges still reported on this snapshot.
    pub unresolved_issues: Vec<Issue>,
}

/// Why a section stopped accepting edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    Regression,
    MaxEdits,
    Oscillation,
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockReason::Regression => "regression",
            LockReason::MaxEdits => "max_edits",
            LockReason::Oscillation => "oscillation",
        };
        write!(f, "{s}")
    }
}

/// Per-run mutable state. Single writer: only the controller mutates it,
/// and only between batches.
#[derive(Debug, Clone)]
pub struct IterationState {
    pub iteration: u32,
    pub score_history: Vec<f64>,
    pub content_history: Vec<IterationResult>,
    pub locked_sections: BTreeMap<SectionId, LockReason>,
    pub section_edit_count: HashMap<SectionId, u32>,
    /// Per-section verifier scores, one entry per accepted edit.
    pub section_scores: HashMap<SectionId, Vec<f64>>,
    pub quality_locks: BTreeMap<Criterion, f64>,
    pub tokens_used: u64,
    pub started_at: DateTime<Utc>,
    start: Instant,
    all_sections: BTreeSet<SectionId>,
    budget_warning_sent: bool,
}

impl IterationState {
    pub fn new(content: &LessonContent) -> Self {
        Self {
            iteration: 0,
            score_history: Vec::new(),
            content_history: Vec::new(),
            locked_sections: BTreeMap::new(),
            section_edit_count: HashMap::new(),
            section_scores: HashMap::new(),
            quality_locks: BTreeMap::new(),
            tokens_used: 0,
            started_at: Utc::now(),
            start: Instant::now(),
            all_sections: content.section_ids().into_iter().collect(),
            budget_warning_sent: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn start_instant(&self) -> Instant {
        self.start
    }

    pub fn current_score(&self) -> Option<f64> {
        self.score_history.last().copied()
    }

    /// Improvement between the last two recorded scores.
    pub fn last_delta(&self) -> Option<f64> {
        match self.score_history.as_slice() {
            [.., prev, last] => Some(last - prev),
            _ => None,
        }
    }

    pub fn record_result(&mut self, result: IterationResult) {
        self.score_history.push(result.score);
        self.content_history.push(result);
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }

    /// Returns `true` exactly once, the first time usage crosses `threshold`.
    pub fn take_budget_warning(&mut self, threshold: u64) -> bool {
        if !self.budget_warning_sent && self.tokens_used >= threshold {
            self.budget_warning_sent = true;
            return true;
        }
        false
    }

    /// Lock a section. Locks are never lifted, so the locked set only grows.
    ///
    /// Returns `false` if the section was already locked or is unknown.
    pub fn lock_section(&mut self, section: &SectionId, reason: LockReason) -> bool {
        if !self.all_sections.contains(section) || self.locked_sections.contains_key(section) {
            return false;
        }
        self.locked_sections.insert(section.clone(), reason);
        true
    }

    pub fn is_locked(&self, section: &SectionId) -> bool {
        self.locked_sections.contains_key(section)
    }

    pub fn lock_reason(&self, section: &SectionId) -> Option<LockReason> {
        self.locked_sections.get(section).copied()
    }

    pub fn all_sections_locked(&self) -> bool {
        !self.all_sections.is_empty() && self.locked_sections.len() == self.all_sections.len()
    }

    pub fn edit_count(&self, section: &SectionId) -> u32 {
        self.section_edit_count.get(section).copied().unwrap_or(0)
    }

    /// Count one committed edit and return the new total.
    pub fn record_edit(&mut self, section: &SectionId) -> u32 {
        let count = self.section_edit_count.entry(section.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_section_score(&mut self, section: &SectionId, score: f64) {
        self.section_scores
            .entry(section.clone())
            .or_default()
            .push(score);
    }

    pub fn section_score_history(&self, section: &SectionId) -> &[f64] {
        self.section_scores
            .get(section)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Lock every criterion that meets its rubric threshold, never lowering an
    /// existing lock. Returns the criteria whose lock value changed.
    pub fn raise_quality_locks(
        &mut self,
        rubric: &Rubric,
        scores: &HashMap<Criterion, f64>,
    ) -> Vec<(Criterion, f64)> {
        let mut changed = Vec::new();
        for config in &rubric.criteria {
            let Some(score) = scores.get(&config.criterion).copied() else {
                continue;
            };
            if score < config.pass_threshold {
                continue;
            }
            match self.quality_locks.get(&config.criterion) {
                Some(locked) if *locked >= score => {}
                _ => {
                    self.quality_locks.insert(config.criterion, score);
                    changed.push((config.criterion, score));
                }
            }
        }
        changed
    }

    pub fn best_result(&self) -> Option<&IterationResult> {
        self.content_history
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}
