//! Quality-Lock Manager.
//!
//! Vetoes committed edits that regress a locked criterion beyond tolerance and
//! freezes sections that were edited too often or keep oscillating. It only
//! decides; the controller applies the decision to [`IterationState`] between
//! batches.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::config::RefinementConfig;
use crate::domain::content::SectionId;
use crate::domain::rubric::Criterion;
use crate::domain::state::{IterationState, LockReason};

/// A locked criterion fell below `locked - tolerance`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockViolation {
    pub criterion: Criterion,
    pub locked: f64,
    pub observed: f64,
}

/// What happens to a verified patch.
#[derive(Debug, Clone, PartialEq)]
pub enum LockDecision {
    /// Keep the patch. `locked` is set if the section froze after this edit.
    Commit { locked: Option<LockReason> },
    /// Undo the patch; the section is now locked for regression.
    Rollback { violation: LockViolation },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityLockManager {
    regression_tolerance: f64,
    lock_after_edits: u32,
    convergence_threshold: f64,
}

impl QualityLockManager {
    pub fn new(regression_tolerance: f64, lock_after_edits: u32, convergence_threshold: f64) -> Self {
        Self {
            regression_tolerance,
            lock_after_edits,
            convergence_threshold,
        }
    }

    pub fn from_config(config: &RefinementConfig) -> Self {
        Self::new(
            config.regression_tolerance,
            config.section_lock_after_edits,
            config.convergence_threshold,
        )
    }

    /// First locked criterion (in criterion order) whose new score breaks the lock.
    pub fn check_regression(
        &self,
        quality_locks: &BTreeMap<Criterion, f64>,
        scores: &HashMap<Criterion, f64>,
    ) -> Option<LockViolation> {
        quality_locks.iter().find_map(|(criterion, locked)| {
            let observed = *scores.get(criterion)?;
            (observed < locked - self.regression_tolerance).then_some(LockViolation {
                criterion: *criterion,
                locked: *locked,
                observed,
            })
        })
    }

    /// The last two edits moved the score in opposite directions, both by at
    /// least the convergence threshold, with no net gain.
    pub fn is_oscillating(&self, history: &[f64]) -> bool {
        let [.., a, b, c] = history else {
            return false;
        };
        let (d1, d2) = (b - a, c - b);
        d1 * d2 < 0.0
            && d1.abs() >= self.convergence_threshold
            && d2.abs() >= self.convergence_threshold
            && c <= a
    }

    /// Decide on a verified patch and record its effect on `state`.
    ///
    /// Checks run in order: regression, oscillation, edit count.
    pub fn review(
        &self,
        state: &mut IterationState,
        section: &SectionId,
        criteria_scores: &HashMap<Criterion, f64>,
        section_score: Option<f64>,
    ) -> LockDecision {
        if let Some(violation) = self.check_regression(&state.quality_locks, criteria_scores) {
            state.lock_section(section, LockReason::Regression);
            return LockDecision::Rollback { violation };
        }

        let edits = state.record_edit(section);
        if let Some(score) = section_score {
            state.record_section_score(section, score);
        }

        let reason = if self.is_oscillating(state.section_score_history(section)) {
            Some(LockReason::Oscillation)
        } else if edits >= self.lock_after_edits {
            Some(LockReason::MaxEdits)
        } else {
            None
        };
        let locked = reason.filter(|r| state.lock_section(section, *r));
        LockDecision::Commit { locked }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::{LessonContent, Section};

    fn state() -> IterationState {
        IterationState::new(&LessonContent {
            id: "l".to_string(),
            title: "t".to_string(),
            learning_objectives: vec![],
            sections: vec![Section::new("s1", "S1", "a."), Section::new("s2", "S2", "b.")],
        })
    }

    #[test]
    fn test_within_tolerance_is_not_a_violation() {
        let m = QualityLockManager::new(0.05, 3, 0.02);
        let locks = BTreeMap::from([(Criterion::Clarity, 0.80)]);
        let scores = HashMap::from([(Criterion::Clarity, 0.76)]);
        assert!(m.check_regression(&locks, &scores).is_none());
    }

    #[test]
    fn test_oscillation_detection() {
        let m = QualityLockManager::new(0.05, 3, 0.02);
        assert!(m.is_oscillating(&[0.80, 0.70, 0.78]));
        assert!(!m.is_oscillating(&[0.70, 0.75, 0.80]));
        // Net gain: not oscillating.
        assert!(!m.is_oscillating(&[0.70, 0.65, 0.75]));
        // Moves below threshold.
        assert!(!m.is_oscillating(&[0.80, 0.79, 0.80]));
        assert!(!m.is_oscillating(&[0.8, 0.7]));
    }

    #[test]
    fn test_max_edits_locks_section() {
        let m = QualityLockManager::new(0.05, 2, 0.02);
        let mut st = state();
        let s1 = SectionId::new("s1");
        let scores = HashMap::new();
        assert_eq!(
            m.review(&mut st, &s1, &scores, Some(0.7)),
            LockDecision::Commit { locked: None }
        );
        assert_eq!(
            m.review(&mut st, &s1, &scores, Some(0.8)),
            LockDecision::Commit {
                locked: Some(LockReason::MaxEdits)
            }
        );
        assert!(st.is_locked(&s1));
    }

    #[test]
    fn test_oscillation_locks_before_max_edits() {
        let m = QualityLockManager::new(0.05, 3, 0.02);
        let mut st = state();
        let s1 = SectionId::new("s1");
        let scores = HashMap::new();
        m.review(&mut st, &s1, &scores, Some(0.80));
        m.review(&mut st, &s1, &scores, Some(0.70));
        let decision = m.review(&mut st, &s1, &scores, Some(0.78));
        assert_eq!(
            decision,
            LockDecision::Commit {
                locked: Some(LockReason::Oscillation)
            }
        );
    }
}
