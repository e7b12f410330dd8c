//! Iteration Controller: the stop/continue state machine of a run.
//!
//! `PENDING -> RUNNING -> {SCORE_MET, CONVERGED, MAX_ITERATIONS,
//! BUDGET_EXCEEDED, TIMEOUT, ALL_LOCKED}`
//!
//! `iteration` counts evaluated snapshots: the initial evaluation is
//! iteration 1. Score-based checks need a fresh evaluation and only run after
//! an iteration; resource checks also run after every batch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::config::{OnMaxIterations, RefinementConfig};
use crate::domain::outcome::StopReason;
use crate::domain::state::IterationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    Pending,
    Running,
    Stopped(StopReason),
}

/// Where a stopped run goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalRoute {
    Accept,
    Escalate,
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct IterationController {
    accept_threshold: f64,
    convergence_threshold: f64,
    max_iterations: u32,
    max_tokens: u64,
    timeout: Duration,
    on_max_iterations: OnMaxIterations,
    escalation_enabled: bool,
    phase: ControllerPhase,
}

impl IterationController {
    pub fn new(config: &RefinementConfig) -> Self {
        Self {
            accept_threshold: config.accept_threshold,
            convergence_threshold: config.convergence_threshold,
            max_iterations: config.max_iterations,
            max_tokens: config.max_tokens,
            timeout: Duration::from_millis(config.timeout_ms),
            on_max_iterations: config.on_max_iterations,
            escalation_enabled: config.escalation_enabled,
            phase: ControllerPhase::Pending,
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn start(&mut self) {
        if self.phase == ControllerPhase::Pending {
            self.phase = ControllerPhase::Running;
        }
    }

    /// Force a terminal state (e.g. an empty plan).
    pub fn stop(&mut self, reason: StopReason) -> StopReason {
        if let ControllerPhase::Stopped(existing) = self.phase {
            return existing;
        }
        debug!(%reason, "controller stopped");
        self.phase = ControllerPhase::Stopped(reason);
        reason
    }

    /// Full check after a re-evaluation, in order: score met, converged,
    /// max iterations, then the resource checks.
    pub fn check_iteration(&self, state: &IterationState) -> Option<StopReason> {
        if state
            .current_score()
            .is_some_and(|s| s >= self.accept_threshold)
        {
            return Some(StopReason::ScoreMet);
        }
        if state
            .last_delta()
            .is_some_and(|d| d < self.convergence_threshold)
        {
            return Some(StopReason::Converged);
        }
        if state.iteration >= self.max_iterations {
            return Some(StopReason::MaxIterations);
        }
        self.check_batch(state)
    }

    /// Resource checks: budget, timeout, all sections locked.
    pub fn check_batch(&self, state: &IterationState) -> Option<StopReason> {
        if state.tokens_used >= self.max_tokens {
            return Some(StopReason::BudgetExceeded);
        }
        if state.elapsed() >= self.timeout {
            return Some(StopReason::Timeout);
        }
        if state.all_sections_locked() {
            return Some(StopReason::AllLocked);
        }
        None
    }

    /// Run [`Self::check_iteration`] and move to the stopped phase if it fires.
    pub fn observe_iteration(&mut self, state: &IterationState) -> Option<StopReason> {
        self.check_iteration(state).map(|r| self.stop(r))
    }

    /// Run [`Self::check_batch`] and move to the stopped phase if it fires.
    pub fn observe_batch(&mut self, state: &IterationState) -> Option<StopReason> {
        self.check_batch(state).map(|r| self.stop(r))
    }

    /// Escalation falls back to best effort when escalation is disabled.
    pub fn route(&self, reason: StopReason) -> TerminalRoute {
        match (reason, self.on_max_iterations) {
            (StopReason::ScoreMet, _) => TerminalRoute::Accept,
            (_, OnMaxIterations::Escalate) if self.escalation_enabled => TerminalRoute::Escalate,
            _ => TerminalRoute::BestEffort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::RefinementMode;
    use crate::domain::content::{LessonContent, Section, SectionId};
    use crate::domain::state::LockReason;

    fn state_with(scores: &[f64]) -> IterationState {
        let content = LessonContent {
            id: "l".to_string(),
            title: "t".to_string(),
            learning_objectives: vec![],
            sections: vec![Section::new("a", "A", "x.")],
        };
        let mut state = IterationState::new(&content);
        state.score_history = scores.to_vec();
        state.iteration = scores.len() as u32;
        state
    }

    #[test]
    fn test_phase_transitions() {
        let mut c = IterationController::new(&RefinementConfig::for_mode(RefinementMode::SemiAuto));
        assert_eq!(c.phase(), ControllerPhase::Pending);
        c.start();
        assert_eq!(c.phase(), ControllerPhase::Running);
        c.stop(StopReason::Timeout);
        // First terminal state sticks.
        assert_eq!(c.stop(StopReason::AllLocked), StopReason::Timeout);
        assert_eq!(c.phase(), ControllerPhase::Stopped(StopReason::Timeout));
    }

    #[test]
    fn test_score_met_wins() {
        let c = IterationController::new(&RefinementConfig::for_mode(RefinementMode::SemiAuto));
        assert_eq!(c.check_iteration(&state_with(&[0.70, 0.86])), Some(StopReason::ScoreMet));
    }

    #[test]
    fn test_keeps_going_while_improving() {
        let c = IterationController::new(&RefinementConfig::for_mode(RefinementMode::SemiAuto));
        assert_eq!(c.check_iteration(&state_with(&[0.70])), None);
        assert_eq!(c.check_iteration(&state_with(&[0.70, 0.78])), None);
    }

    #[test]
    fn test_max_iterations() {
        let c = IterationController::new(&RefinementConfig::for_mode(RefinementMode::SemiAuto));
        assert_eq!(
            c.check_iteration(&state_with(&[0.50, 0.60, 0.70])),
            Some(StopReason::MaxIterations)
        );
    }

    #[test]
    fn test_budget_checked_after_batch() {
        let c = IterationController::new(&RefinementConfig::for_mode(RefinementMode::SemiAuto));
        let mut state = state_with(&[0.5]);
        state.add_tokens(50_000);
        assert_eq!(c.check_batch(&state), Some(StopReason::BudgetExceeded));
    }

    #[test]
    fn test_all_locked() {
        let c = IterationController::new(&RefinementConfig::for_mode(RefinementMode::SemiAuto));
        let mut state = state_with(&[0.5]);
        state.lock_section(&SectionId::new("a"), LockReason::MaxEdits);
        assert_eq!(c.check_batch(&state), Some(StopReason::AllLocked));
    }

    #[test]
    fn test_routes_by_mode() {
        let semi = IterationController::new(&RefinementConfig::for_mode(RefinementMode::SemiAuto));
        let full = IterationController::new(&RefinementConfig::for_mode(RefinementMode::FullAuto));
        assert_eq!(semi.route(StopReason::Converged), TerminalRoute::Escalate);
        assert_eq!(full.route(StopReason::Converged), TerminalRoute::BestEffort);
        assert_eq!(full.route(StopReason::ScoreMet), TerminalRoute::Accept);
    }

    #[test]
    fn test_disabled_escalation_falls_back_to_best_effort() {
        let config = RefinementConfig {
            escalation_enabled: false,
            ..RefinementConfig::for_mode(RefinementMode::SemiAuto)
        };
        let c = IterationController::new(&config);
        assert_eq!(c.route(StopReason::MaxIterations), TerminalRoute::BestEffort);
    }
}
