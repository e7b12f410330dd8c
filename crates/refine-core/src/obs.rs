//! Structured log events for the refinement run lifecycle.
//!
//! These complement the progress stream: the stream is for the caller,
//! these are for operators. All events carry an `event` field so they can be
//! filtered in JSON log pipelines (`REFINE_LOG=info` plus `--json`).

use tracing::{info, warn};

use crate::domain::issue::FixAction;
use crate::domain::outcome::StopReason;
use crate::domain::rubric::Criterion;
use crate::domain::state::LockReason;

pub fn emit_run_started(run_id: &str, content_id: &str, sections: usize) {
    info!(event = "run.started", run_id = %run_id, content_id = %content_id, sections);
}

pub fn emit_run_finished(run_id: &str, outcome: &str, iterations: u32, tokens_used: u64, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        outcome = %outcome,
        iterations,
        tokens_used,
        duration_ms,
    );
}

pub fn emit_consensus(run_id: &str, iteration: u32, score: f64, method: &str, reached: bool) {
    info!(
        event = "consensus.completed",
        run_id = %run_id,
        iteration,
        score,
        method = %method,
        consensus_reached = reached,
    );
}

pub fn emit_plan_built(run_id: &str, iteration: u32, tasks: usize, batches: usize, agreement: f64) {
    info!(
        event = "plan.built",
        run_id = %run_id,
        iteration,
        tasks,
        batches,
        agreement,
    );
}

pub fn emit_task_routed(run_id: &str, section: &str, action: FixAction, estimated_tokens: u64) {
    info!(
        event = "task.routed",
        run_id = %run_id,
        section = %section,
        action = %action,
        estimated_tokens,
    );
}

pub fn emit_section_locked(run_id: &str, section: &str, reason: LockReason) {
    info!(event = "section.locked", run_id = %run_id, section = %section, reason = %reason);
}

pub fn emit_regression(run_id: &str, section: &str, criterion: Criterion, locked: f64, observed: f64) {
    warn!(
        event = "quality.regression",
        run_id = %run_id,
        section = %section,
        criterion = %criterion,
        locked,
        observed,
    );
}

pub fn emit_stopped(run_id: &str, reason: StopReason, score: Option<f64>) {
    info!(event = "run.stopped", run_id = %run_id, reason = %reason, score = ?score);
}

/// Warning-level: an evaluator or service failure ended the run early.
pub fn emit_run_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_without_subscriber() {
        emit_run_started("test-run-id", "lesson-1", 3);
        emit_stopped("test-run-id", StopReason::Converged, Some(0.79));
    }
}
