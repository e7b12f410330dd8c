//! Inter-rater agreement and the acceptance bands derived from it.

use crate::domain::plan::AcceptancePolicy;
use crate::domain::rubric::Rubric;
use crate::domain::verdict::Verdict;

/// Agreement at or above this accepts every issue.
pub const ACCEPT_ALL_AGREEMENT: f64 = 0.80;
/// Agreement at or above this (and below [`ACCEPT_ALL_AGREEMENT`]) accepts
/// issues reported by at least two judges. Below it only critical issues pass
/// and the run is flagged for human review.
pub const MULTI_JUDGE_AGREEMENT: f64 = 0.67;

/// Nominal Krippendorff's alpha over binary ratings.
///
/// Each entry of `units` holds the pass/fail values the coders assigned to one
/// unit; units with fewer than two values are not pairable and are skipped.
/// Returns 1.0 when no disagreement is possible (fewer than two pairable
/// values, or a single value observed everywhere). The result is clamped to
/// `[0, 1]`.
pub fn krippendorff_alpha(units: &[Vec<bool>]) -> f64 {
    let mut observed_disagreement = 0.0;
    let mut n_pass = 0.0;
    let mut n_fail = 0.0;

    for values in units {
        let m = values.len();
        if m < 2 {
            continue;
        }
        let pass = values.iter().filter(|v| **v).count() as f64;
        let fail = m as f64 - pass;
        // Both off-diagonal cells of the coincidence matrix.
        observed_disagreement += 2.0 * pass * fail / (m as f64 - 1.0);
        n_pass += pass;
        n_fail += fail;
    }

    let n = n_pass + n_fail;
    let expected = 2.0 * n_pass * n_fail;
    if n < 2.0 || expected <= f64::EPSILON {
        return 1.0;
    }
    let alpha = 1.0 - (n - 1.0) * observed_disagreement / expected;
    alpha.clamp(0.0, 1.0)
}

/// Agreement across judges on per-criterion pass/fail.
///
/// Units are the rubric criteria; a judge contributes a value for a criterion
/// only if it scored it.
pub fn agreement_score(votes: &[Verdict], rubric: &Rubric) -> f64 {
    let units: Vec<Vec<bool>> = rubric
        .criteria
        .iter()
        .map(|config| {
            votes
                .iter()
                .filter_map(|v| v.criterion_passed(config.criterion, config.pass_threshold))
                .collect()
        })
        .collect();
    krippendorff_alpha(&units)
}

pub fn acceptance_policy(agreement: f64) -> AcceptancePolicy {
    if agreement >= ACCEPT_ALL_AGREEMENT {
        AcceptancePolicy::AcceptAll
    } else if agreement >= MULTI_JUDGE_AGREEMENT {
        AcceptancePolicy::MultiJudgeOnly
    } else {
        AcceptancePolicy::CriticalOnly
    }
}
