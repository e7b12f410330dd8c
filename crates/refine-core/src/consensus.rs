//! Consensus aggregation over independent judge verdicts.
//!
//! Fast path: two primaries are consulted concurrently. If they agree (same
//! recommendation or same score band) the result is `unanimous` and the third,
//! most expensive judge is never called. Otherwise the tiebreaker is invoked and
//! the decision falls to the 2-of-3 majority band, or to the tiebreaker's band
//! when nobody agrees.
//!
//! The decision functions are pure; [`ConsensusAggregator`] only adds the
//! service calls around them.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::domain::error::{RefineError, Result};
use crate::domain::verdict::{
    ConsensusMethod, ConsensusResult, DecisionBands, Recommendation, Verdict,
};
use crate::metrics::METRICS;
use crate::ports::{EvaluationRequest, Evaluator};

/// One judge with its voting weight.
#[derive(Clone)]
pub struct PanelMember {
    pub evaluator: Arc<dyn Evaluator>,
    pub weight: f64,
}

impl PanelMember {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            weight: 1.0,
        }
    }

    pub fn weighted(evaluator: Arc<dyn Evaluator>, weight: f64) -> Self {
        Self { evaluator, weight }
    }
}

impl std::fmt::Debug for PanelMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelMember")
            .field("evaluator", &self.evaluator.id())
            .field("weight", &self.weight)
            .finish()
    }
}

/// How the panel is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelStrategy {
    /// Two primaries first; the third judge only on disagreement.
    FastPath,
    /// All three judges up front.
    FullPanel,
}

/// Three judges: two primaries and a tiebreaker.
#[derive(Debug, Clone)]
pub struct EvaluatorPanel {
    pub primary: [PanelMember; 2],
    pub tiebreaker: PanelMember,
    pub strategy: PanelStrategy,
}

impl EvaluatorPanel {
    pub fn fast_path(a: PanelMember, b: PanelMember, tiebreaker: PanelMember) -> Self {
        Self {
            primary: [a, b],
            tiebreaker,
            strategy: PanelStrategy::FastPath,
        }
    }

    pub fn full_panel(a: PanelMember, b: PanelMember, c: PanelMember) -> Self {
        Self {
            primary: [a, b],
            tiebreaker: c,
            strategy: PanelStrategy::FullPanel,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for member in self.primary.iter().chain(std::iter::once(&self.tiebreaker)) {
            if !member.weight.is_finite() || member.weight <= 0.0 {
                return Err(RefineError::InvalidConfig(format!(
                    "judge weight for {} must be positive",
                    member.evaluator.id()
                )));
            }
        }
        Ok(())
    }
}

/// Two votes agree when they recommend the same action or land in the same band.
pub fn votes_agree(a: &Verdict, b: &Verdict, bands: &DecisionBands) -> bool {
    a.recommendation == b.recommendation
        || bands.band(a.overall_score) == bands.band(b.overall_score)
}

/// The recommendation an agreeing pair settles on.
fn agreed_recommendation(a: &Verdict, b: &Verdict, bands: &DecisionBands) -> Recommendation {
    if a.recommendation == b.recommendation {
        a.recommendation
    } else {
        bands.band(a.overall_score)
    }
}

/// Weighted mean of vote scores. `weights` aligns with `votes`.
pub fn weighted_mean(votes: &[Verdict], weights: &[f64]) -> f64 {
    let (sum, total) = votes
        .iter()
        .zip(weights)
        .fold((0.0, 0.0), |(s, t), (v, w)| (s + v.overall_score * w, t + w));
    if total <= f64::EPSILON {
        0.0
    } else {
        sum / total
    }
}

/// Decide on the cheap pair. `None` means the tiebreaker is required.
pub fn decide_pair(
    a: &Verdict,
    b: &Verdict,
    weights: [f64; 2],
    bands: &DecisionBands,
) -> Option<ConsensusResult> {
    if !votes_agree(a, b, bands) {
        return None;
    }
    let votes = vec![a.clone(), b.clone()];
    Some(ConsensusResult {
        final_score: weighted_mean(&votes, &weights),
        final_recommendation: agreed_recommendation(a, b, bands),
        method: ConsensusMethod::Unanimous,
        consensus_reached: true,
        votes,
    })
}

/// Decide after the tiebreaker (`c`) was consulted on a split pair.
pub fn decide_with_tiebreaker(
    a: &Verdict,
    b: &Verdict,
    c: &Verdict,
    weights: [f64; 3],
    bands: &DecisionBands,
) -> ConsensusResult {
    let votes = vec![a.clone(), b.clone(), c.clone()];
    let final_score = weighted_mean(&votes, &weights);

    let majority = if votes_agree(c, a, bands) {
        Some(agreed_recommendation(c, a, bands))
    } else if votes_agree(c, b, bands) {
        Some(agreed_recommendation(c, b, bands))
    } else {
        None
    };

    ConsensusResult {
        final_score,
        final_recommendation: majority.unwrap_or(c.recommendation),
        method: ConsensusMethod::Tiebreaker,
        consensus_reached: majority.is_some(),
        votes,
    }
}

/// Decide over three votes collected up front.
pub fn decide_panel(
    a: &Verdict,
    b: &Verdict,
    c: &Verdict,
    weights: [f64; 3],
    bands: &DecisionBands,
) -> ConsensusResult {
    let votes = vec![a.clone(), b.clone(), c.clone()];
    let final_score = weighted_mean(&votes, &weights);
    let ab = votes_agree(a, b, bands);
    let ac = votes_agree(a, c, bands);
    let bc = votes_agree(b, c, bands);

    let (method, recommendation) = if ab && ac && bc {
        (ConsensusMethod::Unanimous, agreed_recommendation(a, b, bands))
    } else if ab {
        (ConsensusMethod::Majority, agreed_recommendation(a, b, bands))
    } else if ac {
        (ConsensusMethod::Majority, agreed_recommendation(a, c, bands))
    } else if bc {
        (ConsensusMethod::Majority, agreed_recommendation(b, c, bands))
    } else {
        return decide_with_tiebreaker(a, b, c, weights, bands);
    };

    ConsensusResult {
        votes,
        method,
        final_score,
        final_recommendation: recommendation,
        consensus_reached: true,
    }
}

/// Runs the panel against the evaluator services.
#[derive(Debug, Clone)]
pub struct ConsensusAggregator {
    panel: EvaluatorPanel,
    bands: DecisionBands,
}

impl ConsensusAggregator {
    pub fn new(panel: EvaluatorPanel, bands: DecisionBands) -> Self {
        Self { panel, bands }
    }

    pub fn bands(&self) -> &DecisionBands {
        &self.bands
    }

    pub fn panel(&self) -> &EvaluatorPanel {
        &self.panel
    }

    /// Collect verdicts and aggregate them.
    ///
    /// Any evaluator failure (transport error or invalid verdict) yields
    /// [`RefineError::EvaluatorUnavailable`]; the caller escalates.
    #[instrument(skip_all, fields(content_id = %request.content.id))]
    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<ConsensusResult> {
        let [a, b] = &self.panel.primary;
        let c = &self.panel.tiebreaker;

        match self.panel.strategy {
            PanelStrategy::FastPath => {
                let (va, vb) = tokio::join!(call(a, request), call(b, request));
                let (va, vb) = (va?, vb?);
                if let Some(result) = decide_pair(&va, &vb, [a.weight, b.weight], &self.bands) {
                    debug!(score = result.final_score, "primary judges agree");
                    return Ok(result);
                }
                METRICS.inc_tiebreakers();
                debug!(
                    a = va.overall_score,
                    b = vb.overall_score,
                    "primary judges split, invoking tiebreaker"
                );
                let vc = call(c, request).await?;
                let result = decide_with_tiebreaker(
                    &va,
                    &vb,
                    &vc,
                    [a.weight, b.weight, c.weight],
                    &self.bands,
                );
                if !result.consensus_reached {
                    warn!(
                        recommendation = %result.final_recommendation,
                        "tiebreaker matched no other vote"
                    );
                }
                Ok(result)
            }
            PanelStrategy::FullPanel => {
                let (va, vb, vc) =
                    tokio::join!(call(a, request), call(b, request), call(c, request));
                let (va, vb, vc) = (va?, vb?, vc?);
                Ok(decide_panel(
                    &va,
                    &vb,
                    &vc,
                    [a.weight, b.weight, c.weight],
                    &self.bands,
                ))
            }
        }
    }
}

async fn call(member: &PanelMember, request: &EvaluationRequest) -> Result<Verdict> {
    METRICS.inc_evaluator_calls();
    let id = member.evaluator.id().to_string();
    let mut verdict = member
        .evaluator
        .evaluate(request)
        .await
        .map_err(|e| RefineError::EvaluatorUnavailable {
            evaluator: id.clone(),
            reason: e.to_string(),
        })?;
    verdict.evaluator_id = id.clone();
    verdict
        .validate()
        .map_err(|e| RefineError::EvaluatorUnavailable {
            evaluator: id,
            reason: e.to_string(),
        })?;
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::verdict::Confidence;
    use std::collections::HashMap;

    fn vote(id: &str, score: f64, rec: Recommendation) -> Verdict {
        Verdict {
            evaluator_id: id.to_string(),
            overall_score: score,
            passed: rec == Recommendation::Accept,
            confidence: Confidence::High,
            criteria_scores: HashMap::new(),
            issues: vec![],
            strengths: vec![],
            recommendation: rec,
            tokens_used: 100,
            duration_ms: 10,
        }
    }

    #[test]
    fn test_pair_agreement_is_unanimous() {
        let bands = DecisionBands::new(0.85);
        let a = vote("a", 0.92, Recommendation::Accept);
        let b = vote("b", 0.89, Recommendation::Accept);
        let result = decide_pair(&a, &b, [1.0, 1.0], &bands).unwrap();
        assert_eq!(result.method, ConsensusMethod::Unanimous);
        assert!((result.final_score - 0.905).abs() < 1e-9);
        assert!(result.is_well_formed());
    }

    #[test]
    fn test_same_band_counts_as_agreement() {
        let bands = DecisionBands::new(0.85);
        let a = vote("a", 0.70, Recommendation::Revise);
        let b = vote("b", 0.72, Recommendation::Regenerate);
        let result = decide_pair(&a, &b, [1.0, 1.0], &bands).unwrap();
        assert_eq!(result.final_recommendation, Recommendation::Revise);
    }

    #[test]
    fn test_split_pair_needs_tiebreaker() {
        let bands = DecisionBands::new(0.85);
        let a = vote("a", 0.95, Recommendation::Accept);
        let b = vote("b", 0.55, Recommendation::Regenerate);
        assert!(decide_pair(&a, &b, [1.0, 1.0], &bands).is_none());
    }

    #[test]
    fn test_tiebreaker_without_match_keeps_its_band() {
        let bands = DecisionBands::new(0.85);
        let a = vote("a", 0.95, Recommendation::Accept);
        let b = vote("b", 0.40, Recommendation::Regenerate);
        let c = vote("c", 0.70, Recommendation::Revise);
        let result = decide_with_tiebreaker(&a, &b, &c, [1.0; 3], &bands);
        assert_eq!(result.method, ConsensusMethod::Tiebreaker);
        assert!(!result.consensus_reached);
        assert_eq!(result.final_recommendation, Recommendation::Revise);
        assert!(result.is_well_formed());
    }

    #[test]
    fn test_weighted_mean_respects_weights() {
        let votes = vec![
            vote("a", 1.0, Recommendation::Accept),
            vote("b", 0.0, Recommendation::Regenerate),
        ];
        assert!((weighted_mean(&votes, &[3.0, 1.0]) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_full_panel_majority() {
        let bands = DecisionBands::new(0.85);
        let a = vote("a", 0.90, Recommendation::Accept);
        let b = vote("b", 0.50, Recommendation::Regenerate);
        let c = vote("c", 0.88, Recommendation::Accept);
        let result = decide_panel(&a, &b, &c, [1.0; 3], &bands);
        assert_eq!(result.method, ConsensusMethod::Majority);
        assert_eq!(result.final_recommendation, Recommendation::Accept);
        assert!(result.consensus_reached);
    }

    #[test]
    fn test_full_panel_unanimous() {
        let bands = DecisionBands::new(0.85);
        let a = vote("a", 0.90, Recommendation::Accept);
        let b = vote("b", 0.91, Recommendation::Accept);
        let c = vote("c", 0.88, Recommendation::Accept);
        let result = decide_panel(&a, &b, &c, [1.0; 3], &bands);
        assert_eq!(result.method, ConsensusMethod::Unanimous);
        assert_eq!(result.votes.len(), 3);
    }
}
