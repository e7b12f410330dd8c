//! Evaluation criteria, their conflict priority and the weighted rubric.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::{RefineError, Result};

/// Tolerance applied to the rubric weight sum.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// Quality dimension a judge scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Accuracy,
    Safety,
    ObjectiveAlignment,
    Structure,
    Clarity,
    Engagement,
    Completeness,
}

impl Criterion {
    pub const ALL: [Criterion; 7] = [
        Criterion::Accuracy,
        Criterion::Safety,
        Criterion::ObjectiveAlignment,
        Criterion::Structure,
        Criterion::Clarity,
        Criterion::Engagement,
        Criterion::Completeness,
    ];

    /// Conflict-resolution rank; lower wins.
    ///
    /// accuracy/safety > learning-objective alignment > structure > clarity >
    /// engagement > completeness.
    pub fn priority_rank(self) -> u8 {
        match self {
            Criterion::Accuracy | Criterion::Safety => 0,
            Criterion::ObjectiveAlignment => 1,
            Criterion::Structure => 2,
            Criterion::Clarity => 3,
            Criterion::Engagement => 4,
            Criterion::Completeness => 5,
        }
    }

    /// Whether `self` beats `other` in a conflict.
    pub fn outranks(self, other: Criterion) -> bool {
        self.priority_rank() < other.priority_rank()
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Criterion::Accuracy => "accuracy",
            Criterion::Safety => "safety",
            Criterion::ObjectiveAlignment => "objective_alignment",
            Criterion::Structure => "structure",
            Criterion::Clarity => "clarity",
            Criterion::Engagement => "engagement",
            Criterion::Completeness => "completeness",
        };
        write!(f, "{s}")
    }
}

/// Weight and pass threshold of one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionConfig {
    pub criterion: Criterion,
    pub weight: f64,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
}

fn default_pass_threshold() -> f64 {
    0.7
}

/// Weighted set of criteria used by every judge in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub criteria: Vec<CriterionConfig>,
}

impl Rubric {
    /// Default educational rubric.
    pub fn standard() -> Self {
        let entry = |criterion, weight| CriterionConfig {
            criterion,
            weight,
            pass_threshold: default_pass_threshold(),
        };
        Self {
            criteria: vec![
                entry(Criterion::Accuracy, 0.25),
                entry(Criterion::Safety, 0.10),
                entry(Criterion::ObjectiveAlignment, 0.20),
                entry(Criterion::Structure, 0.15),
                entry(Criterion::Clarity, 0.15),
                entry(Criterion::Engagement, 0.10),
                entry(Criterion::Completeness, 0.05),
            ],
        }
    }

    /// Enforce `|Σweight − 1.0| < 0.001`, non-negative weights, thresholds in
    /// `[0, 1]` and unique criteria.
    pub fn validate(&self) -> Result<()> {
        if self.criteria.is_empty() {
            return Err(RefineError::InvalidRubricDefinition(
                "rubric must contain at least one criterion".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for c in &self.criteria {
            if !seen.insert(c.criterion) {
                return Err(RefineError::InvalidRubricDefinition(format!(
                    "duplicate criterion: {}",
                    c.criterion
                )));
            }
            if !c.weight.is_finite() || c.weight < 0.0 {
                return Err(RefineError::InvalidRubricDefinition(format!(
                    "weight for {} must be a non-negative number",
                    c.criterion
                )));
            }
            if !(0.0..=1.0).contains(&c.pass_threshold) {
                return Err(RefineError::InvalidRubricDefinition(format!(
                    "pass threshold for {} must be within [0, 1]",
                    c.criterion
                )));
            }
        }
        let sum = self.weight_sum();
        if (sum - 1.0).abs() >= WEIGHT_SUM_TOLERANCE {
            return Err(RefineError::InvalidRubric { sum });
        }
        Ok(())
    }

    pub fn weight_sum(&self) -> f64 {
        self.criteria.iter().map(|c| c.weight).sum()
    }

    pub fn config_for(&self, criterion: Criterion) -> Option<&CriterionConfig> {
        self.criteria.iter().find(|c| c.criterion == criterion)
    }

    pub fn pass_threshold(&self, criterion: Criterion) -> Option<f64> {
        self.config_for(criterion).map(|c| c.pass_threshold)
    }

    /// Weighted overall score from per-criterion scores.
    ///
    /// Missing criteria are excluded and the remaining weights renormalised,
    /// so a judge that skips a criterion does not get a zero for it.
    pub fn weighted_score(&self, scores: &HashMap<Criterion, f64>) -> Option<f64> {
        let mut total = 0.0;
        let mut weight = 0.0;
        for c in &self.criteria {
            if let Some(score) = scores.get(&c.criterion) {
                total += c.weight * score;
                weight += c.weight;
            }
        }
        if weight <= f64::EPSILON {
            None
        } else {
            Some(total / weight)
        }
    }
}

impl Default for Rubric {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_rubric_is_valid() {
        let rubric = Rubric::standard();
        rubric.validate().unwrap();
        assert!((rubric.weight_sum() - 1.0).abs() < WEIGHT_SUM_TOLERANCE);
    }

    #[test]
    fn test_weights_off_by_more_than_tolerance_are_rejected() {
        let mut rubric = Rubric::standard();
        rubric.criteria[0].weight += 0.002;
        assert!(matches!(
            rubric.validate(),
            Err(RefineError::InvalidRubric { .. })
        ));
    }

    #[test]
    fn test_weights_within_tolerance_are_accepted() {
        let mut rubric = Rubric::standard();
        rubric.criteria[0].weight += 0.0005;
        rubric.validate().unwrap();
    }

    #[test]
    fn test_duplicate_criterion_is_rejected() {
        let mut rubric = Rubric::standard();
        rubric.criteria[1].criterion = Criterion::Accuracy;
        assert!(matches!(
            rubric.validate(),
            Err(RefineError::InvalidRubricDefinition(_))
        ));
    }

    #[test]
    fn test_priority_hierarchy() {
        assert!(Criterion::Accuracy.outranks(Criterion::ObjectiveAlignment));
        assert!(Criterion::Safety.outranks(Criterion::Structure));
        assert!(Criterion::ObjectiveAlignment.outranks(Criterion::Structure));
        assert!(Criterion::Structure.outranks(Criterion::Clarity));
        assert!(Criterion::Clarity.outranks(Criterion::Engagement));
        assert!(Criterion::Engagement.outranks(Criterion::Completeness));
        assert!(!Criterion::Accuracy.outranks(Criterion::Safety));
    }

    #[test]
    fn test_weighted_score_renormalises_missing_criteria() {
        let rubric = Rubric {
            criteria: vec![
                CriterionConfig {
                    criterion: Criterion::Accuracy,
                    weight: 0.5,
                    pass_threshold: 0.7,
                },
                CriterionConfig {
                    criterion: Criterion::Clarity,
                    weight: 0.5,
                    pass_threshold: 0.7,
                },
            ],
        };
        let scores = HashMap::from([(Criterion::Accuracy, 0.8)]);
        assert!((rubric.weighted_score(&scores).unwrap() - 0.8).abs() < 1e-9);
        assert!(rubric.weighted_score(&HashMap::new()).is_none());
    }
}
