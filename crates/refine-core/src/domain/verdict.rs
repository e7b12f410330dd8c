//! Judge verdicts and the consensus record built from them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::{RefineError, Result};
use crate::domain::issue::Issue;
use crate::domain::rubric::Criterion;

/// Judge self-reported confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Decision a judge recommends for the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Accept,
    Revise,
    Regenerate,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Recommendation::Accept => "ACCEPT",
            Recommendation::Revise => "REVISE",
            Recommendation::Regenerate => "REGENERATE",
        };
        write!(f, "{s}")
    }
}

/// Score cut-offs that map a score onto a recommendation band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionBands {
    pub accept: f64,
    pub revise: f64,
}

impl DecisionBands {
    pub const DEFAULT_REVISE_FLOOR: f64 = 0.60;

    pub fn new(accept: f64) -> Self {
        Self {
            accept,
            revise: Self::DEFAULT_REVISE_FLOOR.min(accept),
        }
    }

    pub fn band(&self, score: f64) -> Recommendation {
        if score >= self.accept {
            Recommendation::Accept
        } else if score >= self.revise {
            Recommendation::Revise
        } else {
            Recommendation::Regenerate
        }
    }
}

impl Default for DecisionBands {
    fn default() -> Self {
        Self::new(0.85)
    }
}

/// Independent quality verdict from one evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default)]
    pub evaluator_id: String,
    pub overall_score: f64,
    pub passed: bool,
    pub confidence: Confidence,
    #[serde(default)]
    pub criteria_scores: HashMap<Criterion, f64>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub strengths: Vec<String>,
    pub recommendation: Recommendation,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl Verdict {
    /// Reject scores outside `[0, 1]` or non-finite values.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| RefineError::InvalidVerdict {
            evaluator: self.evaluator_id.clone(),
            reason,
        };
        if !is_unit(self.overall_score) {
            return Err(invalid(format!(
                "overall score {} outside [0, 1]",
                self.overall_score
            )));
        }
        for (criterion, score) in &self.criteria_scores {
            if !is_unit(*score) {
                return Err(invalid(format!("{criterion} score {score} outside [0, 1]")));
            }
        }
        Ok(())
    }

    /// Binary pass/fail for one criterion, used by the agreement coefficient.
    pub fn criterion_passed(&self, criterion: Criterion, threshold: f64) -> Option<bool> {
        self.criteria_scores.get(&criterion).map(|s| *s >= threshold)
    }
}

fn is_unit(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

/// How the final decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    Unanimous,
    Majority,
    Tiebreaker,
}

impl ConsensusMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusMethod::Unanimous => "unanimous",
            ConsensusMethod::Majority => "majority",
            ConsensusMethod::Tiebreaker => "tiebreaker",
        }
    }
}

/// Combined decision over 2–3 verdicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub votes: Vec<Verdict>,
    pub method: ConsensusMethod,
    pub final_score: f64,
    pub final_recommendation: Recommendation,
    pub consensus_reached: bool,
}

impl ConsensusResult {
    /// `tiebreaker` implies exactly 3 votes; `unanimous`/`majority` imply 2 or 3.
    pub fn is_well_formed(&self) -> bool {
        match self.method {
            ConsensusMethod::Tiebreaker => self.votes.len() == 3,
            ConsensusMethod::Unanimous | ConsensusMethod::Majority => {
                matches!(self.votes.len(), 2 | 3)
            }
        }
    }

    pub fn tokens_used(&self) -> u64 {
        self.votes.iter().map(|v| v.tokens_used).sum()
    }

    /// Mean of each criterion across votes that scored it.
    pub fn criteria_scores(&self) -> HashMap<Criterion, f64> {
        let mut sums: HashMap<Criterion, (f64, usize)> = HashMap::new();
        for vote in &self.votes {
            for (criterion, score) in &vote.criteria_scores {
                let entry = sums.entry(*criterion).or_insert((0.0, 0));
                entry.0 += score;
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(c, (sum, n))| (c, sum / n as f64))
            .collect()
    }
}
