//! Domain model for the refinement engine.
//!
//! Canonical definitions shared by every component:
//! - `LessonContent`: the content unit being refined
//! - `Rubric` / `Criterion`: weighted quality dimensions
//! - `Verdict` / `ConsensusResult`: judge output and its aggregation
//! - `RefinementPlan`: arbiter output
//! - `IterationState`: controller-owned run state
//! - `RefinementConfig`: per-run configuration

pub mod config;
pub mod content;
pub mod digest;
pub mod error;
pub mod issue;
pub mod outcome;
pub mod plan;
pub mod rubric;
pub mod state;
pub mod verdict;

pub use config::{ConfigOverrides, OnMaxIterations, RefinementConfig, RefinementMode};
pub use content::{ContextAnchors, LessonContent, Section, SectionId};
pub use error::{RefineError, Result, ServiceError};
pub use issue::{FixAction, Issue, IssueLocation, Severity, TargetedIssue};
pub use outcome::{
    BestEffortResult, EscalationReason, QualityStatus, RefinementOutcome, RefinementReport,
    StopReason, TaskFailure, UnresolvedTask,
};
pub use plan::{
    AcceptancePolicy, ConflictResolution, PlanStatus, RefinementPlan, SectionRefinementTask,
    TokenEstimate,
};
pub use rubric::{Criterion, CriterionConfig, Rubric};
pub use state::{IterationResult, IterationState, LockReason};
pub use verdict::{
    Confidence, ConsensusMethod, ConsensusResult, DecisionBands, Recommendation, Verdict,
};
