//! Service ports for the external collaborators of the engine.
//!
//! The engine only ever talks to the evaluator, generation and verification
//! services through these traits. Calls to them are the only suspension
//! points of a run; everything else is synchronous computation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::content::{ContextAnchors, LessonContent, SectionId};
use crate::domain::error::ServiceError;
use crate::domain::issue::Issue;
use crate::domain::rubric::{Criterion, Rubric};
use crate::domain::verdict::{Confidence, Verdict};

/// Result type for service calls.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Request sent to an evaluator service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub content: LessonContent,
    pub learning_objectives: Vec<String>,
    pub source_materials: Vec<String>,
    pub rubric: Rubric,
}

/// An opaque judge returning a [`Verdict`].
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Stable identifier, recorded on every verdict.
    fn id(&self) -> &str;

    async fn evaluate(&self, request: &EvaluationRequest) -> ServiceResult<Verdict>;
}

/// What the generation service is asked to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationMode {
    /// Minimal edit of the existing section text.
    Patch,
    /// Rewrite the section from scratch.
    RegenerateSection {
        target_words: usize,
        supporting_context: Vec<String>,
        learning_objectives: Vec<String>,
    },
}

/// Request sent to the content-generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub section_id: SectionId,
    pub mode: GenerationMode,
    pub original_text: String,
    pub instructions: String,
    pub context_anchors: ContextAnchors,
    /// Upper token budget for this call.
    pub budget: u64,
}

/// Response from the content-generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    pub tokens_used: u64,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> ServiceResult<GenerationResponse>;
}

/// Request sent to the verification judge for one patched section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub section_id: SectionId,
    pub original_content: String,
    pub patched_content: String,
    pub addressed_issues: Vec<Issue>,
    pub context_anchors: ContextAnchors,
    /// Criteria whose post-patch scores are required for regression checks.
    pub criteria: Vec<Criterion>,
}

/// Verification judge output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub confidence: Confidence,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub new_issues: Vec<Issue>,
    /// Post-patch scores of the requested criteria.
    #[serde(default)]
    pub criteria_scores: HashMap<Criterion, f64>,
    /// Post-patch quality score of the section itself.
    #[serde(default)]
    pub section_score: Option<f64>,
    #[serde(default)]
    pub tokens_used: u64,
}

#[async_trait]
pub trait VerificationService: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> ServiceResult<VerificationOutcome>;
}
