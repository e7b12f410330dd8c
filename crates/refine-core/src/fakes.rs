//! In-memory fakes for the service ports (testing only)
//!
//! Provides `ScriptedEvaluator`, `ScriptedGenerator` and `ScriptedVerifier`
//! that satisfy the port contracts without any network access. Each fake
//! counts its calls so tests can assert how often a service was consulted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::error::ServiceError;
use crate::domain::issue::Issue;
use crate::domain::rubric::Criterion;
use crate::domain::verdict::{Confidence, DecisionBands, Verdict};
use crate::ports::{
    EvaluationRequest, Evaluator, GenerationRequest, GenerationResponse, GenerationService,
    ServiceResult, VerificationOutcome, VerificationRequest, VerificationService,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A verdict scoring every criterion at `score`, with the recommendation
/// taken from the default decision bands.
pub fn verdict(score: f64) -> Verdict {
    let bands = DecisionBands::default();
    Verdict {
        evaluator_id: String::new(),
        overall_score: score,
        passed: score >= bands.accept,
        confidence: Confidence::High,
        criteria_scores: Criterion::ALL.iter().map(|c| (*c, score)).collect(),
        issues: Vec::new(),
        strengths: Vec::new(),
        recommendation: bands.band(score),
        tokens_used: 100,
        duration_ms: 0,
    }
}

/// [`verdict`] carrying the given issues.
pub fn verdict_with_issues(score: f64, issues: Vec<Issue>) -> Verdict {
    Verdict {
        issues,
        ..verdict(score)
    }
}

// ---------------------------------------------------------------------------
// ScriptedEvaluator
// ---------------------------------------------------------------------------

/// Evaluator that replays a queue of results, then repeats its last verdict.
#[derive(Debug)]
pub struct ScriptedEvaluator {
    id: String,
    script: Mutex<VecDeque<ServiceResult<Verdict>>>,
    last: Mutex<Option<Verdict>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue one verdict.
    pub fn then(self, verdict: Verdict) -> Self {
        lock(&self.script).push_back(Ok(verdict));
        self
    }

    /// Queue verdicts of the given scores, in order.
    pub fn scores(self, scores: &[f64]) -> Self {
        scores.iter().fold(self, |e, s| e.then(verdict(*s)))
    }

    /// Queue one failure.
    pub fn then_fail(self, error: ServiceError) -> Self {
        lock(&self.script).push_back(Err(error));
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, _request: &EvaluationRequest) -> ServiceResult<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.script).pop_front();
        match next {
            Some(Ok(verdict)) => {
                *lock(&self.last) = Some(verdict.clone());
                Ok(verdict)
            }
            Some(Err(e)) => Err(e),
            None => lock(&self.last)
                .clone()
                .ok_or_else(|| ServiceError::Unavailable(format!("{}: script exhausted", self.id))),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedGenerator
// ---------------------------------------------------------------------------

type GenerateFn = dyn Fn(&GenerationRequest) -> ServiceResult<GenerationResponse> + Send + Sync;

/// Generation service driven by a closure; records every request.
pub struct ScriptedGenerator {
    respond: Box<GenerateFn>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl std::fmt::Debug for ScriptedGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedGenerator")
            .field("calls", &self.calls())
            .finish()
    }
}

impl ScriptedGenerator {
    pub fn from_fn(
        respond: impl Fn(&GenerationRequest) -> ServiceResult<GenerationResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Appends a revision marker to the section text.
    pub fn rewriting(tokens_used: u64) -> Self {
        Self::from_fn(move |req| {
            Ok(GenerationResponse {
                content: format!("{}\nRevised: {}", req.original_text, req.instructions),
                tokens_used,
                success: true,
                error_message: None,
            })
        })
    }

    /// Reports failure on every call.
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_fn(move |_| {
            Ok(GenerationResponse {
                content: String::new(),
                tokens_used: 0,
                success: false,
                error_message: Some(message.clone()),
            })
        })
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> ServiceResult<GenerationResponse> {
        lock(&self.requests).push(request.clone());
        (self.respond)(request)
    }
}

// ---------------------------------------------------------------------------
// ScriptedVerifier
// ---------------------------------------------------------------------------

type VerifyFn = dyn Fn(&VerificationRequest) -> ServiceResult<VerificationOutcome> + Send + Sync;

/// Verification service driven by a closure; counts calls.
pub struct ScriptedVerifier {
    respond: Box<VerifyFn>,
    calls: AtomicUsize,
}

impl std::fmt::Debug for ScriptedVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedVerifier")
            .field("calls", &self.calls())
            .finish()
    }
}

impl ScriptedVerifier {
    pub fn from_fn(
        respond: impl Fn(&VerificationRequest) -> ServiceResult<VerificationOutcome> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    /// Passes every patch and scores each requested criterion at `score`.
    pub fn approving(score: f64) -> Self {
        Self::from_fn(move |req| Ok(outcome(true, score, &req.criteria, "issues addressed")))
    }

    /// Rejects every patch.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::from_fn(move |req| Ok(outcome(false, 0.5, &req.criteria, &reason)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A verification outcome with uniform criterion scores.
pub fn outcome(passed: bool, score: f64, criteria: &[Criterion], reasoning: &str) -> VerificationOutcome {
    VerificationOutcome {
        passed,
        confidence: Confidence::High,
        reasoning: reasoning.to_string(),
        new_issues: Vec::new(),
        criteria_scores: criteria.iter().map(|c| (*c, score)).collect::<HashMap<_, _>>(),
        section_score: Some(score),
        tokens_used: 50,
    }
}

#[async_trait]
impl VerificationService for ScriptedVerifier {
    async fn verify(&self, request: &VerificationRequest) -> ServiceResult<VerificationOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::{LessonContent, Section};
    use crate::domain::rubric::Rubric;

    fn request() -> EvaluationRequest {
        EvaluationRequest {
            content: LessonContent {
                id: "l".to_string(),
                title: "t".to_string(),
                learning_objectives: vec![],
                sections: vec![Section::new("a", "A", "x.")],
            },
            learning_objectives: vec![],
            source_materials: vec![],
            rubric: Rubric::standard(),
        }
    }

    #[tokio::test]
    async fn test_scripted_evaluator_repeats_last_verdict() {
        let judge = ScriptedEvaluator::new("j1").scores(&[0.7, 0.8]);
        let req = request();
        assert_eq!(judge.evaluate(&req).await.unwrap().overall_score, 0.7);
        assert_eq!(judge.evaluate(&req).await.unwrap().overall_score, 0.8);
        assert_eq!(judge.evaluate(&req).await.unwrap().overall_score, 0.8);
        assert_eq!(judge.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_script_is_unavailable() {
        let judge = ScriptedEvaluator::new("j1");
        assert!(matches!(
            judge.evaluate(&request()).await,
            Err(ServiceError::Unavailable(_))
        ));
    }
}
