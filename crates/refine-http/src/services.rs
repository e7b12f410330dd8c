//! Port implementations backed by remote JSON services.

use std::time::Instant;

use async_trait::async_trait;
use refine_core::{
    EvaluationRequest, Evaluator, GenerationRequest, GenerationResponse, GenerationService,
    ServiceResult, VerificationOutcome, VerificationRequest, VerificationService, Verdict,
};
use tracing::debug;

use crate::client::{JsonClient, ServiceEndpoint};

/// A judge reached over HTTP at `POST {base_url}/evaluate`.
#[derive(Debug, Clone)]
pub struct HttpEvaluator {
    id: String,
    client: JsonClient,
}

impl HttpEvaluator {
    pub fn new(id: impl Into<String>, endpoint: ServiceEndpoint) -> ServiceResult<Self> {
        Ok(Self {
            id: id.into(),
            client: JsonClient::new(endpoint)?,
        })
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        self.client.endpoint()
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> ServiceResult<Verdict> {
        let started = Instant::now();
        let mut verdict: Verdict = self.client.post("evaluate", request).await?;
        // Votes are keyed by the configured id.
        verdict.evaluator_id = self.id.clone();
        if verdict.duration_ms == 0 {
            verdict.duration_ms = started.elapsed().as_millis() as u64;
        }
        debug!(
            evaluator = %self.id,
            score = verdict.overall_score,
            recommendation = %verdict.recommendation,
            "verdict received"
        );
        Ok(verdict)
    }
}

/// Content generation at `POST {base_url}/generate`.
#[derive(Debug, Clone)]
pub struct HttpGenerationService {
    client: JsonClient,
}

impl HttpGenerationService {
    pub fn new(endpoint: ServiceEndpoint) -> ServiceResult<Self> {
        Ok(Self {
            client: JsonClient::new(endpoint)?,
        })
    }
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    async fn generate(&self, request: &GenerationRequest) -> ServiceResult<GenerationResponse> {
        let response: GenerationResponse = self.client.post("generate", request).await?;
        debug!(
            section = %request.section_id,
            tokens = response.tokens_used,
            success = response.success,
            "generation finished"
        );
        Ok(response)
    }
}

/// Delta verification at `POST {base_url}/verify`.
#[derive(Debug, Clone)]
pub struct HttpVerificationService {
    client: JsonClient,
}

impl HttpVerificationService {
    pub fn new(endpoint: ServiceEndpoint) -> ServiceResult<Self> {
        Ok(Self {
            client: JsonClient::new(endpoint)?,
        })
    }
}

#[async_trait]
impl VerificationService for HttpVerificationService {
    async fn verify(&self, request: &VerificationRequest) -> ServiceResult<VerificationOutcome> {
        let outcome: VerificationOutcome = self.client.post("verify", request).await?;
        debug!(
            section = %request.section_id,
            passed = outcome.passed,
            "verification finished"
        );
        Ok(outcome)
    }
}
