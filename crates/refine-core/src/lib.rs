//! Targeted content-refinement engine.
//!
//! Two judges score a lesson on the fast path, a third breaks ties. The
//! arbiter turns their issues into at most one repair task per section,
//! grouped into adjacency-safe batches. The router picks a patch, a section
//! rewrite or a full restart for each task, executors run them in parallel,
//! and the delta-verifier plus quality locks decide what gets committed. The
//! iteration controller stops the loop and routes the result to acceptance,
//! human escalation or a best-effort fallback.
//!
//! ```no_run
//! # async fn demo(
//! #     panel: refine_core::EvaluatorPanel,
//! #     generator: std::sync::Arc<dyn refine_core::GenerationService>,
//! #     verifier: std::sync::Arc<dyn refine_core::VerificationService>,
//! #     lesson: refine_core::LessonContent,
//! # ) -> refine_core::Result<()> {
//! use refine_core::{RefinementConfig, RefinementEngine, RefinementMode, RefinementRequest};
//!
//! let config = RefinementConfig::for_mode(RefinementMode::SemiAuto);
//! let engine = RefinementEngine::new(config, panel, generator, verifier)?;
//! let report = engine.run(RefinementRequest::new(lesson)).await?;
//! println!("{}", report.outcome.kind());
//! # Ok(())
//! # }
//! ```

pub mod arbiter;
pub mod best_effort;
pub mod consensus;
pub mod controller;
pub mod domain;
pub mod engine;
pub mod events;
pub mod executors;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod ports;
pub mod quality_lock;
pub mod report;
pub mod router;
pub mod telemetry;
pub mod verifier;

pub use arbiter::Arbiter;
pub use best_effort::BestEffortSelector;
pub use consensus::{ConsensusAggregator, EvaluatorPanel, PanelMember, PanelStrategy};
pub use controller::{ControllerPhase, IterationController, TerminalRoute};
pub use domain::{
    AcceptancePolicy, BestEffortResult, ConfigOverrides, ConsensusMethod, ConsensusResult,
    Criterion, EscalationReason, FixAction, Issue, IterationState, LessonContent, LockReason,
    OnMaxIterations, QualityStatus, Recommendation, RefineError, RefinementConfig,
    RefinementMode, RefinementOutcome, RefinementPlan, RefinementReport, Result, Rubric, Section,
    SectionId, ServiceError, Severity, StopReason, TaskFailure, Verdict,
};
pub use engine::{RefinementEngine, RefinementRequest};
pub use events::{PlanDisplay, ProgressEmitter, ProgressEnvelope, ProgressEvent};
pub use executors::{Executors, PatchResult};
pub use ports::{
    EvaluationRequest, Evaluator, GenerationMode, GenerationRequest, GenerationResponse,
    GenerationService, ServiceResult, VerificationOutcome, VerificationRequest,
    VerificationService,
};
pub use quality_lock::QualityLockManager;
pub use report::{read_report_artifact, write_report_artifact, RefinementArtifact};
pub use router::{ExecutorKind, Router, RouterDecision};
pub use verifier::DeltaVerifier;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
