//! HTTP adapters for the refinement engine's service ports.
//!
//! Each remote collaborator is a JSON endpoint:
//!
//! | Port | Route |
//! |------|-------|
//! | [`Evaluator`](refine_core::Evaluator) | `POST /evaluate` |
//! | [`GenerationService`](refine_core::GenerationService) | `POST /generate` |
//! | [`VerificationService`](refine_core::VerificationService) | `POST /verify` |
//!
//! Request and response bodies are the serde forms of the corresponding
//! `refine_core` port types. Transport failures are reported as
//! [`ServiceError`](refine_core::ServiceError) so the engine can tell an
//! unreachable judge from a malformed answer.

mod client;
mod services;

pub use client::ServiceEndpoint;
pub use services::{HttpEvaluator, HttpGenerationService, HttpVerificationService};
