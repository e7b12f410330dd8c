//! Executors that mutate content: Patcher, Section-Regenerator and
//! Full-Regenerator.
//!
//! Executors never retry on their own and never return `Err`. A failed
//! generation call comes back as a [`PatchResult`] with `success = false`;
//! callers must check it.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::content::{LessonContent, Section, SectionId};
use crate::domain::issue::FixAction;
use crate::domain::plan::SectionRefinementTask;
use crate::ports::{GenerationMode, GenerationRequest, GenerationService};
use crate::router::RouterDecision;

/// Lower bound on the word target handed to section regeneration.
pub const MIN_REGENERATION_WORDS: usize = 120;
/// Supporting passages attached to a regeneration request.
pub const MAX_SUPPORTING_PASSAGES: usize = 3;

/// Result of one content mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchResult {
    pub section_id: SectionId,
    pub action: FixAction,
    pub success: bool,
    pub original_content: String,
    pub patched_content: String,
    pub diff_summary: String,
    pub tokens_used: u64,
    pub error: Option<String>,
}

impl PatchResult {
    fn failed(
        section_id: SectionId,
        action: FixAction,
        original: String,
        tokens_used: u64,
        error: String,
    ) -> Self {
        Self {
            section_id,
            action,
            success: false,
            patched_content: original.clone(),
            original_content: original,
            diff_summary: String::new(),
            tokens_used,
            error: Some(error),
        }
    }
}

/// The outer pipeline must restart from planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSignal {
    pub section_id: SectionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Patched(PatchResult),
    Restart(RestartSignal),
}

/// Line-oriented summary of what changed: `-N/+M lines` plus the first
/// removed and added line.
pub fn diff_summary(original: &str, patched: &str) -> String {
    let old: Vec<&str> = original.lines().map(str::trim_end).collect();
    let new: Vec<&str> = patched.lines().map(str::trim_end).collect();
    let old_set: HashSet<&str> = old.iter().copied().collect();
    let new_set: HashSet<&str> = new.iter().copied().collect();

    let removed: Vec<&str> = old.iter().copied().filter(|l| !new_set.contains(l)).collect();
    let added: Vec<&str> = new.iter().copied().filter(|l| !old_set.contains(l)).collect();
    if removed.is_empty() && added.is_empty() {
        return "no changes".to_string();
    }

    let mut summary = format!("-{}/+{} lines", removed.len(), added.len());
    if let Some(line) = removed.first() {
        summary.push_str(&format!("\n- {line}"));
    }
    if let Some(line) = added.first() {
        summary.push_str(&format!("\n+ {line}"));
    }
    summary
}

async fn generate(
    generator: &dyn GenerationService,
    request: GenerationRequest,
    action: FixAction,
) -> PatchResult {
    let section_id = request.section_id.clone();
    let original = request.original_text.clone();
    match generator.generate(&request).await {
        Ok(resp) if resp.success && !resp.content.trim().is_empty() => {
            let diff = diff_summary(&original, &resp.content);
            debug!(section = %section_id, %action, tokens = resp.tokens_used, "section generated");
            PatchResult {
                section_id,
                action,
                success: true,
                original_content: original,
                patched_content: resp.content,
                diff_summary: diff,
                tokens_used: resp.tokens_used,
                error: None,
            }
        }
        Ok(resp) => {
            let reason = match resp.error_message {
                Some(msg) if !resp.success => msg,
                _ if !resp.success => "generation reported failure".to_string(),
                _ => "generation returned empty content".to_string(),
            };
            warn!(section = %section_id, %action, %reason, "generation failed");
            PatchResult::failed(section_id, action, original, resp.tokens_used, reason)
        }
        Err(e) => {
            warn!(section = %section_id, %action, error = %e, "generation service error");
            PatchResult::failed(section_id, action, original, 0, e.to_string())
        }
    }
}

/// Minimal edits to an existing section.
#[derive(Clone)]
pub struct Patcher {
    generator: Arc<dyn GenerationService>,
}

impl Patcher {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }

    pub async fn patch(&self, task: &SectionRefinementTask, section: &Section, budget: u64) -> PatchResult {
        let request = GenerationRequest {
            section_id: task.section_id.clone(),
            mode: GenerationMode::Patch,
            original_text: section.body.clone(),
            instructions: task.synthesized_instructions.clone(),
            context_anchors: task.context_anchors.clone(),
            budget,
        };
        generate(self.generator.as_ref(), request, FixAction::SurgicalEdit).await
    }
}

/// Rewrites one section from scratch, grounded in supporting material.
#[derive(Clone)]
pub struct SectionRegenerator {
    generator: Arc<dyn GenerationService>,
}

impl SectionRegenerator {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }

    pub async fn regenerate(
        &self,
        task: &SectionRefinementTask,
        section: &Section,
        learning_objectives: &[String],
        source_materials: &[String],
        budget: u64,
    ) -> PatchResult {
        let request = GenerationRequest {
            section_id: task.section_id.clone(),
            mode: GenerationMode::RegenerateSection {
                target_words: section.word_count().max(MIN_REGENERATION_WORDS),
                supporting_context: supporting_context(section, source_materials),
                learning_objectives: learning_objectives.to_vec(),
            },
            original_text: section.body.clone(),
            instructions: task.synthesized_instructions.clone(),
            context_anchors: task.context_anchors.clone(),
            budget,
        };
        generate(self.generator.as_ref(), request, FixAction::RegenerateSection).await
    }
}

/// Emits the restart signal for a whole-lesson regeneration.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullRegenerator;

impl FullRegenerator {
    pub fn signal(&self, task: &SectionRefinementTask) -> RestartSignal {
        let reason = task
            .issues()
            .find(|i| i.is_structural())
            .map(|i| i.description.clone())
            .unwrap_or_else(|| format!("full regeneration requested for {}", task.section_id));
        RestartSignal {
            section_id: task.section_id.clone(),
            reason,
        }
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_lowercase)
        .collect()
}

/// Pick the source passages sharing the most vocabulary with the section.
pub fn supporting_context(section: &Section, source_materials: &[String]) -> Vec<String> {
    let vocab = words(&format!("{} {}", section.heading, section.body));
    let mut scored: Vec<(usize, &String)> = source_materials
        .iter()
        .map(|m| (words(m).intersection(&vocab).count(), m))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(MAX_SUPPORTING_PASSAGES)
        .map(|(_, m)| m.clone())
        .collect()
}

/// All executors behind one dispatch point.
#[derive(Clone)]
pub struct Executors {
    pub patcher: Patcher,
    pub regenerator: SectionRegenerator,
    pub full: FullRegenerator,
}

impl Executors {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self {
            patcher: Patcher::new(Arc::clone(&generator)),
            regenerator: SectionRegenerator::new(generator),
            full: FullRegenerator,
        }
    }

    pub async fn execute(
        &self,
        decision: &RouterDecision,
        content: &LessonContent,
        source_materials: &[String],
        budget: u64,
    ) -> ExecutionOutcome {
        let task = &decision.task;
        let Some(section) = content.section(&task.section_id) else {
            return ExecutionOutcome::Patched(PatchResult::failed(
                task.section_id.clone(),
                decision.action,
                String::new(),
                0,
                format!("unknown section {}", task.section_id),
            ));
        };
        match decision.action {
            FixAction::SurgicalEdit => {
                ExecutionOutcome::Patched(self.patcher.patch(task, section, budget).await)
            }
            FixAction::RegenerateSection => ExecutionOutcome::Patched(
                self.regenerator
                    .regenerate(
                        task,
                        section,
                        &content.learning_objectives,
                        source_materials,
                        budget,
                    )
                    .await,
            ),
            FixAction::FullRegenerate => ExecutionOutcome::Restart(self.full.signal(task)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_summary_counts_lines() {
        let summary = diff_summary("a\nb\nc", "a\nB\nc\nd");
        assert!(summary.starts_with("-1/+2 lines"));
        assert!(summary.contains("\n- b"));
        assert!(summary.contains("\n+ B"));
        assert_eq!(diff_summary("same", "same"), "no changes");
    }

    #[test]
    fn test_supporting_context_ranks_by_overlap() {
        let section = Section::new("s", "Photosynthesis", "Chlorophyll captures sunlight energy.");
        let materials = vec![
            "Volcanoes erupt magma.".to_string(),
            "Chlorophyll captures sunlight in photosynthesis.".to_string(),
            "Sunlight is energy.".to_string(),
        ];
        let picked = supporting_context(&section, &materials);
        assert_eq!(picked.len(), 2);
        assert!(picked[0].starts_with("Chlorophyll"));
    }
}
