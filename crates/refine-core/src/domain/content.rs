//! The single concrete content representation shared by executors, the
//! delta-verifier and iteration snapshots.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::{RefineError, Result};

/// Stable identifier of a section within a lesson.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionId(pub String);

impl SectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One addressable unit of a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub heading: String,
    pub body: String,
}

impl Section {
    pub fn new(id: impl Into<String>, heading: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: SectionId::new(id),
            heading: heading.into(),
            body: body.into(),
        }
    }

    pub fn word_count(&self) -> usize {
        self.body.split_whitespace().count()
    }
}

/// Boundary sentences of the neighbouring sections, handed to executors so a
/// rewritten section still reads continuously.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextAnchors {
    /// Last sentence of the preceding section.
    pub previous_tail: Option<String>,
    /// First sentence of the following section.
    pub next_head: Option<String>,
}

/// A generated unit of educational content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonContent {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
    pub sections: Vec<Section>,
}

impl LessonContent {
    /// Validate the structural invariants every component relies on.
    ///
    /// Called once at the system boundary; internal components assume a
    /// validated value.
    pub fn validate(&self) -> Result<()> {
        if self.sections.is_empty() {
            return Err(RefineError::InvalidContent(
                "content must contain at least one section".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for section in &self.sections {
            if section.id.0.trim().is_empty() {
                return Err(RefineError::InvalidContent(
                    "section id must not be empty".to_string(),
                ));
            }
            if !seen.insert(&section.id) {
                return Err(RefineError::InvalidContent(format!(
                    "duplicate section id: {}",
                    section.id
                )));
            }
        }
        Ok(())
    }

    pub fn section(&self, id: &SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| &s.id == id)
    }

    /// 0-indexed position of a section, used for adjacency checks.
    pub fn position_of(&self, id: &SectionId) -> Option<usize> {
        self.sections.iter().position(|s| &s.id == id)
    }

    pub fn section_ids(&self) -> Vec<SectionId> {
        self.sections.iter().map(|s| s.id.clone()).collect()
    }

    /// Replace the body of one section, returning the previous body.
    pub fn replace_section_body(&mut self, id: &SectionId, body: String) -> Option<String> {
        self.sections
            .iter_mut()
            .find(|s| &s.id == id)
            .map(|s| std::mem::replace(&mut s.body, body))
    }

    /// Locate the section whose body contains `quote` (case-insensitive).
    pub fn find_quote(&self, quote: &str) -> Option<&SectionId> {
        let needle = quote.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.sections
            .iter()
            .find(|s| s.body.to_lowercase().contains(&needle))
            .map(|s| &s.id)
    }

    pub fn context_anchors(&self, id: &SectionId) -> ContextAnchors {
        let Some(pos) = self.position_of(id) else {
            return ContextAnchors::default();
        };
        let previous_tail = pos
            .checked_sub(1)
            .and_then(|p| self.sections.get(p))
            .and_then(|s| last_sentence(&s.body));
        let next_head = self
            .sections
            .get(pos + 1)
            .and_then(|s| first_sentence(&s.body));
        ContextAnchors {
            previous_tail,
            next_head,
        }
    }

    pub fn word_count(&self) -> usize {
        self.sections.iter().map(Section::word_count).sum()
    }
}

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}

fn first_sentence(text: &str) -> Option<String> {
    sentences(text).into_iter().next()
}

fn last_sentence(text: &str) -> Option<String> {
    sentences(text).pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesson() -> LessonContent {
        LessonContent {
            id: "lesson-1".to_string(),
            title: "Photosynthesis".to_string(),
            learning_objectives: vec!["Explain light reactions".to_string()],
            sections: vec![
                Section::new("intro", "Intro", "Plants make food. They use light."),
                Section::new("body", "Body", "Chlorophyll absorbs light! It is green."),
                Section::new("wrap", "Wrap-up", "Review the key ideas. Then try the quiz"),
            ],
        }
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut content = lesson();
        content.sections[1].id = SectionId::new("intro");
        let err = content.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate section id"));
    }

    #[test]
    fn test_validate_rejects_empty_content() {
        let mut content = lesson();
        content.sections.clear();
        assert!(content.validate().is_err());
    }

    #[test]
    fn test_context_anchors_use_neighbour_boundaries() {
        let content = lesson();
        let anchors = content.context_anchors(&SectionId::new("body"));
        assert_eq!(anchors.previous_tail.as_deref(), Some("They use light."));
        assert_eq!(anchors.next_head.as_deref(), Some("Review the key ideas."));

        let first = content.context_anchors(&SectionId::new("intro"));
        assert!(first.previous_tail.is_none());
        let last = content.context_anchors(&SectionId::new("wrap"));
        assert!(last.next_head.is_none());
    }

    #[test]
    fn test_find_quote_is_case_insensitive() {
        let content = lesson();
        assert_eq!(
            content.find_quote("CHLOROPHYLL absorbs"),
            Some(&SectionId::new("body"))
        );
        assert_eq!(content.find_quote("mitochondria"), None);
    }

    #[test]
    fn test_replace_section_body_returns_previous() {
        let mut content = lesson();
        let old = content
            .replace_section_body(&SectionId::new("wrap"), "New text.".to_string())
            .unwrap();
        assert!(old.starts_with("Review"));
        assert_eq!(content.sections[2].body, "New text.");
    }
}
