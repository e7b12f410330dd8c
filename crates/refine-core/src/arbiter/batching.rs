//! Adjacency-safe execution batches.

use std::cmp::Reverse;

use crate::domain::issue::FixAction;
use crate::domain::plan::SectionRefinementTask;

fn too_close(a: usize, b: usize, gap: usize) -> bool {
    a.abs_diff(b) <= gap
}

/// Partition tasks into sequential batches.
///
/// Tasks are taken in priority order (highest severity first, then section
/// position). No batch holds two sections within `gap` positions of each
/// other. With `sequential_regenerations`, every `FULL_REGENERATE` task runs
/// alone in a leading batch.
pub fn schedule_batches(
    tasks: &[SectionRefinementTask],
    gap: usize,
    sequential_regenerations: bool,
) -> Vec<Vec<SectionRefinementTask>> {
    let mut ordered: Vec<&SectionRefinementTask> = tasks.iter().collect();
    ordered.sort_by_key(|t| (Reverse(t.priority), t.position));

    let mut batches: Vec<Vec<SectionRefinementTask>> = Vec::new();
    let (solo, rest): (Vec<_>, Vec<_>) = ordered.into_iter().partition(|t| {
        sequential_regenerations && t.action_type == FixAction::FullRegenerate
    });
    for task in solo {
        batches.push(vec![task.clone()]);
    }

    let first_shared = batches.len();
    for task in rest {
        let slot = batches[first_shared..]
            .iter_mut()
            .find(|batch| batch.iter().all(|m| !too_close(m.position, task.position, gap)));
        match slot {
            Some(batch) => batch.push(task.clone()),
            None => batches.push(vec![task.clone()]),
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::{ContextAnchors, SectionId};
    use crate::domain::issue::Severity;

    fn task(pos: usize, action: FixAction, priority: Severity) -> SectionRefinementTask {
        SectionRefinementTask {
            section_id: SectionId::new(format!("s{pos}")),
            position: pos,
            action_type: action,
            synthesized_instructions: String::new(),
            context_anchors: ContextAnchors::default(),
            priority,
            source_issues: vec![],
        }
    }

    fn positions(batches: &[Vec<SectionRefinementTask>]) -> Vec<Vec<usize>> {
        batches
            .iter()
            .map(|b| b.iter().map(|t| t.position).collect())
            .collect()
    }

    #[test]
    fn test_adjacent_sections_are_split() {
        let tasks: Vec<_> = (0..4)
            .map(|p| task(p, FixAction::SurgicalEdit, Severity::Minor))
            .collect();
        let batches = schedule_batches(&tasks, 1, true);
        assert_eq!(positions(&batches), vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn test_wider_gap() {
        let tasks: Vec<_> = [0, 2, 4]
            .into_iter()
            .map(|p| task(p, FixAction::SurgicalEdit, Severity::Minor))
            .collect();
        let batches = schedule_batches(&tasks, 2, true);
        assert_eq!(positions(&batches), vec![vec![0, 4], vec![2]]);
    }

    #[test]
    fn test_full_regenerate_runs_alone_first() {
        let tasks = vec![
            task(0, FixAction::SurgicalEdit, Severity::Major),
            task(5, FixAction::FullRegenerate, Severity::Critical),
            task(3, FixAction::SurgicalEdit, Severity::Minor),
        ];
        let batches = schedule_batches(&tasks, 1, true);
        assert_eq!(positions(&batches), vec![vec![5], vec![0, 3]]);
    }

    #[test]
    fn test_priority_orders_placement() {
        let tasks = vec![
            task(0, FixAction::SurgicalEdit, Severity::Minor),
            task(1, FixAction::SurgicalEdit, Severity::Critical),
        ];
        let batches = schedule_batches(&tasks, 1, true);
        assert_eq!(positions(&batches), vec![vec![1], vec![0]]);
    }
}
