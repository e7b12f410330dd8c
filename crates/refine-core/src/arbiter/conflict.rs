//! Contradictory instructions on the same text, settled by criterion priority.

use crate::domain::issue::TargetedIssue;
use crate::domain::plan::ConflictResolution;

const EXPAND_WORDS: &[&str] = &[
    "add",
    "expand",
    "elaborate",
    "extend",
    "include",
    "lengthen",
    "detail",
    "illustrate",
];

const REDUCE_WORDS: &[&str] = &[
    "shorten",
    "remove",
    "simplify",
    "cut",
    "condense",
    "delete",
    "trim",
    "reduce",
    "omit",
];

/// Direction an instruction pushes the text in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Expand,
    Reduce,
    Neutral,
}

impl Directive {
    pub fn of(instruction: &str) -> Self {
        let lower = instruction.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |lexicon: &[&str]| words.iter().any(|w| lexicon.contains(w));
        match (has(EXPAND_WORDS), has(REDUCE_WORDS)) {
            (true, false) => Directive::Expand,
            (false, true) => Directive::Reduce,
            _ => Directive::Neutral,
        }
    }

    pub fn opposes(self, other: Directive) -> bool {
        matches!(
            (self, other),
            (Directive::Expand, Directive::Reduce) | (Directive::Reduce, Directive::Expand)
        )
    }
}

/// Whether two optional quotes refer to the same text.
///
/// Two missing quotes count as the same text (the whole section).
pub fn quotes_overlap(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            let (a, b) = (a.trim().to_lowercase(), b.trim().to_lowercase());
            !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
        }
        _ => false,
    }
}

fn conflicts(a: &TargetedIssue, b: &TargetedIssue) -> bool {
    a.target_section_id == b.target_section_id
        && a.criterion() != b.criterion()
        && quotes_overlap(a.issue.quoted_text.as_deref(), b.issue.quoted_text.as_deref())
        && Directive::of(&a.fix_instructions).opposes(Directive::of(&b.fix_instructions))
}

/// Index of the loser among `(i, a)` and `(j, b)`.
fn loser(i: usize, a: &TargetedIssue, j: usize, b: &TargetedIssue) -> usize {
    if a.criterion().outranks(b.criterion()) {
        j
    } else if b.criterion().outranks(a.criterion()) {
        i
    } else if a.severity() != b.severity() {
        if a.severity() > b.severity() {
            j
        } else {
            i
        }
    } else {
        j
    }
}

/// Drop the lower-priority side of every conflicting pair.
///
/// Returns the surviving issues (original order preserved) and a record for
/// every discarded instruction.
pub fn resolve_conflicts(
    issues: Vec<TargetedIssue>,
) -> (Vec<TargetedIssue>, Vec<ConflictResolution>) {
    let mut discarded = vec![false; issues.len()];
    let mut resolutions = Vec::new();

    for i in 0..issues.len() {
        for j in (i + 1)..issues.len() {
            if discarded[i] || discarded[j] || !conflicts(&issues[i], &issues[j]) {
                continue;
            }
            let lose = loser(i, &issues[i], j, &issues[j]);
            let win = if lose == i { j } else { i };
            discarded[lose] = true;

            let (winner, losing) = (&issues[win], &issues[lose]);
            let rationale = if winner.criterion().priority_rank() < losing.criterion().priority_rank()
            {
                format!(
                    "{} outranks {} in the priority hierarchy",
                    winner.criterion(),
                    losing.criterion()
                )
            } else {
                format!(
                    "{} and {} share a priority tier; the {} issue wins",
                    winner.criterion(),
                    losing.criterion(),
                    winner.severity()
                )
            };
            resolutions.push(ConflictResolution {
                section_id: winner.target_section_id.clone(),
                winning_criterion: winner.criterion(),
                winning_instruction: winner.fix_instructions.clone(),
                losing_criterion: losing.criterion(),
                discarded_instruction: losing.fix_instructions.clone(),
                rationale,
            });
        }
    }

    let kept = issues
        .into_iter()
        .zip(discarded)
        .filter_map(|(issue, gone)| (!gone).then_some(issue))
        .collect();
    (kept, resolutions)
}
