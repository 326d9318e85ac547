//! Conflict detection between edit sets.
//!
//! Edits are grouped by file and every pair from *different* edit sets is
//! compared with an inclusive interval test. Pairs from the same edit set are
//! never compared: overlap inside one set is an input error caught by
//! [`EditSet::check`](crate::EditSet::check).

use crate::model::{EditSet, EditSetId, Severity, Span, group_by_file};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::debug;

/// Why two edit sets cannot both be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Spans from two edit sets overlap in one file.
    OverlappingEdits,
    /// One edit set deletes a file another edits or deletes.
    SameFileWriteRace,
    /// An edit set was submitted before an edit set it depends on.
    DependencyOrder,
}

/// One side of a conflict. Carries the metadata strategies decide on, so a
/// resolution needs nothing but the conflict itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictParty {
    pub edit_set: EditSetId,
    /// Position in the submitted batch.
    pub submission: usize,
    /// Colliding span, when the conflict is about spans.
    pub span: Option<Span>,
    pub confidence: f64,
    pub severity: Option<Severity>,
}

impl ConflictParty {
    fn of(set: &EditSet, submission: usize, span: Option<Span>) -> Self {
        Self {
            edit_set: set.id.clone(),
            submission,
            span,
            confidence: set.metadata.confidence,
            severity: set.metadata.severity,
        }
    }
}

/// Two edit sets that collide. `first` is always the earlier submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// File where the collision happens; `None` for dependency conflicts.
    pub file_path: Option<PathBuf>,
    pub first: ConflictParty,
    pub second: ConflictParty,
}

impl Conflict {
    fn new(
        kind: ConflictKind,
        file_path: Option<PathBuf>,
        a: ConflictParty,
        b: ConflictParty,
    ) -> Self {
        let (first, second) = if a.submission <= b.submission {
            (a, b)
        } else {
            (b, a)
        };
        Self {
            kind,
            file_path,
            first,
            second,
        }
    }

    pub fn describe(&self) -> String {
        let location = self
            .file_path
            .as_ref()
            .map(|p| format!(" in {}", p.display()))
            .unwrap_or_default();
        match self.kind {
            ConflictKind::OverlappingEdits => format!(
                "{} and {} edit overlapping spans{}",
                self.first.edit_set, self.second.edit_set, location
            ),
            ConflictKind::SameFileWriteRace => format!(
                "{} and {} race on a file deletion{}",
                self.first.edit_set, self.second.edit_set, location
            ),
            ConflictKind::DependencyOrder => format!(
                "{} depends on {}, which was submitted later",
                self.first.edit_set, self.second.edit_set
            ),
        }
    }
}

/// Finds conflicts in a batch.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Detect conflicts in a batch, using slice position as submission order.
    pub fn detect(edit_sets: &[EditSet]) -> Vec<Conflict> {
        Self::detect_ordered(edit_sets.iter().enumerate())
    }

    /// Detect conflicts among `(submission index, edit set)` pairs.
    ///
    /// Output order is deterministic: file conflicts by path then by edit
    /// position, followed by dependency conflicts in submission order.
    pub fn detect_ordered<'a>(
        edit_sets: impl IntoIterator<Item = (usize, &'a EditSet)>,
    ) -> Vec<Conflict> {
        let sets: Vec<(usize, &EditSet)> = edit_sets.into_iter().collect();
        let by_id: HashMap<&EditSetId, (usize, &EditSet)> =
            sets.iter().map(|&(i, s)| (&s.id, (i, s))).collect();
        let mut conflicts = Vec::new();

        for (path, file) in group_by_file(sets.iter().copied()) {
            for (i, a) in file.edits.iter().enumerate() {
                for b in &file.edits[i + 1..] {
                    if a.edit_set == b.edit_set || !a.edit.span.overlaps(&b.edit.span) {
                        continue;
                    }
                    let (sa, sb) = (by_id[&a.edit_set].1, by_id[&b.edit_set].1);
                    conflicts.push(Conflict::new(
                        ConflictKind::OverlappingEdits,
                        Some(path.clone()),
                        ConflictParty::of(sa, a.submission, Some(a.edit.span)),
                        ConflictParty::of(sb, b.submission, Some(b.edit.span)),
                    ));
                }
            }

            let mut raced = BTreeSet::new();
            for (deleter, del_sub) in &file.deleted_by {
                let others = file
                    .edits
                    .iter()
                    .map(|e| (&e.edit_set, e.submission))
                    .chain(file.deleted_by.iter().map(|(id, sub)| (id, *sub)));
                for (other, other_sub) in others {
                    if other == deleter {
                        continue;
                    }
                    let key = (*del_sub.min(&other_sub), *del_sub.max(&other_sub));
                    if !raced.insert(key) {
                        continue;
                    }
                    conflicts.push(Conflict::new(
                        ConflictKind::SameFileWriteRace,
                        Some(path.clone()),
                        ConflictParty::of(by_id[deleter].1, *del_sub, None),
                        ConflictParty::of(by_id[other].1, other_sub, None),
                    ));
                }
            }
        }

        for &(submission, set) in &sets {
            for dep in &set.metadata.depends_on {
                if let Some(&(dep_sub, dep_set)) = by_id.get(dep)
                    && dep_sub > submission
                {
                    conflicts.push(Conflict::new(
                        ConflictKind::DependencyOrder,
                        None,
                        ConflictParty::of(set, submission, None),
                        ConflictParty::of(dep_set, dep_sub, None),
                    ));
                }
            }
        }

        if !conflicts.is_empty() {
            debug!(count = conflicts.len(), "Detected edit conflicts");
        }
        conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edit, Position};
    use proptest::prelude::*;

    #[test]
    fn test_same_span_two_sets_one_conflict() {
        let sets = [
            EditSet::new("first").with_edit(Edit::replace("a.txt", (1, 0), (1, 5), "alpha")),
            EditSet::new("second").with_edit(Edit::replace("a.txt", (1, 0), (1, 5), "omega")),
        ];
        let conflicts = ConflictDetector::detect(&sets);
        assert_eq!(conflicts.len(), 1);
        let c = &conflicts[0];
        assert_eq!(c.kind, ConflictKind::OverlappingEdits);
        assert_eq!(c.first.edit_set.as_str(), "first");
        assert_eq!(c.second.edit_set.as_str(), "second");
        assert_eq!(c.file_path, Some(PathBuf::from("a.txt")));
    }

    #[test]
    fn test_same_set_never_compared() {
        let set = EditSet::new("only")
            .with_edit(Edit::replace("a.txt", (0, 0), (0, 5), "x"))
            .with_edit(Edit::replace("a.txt", (0, 2), (0, 3), "y"));
        assert!(ConflictDetector::detect(&[set]).is_empty());
    }

    #[test]
    fn test_disjoint_and_other_files_do_not_conflict() {
        let sets = [
            EditSet::new("a").with_edit(Edit::replace("a.txt", (0, 0), (0, 2), "x")),
            EditSet::new("b").with_edit(Edit::replace("a.txt", (0, 3), (0, 4), "y")),
            EditSet::new("c").with_edit(Edit::replace("b.txt", (0, 0), (0, 2), "z")),
        ];
        assert!(ConflictDetector::detect(&sets).is_empty());
    }

    #[test]
    fn test_delete_races_with_edit() {
        let sets = [
            EditSet::new("edit").with_edit(Edit::insert("a.txt", (0, 0), "x")),
            EditSet::new("rm").with_deletion("a.txt"),
            EditSet::new("rm2").with_deletion("a.txt"),
        ];
        let conflicts = ConflictDetector::detect(&sets);
        assert_eq!(conflicts.len(), 3);
        assert!(
            conflicts
                .iter()
                .all(|c| c.kind == ConflictKind::SameFileWriteRace)
        );
    }

    #[test]
    fn test_dependency_order_violation() {
        let sets = [
            EditSet::new("late-user")
                .with_edit(Edit::insert("a.txt", (0, 0), "use x;"))
                .depends_on("provider"),
            EditSet::new("provider").with_edit(Edit::insert("b.txt", (0, 0), "pub x;")),
        ];
        let conflicts = ConflictDetector::detect(&sets);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::DependencyOrder);
        assert_eq!(conflicts[0].first.edit_set.as_str(), "late-user");
        assert!(conflicts[0].file_path.is_none());
    }

    #[test]
    fn test_party_carries_metadata() {
        let sets = [
            EditSet::new("a")
                .with_edit(Edit::insert("a.txt", (0, 0), "x"))
                .with_confidence(0.4),
            EditSet::new("b")
                .with_edit(Edit::insert("a.txt", (0, 0), "y"))
                .with_severity(Severity::Error),
        ];
        let c = &ConflictDetector::detect(&sets)[0];
        assert_eq!(c.first.confidence, 0.4);
        assert_eq!(c.second.severity, Some(Severity::Error));
    }

    fn arb_span() -> impl Strategy<Value = Span> {
        (0usize..4, 0usize..6, 0usize..4, 0usize..6).prop_map(|(l1, c1, l2, c2)| {
            let a = Position::new(l1, c1);
            let b = Position::new(l2, c2);
            if a <= b { Span::new(a, b) } else { Span::new(b, a) }
        })
    }

    proptest! {
        #[test]
        fn prop_detects_exactly_overlapping_pairs(spans in prop::collection::vec(arb_span(), 1..12)) {
            // One single-edit set per span, all in the same file.
            let sets: Vec<EditSet> = spans
                .iter()
                .enumerate()
                .map(|(i, s)| EditSet::new(format!("set-{i}")).with_edit(Edit::replace("f.rs", s.start, s.end, "x")))
                .collect();

            let mut expected = BTreeSet::new();
            for i in 0..spans.len() {
                for j in i + 1..spans.len() {
                    let (a, b) = (spans[i], spans[j]);
                    if !(a.end < b.start || b.end < a.start) {
                        expected.insert((i, j));
                    }
                }
            }

            let found: BTreeSet<(usize, usize)> = ConflictDetector::detect(&sets)
                .iter()
                .map(|c| (c.first.submission, c.second.submission))
                .collect();
            prop_assert_eq!(found, expected);
        }
    }
}
