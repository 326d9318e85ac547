//! Edit descriptors.
//!
//! An [`Edit`] replaces one span of one file. An [`EditSet`] groups the edits
//! (and optional file deletions) that make up one logical change, such as a
//! single analyzer fix or one bulk-edit request.

use crate::{EditsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// A 0-indexed line and column. Columns count chars, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl From<(usize, usize)> for Position {
    fn from((line, column): (usize, usize)) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// An end-exclusive range of positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: impl Into<Position>, end: impl Into<Position>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn point(at: impl Into<Position>) -> Self {
        let at = at.into();
        Self { start: at, end: at }
    }

    /// A pure insertion.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_ordered(&self) -> bool {
        self.start <= self.end
    }

    /// Conflict test between edits of different edit sets: true unless one
    /// span ends strictly before the other begins. Touching spans and two
    /// insertions at the same point count as overlapping.
    pub fn overlaps(&self, other: &Span) -> bool {
        !(self.end < other.start || other.end < self.start)
    }

    /// Overlap test between edits of the same edit set: spans may touch, and
    /// an insertion may sit on the boundary of a replacement.
    pub fn intersects(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A single proposed change to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    /// File path to edit.
    pub file_path: PathBuf,
    /// Range replaced by `new_text`.
    pub span: Span,
    /// Replacement text. Empty means deletion.
    pub new_text: String,
    /// Which fix or operation produced this edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl Edit {
    pub fn replace(
        file_path: impl Into<PathBuf>,
        start: impl Into<Position>,
        end: impl Into<Position>,
        new_text: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            span: Span::new(start, end),
            new_text: new_text.into(),
            source_id: None,
        }
    }

    pub fn insert(
        file_path: impl Into<PathBuf>,
        at: impl Into<Position>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            span: Span::point(at),
            new_text: text.into(),
            source_id: None,
        }
    }

    pub fn delete(
        file_path: impl Into<PathBuf>,
        start: impl Into<Position>,
        end: impl Into<Position>,
    ) -> Self {
        Self::replace(file_path, start, end, String::new())
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

/// Identifier of an edit set, chosen by the producer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditSetId(String);

impl EditSetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EditSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EditSetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EditSetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Declared importance of the finding an edit set fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Descriptive metadata attached to an edit set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditSetMetadata {
    /// Human readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Owning rule or operation id.
    #[serde(default)]
    pub source_id: Option<String>,
    /// Producer confidence in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub severity: Option<Severity>,
    /// Edit sets that must be submitted (and survive) before this one.
    #[serde(default)]
    pub depends_on: Vec<EditSetId>,
    /// Producer-specific parameters the engine carries but never reads.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

fn default_confidence() -> f64 {
    1.0
}

impl Default for EditSetMetadata {
    fn default() -> Self {
        Self {
            description: None,
            source_id: None,
            confidence: default_confidence(),
            severity: None,
            depends_on: Vec::new(),
            extensions: BTreeMap::new(),
        }
    }
}

/// One logical change, possibly spanning several files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditSet {
    pub id: EditSetId,
    #[serde(default)]
    pub edits: Vec<Edit>,
    /// Files this change removes entirely.
    #[serde(default)]
    pub deletions: Vec<PathBuf>,
    #[serde(default)]
    pub metadata: EditSetMetadata,
}

impl EditSet {
    pub fn new(id: impl Into<EditSetId>) -> Self {
        Self {
            id: id.into(),
            edits: Vec::new(),
            deletions: Vec::new(),
            metadata: EditSetMetadata::default(),
        }
    }

    pub fn with_edit(mut self, edit: Edit) -> Self {
        self.edits.push(edit);
        self
    }

    pub fn with_edits(mut self, edits: impl IntoIterator<Item = Edit>) -> Self {
        self.edits.extend(edits);
        self
    }

    pub fn with_deletion(mut self, path: impl Into<PathBuf>) -> Self {
        self.deletions.push(path.into());
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.metadata.description = Some(desc.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = confidence;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.metadata.severity = Some(severity);
        self
    }

    pub fn depends_on(mut self, id: impl Into<EditSetId>) -> Self {
        self.metadata.depends_on.push(id.into());
        self
    }

    /// Every file this set edits or deletes, sorted.
    pub fn files(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = self
            .edits
            .iter()
            .map(|e| e.file_path.as_path())
            .chain(self.deletions.iter().map(PathBuf::as_path))
            .collect();
        files.sort();
        files.dedup();
        files
    }

    /// Structural checks that need no file content.
    pub fn check(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(EditsError::EmptyId);
        }

        let confidence = self.metadata.confidence;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EditsError::ConfidenceOutOfRange(confidence));
        }

        let mut by_file: HashMap<&Path, Vec<&Span>> = HashMap::new();
        for edit in &self.edits {
            if !edit.span.is_ordered() {
                return Err(EditsError::InvertedSpan {
                    path: edit.file_path.clone(),
                    start: edit.span.start,
                    end: edit.span.end,
                });
            }
            by_file.entry(&edit.file_path).or_default().push(&edit.span);
        }

        for (path, mut spans) in by_file {
            if self.deletions.iter().any(|d| d == path) {
                return Err(EditsError::EditAndDelete(path.to_path_buf()));
            }
            spans.sort_by_key(|s| (s.start, s.end));
            for pair in spans.windows(2) {
                if pair[0].intersects(pair[1]) {
                    return Err(EditsError::OverlapWithinSet {
                        path: path.to_path_buf(),
                        first: *pair[0],
                        second: *pair[1],
                    });
                }
            }
        }

        Ok(())
    }
}

/// An edit set that failed input checks and was left out of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedEditSet {
    pub id: EditSetId,
    pub reason: EditsError,
}

/// Split a batch into the submission indices that pass input checks and the
/// edit sets rejected with a reason.
///
/// Dependencies are checked last so a set depending on a rejected set is
/// rejected too.
pub fn check_batch(edit_sets: &[EditSet]) -> (Vec<usize>, Vec<RejectedEditSet>) {
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();

    for (index, set) in edit_sets.iter().enumerate() {
        if !seen.insert(set.id.clone()) {
            rejected.push(RejectedEditSet {
                id: set.id.clone(),
                reason: EditsError::DuplicateId(set.id.to_string()),
            });
            continue;
        }
        match set.check() {
            Ok(()) => accepted.push(index),
            Err(reason) => rejected.push(RejectedEditSet {
                id: set.id.clone(),
                reason,
            }),
        }
    }

    loop {
        let live: HashSet<&EditSetId> = accepted.iter().map(|&i| &edit_sets[i].id).collect();
        let missing = accepted.iter().find_map(|&i| {
            edit_sets[i]
                .metadata
                .depends_on
                .iter()
                .find(|dep| !live.contains(dep))
                .map(|dep| (i, dep.clone()))
        });
        let Some((index, dep)) = missing else {
            break;
        };
        accepted.retain(|&i| i != index);
        rejected.push(RejectedEditSet {
            id: edit_sets[index].id.clone(),
            reason: EditsError::UnknownDependency(dep.to_string()),
        });
    }

    (accepted, rejected)
}

/// An edit together with the edit set that proposed it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEdit {
    pub edit_set: EditSetId,
    /// Position of the owning edit set in the submitted batch.
    pub submission: usize,
    pub edit: Edit,
}

/// Everything a batch wants to do to one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileEdits {
    pub edits: Vec<TaggedEdit>,
    /// Edit sets (with submission index) that delete this file.
    pub deleted_by: Vec<(EditSetId, usize)>,
}

impl FileEdits {
    pub fn edit_set_ids(&self) -> Vec<&EditSetId> {
        let mut ids: Vec<&EditSetId> = self
            .edits
            .iter()
            .map(|e| &e.edit_set)
            .chain(self.deleted_by.iter().map(|(id, _)| id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_deleted(&self) -> bool {
        !self.deleted_by.is_empty()
    }
}

/// Group the edits of `(submission index, edit set)` pairs by target file.
pub fn group_by_file<'a>(
    edit_sets: impl IntoIterator<Item = (usize, &'a EditSet)>,
) -> BTreeMap<PathBuf, FileEdits> {
    let mut files: BTreeMap<PathBuf, FileEdits> = BTreeMap::new();
    for (submission, set) in edit_sets {
        for edit in &set.edits {
            files
                .entry(edit.file_path.clone())
                .or_default()
                .edits
                .push(TaggedEdit {
                    edit_set: set.id.clone(),
                    submission,
                    edit: edit.clone(),
                });
        }
        for path in &set.deletions {
            files
                .entry(path.clone())
                .or_default()
                .deleted_by
                .push((set.id.clone(), submission));
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering_is_lexicographic() {
        assert!(Position::new(0, 9) < Position::new(1, 0));
        assert!(Position::new(2, 3) < Position::new(2, 4));
    }

    #[test]
    fn test_span_overlap_inclusive() {
        let a = Span::new((0, 0), (0, 5));
        let b = Span::new((0, 5), (0, 8));
        let c = Span::new((0, 6), (0, 8));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(Span::point((1, 1)).overlaps(&Span::point((1, 1))));
    }

    #[test]
    fn test_span_intersects_allows_touching() {
        let a = Span::new((0, 0), (0, 5));
        let b = Span::new((0, 5), (0, 8));
        assert!(!a.intersects(&b));
        assert!(a.intersects(&Span::new((0, 4), (0, 6))));
        assert!(a.intersects(&Span::point((0, 2))));
    }

    #[test]
    fn test_check_rejects_inverted_span() {
        let set = EditSet::new("fix-1").with_edit(Edit::replace("a.rs", (3, 0), (1, 0), "x"));
        assert!(matches!(set.check(), Err(EditsError::InvertedSpan { .. })));
    }

    #[test]
    fn test_check_rejects_overlap_within_set() {
        let set = EditSet::new("fix-1")
            .with_edit(Edit::replace("a.rs", (0, 0), (0, 5), "x"))
            .with_edit(Edit::replace("a.rs", (0, 3), (0, 7), "y"));
        assert!(matches!(
            set.check(),
            Err(EditsError::OverlapWithinSet { .. })
        ));
    }

    #[test]
    fn test_check_rejects_edit_and_delete() {
        let set = EditSet::new("fix-1")
            .with_edit(Edit::insert("a.rs", (0, 0), "x"))
            .with_deletion("a.rs");
        assert_eq!(
            set.check(),
            Err(EditsError::EditAndDelete(PathBuf::from("a.rs")))
        );
    }

    #[test]
    fn test_check_batch_duplicates_and_dependencies() {
        let sets = vec![
            EditSet::new("a").with_edit(Edit::insert("a.rs", (0, 0), "x")),
            EditSet::new("a").with_edit(Edit::insert("b.rs", (0, 0), "x")),
            EditSet::new("b")
                .with_edit(Edit::insert("c.rs", (0, 0), "x"))
                .with_confidence(2.0),
            EditSet::new("c")
                .with_edit(Edit::insert("d.rs", (0, 0), "x"))
                .depends_on("b"),
        ];
        let (accepted, rejected) = check_batch(&sets);
        assert_eq!(accepted, vec![0]);
        let reasons: Vec<_> = rejected.iter().map(|r| r.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                EditsError::DuplicateId("a".into()),
                EditsError::ConfidenceOutOfRange(2.0),
                EditsError::UnknownDependency("b".into()),
            ]
        );
    }

    #[test]
    fn test_group_by_file() {
        let sets = [
            EditSet::new("a")
                .with_edit(Edit::insert("x.rs", (0, 0), "1"))
                .with_edit(Edit::insert("y.rs", (0, 0), "2")),
            EditSet::new("b").with_deletion("x.rs"),
        ];
        let grouped = group_by_file(sets.iter().enumerate());
        assert_eq!(grouped.len(), 2);
        let x = &grouped[Path::new("x.rs")];
        assert_eq!(x.edits.len(), 1);
        assert!(x.is_deleted());
        assert_eq!(x.edit_set_ids().len(), 2);
    }

    #[test]
    fn test_edit_set_deserialize_defaults() {
        let json = r#"{
            "id": "fix-7",
            "edits": [{
                "file_path": "src/lib.rs",
                "span": {"start": {"line": 0, "column": 0}, "end": {"line": 0, "column": 3}},
                "new_text": "pub"
            }]
        }"#;
        let set: EditSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.id.as_str(), "fix-7");
        assert_eq!(set.metadata.confidence, 1.0);
        assert!(set.deletions.is_empty());
    }
}
