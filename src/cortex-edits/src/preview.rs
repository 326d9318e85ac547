//! In-memory previews of a batch of edits.
//!
//! A preview applies a file's edits to a copy of its content, bottom-to-top so
//! earlier offsets stay valid, and reports the structured changes, a unified
//! diff and line statistics. Nothing here reads or writes files.

use crate::conflict::Conflict;
use crate::model::{EditSetId, FileEdits, Position, RejectedEditSet, Span, TaggedEdit};
use crate::text::LineIndex;
use crate::{EditsError, Result};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::path::{Path, PathBuf};

/// Kind of a single text change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Delete,
    Replace,
}

/// One change as it would land in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub kind: ChangeKind,
    pub span: Span,
    pub original_text: String,
    pub new_text: String,
    pub edit_set: EditSetId,
}

/// Would-be result of applying a file's edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePreview {
    pub path: PathBuf,
    /// Whether the file existed when the preview was taken.
    pub exists: bool,
    pub original: String,
    pub modified: String,
    pub would_change: bool,
    pub creates_file: bool,
    pub deletes_file: bool,
    /// Changes in document order.
    pub changes: Vec<TextChange>,
    pub unified_diff: String,
    pub lines_added: usize,
    pub lines_removed: usize,
    /// SHA-256 of the bytes the preview was computed from, filled in by the
    /// caller that read the file.
    #[serde(default)]
    pub original_checksum: Option<String>,
    /// Edit sets contributing to this file.
    pub edit_sets: Vec<EditSetId>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FilePreview {
    /// A preview that could not be computed.
    pub fn failed(path: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exists: false,
            original: String::new(),
            modified: String::new(),
            would_change: false,
            creates_file: false,
            deletes_file: false,
            changes: Vec::new(),
            unified_diff: String::new(),
            lines_added: 0,
            lines_removed: 0,
            original_checksum: None,
            edit_sets: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.original_checksum = checksum;
        self
    }
}

/// Coarse blast-radius classification of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Size of a batch as seen through its previews.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactEstimate {
    pub files_affected: usize,
    pub files_created: usize,
    pub files_deleted: usize,
    pub edit_count: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub risk: RiskLevel,
}

impl ImpactEstimate {
    pub fn from_previews(previews: &[FilePreview]) -> Self {
        let changing: Vec<&FilePreview> = previews
            .iter()
            .filter(|p| p.is_ok() && p.would_change)
            .collect();
        let files_affected = changing.len();
        let files_created = changing.iter().filter(|p| p.creates_file).count();
        let files_deleted = changing.iter().filter(|p| p.deletes_file).count();
        let edit_count = changing.iter().map(|p| p.changes.len()).sum();
        let lines_added = changing.iter().map(|p| p.lines_added).sum();
        let lines_removed = changing.iter().map(|p| p.lines_removed).sum();
        let emptied = changing
            .iter()
            .any(|p| p.exists && !p.deletes_file && !p.original.is_empty() && p.modified.is_empty());

        let changed_lines = lines_added + lines_removed;
        let risk = if files_deleted > 0 || emptied {
            RiskLevel::Critical
        } else if files_affected <= 5 && changed_lines <= 50 {
            RiskLevel::Low
        } else if files_affected <= 20 && changed_lines <= 500 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        };

        Self {
            files_affected,
            files_created,
            files_deleted,
            edit_count,
            lines_added,
            lines_removed,
            risk,
        }
    }
}

/// Counts over a preview batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSummary {
    pub total_files: usize,
    pub files_changed: usize,
    pub files_unchanged: usize,
    pub files_failed: usize,
    pub total_changes: usize,
}

/// Result of previewing a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewBatchResult {
    pub file_previews: Vec<FilePreview>,
    pub summary: PreviewSummary,
    pub impact: ImpactEstimate,
    /// Conflicts between edit sets; files they touch are not rendered.
    pub conflicts: Vec<Conflict>,
    pub rejected: Vec<RejectedEditSet>,
}

impl PreviewBatchResult {
    pub fn new(
        file_previews: Vec<FilePreview>,
        conflicts: Vec<Conflict>,
        rejected: Vec<RejectedEditSet>,
    ) -> Self {
        let summary = PreviewSummary {
            total_files: file_previews.len(),
            files_changed: file_previews
                .iter()
                .filter(|p| p.is_ok() && p.would_change)
                .count(),
            files_unchanged: file_previews
                .iter()
                .filter(|p| p.is_ok() && !p.would_change)
                .count(),
            files_failed: file_previews.iter().filter(|p| !p.is_ok()).count(),
            total_changes: file_previews.iter().map(|p| p.changes.len()).sum(),
        };
        let impact = ImpactEstimate::from_previews(&file_previews);
        Self {
            file_previews,
            summary,
            impact,
            conflicts,
            rejected,
        }
    }

    pub fn would_change(&self) -> bool {
        self.summary.files_changed > 0
    }
}

/// Renders previews.
#[derive(Debug, Clone, Copy)]
pub struct PreviewGenerator {
    context_lines: usize,
}

impl Default for PreviewGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewGenerator {
    pub fn new() -> Self {
        Self { context_lines: 3 }
    }

    pub fn with_context_lines(mut self, lines: usize) -> Self {
        self.context_lines = lines;
        self
    }

    /// Every edit whose span does not fit `content`, with its edit set.
    pub fn check_spans(
        path: &Path,
        content: &str,
        file_edits: &FileEdits,
    ) -> Vec<(EditSetId, EditsError)> {
        let index = LineIndex::new(content);
        file_edits
            .edits
            .iter()
            .filter_map(|tagged| {
                index.range(&tagged.edit.span).err().map(|detail| {
                    (
                        tagged.edit_set.clone(),
                        EditsError::SpanOutOfRange {
                            path: path.to_path_buf(),
                            span: tagged.edit.span,
                            detail,
                        },
                    )
                })
            })
            .collect()
    }

    /// Preview one file. `original` is `None` when the file does not exist.
    ///
    /// Fails when edits from different edit sets overlap, when the file is
    /// both deleted and edited by different sets, or when a span does not fit
    /// the content.
    pub fn render(
        &self,
        path: &Path,
        original: Option<&str>,
        file_edits: &FileEdits,
    ) -> Result<FilePreview> {
        let exists = original.is_some();
        let text = original.unwrap_or("");

        if file_edits.deleted_by.len() > 1
            || (file_edits.is_deleted() && !file_edits.edits.is_empty())
            || has_cross_set_overlap(&file_edits.edits)
        {
            return Err(EditsError::UnresolvedOverlap(path.to_path_buf()));
        }

        let index = LineIndex::new(text);
        let (modified, mut changes) = if let Some((deleter, _)) = file_edits.deleted_by.first() {
            let changes = if exists {
                vec![TextChange {
                    kind: ChangeKind::Delete,
                    span: Span::new(Position::new(0, 0), index.position(text.len())),
                    original_text: text.to_string(),
                    new_text: String::new(),
                    edit_set: deleter.clone(),
                }]
            } else {
                Vec::new()
            };
            (String::new(), changes)
        } else {
            apply_edits(path, text, &index, &file_edits.edits)?
        };
        changes.sort_by_key(|c| (c.span.start, c.span.end));

        let deletes_file = exists && file_edits.is_deleted();
        let would_change = deletes_file || modified != text;
        let creates_file = !exists && would_change;
        let (lines_added, lines_removed, unified_diff) = if would_change {
            self.diff_stats(path, text, &modified)
        } else {
            (0, 0, String::new())
        };

        Ok(FilePreview {
            path: path.to_path_buf(),
            exists,
            original: text.to_string(),
            modified,
            would_change,
            creates_file,
            deletes_file,
            changes,
            unified_diff,
            lines_added,
            lines_removed,
            original_checksum: None,
            edit_sets: file_edits.edit_set_ids().into_iter().cloned().collect(),
            error: None,
        })
    }

    fn diff_stats(&self, path: &Path, before: &str, after: &str) -> (usize, usize, String) {
        let diff = TextDiff::from_lines(before, after);
        let mut added = 0;
        let mut removed = 0;
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Insert => added += 1,
                ChangeTag::Delete => removed += 1,
                ChangeTag::Equal => {}
            }
        }
        let display = path.display();
        let unified = diff
            .unified_diff()
            .context_radius(self.context_lines)
            .header(&format!("a/{display}"), &format!("b/{display}"))
            .to_string();
        (added, removed, unified)
    }
}

fn has_cross_set_overlap(edits: &[TaggedEdit]) -> bool {
    edits.iter().enumerate().any(|(i, a)| {
        edits[i + 1..]
            .iter()
            .any(|b| a.edit_set != b.edit_set && a.edit.span.overlaps(&b.edit.span))
    })
}

/// Apply edits right-to-left, bottom-to-top. Ties keep submission order in
/// the final text.
fn apply_edits(
    path: &Path,
    text: &str,
    index: &LineIndex<'_>,
    edits: &[TaggedEdit],
) -> Result<(String, Vec<TextChange>)> {
    let mut located = Vec::with_capacity(edits.len());
    for (order, tagged) in edits.iter().enumerate() {
        let range = index
            .range(&tagged.edit.span)
            .map_err(|detail| EditsError::SpanOutOfRange {
                path: path.to_path_buf(),
                span: tagged.edit.span,
                detail,
            })?;
        located.push((range, order, tagged));
    }
    located.sort_by(|(ra, oa, _), (rb, ob, _)| {
        (rb.start, rb.end, ob).cmp(&(ra.start, ra.end, oa))
    });

    let mut content = text.to_string();
    let mut changes = Vec::with_capacity(located.len());
    for (range, _, tagged) in located {
        let original_text = text[range.clone()].to_string();
        let new_text = tagged.edit.new_text.clone();
        if original_text == new_text {
            continue;
        }
        let kind = if range.is_empty() {
            ChangeKind::Insert
        } else if new_text.is_empty() {
            ChangeKind::Delete
        } else {
            ChangeKind::Replace
        };
        content.replace_range(range, &new_text);
        changes.push(TextChange {
            kind,
            span: tagged.edit.span,
            original_text,
            new_text,
            edit_set: tagged.edit_set.clone(),
        });
    }
    Ok((content, changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edit, EditSet, group_by_file};
    use pretty_assertions::assert_eq;

    fn file_edits(sets: &[EditSet], path: &str) -> FileEdits {
        group_by_file(sets.iter().enumerate())
            .remove(Path::new(path))
            .unwrap()
    }

    #[test]
    fn test_replace_hello_world() {
        let sets = [EditSet::new("fix").with_edit(Edit::replace("a.txt", (0, 6), (0, 11), "there"))];
        let preview = PreviewGenerator::new()
            .render(Path::new("a.txt"), Some("hello world"), &file_edits(&sets, "a.txt"))
            .unwrap();
        assert_eq!(preview.modified, "hello there");
        assert!(preview.would_change);
        assert_eq!(preview.changes.len(), 1);
        assert_eq!(preview.changes[0].kind, ChangeKind::Replace);
        assert_eq!(preview.changes[0].original_text, "world");
        assert!(preview.unified_diff.contains("+hello there"));
    }

    #[test]
    fn test_multiple_edits_apply_bottom_up() {
        let content = "let a = 1;\nlet b = 2;\nlet c = 3;\n";
        let sets = [EditSet::new("rename")
            .with_edit(Edit::replace("m.rs", (0, 4), (0, 5), "alpha"))
            .with_edit(Edit::replace("m.rs", (2, 4), (2, 5), "gamma"))
            .with_edit(Edit::insert("m.rs", (1, 0), "// b\n"))];
        let preview = PreviewGenerator::new()
            .render(Path::new("m.rs"), Some(content), &file_edits(&sets, "m.rs"))
            .unwrap();
        assert_eq!(
            preview.modified,
            "let alpha = 1;\n// b\nlet b = 2;\nlet gamma = 3;\n"
        );
        let kinds: Vec<_> = preview.changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Replace, ChangeKind::Insert, ChangeKind::Replace]
        );
        assert_eq!(preview.lines_added, 3);
        assert_eq!(preview.lines_removed, 2);
    }

    #[test]
    fn test_touching_edits_in_one_set() {
        let sets = [EditSet::new("fix")
            .with_edit(Edit::insert("a.txt", (0, 3), "X"))
            .with_edit(Edit::replace("a.txt", (0, 3), (0, 6), "def"))
            .with_edit(Edit::replace("a.txt", (0, 0), (0, 3), "ABC"))];
        let preview = PreviewGenerator::new()
            .render(Path::new("a.txt"), Some("abcxyz"), &file_edits(&sets, "a.txt"))
            .unwrap();
        assert_eq!(preview.modified, "ABCXdef");
    }

    #[test]
    fn test_noop_edit_does_not_change() {
        let sets = [EditSet::new("fix").with_edit(Edit::replace("a.txt", (0, 0), (0, 5), "hello"))];
        let preview = PreviewGenerator::new()
            .render(Path::new("a.txt"), Some("hello world"), &file_edits(&sets, "a.txt"))
            .unwrap();
        assert!(!preview.would_change);
        assert!(preview.changes.is_empty());
        assert!(preview.unified_diff.is_empty());
        assert_eq!(preview.modified, "hello world");
    }

    #[test]
    fn test_missing_file_is_created() {
        let sets = [EditSet::new("new").with_edit(Edit::insert("new.txt", (0, 0), "fresh\n"))];
        let preview = PreviewGenerator::new()
            .render(Path::new("new.txt"), None, &file_edits(&sets, "new.txt"))
            .unwrap();
        assert!(preview.creates_file);
        assert!(!preview.exists);
        assert_eq!(preview.modified, "fresh\n");
    }

    #[test]
    fn test_deletion_preview() {
        let sets = [EditSet::new("rm").with_deletion("old.txt")];
        let preview = PreviewGenerator::new()
            .render(Path::new("old.txt"), Some("a\nb\n"), &file_edits(&sets, "old.txt"))
            .unwrap();
        assert!(preview.deletes_file);
        assert!(preview.would_change);
        assert_eq!(preview.lines_removed, 2);
        assert_eq!(preview.changes[0].kind, ChangeKind::Delete);
    }

    #[test]
    fn test_cross_set_overlap_refused() {
        let sets = [
            EditSet::new("a").with_edit(Edit::replace("a.txt", (0, 0), (0, 5), "x")),
            EditSet::new("b").with_edit(Edit::replace("a.txt", (0, 2), (0, 4), "y")),
        ];
        let err = PreviewGenerator::new()
            .render(Path::new("a.txt"), Some("hello"), &file_edits(&sets, "a.txt"))
            .unwrap_err();
        assert_eq!(err, EditsError::UnresolvedOverlap(PathBuf::from("a.txt")));
    }

    #[test]
    fn test_check_spans_reports_owner() {
        let sets = [
            EditSet::new("ok").with_edit(Edit::insert("a.txt", (0, 0), "x")),
            EditSet::new("bad").with_edit(Edit::insert("a.txt", (4, 0), "y")),
        ];
        let bad = PreviewGenerator::check_spans(Path::new("a.txt"), "one line", &file_edits(&sets, "a.txt"));
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].0.as_str(), "bad");
    }

    #[test]
    fn test_impact_risk_levels() {
        let sets = [EditSet::new("fix").with_edit(Edit::replace("a.txt", (0, 6), (0, 11), "there"))];
        let preview = PreviewGenerator::new()
            .render(Path::new("a.txt"), Some("hello world"), &file_edits(&sets, "a.txt"))
            .unwrap();
        let impact = ImpactEstimate::from_previews(std::slice::from_ref(&preview));
        assert_eq!(impact.risk, RiskLevel::Low);
        assert_eq!(impact.files_affected, 1);

        let rm = [EditSet::new("rm").with_deletion("b.txt")];
        let deleted = PreviewGenerator::new()
            .render(Path::new("b.txt"), Some("x"), &file_edits(&rm, "b.txt"))
            .unwrap();
        let impact = ImpactEstimate::from_previews(&[preview, deleted]);
        assert_eq!(impact.risk, RiskLevel::Critical);
    }

    #[test]
    fn test_preview_is_deterministic() {
        let sets = [EditSet::new("fix")
            .with_edit(Edit::replace("a.txt", (0, 0), (0, 1), "H"))
            .with_edit(Edit::insert("a.txt", (0, 11), "!"))];
        let edits = file_edits(&sets, "a.txt");
        let generator = PreviewGenerator::new();
        let first = generator.render(Path::new("a.txt"), Some("hello world"), &edits).unwrap();
        let second = generator.render(Path::new("a.txt"), Some("hello world"), &edits).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.modified, "Hello world!");
    }
}
