//! Search and replace as an edit-set producer.
//!
//! Matches become ordinary [`Edit`]s, so a replace goes through the same
//! preview, conflict and backup path as any other edit set.

use crate::model::{Edit, EditSet, EditSetId, Span};
use crate::text::LineIndex;
use crate::{EditsError, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Search pattern configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPattern {
    /// Pattern to search for.
    pub pattern: String,
    /// Whether pattern is regex.
    #[serde(default)]
    pub is_regex: bool,
    /// Case sensitive search.
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    /// Whole word only.
    #[serde(default)]
    pub whole_word: bool,
}

fn default_true() -> bool {
    true
}

impl SearchPattern {
    pub fn literal(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            is_regex: false,
            case_sensitive: true,
            whole_word: false,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            is_regex: true,
            ..Self::literal(String::new())
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn whole_word(mut self) -> Self {
        self.whole_word = true;
        self
    }

    /// Compile into a regex. Literal patterns are escaped first.
    pub fn compile(&self) -> Result<Regex> {
        if self.pattern.is_empty() {
            return Err(EditsError::Pattern("pattern is empty".to_string()));
        }
        let body = if self.is_regex {
            self.pattern.clone()
        } else {
            regex::escape(&self.pattern)
        };
        let body = if self.whole_word {
            format!(r"\b(?:{body})\b")
        } else {
            body
        };
        RegexBuilder::new(&body)
            .case_insensitive(!self.case_sensitive)
            .build()
            .map_err(|e| EditsError::Pattern(e.to_string()))
    }

    /// All non-empty matches in `content`, in order.
    pub fn find_matches(&self, path: &Path, content: &str) -> Result<Vec<SearchMatch>> {
        let regex = self.compile()?;
        let index = LineIndex::new(content);
        Ok(regex
            .find_iter(content)
            .filter(|m| !m.is_empty())
            .map(|m| SearchMatch {
                file_path: path.to_path_buf(),
                span: Span::new(index.position(m.start()), index.position(m.end())),
                match_text: m.as_str().to_string(),
            })
            .collect())
    }
}

/// A match found in a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub file_path: PathBuf,
    pub span: Span,
    pub match_text: String,
}

/// Build an edit set replacing every match of `pattern` in `content`.
///
/// Regex replacements may reference capture groups (`$1`, `${name}`);
/// literal replacements are inserted as-is. Returns `Ok(None)` when nothing
/// matches.
pub fn build_replace_edit_set(
    id: impl Into<EditSetId>,
    path: impl AsRef<Path>,
    content: &str,
    pattern: &SearchPattern,
    replacement: &str,
) -> Result<Option<EditSet>> {
    let path = path.as_ref();
    let regex = pattern.compile()?;
    let index = LineIndex::new(content);

    let mut edits = Vec::new();
    for caps in regex.captures_iter(content) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.is_empty() {
            continue;
        }
        let new_text = if pattern.is_regex {
            let mut expanded = String::new();
            caps.expand(replacement, &mut expanded);
            expanded
        } else {
            replacement.to_string()
        };
        edits.push(
            Edit::replace(
                path,
                index.position(whole.start()),
                index.position(whole.end()),
                new_text,
            )
            .with_source("search-replace"),
        );
    }

    if edits.is_empty() {
        return Ok(None);
    }

    debug!(
        file = %path.display(),
        matches = edits.len(),
        pattern = %pattern.pattern,
        "Built search-replace edit set"
    );

    let set = EditSet::new(id)
        .with_edits(edits)
        .with_description(format!("Replace '{}' with '{}'", pattern.pattern, replacement));
    Ok(Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Position, group_by_file};
    use crate::preview::PreviewGenerator;
    use pretty_assertions::assert_eq;

    fn apply(set: &EditSet, content: &str) -> String {
        let files = group_by_file([(0, set)]);
        let (path, edits) = files.iter().next().unwrap();
        PreviewGenerator::new()
            .render(path, Some(content), edits)
            .unwrap()
            .modified
    }

    #[test]
    fn test_literal_replace() {
        let content = "foo bar foo\nfoo";
        let set = build_replace_edit_set(
            "rename",
            "a.txt",
            content,
            &SearchPattern::literal("foo"),
            "baz",
        )
        .unwrap()
        .unwrap();
        assert_eq!(set.edits.len(), 3);
        assert_eq!(set.edits[2].span.start, Position::new(1, 0));
        assert!(set.check().is_ok());
        assert_eq!(apply(&set, content), "baz bar baz\nbaz");
    }

    #[test]
    fn test_literal_special_chars_are_escaped() {
        let matches = SearchPattern::literal("a.b")
            .find_matches(Path::new("x"), "a.b axb")
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].match_text, "a.b");
    }

    #[test]
    fn test_case_insensitive_whole_word() {
        let pattern = SearchPattern::literal("hello").case_insensitive().whole_word();
        let matches = pattern
            .find_matches(Path::new("x"), "Hello HELLO helloworld")
            .unwrap();
        let texts: Vec<_> = matches.iter().map(|m| m.match_text.as_str()).collect();
        assert_eq!(texts, vec!["Hello", "HELLO"]);
    }

    #[test]
    fn test_regex_capture_expansion() {
        let content = "let x = foo(1);\nlet y = foo(22);";
        let set = build_replace_edit_set(
            "wrap",
            "a.rs",
            content,
            &SearchPattern::regex(r"foo\((\d+)\)"),
            "bar(${1}, 0)",
        )
        .unwrap()
        .unwrap();
        assert_eq!(apply(&set, content), "let x = bar(1, 0);\nlet y = bar(22, 0);");
    }

    #[test]
    fn test_no_match_and_bad_pattern() {
        assert!(
            build_replace_edit_set("n", "a", "abc", &SearchPattern::literal("zzz"), "y")
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            SearchPattern::regex("(unclosed").compile(),
            Err(EditsError::Pattern(_))
        ));
        assert!(SearchPattern::literal("").compile().is_err());
    }

    #[test]
    fn test_match_positions_count_chars() {
        let matches = SearchPattern::literal("x")
            .find_matches(Path::new("f"), "é x")
            .unwrap();
        assert_eq!(matches[0].span, Span::new((0, 2), (0, 3)));
    }
}
