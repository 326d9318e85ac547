//! Best-effort checks run on a file after its edits land.
//!
//! Validators only report. Nothing here reverts a write; rolling back is an
//! explicit caller action.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationSeverity {
    Warning,
    Error,
}

/// One finding of a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: PathBuf,
    pub validator: String,
    pub severity: ValidationSeverity,
    pub message: String,
}

/// A structural sanity check comparing a file before and after its edits.
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, path: &Path, before: &str, after: &str) -> Vec<ValidationIssue>;
}

const PAIRS: [(char, char); 3] = [('(', ')'), ('[', ']'), ('{', '}')];

/// Flags edits that change the balance of `()`, `[]` or `{}`.
///
/// Only the change is reported: a file that was already unbalanced and stays
/// equally unbalanced is not blamed on the edit.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelimiterBalanceValidator;

impl DelimiterBalanceValidator {
    fn balance(text: &str) -> [i64; 3] {
        let mut counts = [0i64; 3];
        for c in text.chars() {
            for (i, (open, close)) in PAIRS.iter().enumerate() {
                if c == *open {
                    counts[i] += 1;
                } else if c == *close {
                    counts[i] -= 1;
                }
            }
        }
        counts
    }
}

impl Validator for DelimiterBalanceValidator {
    fn name(&self) -> &str {
        "delimiter-balance"
    }

    fn validate(&self, path: &Path, before: &str, after: &str) -> Vec<ValidationIssue> {
        let (old, new) = (Self::balance(before), Self::balance(after));
        PAIRS
            .iter()
            .enumerate()
            .filter(|(i, _)| old[*i] != new[*i])
            .map(|(i, (open, close))| {
                let severity = if old[i] == 0 {
                    ValidationSeverity::Error
                } else {
                    ValidationSeverity::Warning
                };
                ValidationIssue {
                    path: path.to_path_buf(),
                    validator: self.name().to_string(),
                    severity,
                    message: format!(
                        "'{open}{close}' balance changed from {} to {}",
                        old[i], new[i]
                    ),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(before: &str, after: &str) -> Vec<ValidationIssue> {
        DelimiterBalanceValidator.validate(Path::new("lib.rs"), before, after)
    }

    #[test]
    fn test_balanced_edit_is_clean() {
        assert!(check("fn a() {}", "fn a() { b(); }").is_empty());
    }

    #[test]
    fn test_new_imbalance_is_error() {
        let issues = check("fn a() {}", "fn a() {");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ValidationSeverity::Error);
        assert_eq!(issues[0].validator, "delimiter-balance");
        assert!(issues[0].message.contains("'{}'"));
    }

    #[test]
    fn test_existing_imbalance_not_blamed() {
        assert!(check("let v = [1, 2", "let v = [1, 3").is_empty());
        let issues = check("let v = [1, 2", "let v = [[1, 2");
        assert_eq!(issues[0].severity, ValidationSeverity::Warning);
    }
}
