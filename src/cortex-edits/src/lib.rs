//! Edit descriptors and the pure half of the Cortex bulk-edit engine.
//!
//! Provides:
//! - The edit model (`Edit`, `EditSet`, spans and positions)
//! - Input checks that reject malformed edit sets before any I/O
//! - In-memory previews with unified diffs and an impact estimate
//! - Interval-overlap conflict detection between edit sets
//! - Strategy-based conflict resolution
//! - Best-effort textual validators run after an edit lands
//! - A search-and-replace producer that turns pattern matches into an edit set
//!
//! Nothing in this crate touches the filesystem; reading, backing up and
//! writing files is the job of `cortex-edit-engine`.

pub mod conflict;
pub mod model;
pub mod preview;
pub mod resolve;
pub mod search_replace;
pub mod text;
pub mod validate;

pub use conflict::{Conflict, ConflictDetector, ConflictKind, ConflictParty};
pub use model::{
    Edit, EditSet, EditSetId, EditSetMetadata, FileEdits, Position, RejectedEditSet, Severity,
    Span, TaggedEdit, check_batch, group_by_file,
};
pub use preview::{
    ChangeKind, FilePreview, ImpactEstimate, PreviewBatchResult, PreviewGenerator, PreviewSummary,
    RiskLevel, TextChange,
};
pub use resolve::{
    ConflictResolver, ConflictStrategy, DropReason, DroppedEditSet, ResolutionOutcome,
    ResolvedConflict, Resolution,
};
pub use search_replace::{SearchMatch, SearchPattern, build_replace_edit_set};
pub use text::LineIndex;
pub use validate::{
    DelimiterBalanceValidator, ValidationIssue, ValidationSeverity, Validator,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Input errors: a malformed edit set or request, detected before it can
/// touch any file.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EditsError {
    #[error("Edit set id must not be empty")]
    EmptyId,
    #[error("Duplicate edit set id: {0}")]
    DuplicateId(String),
    #[error("Inverted span in {path}: start {start} is after end {end}")]
    InvertedSpan {
        path: PathBuf,
        start: Position,
        end: Position,
    },
    #[error("Edits {first} and {second} overlap inside one edit set in {path}")]
    OverlapWithinSet {
        path: PathBuf,
        first: Span,
        second: Span,
    },
    #[error("Confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("{0} is both edited and deleted by the same edit set")]
    EditAndDelete(PathBuf),
    #[error("Unknown dependency: {0}")]
    UnknownDependency(String),
    #[error("Depends on rejected edit set {0}")]
    DependencyRejected(String),
    #[error("Span {span} is out of range in {path}: {detail}")]
    SpanOutOfRange {
        path: PathBuf,
        span: Span,
        detail: String,
    },
    #[error("Edits from different edit sets overlap in {0}; resolve conflicts first")]
    UnresolvedOverlap(PathBuf),
    #[error("Unknown conflict strategy: {0}")]
    UnknownStrategy(String),
    #[error("Invalid pattern: {0}")]
    Pattern(String),
}

pub type Result<T> = std::result::Result<T, EditsError>;
