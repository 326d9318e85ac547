//! Strategy-based conflict resolution.
//!
//! Resolving is a pure function of a [`Conflict`] and a [`ConflictStrategy`]:
//! no I/O, no shared state, same answer every time.

use crate::conflict::{Conflict, ConflictKind};
use crate::model::{EditSet, EditSetId};
use crate::{EditsError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// How conflicts between edit sets are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Keep the first-submitted edit set.
    #[default]
    PreferOlder,
    /// Keep the last-submitted edit set.
    PreferNewer,
    /// Keep the edit set with the higher confidence.
    PreferConfidence,
    /// Keep the edit set with the higher severity.
    PreferSeverity,
    /// Leave the conflict to the caller.
    Manual,
    /// Drop every conflicting edit set.
    SkipAll,
    /// Fail the entire batch.
    Abort,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreferOlder => "prefer_older",
            Self::PreferNewer => "prefer_newer",
            Self::PreferConfidence => "prefer_confidence",
            Self::PreferSeverity => "prefer_severity",
            Self::Manual => "manual",
            Self::SkipAll => "skip_all",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = EditsError;

    /// Accepts snake_case, kebab-case and PascalCase names.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "preferolder" | "older" => Ok(Self::PreferOlder),
            "prefernewer" | "newer" => Ok(Self::PreferNewer),
            "preferconfidence" | "confidence" => Ok(Self::PreferConfidence),
            "preferseverity" | "severity" => Ok(Self::PreferSeverity),
            "manual" => Ok(Self::Manual),
            "skipall" | "skip" => Ok(Self::SkipAll),
            "abort" => Ok(Self::Abort),
            _ => Err(EditsError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Outcome of applying a strategy to one conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resolution {
    /// Keep one edit set, drop the other.
    Prefer { keep: EditSetId, drop: EditSetId },
    /// Drop both edit sets.
    SkipAll { dropped: Vec<EditSetId> },
    /// Fail the batch.
    Abort,
}

/// A conflict together with how it was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub conflict: Conflict,
    pub resolution: Resolution,
}

/// Why an edit set was left out of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DropReason {
    /// Lost a conflict to another edit set.
    LostConflict { winner: EditSetId },
    /// Dropped with every other party under `SkipAll`.
    SkippedConflict,
    /// Part of a conflict nobody resolved.
    Unresolved,
    /// An edit set it depends on was dropped.
    DependencyDropped { dependency: EditSetId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEditSet {
    pub id: EditSetId,
    pub reason: DropReason,
}

/// Result of resolving every conflict of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub resolutions: Vec<ResolvedConflict>,
    pub unresolved: Vec<Conflict>,
    /// Edit sets withheld from the commit, in id order.
    pub dropped: Vec<DroppedEditSet>,
    /// Some conflict asked to abort the batch.
    pub aborted: bool,
}

impl ResolutionOutcome {
    pub fn dropped_ids(&self) -> BTreeSet<&EditSetId> {
        self.dropped.iter().map(|d| &d.id).collect()
    }

    pub fn is_dropped(&self, id: &EditSetId) -> bool {
        self.dropped.iter().any(|d| &d.id == id)
    }

    /// Drop every edit set whose dependency was dropped, until nothing
    /// changes.
    pub fn cascade_dependencies(&mut self, edit_sets: &[EditSet]) {
        loop {
            let next = edit_sets.iter().find_map(|set| {
                if self.is_dropped(&set.id) {
                    return None;
                }
                set.metadata
                    .depends_on
                    .iter()
                    .find(|dep| self.is_dropped(dep))
                    .map(|dep| DroppedEditSet {
                        id: set.id.clone(),
                        reason: DropReason::DependencyDropped {
                            dependency: dep.clone(),
                        },
                    })
            });
            match next {
                Some(dropped) => self.dropped.push(dropped),
                None => break,
            }
        }
        self.dropped.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

/// Applies strategies to conflicts.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve one conflict. `None` means the strategy leaves it unresolved.
    ///
    /// A dependency-order conflict under any `Prefer*` strategy always drops
    /// the dependent: keeping it would drop the set it depends on.
    pub fn resolve(conflict: &Conflict, strategy: ConflictStrategy) -> Option<Resolution> {
        let (first, second) = (&conflict.first, &conflict.second);
        let first_wins = match strategy {
            ConflictStrategy::SkipAll => {
                return Some(Resolution::SkipAll {
                    dropped: vec![first.edit_set.clone(), second.edit_set.clone()],
                });
            }
            ConflictStrategy::Abort => return Some(Resolution::Abort),
            ConflictStrategy::Manual => return None,
            // `first` is the dependent.
            _ if conflict.kind == ConflictKind::DependencyOrder => false,
            // `first` is always the older submission, so ties go to it.
            ConflictStrategy::PreferOlder => true,
            ConflictStrategy::PreferNewer => false,
            ConflictStrategy::PreferConfidence => {
                first.confidence.total_cmp(&second.confidence) != Ordering::Less
            }
            ConflictStrategy::PreferSeverity => first.severity >= second.severity,
        };
        let (keep, drop) = if first_wins {
            (first, second)
        } else {
            (second, first)
        };
        Some(Resolution::Prefer {
            keep: keep.edit_set.clone(),
            drop: drop.edit_set.clone(),
        })
    }

    /// Resolve every conflict of a batch. Every conflicting pair loses at
    /// least one side, so the surviving edit sets never overlap.
    pub fn resolve_all(conflicts: &[Conflict], strategy: ConflictStrategy) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();
        let mut dropped: BTreeMap<EditSetId, DropReason> = BTreeMap::new();

        for conflict in conflicts {
            match Self::resolve(conflict, strategy) {
                Some(resolution) => {
                    match &resolution {
                        Resolution::Prefer { keep, drop } => {
                            dropped
                                .entry(drop.clone())
                                .or_insert_with(|| DropReason::LostConflict {
                                    winner: keep.clone(),
                                });
                        }
                        Resolution::SkipAll { dropped: ids } => {
                            for id in ids {
                                dropped
                                    .entry(id.clone())
                                    .or_insert(DropReason::SkippedConflict);
                            }
                        }
                        Resolution::Abort => outcome.aborted = true,
                    }
                    outcome.resolutions.push(ResolvedConflict {
                        conflict: conflict.clone(),
                        resolution,
                    });
                }
                None => {
                    for id in [&conflict.first.edit_set, &conflict.second.edit_set] {
                        dropped.entry(id.clone()).or_insert(DropReason::Unresolved);
                    }
                    outcome.unresolved.push(conflict.clone());
                }
            }
        }

        outcome.dropped = dropped
            .into_iter()
            .map(|(id, reason)| DroppedEditSet { id, reason })
            .collect();
        outcome
    }
}
