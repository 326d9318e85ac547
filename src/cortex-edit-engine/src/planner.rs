//! Reads the files a batch touches and prepares it for preview and apply.
//!
//! Planning is read-only. It applies `exclude_files`, runs the input checks,
//! loads every target file once, and rejects edit sets whose spans do not fit
//! the content they target.

use cortex_backup::sha256_hex;
use cortex_edits::{
    Conflict, ConflictDetector, EditSet, EditSetId, EditsError, FileEdits, FilePreview,
    PreviewGenerator, RejectedEditSet, check_batch, group_by_file,
};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::fs_ops::read_optional;
use crate::options::ApplyOptions;

/// Pre-edit state of one file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileSource {
    /// `content` is `None` when the file does not exist.
    Loaded {
        content: Option<String>,
        checksum: Option<String>,
        size: Option<u64>,
    },
    Unreadable(String),
}

impl FileSource {
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::Loaded { size, .. } => *size,
            Self::Unreadable(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct Plan {
    /// Submitted edit sets with excluded files stripped.
    pub edit_sets: Vec<EditSet>,
    /// Submission indices that passed every input check.
    pub accepted: Vec<usize>,
    pub rejected: Vec<RejectedEditSet>,
    pub sources: BTreeMap<PathBuf, FileSource>,
    /// Excluded paths with the edit sets that targeted them.
    pub excluded: BTreeMap<PathBuf, Vec<EditSetId>>,
    /// Edits (and deletions) submitted per path, before any filtering.
    pub targeted: BTreeMap<PathBuf, usize>,
}

impl Plan {
    pub async fn build(edit_sets: &[EditSet], options: &ApplyOptions, parallelism: usize) -> Self {
        let mut targeted: BTreeMap<PathBuf, usize> = BTreeMap::new();
        let mut excluded: BTreeMap<PathBuf, Vec<EditSetId>> = BTreeMap::new();
        let is_excluded = |path: &Path| options.is_excluded(path);

        let filtered: Vec<EditSet> = edit_sets
            .iter()
            .map(|set| {
                let mut set = set.clone();
                for path in set
                    .edits
                    .iter()
                    .map(|e| &e.file_path)
                    .chain(set.deletions.iter())
                {
                    *targeted.entry(path.clone()).or_default() += 1;
                    if is_excluded(path) {
                        let ids = excluded.entry(path.clone()).or_default();
                        if !ids.contains(&set.id) {
                            ids.push(set.id.clone());
                        }
                    }
                }
                set.edits.retain(|e| !is_excluded(&e.file_path));
                set.deletions.retain(|d| !is_excluded(d));
                set
            })
            .collect();

        let (accepted, rejected) = check_batch(&filtered);
        let paths: Vec<PathBuf> = group_by_file(accepted.iter().map(|&i| (i, &filtered[i])))
            .into_keys()
            .collect();
        let sources = load_sources(paths, parallelism).await;

        let mut plan = Self {
            edit_sets: filtered,
            accepted,
            rejected,
            sources,
            excluded,
            targeted,
        };
        plan.reject_out_of_range_spans();
        plan
    }

    /// Accepted edit sets with their submission index.
    pub fn live(&self) -> impl Iterator<Item = (usize, &EditSet)> {
        self.accepted.iter().map(|&i| (i, &self.edit_sets[i]))
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        ConflictDetector::detect_ordered(self.live())
    }

    /// Edits per file for the accepted sets not in `dropped`.
    pub fn file_edits(&self, dropped: &BTreeSet<&EditSetId>) -> BTreeMap<PathBuf, FileEdits> {
        group_by_file(self.live().filter(|(_, set)| !dropped.contains(&set.id)))
    }

    /// Preview every file of `files`. Unreadable files and files whose edits
    /// cannot be rendered come back as failed previews.
    pub fn render(
        &self,
        generator: &PreviewGenerator,
        files: &BTreeMap<PathBuf, FileEdits>,
    ) -> Vec<FilePreview> {
        files
            .iter()
            .map(|(path, file_edits)| match self.sources.get(path) {
                Some(FileSource::Loaded {
                    content, checksum, ..
                }) => generator
                    .render(path, content.as_deref(), file_edits)
                    .map(|preview| preview.with_checksum(checksum.clone()))
                    .unwrap_or_else(|e| FilePreview::failed(path.clone(), e.to_string())),
                Some(FileSource::Unreadable(error)) => FilePreview::failed(path.clone(), error.clone()),
                None => FilePreview::failed(path.clone(), "file was not loaded"),
            })
            .collect()
    }

    pub fn targeted_count(&self, path: &Path) -> usize {
        self.targeted.get(path).copied().unwrap_or(0)
    }

    fn reject_out_of_range_spans(&mut self) {
        let files = group_by_file(self.live());
        let mut bad: Vec<(EditSetId, EditsError)> = Vec::new();
        for (path, file_edits) in &files {
            if let Some(FileSource::Loaded { content, .. }) = self.sources.get(path) {
                bad.extend(PreviewGenerator::check_spans(
                    path,
                    content.as_deref().unwrap_or(""),
                    file_edits,
                ));
            }
        }

        let mut rejected_ids: HashSet<EditSetId> = HashSet::new();
        for (id, reason) in bad {
            if rejected_ids.insert(id.clone()) {
                warn!(edit_set = %id, error = %reason, "Rejecting edit set");
                self.rejected.push(RejectedEditSet { id, reason });
            }
        }
        if rejected_ids.is_empty() {
            return;
        }

        // Sets depending on a rejected set go too.
        loop {
            let edit_sets = &self.edit_sets;
            let next = self.accepted.iter().find_map(|&i| {
                let set = &edit_sets[i];
                if rejected_ids.contains(&set.id) {
                    return None;
                }
                set.metadata
                    .depends_on
                    .iter()
                    .find(|dep| rejected_ids.contains(*dep))
                    .map(|dep| (set.id.clone(), dep.clone()))
            });
            let Some((id, dep)) = next else {
                break;
            };
            rejected_ids.insert(id.clone());
            self.rejected.push(RejectedEditSet {
                id,
                reason: EditsError::DependencyRejected(dep.to_string()),
            });
        }

        let edit_sets = &self.edit_sets;
        self.accepted
            .retain(|&i| !rejected_ids.contains(&edit_sets[i].id));
    }
}

async fn load_sources(paths: Vec<PathBuf>, parallelism: usize) -> BTreeMap<PathBuf, FileSource> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let loads = paths.into_iter().map(|path| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = semaphore.acquire().await;
            let source = load_source(&path).await;
            (path, source)
        }
    });
    join_all(loads).await.into_iter().collect()
}

async fn load_source(path: &Path) -> FileSource {
    match read_optional(path).await {
        Ok(None) => FileSource::Loaded {
            content: None,
            checksum: None,
            size: None,
        },
        Ok(Some(bytes)) => {
            let checksum = sha256_hex(&bytes);
            let size = bytes.len() as u64;
            match String::from_utf8(bytes) {
                Ok(content) => {
                    debug!(file = %path.display(), size, "Loaded file");
                    FileSource::Loaded {
                        content: Some(content),
                        checksum: Some(checksum),
                        size: Some(size),
                    }
                }
                Err(_) => FileSource::Unreadable("file is not valid UTF-8".to_string()),
            }
        }
        Err(e) => FileSource::Unreadable(format!("failed to read file: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_edits::Edit;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_build_loads_and_rejects_out_of_range() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        tokio::fs::write(&a, "one line").await.unwrap();

        let sets = vec![
            EditSet::new("ok").with_edit(Edit::replace(&a, (0, 0), (0, 3), "two")),
            EditSet::new("too-far").with_edit(Edit::insert(&a, (5, 0), "x")),
            EditSet::new("dependent")
                .with_edit(Edit::insert(dir.path().join("b.txt"), (0, 0), "y"))
                .depends_on("too-far"),
        ];
        let plan = Plan::build(&sets, &ApplyOptions::default(), 2).await;

        assert_eq!(plan.accepted, vec![0]);
        let reasons: Vec<_> = plan.rejected.iter().map(|r| r.id.to_string()).collect();
        assert_eq!(reasons, vec!["too-far", "dependent"]);
        assert!(matches!(
            plan.rejected[1].reason,
            EditsError::DependencyRejected(_)
        ));
        assert!(matches!(
            plan.sources.get(&a),
            Some(FileSource::Loaded { content: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_exclusion_strips_edits() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let sets = vec![
            EditSet::new("both")
                .with_edit(Edit::insert(&a, (0, 0), "x"))
                .with_edit(Edit::insert(&b, (0, 0), "y")),
        ];
        let plan = Plan::build(&sets, &ApplyOptions::default().exclude(b.clone()), 1).await;
        assert_eq!(plan.excluded.get(&b).unwrap(), &vec![EditSetId::from("both")]);
        assert_eq!(plan.targeted_count(&b), 1);
        assert!(!plan.sources.contains_key(&b));
        assert_eq!(plan.edit_sets[0].edits.len(), 1);
    }

    #[tokio::test]
    async fn test_non_utf8_is_unreadable() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("blob.bin");
        tokio::fs::write(&bin, [0xffu8, 0xfe, 0x00]).await.unwrap();
        let sets = vec![EditSet::new("x").with_edit(Edit::insert(&bin, (0, 0), "x"))];
        let plan = Plan::build(&sets, &ApplyOptions::default(), 1).await;
        let files = plan.file_edits(&BTreeSet::new());
        let previews = plan.render(&PreviewGenerator::new(), &files);
        assert!(!previews[0].is_ok());
        assert!(previews[0].error.as_ref().unwrap().contains("UTF-8"));
    }
}
