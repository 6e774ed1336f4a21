//! Rename/move detection over one batch of filesystem changes.
//!
//! Raw changes cannot tell "X was renamed to Y" apart from "X was deleted and an unrelated Y was
//! created". Within a batch, every deleted path is compared against every added path by
//! modification time. A deleted file can no longer be stat'ed, so its time comes from the
//! identity store. Equal times are taken to be the same file: the pair leaves both working sets
//! and the identity record is moved. Nothing is correlated across batches.

use crate::{
    event::{ChangeKind, FileChange},
    identity::{FileIdResolver, FileStat},
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// What a batch did to the identity store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub moved: Vec<(PathBuf, PathBuf)>,
    pub saved: Vec<PathBuf>,
    pub unmatched_added: Vec<PathBuf>,
    pub unmatched_deleted: Vec<PathBuf>,
}

impl BatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
            && self.saved.is_empty()
            && self.unmatched_added.is_empty()
            && self.unmatched_deleted.is_empty()
    }
}

#[derive(Clone)]
pub struct RenameDetector {
    resolver: FileIdResolver,
}

impl RenameDetector {
    pub fn new(resolver: FileIdResolver) -> Self {
        RenameDetector { resolver }
    }

    /// Correlate one batch and apply the result to the identity store.
    ///
    /// Holds the document lock for the whole batch, so a concurrent `path_for_id` never sees a
    /// record halfway through a move.
    #[tracing::instrument(skip_all)]
    pub async fn process_batch(&self, changes: &[FileChange]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if !self.resolver.is_enabled() || changes.is_empty() {
            return outcome;
        }
        let _guard = self.resolver.document_lock().lock().await;

        // path -> last known mtime, in arrival order of first sighting
        let mut deleted: BTreeMap<PathBuf, (usize, Option<i64>)> = BTreeMap::new();
        let mut added: BTreeMap<PathBuf, (usize, Option<i64>)> = BTreeMap::new();

        for (seq, change) in changes.iter().enumerate() {
            match change.kind {
                ChangeKind::Modified => {
                    self.save(&change.path, &mut outcome).await;
                }
                ChangeKind::Deleted => {
                    if deleted.contains_key(&change.path) {
                        continue;
                    }
                    let mtime = self.resolver.last_known_mtime(&change.path).await;
                    match take_match(&mut added, mtime) {
                        Some(new_path) => {
                            self.relocate(change.path.clone(), new_path, &mut outcome)
                                .await;
                        }
                        None => {
                            deleted.insert(change.path.clone(), (seq, mtime));
                        }
                    }
                }
                ChangeKind::Added => {
                    if added.contains_key(&change.path) {
                        continue;
                    }
                    let mtime = FileStat::of(&change.path).map(|stat| stat.mtime);
                    match take_match(&mut deleted, mtime) {
                        Some(old_path) => {
                            self.relocate(old_path, change.path.clone(), &mut outcome)
                                .await;
                        }
                        None => {
                            added.insert(change.path.clone(), (seq, mtime));
                        }
                    }
                }
            }
        }

        outcome.unmatched_added = in_arrival_order(added);
        outcome.unmatched_deleted = in_arrival_order(deleted);
        if !outcome.is_empty() {
            tracing::debug!(
                "[RenameDetector] batch of {} change(s): {} moved, {} saved, {} added, {} deleted",
                changes.len(),
                outcome.moved.len(),
                outcome.saved.len(),
                outcome.unmatched_added.len(),
                outcome.unmatched_deleted.len()
            );
        }
        outcome
    }

    async fn relocate(&self, old_path: PathBuf, new_path: PathBuf, outcome: &mut BatchOutcome) {
        if old_path == new_path {
            self.save(&new_path, outcome).await;
            return;
        }
        match self.resolver.move_path(&old_path, &new_path).await {
            Ok(()) => {
                tracing::info!("Detected move {:?} -> {:?}", old_path, new_path);
                outcome.moved.push((old_path, new_path));
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to record move {:?} -> {:?}: {}",
                    old_path,
                    new_path,
                    e
                );
            }
        }
    }

    async fn save(&self, path: &Path, outcome: &mut BatchOutcome) {
        match self.resolver.save(path).await {
            Ok(()) => outcome.saved.push(path.to_path_buf()),
            Err(e) => tracing::warn!("Failed to refresh identity record for {:?}: {}", path, e),
        }
    }
}

/// Remove and return the earliest entry of `other` whose mtime equals `mtime`. Unknown times
/// never match.
fn take_match(
    other: &mut BTreeMap<PathBuf, (usize, Option<i64>)>,
    mtime: Option<i64>,
) -> Option<PathBuf> {
    let mtime = mtime?;
    let path = other
        .iter()
        .filter(|(_, (_, candidate))| *candidate == Some(mtime))
        .min_by_key(|(_, (seq, _))| *seq)
        .map(|(path, _)| path.clone())?;
    other.remove(&path);
    Some(path)
}

fn in_arrival_order(set: BTreeMap<PathBuf, (usize, Option<i64>)>) -> Vec<PathBuf> {
    let mut entries = set.into_iter().collect::<Vec<_>>();
    entries.sort_by_key(|(_, (seq, _))| *seq);
    entries.into_iter().map(|(path, _)| path).collect()
}
