//! Reconciliation against the remote tree
//!
//! Compares every cached record of a repository with a fresh remote tree
//! listing, settles what can be settled automatically and asks a
//! [`ConflictResolver`] about the rest. The outcome (record updates, new
//! baseline, advanced sync state) is written in a single transaction after
//! every conflict has a decision, so an aborted or cancelled pass leaves the
//! persisted state untouched.

use crate::error::{Result, SyncError};
use crate::object::{BaselineEntry, BaselineIndex, RepoId, blob_sha};
use crate::remote::{Freshness, RemoteStore};
use crate::store::{ContentStore, DirtyState, FileRecord, RecordUpdate};
use crate::sync_state::{RepositorySyncState, SyncPhase};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Kind of divergence between a local record and the remote tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The remote removed a path that still has local content.
    RemoteDelete,
    /// The remote changed a path that was edited or deleted locally.
    RemoteUpdate,
}

/// A path that needs an external decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictKind,
    pub local_state: DirtyState,
    /// Blob SHA on the remote; `None` for remote deletions.
    pub remote_sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    DiscardLocal,
}

/// Decides conflicts on behalf of the user.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &Conflict) -> Result<Resolution>;
}

/// Resolver that answers every conflict the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub Resolution);

#[async_trait]
impl ConflictResolver for FixedResolver {
    async fn resolve(&self, _conflict: &Conflict) -> Result<Resolution> {
        Ok(self.0)
    }
}

/// Paths that changed on the remote between two baselines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChanges {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl RemoteChanges {
    pub fn between(old: &BaselineIndex, new: &BaselineIndex) -> Self {
        let mut changes = Self::default();
        for (path, entry) in new {
            match old.get(path) {
                None => changes.added.push(path.clone()),
                Some(prev) if prev.sha != entry.sha => changes.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        changes.removed = old
            .keys()
            .filter(|p| !new.contains_key(*p))
            .cloned()
            .collect();
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub tree_sha: String,
    pub previous_tree_sha: Option<String>,
    /// The tree was adopted as the first baseline.
    pub first_sync: bool,
    pub changes: RemoteChanges,
    pub conflicts: Vec<(Conflict, Resolution)>,
    /// Paths scheduled for re-pull.
    pub stale: Vec<String>,
    /// Records removed because the remote agreed or the user discarded them.
    pub purged: Vec<String>,
}

impl ReconcileReport {
    /// The remote tree had not moved.
    pub fn is_unchanged(&self) -> bool {
        !self.first_sync && self.previous_tree_sha.as_deref() == Some(self.tree_sha.as_str())
    }
}

/// Automatic outcome for each record plus the conflicts left to decide.
#[derive(Debug, Default)]
pub struct Classification {
    pub updates: Vec<RecordUpdate>,
    pub conflicts: Vec<Conflict>,
}

fn conflict(record: &FileRecord, kind: ConflictKind, remote: Option<&BaselineEntry>) -> Conflict {
    Conflict {
        path: record.path.clone(),
        kind,
        local_state: record.dirty_state,
        remote_sha: remote.map(|e| e.sha.clone()),
    }
}

/// Classify every record against the remote index. Records are expected in
/// path order; the result keeps that order.
pub fn classify(records: &[FileRecord], remote: &BaselineIndex) -> Classification {
    use DirtyState::*;

    let mut out = Classification::default();
    for record in records {
        let path = record.path.clone();
        let entry = remote.get(&record.path);

        let Some(entry) = entry else {
            match record.dirty_state {
                DeletedLocally => out.updates.push(RecordUpdate::Purge(path)),
                CreatedLocally => {}
                // Nothing local to keep
                Clean | ChangedRemotely if record.content.is_none() => {
                    out.updates.push(RecordUpdate::Purge(path))
                }
                Clean | ModifiedLocally | ChangedRemotely => out
                    .conflicts
                    .push(conflict(record, ConflictKind::RemoteDelete, None)),
            }
            continue;
        };

        if record.origin_blob_sha.as_deref() == Some(entry.sha.as_str()) {
            continue;
        }

        let matches_remote = record
            .content
            .as_deref()
            .is_some_and(|c| blob_sha(c) == entry.sha);
        if matches_remote && record.dirty_state != DeletedLocally {
            out.updates.push(RecordUpdate::MarkClean {
                path,
                origin_sha: entry.sha.clone(),
            });
            continue;
        }

        match record.dirty_state {
            Clean => out.updates.push(RecordUpdate::MarkStale {
                path,
                drop_content: false,
            }),
            ChangedRemotely => {}
            ModifiedLocally | CreatedLocally | DeletedLocally => out
                .conflicts
                .push(conflict(record, ConflictKind::RemoteUpdate, Some(entry))),
        }
    }
    out
}

/// Record update that carries out a decision.
pub fn resolution_update(conflict: &Conflict, resolution: Resolution) -> RecordUpdate {
    let path = conflict.path.clone();
    match (conflict.kind, resolution) {
        (ConflictKind::RemoteDelete, Resolution::KeepLocal) => RecordUpdate::MarkCreated(path),
        (ConflictKind::RemoteDelete, Resolution::DiscardLocal) => RecordUpdate::Purge(path),
        (ConflictKind::RemoteUpdate, Resolution::KeepLocal) => RecordUpdate::AdoptOrigin {
            path,
            origin_sha: conflict.remote_sha.clone().unwrap_or_default(),
        },
        (ConflictKind::RemoteUpdate, Resolution::DiscardLocal) => RecordUpdate::MarkStale {
            path,
            drop_content: true,
        },
    }
}

/// Puts the phase back to `fallback` unless the pass finishes.
struct PhaseGuard<'a> {
    phase: &'a mut SyncPhase,
    fallback: SyncPhase,
    done: bool,
}

impl PhaseGuard<'_> {
    fn finish(&mut self, phase: SyncPhase) {
        *self.phase = phase;
        self.done = true;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            *self.phase = self.fallback;
        }
    }
}

/// Run one reconciliation pass for `repo` at `branch`.
///
/// The caller holds the repository's exclusive scope; `phase` is the
/// in-memory state machine guarded by it.
pub async fn reconcile(
    store: &ContentStore,
    remote: &dyn RemoteStore,
    resolver: &dyn ConflictResolver,
    repo: &RepoId,
    branch: &str,
    phase: &mut SyncPhase,
) -> Result<ReconcileReport> {
    let key = repo.to_string();
    let state = store
        .sync_state(&key)?
        .unwrap_or_else(|| RepositorySyncState::new(key.as_str()));

    let tree = remote.fetch_tree(repo, branch, Freshness::Fresh).await?;
    if tree.truncated {
        return Err(SyncError::Decode(format!(
            "tree listing of {} at {} was truncated",
            repo, branch
        )));
    }

    let previous = state.last_known_tree_sha.clone();
    if previous.as_deref() == Some(tree.sha.as_str()) {
        *phase = SyncPhase::Synced;
        return Ok(ReconcileReport {
            tree_sha: tree.sha,
            previous_tree_sha: previous,
            ..Default::default()
        });
    }

    let first_sync = !state.is_initialized();
    // Unwinds to Uninitialized/Diverged on error or when the future is dropped.
    let mut phase = PhaseGuard {
        fallback: if first_sync {
            SyncPhase::Uninitialized
        } else {
            SyncPhase::Diverged
        },
        phase,
        done: false,
    };
    *phase.phase = phase.fallback;
    debug!(repository = %repo, from = ?previous, to = %tree.sha, "Remote tree moved");

    let new_index = tree.blob_index();
    let old_index = store.baseline(&key)?;
    let records = store.list(&key)?;
    let Classification {
        mut updates,
        conflicts,
    } = classify(&records, &new_index);

    *phase.phase = SyncPhase::Reconciling;
    let mut decided = Vec::with_capacity(conflicts.len());
    for c in conflicts {
        let resolution = resolver.resolve(&c).await.inspect_err(|e| {
            warn!(repository = %repo, path = %c.path, error = %e, "Conflict left unresolved");
        })?;
        debug!(path = %c.path, kind = ?c.kind, ?resolution, "Conflict resolved");
        updates.push(resolution_update(&c, resolution));
        decided.push((c, resolution));
    }

    let next = state.advanced(&tree.sha, None);
    store.apply_reconciliation(&next, &updates, &new_index)?;
    phase.finish(SyncPhase::Synced);

    let stale = updates
        .iter()
        .filter(|u| matches!(u, RecordUpdate::MarkStale { .. }))
        .map(|u| u.path().to_string())
        .collect();
    let purged = updates
        .iter()
        .filter(|u| matches!(u, RecordUpdate::Purge(_)))
        .map(|u| u.path().to_string())
        .collect();
    let changes = if first_sync {
        RemoteChanges::default()
    } else {
        RemoteChanges::between(&old_index, &new_index)
    };

    info!(
        repository = %repo,
        tree = %tree.sha,
        changed = changes.len(),
        conflicts = decided.len(),
        "Reconciled"
    );
    Ok(ReconcileReport {
        tree_sha: tree.sha,
        previous_tree_sha: previous,
        first_sync,
        changes,
        conflicts: decided,
        stale,
        purged,
    })
}
