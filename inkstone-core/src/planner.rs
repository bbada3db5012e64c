//! Commit planning
//!
//! Turns dirty records into a commit batch and drives it through the remote
//! after a fresh reconciliation.

use crate::error::{Result, SyncError};
use crate::object::{BaselineIndex, CommitOperation, CommitReceipt, RepoId, apply_operations};
use crate::reconcile::{ConflictResolver, ReconcileReport, reconcile};
use crate::remote::RemoteStore;
use crate::store::{ContentStore, DirtyState, FileRecord};
use crate::sync_state::{RepositorySyncState, SyncPhase};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Operations that would push the given records, sorted by path.
pub fn plan(records: &[FileRecord]) -> Vec<CommitOperation> {
    let mut ops: Vec<CommitOperation> = records
        .iter()
        .filter_map(|r| match (r.dirty_state, &r.content) {
            (DirtyState::CreatedLocally, Some(c)) => Some(CommitOperation::create(&r.path, c.as_str())),
            (DirtyState::ModifiedLocally, Some(c)) => Some(CommitOperation::update(&r.path, c.as_str())),
            (DirtyState::DeletedLocally, _) => Some(CommitOperation::delete(&r.path)),
            (DirtyState::CreatedLocally | DirtyState::ModifiedLocally, None) => {
                warn!(path = %r.path, "Dirty record without content skipped");
                None
            }
            (DirtyState::Clean | DirtyState::ChangedRemotely, _) => None,
        })
        .collect();
    ops.sort_by(|a, b| a.path.cmp(&b.path));
    ops
}

/// Give each operation the mode its path has in the baseline.
///
/// New paths keep the default regular-file mode.
pub fn carry_modes(operations: &mut [CommitOperation], baseline: &BaselineIndex) {
    for op in operations.iter_mut() {
        if let Some(entry) = baseline.get(&op.path) {
            op.mode = entry.mode.clone();
        }
    }
}

/// A commit that landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub receipt: CommitReceipt,
    pub operations: Vec<CommitOperation>,
    /// Reconciliation passes run before the commit landed (two after a ref conflict).
    pub reconciliations: Vec<ReconcileReport>,
}

impl CommitOutcome {
    pub fn retried(&self) -> bool {
        self.reconciliations.len() > 1
    }
}

/// Reconcile, plan and commit. Returns `None` when there is nothing to push.
///
/// A ref conflict triggers exactly one re-reconciliation and retry; a second
/// conflict is returned to the caller.
#[allow(clippy::too_many_arguments)]
pub async fn plan_and_commit(
    store: &ContentStore,
    remote: &dyn RemoteStore,
    resolver: &dyn ConflictResolver,
    repo: &RepoId,
    branch: &str,
    message: &str,
    phase: &mut SyncPhase,
) -> Result<Option<CommitOutcome>> {
    let key = repo.to_string();
    let mut reconciliations = Vec::new();

    loop {
        let report = reconcile(store, remote, resolver, repo, branch, phase).await?;
        let base_tree = report.tree_sha.clone();
        reconciliations.push(report);

        let mut operations = plan(&store.list_dirty(&key)?);
        if operations.is_empty() {
            info!(repository = %repo, "Nothing to commit");
            return Ok(None);
        }
        let mut baseline = store.baseline(&key)?;
        carry_modes(&mut operations, &baseline);

        match remote
            .commit_batch(repo, branch, &operations, message, Some(&base_tree))
            .await
        {
            Ok(receipt) => {
                apply_operations(&mut baseline, &operations);
                let state = store
                    .sync_state(&key)?
                    .unwrap_or_else(|| RepositorySyncState::new(key.as_str()))
                    .advanced(&receipt.tree_sha, Some(&receipt.commit_sha));
                store.apply_commit(&state, &operations, &baseline)?;
                *phase = SyncPhase::Synced;

                info!(
                    repository = %repo,
                    commit = %receipt.commit_sha,
                    ops = operations.len(),
                    "Committed"
                );
                return Ok(Some(CommitOutcome {
                    receipt,
                    operations,
                    reconciliations,
                }));
            }
            Err(SyncError::Conflict(reason)) if reconciliations.len() == 1 => {
                warn!(repository = %repo, %reason, "Branch moved during commit, reconciling again");
                *phase = SyncPhase::Diverged;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::CommitAction;

    fn record(path: &str, state: DirtyState, content: Option<&str>) -> FileRecord {
        FileRecord {
            path: path.into(),
            repository: "alice/notes".into(),
            content: content.map(str::to_string),
            origin_blob_sha: None,
            dirty_state: state,
            deleted_from: None,
            updated_at: 0,
        }
    }

    #[test]
    fn test_plan_maps_states() {
        let records = vec![
            record("z.md", DirtyState::CreatedLocally, Some("")),
            record("a.md", DirtyState::ModifiedLocally, Some("edit")),
            record("m.md", DirtyState::DeletedLocally, Some("old")),
            record("s.md", DirtyState::ChangedRemotely, Some("stale")),
            record("c.md", DirtyState::Clean, Some("same")),
        ];
        let ops = plan(&records);
        assert_eq!(
            ops,
            vec![
                CommitOperation::update("a.md", "edit"),
                CommitOperation::delete("m.md"),
                CommitOperation::create("z.md", ""),
            ]
        );
        assert_eq!(ops[1].action, CommitAction::Delete);
        assert!(ops[1].content().is_none());
        assert_eq!(ops[2].content(), Some(""));
    }

    #[test]
    fn test_carry_modes() {
        let mut baseline = BaselineIndex::new();
        baseline.insert(
            "run.sh".into(),
            crate::object::BaselineEntry {
                sha: "s".into(),
                mode: "100755".into(),
                size: None,
            },
        );
        let mut ops = vec![
            CommitOperation::update("run.sh", "echo"),
            CommitOperation::create("new.md", ""),
        ];
        carry_modes(&mut ops, &baseline);
        assert_eq!(ops[0].mode, "100755");
        assert_eq!(ops[1].mode, crate::object::FILE_MODE);
    }

    #[test]
    fn test_plan_empty() {
        assert!(plan(&[]).is_empty());
        assert!(plan(&[record("c.md", DirtyState::Clean, Some("x"))]).is_empty());
    }
}
