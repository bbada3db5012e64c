//! Per-repository synchronization state.
//!
//! `RepositorySyncState` is the persisted half (baseline tree SHA, last sync
//! time); `SyncPhase` is the in-memory state machine a session walks through
//! while it checks the remote and reconciles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Synchronization state persisted per repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySyncState {
    /// `owner/name` key.
    pub repository: String,
    /// Root tree SHA every cached record has been cross-checked against.
    pub last_known_tree_sha: Option<String>,
    /// Branch head at the time the tree SHA was adopted; `None` when the
    /// tree came from a listing that does not name its commit.
    pub last_commit_sha: Option<String>,
    /// Timestamp of the last successful advance (Unix seconds).
    pub last_sync_timestamp: i64,
}

impl RepositorySyncState {
    /// State for a repository that has never been synced.
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            last_known_tree_sha: None,
            last_commit_sha: None,
            last_sync_timestamp: 0,
        }
    }

    /// Copy of this state advanced to a reconciled or committed tree.
    pub fn advanced(&self, tree_sha: &str, commit_sha: Option<&str>) -> Self {
        Self {
            repository: self.repository.clone(),
            last_known_tree_sha: Some(tree_sha.to_string()),
            last_commit_sha: commit_sha.map(str::to_string),
            last_sync_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.last_known_tree_sha.is_some()
    }
}

/// Where a repository stands relative to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// No baseline tree has been adopted yet.
    Uninitialized,
    /// The baseline matches the last observed remote tree.
    Synced,
    /// The remote tree moved since the baseline was adopted.
    Diverged,
    /// A reconciliation pass is deciding the outcome for each path.
    Reconciling,
}

impl SyncPhase {
    /// Initial phase for a persisted state.
    pub fn from_state(state: Option<&RepositorySyncState>) -> Self {
        match state {
            Some(s) if s.is_initialized() => SyncPhase::Synced,
            _ => SyncPhase::Uninitialized,
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Uninitialized => "uninitialized",
            SyncPhase::Synced => "synced",
            SyncPhase::Diverged => "diverged",
            SyncPhase::Reconciling => "reconciling",
        };
        f.write_str(s)
    }
}
