//! Per-repository editing sessions
//!
//! A [`RepoSession`] is the entry point for one repository on one branch.
//! Plain reads and writes share its scope; reconciliation and commit take
//! it exclusively. An [`Engine`] hands out one session per repository so
//! every caller goes through the same scope.

use crate::error::{Result, SyncError};
use crate::file_tree::{TreeNode, build_file_tree};
use crate::object::{BaselineIndex, CommitOperation, RepoId, blob_sha, normalize_path};
use crate::planner::{CommitOutcome, plan, plan_and_commit};
use crate::reconcile::{ConflictResolver, ReconcileReport, reconcile};
use crate::remote::{Freshness, RemoteStore};
use crate::store::{ContentStore, DirtyState, FileRecord};
use crate::sync_state::SyncPhase;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One row of a file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// `None` for remote files that are not cached locally
    pub state: Option<DirtyState>,
    pub sha: Option<String>,
    pub size: Option<u64>,
}

/// Snapshot of a session for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub repository: String,
    pub branch: String,
    pub phase: SyncPhase,
    pub last_known_tree_sha: Option<String>,
    pub last_commit_sha: Option<String>,
    pub last_sync_timestamp: i64,
    pub pending: Vec<CommitOperation>,
    pub stale: Vec<String>,
}

struct CachedListing {
    fetched: Instant,
    index: BaselineIndex,
}

pub struct RepoSession {
    store: Arc<ContentStore>,
    remote: Arc<dyn RemoteStore>,
    resolver: Arc<dyn ConflictResolver>,
    repo: RepoId,
    key: String,
    branch: String,
    scope: RwLock<SyncPhase>,
    listing: Mutex<Option<CachedListing>>,
    listing_ttl: Duration,
}

impl RepoSession {
    pub fn new(
        store: Arc<ContentStore>,
        remote: Arc<dyn RemoteStore>,
        resolver: Arc<dyn ConflictResolver>,
        repo: RepoId,
        branch: impl Into<String>,
    ) -> Result<Self> {
        let key = repo.to_string();
        let phase = SyncPhase::from_state(store.sync_state(&key)?.as_ref());
        Ok(Self {
            store,
            remote,
            resolver,
            repo,
            key,
            branch: branch.into(),
            scope: RwLock::new(phase),
            listing: Mutex::new(None),
            listing_ttl: Duration::from_secs(120),
        })
    }

    /// Lifetime of the browsing listing cache.
    pub fn with_listing_ttl(mut self, ttl: Duration) -> Self {
        self.listing_ttl = ttl;
        self
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub async fn phase(&self) -> SyncPhase {
        *self.scope.read().await
    }

    // ==================== Files ====================

    /// Content of `path`, pulled from the remote when not cached or stale.
    pub async fn open_file(&self, path: &str) -> Result<String> {
        let path = normalize_path(path)?;
        let _scope = self.scope.read().await;

        match self.record(&path)? {
            Some(r) if r.is_deleted() => Err(SyncError::not_found(path, &self.branch)),
            Some(FileRecord {
                content: Some(content),
                dirty_state,
                ..
            }) if dirty_state != DirtyState::ChangedRemotely => Ok(content),
            _ => self.pull(&path).await,
        }
    }

    /// Store a local edit. The file need not exist yet.
    pub async fn save_file(&self, path: &str, content: &str) -> Result<FileRecord> {
        let path = normalize_path(path)?;
        let _scope = self.scope.read().await;
        self.track_baseline(&path)?;
        self.store.write(&path, &self.key, content)
    }

    /// Create a new file; fails if the path already exists.
    pub async fn create_file(&self, path: &str, content: &str) -> Result<FileRecord> {
        let path = normalize_path(path)?;
        let _scope = self.scope.read().await;

        let taken = match self.record(&path)? {
            Some(r) => !r.is_deleted(),
            None => self.store.baseline_sha(&self.key, &path)?.is_some(),
        };
        if taken {
            return Err(SyncError::AlreadyExists(path));
        }
        self.store.write(&path, &self.key, content)
    }

    /// Tombstone `path`. Files never committed are dropped at once.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let _scope = self.scope.read().await;

        self.track_baseline(&path)?;
        match self.record(&path)? {
            Some(r) if !r.is_deleted() => {
                self.store.mark_deleted(&path, &self.key)?;
                debug!(repository = %self.repo, path = %path, "Deleted file");
                Ok(())
            }
            _ => Err(SyncError::not_found(path, &self.branch)),
        }
    }

    /// Undo a delete that has not been committed.
    pub async fn restore_file(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let _scope = self.scope.read().await;
        if self.store.unmark_deleted(&path, &self.key)? {
            Ok(())
        } else {
            Err(SyncError::not_found(path, &self.branch))
        }
    }

    /// Remote listing merged with local records, sorted by path.
    ///
    /// The remote listing is cached for a while and replaced by the
    /// persisted baseline when the remote is unreachable.
    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let _scope = self.scope.read().await;
        let index = self.listing_index().await?;

        let mut entries: BTreeMap<String, FileEntry> = index
            .into_iter()
            .map(|(path, e)| {
                let entry = FileEntry {
                    path: path.clone(),
                    state: None,
                    sha: Some(e.sha),
                    size: e.size,
                };
                (path, entry)
            })
            .collect();

        for record in self.store.list(&self.key)? {
            let entry = entries
                .entry(record.path.clone())
                .or_insert_with(|| FileEntry {
                    path: record.path.clone(),
                    state: None,
                    sha: record.origin_blob_sha.clone(),
                    size: None,
                });
            entry.state = Some(record.dirty_state);
            if let Some(content) = &record.content {
                entry.size = Some(content.len() as u64);
            }
        }
        Ok(entries.into_values().collect())
    }

    /// Browser tree of the live (non-deleted) files.
    pub async fn file_tree(&self) -> Result<Vec<TreeNode>> {
        let files = self.list_files().await?;
        Ok(build_file_tree(
            files
                .iter()
                .filter(|f| f.state != Some(DirtyState::DeletedLocally))
                .map(|f| f.path.as_str()),
        ))
    }

    pub async fn list_deleted(&self) -> Result<Vec<FileRecord>> {
        let _scope = self.scope.read().await;
        self.store.list_deleted(&self.key)
    }

    /// Operations the next commit would push. No network.
    pub async fn get_diff_summary(&self) -> Result<Vec<CommitOperation>> {
        let _scope = self.scope.read().await;
        Ok(plan(&self.store.list_dirty(&self.key)?))
    }

    // ==================== Sync ====================

    /// Reconcile with the remote branch.
    pub async fn sync(&self) -> Result<ReconcileReport> {
        let mut phase = self.scope.write().await;
        let report = reconcile(
            &self.store,
            self.remote.as_ref(),
            self.resolver.as_ref(),
            &self.repo,
            &self.branch,
            &mut phase,
        )
        .await?;
        self.invalidate_listing();
        Ok(report)
    }

    /// Pull every record flagged as changed remotely. Returns their paths.
    pub async fn refresh_stale(&self) -> Result<Vec<String>> {
        let _scope = self.scope.read().await;
        let stale: Vec<String> = self
            .store
            .list_dirty(&self.key)?
            .into_iter()
            .filter(|r| r.dirty_state == DirtyState::ChangedRemotely)
            .map(|r| r.path)
            .collect();

        futures::future::try_join_all(stale.iter().map(|p| self.pull(p))).await?;
        if !stale.is_empty() {
            info!(repository = %self.repo, count = stale.len(), "Refreshed stale files");
        }
        Ok(stale)
    }

    /// Commit every local change as one commit on the branch.
    pub async fn commit(&self, message: &str) -> Result<Option<CommitOutcome>> {
        let mut phase = self.scope.write().await;
        let outcome = plan_and_commit(
            &self.store,
            self.remote.as_ref(),
            self.resolver.as_ref(),
            &self.repo,
            &self.branch,
            message,
            &mut phase,
        )
        .await?;
        self.invalidate_listing();
        Ok(outcome)
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        let phase = self.scope.read().await;
        let state = self.store.sync_state(&self.key)?;
        let dirty = self.store.list_dirty(&self.key)?;
        let stale = dirty
            .iter()
            .filter(|r| r.dirty_state == DirtyState::ChangedRemotely)
            .map(|r| r.path.clone())
            .collect();

        Ok(SessionStatus {
            repository: self.key.clone(),
            branch: self.branch.clone(),
            phase: *phase,
            last_known_tree_sha: state.as_ref().and_then(|s| s.last_known_tree_sha.clone()),
            last_commit_sha: state.as_ref().and_then(|s| s.last_commit_sha.clone()),
            last_sync_timestamp: state.map(|s| s.last_sync_timestamp).unwrap_or_default(),
            pending: plan(&dirty),
            stale,
        })
    }

    // ==================== Internals ====================

    /// Record for `path`; an undecodable row is quarantined and re-read.
    fn record(&self, path: &str) -> Result<Option<FileRecord>> {
        match self.store.get(path, &self.key) {
            Err(SyncError::LocalStoreCorruption { reason, .. }) => {
                warn!(repository = %self.repo, path, %reason, "Corrupt record flagged for re-pull");
                self.store.get(path, &self.key)
            }
            other => other,
        }
    }

    /// Give a baseline file a record before it is edited or deleted.
    fn track_baseline(&self, path: &str) -> Result<()> {
        if let Some(sha) = self.store.baseline_sha(&self.key, path)? {
            self.store.track_remote(path, &self.key, &sha)?;
        }
        Ok(())
    }

    async fn pull(&self, path: &str) -> Result<String> {
        let content = self.remote.fetch_blob(&self.repo, path, &self.branch).await?;
        let sha = blob_sha(&content);
        if let Some(expected) = self.store.baseline_sha(&self.key, path)? {
            if expected != sha {
                debug!(path, %expected, actual = %sha, "Remote blob is newer than baseline");
            }
        }

        // A local edit that landed while the blob was in flight wins.
        match self.record(path)? {
            Some(r) if r.is_deleted() => Err(SyncError::not_found(path, &self.branch)),
            Some(FileRecord {
                content: Some(local),
                dirty_state: DirtyState::CreatedLocally | DirtyState::ModifiedLocally,
                ..
            }) => Ok(local),
            _ => {
                self.store.cache_remote(path, &self.key, &content, &sha)?;
                Ok(content)
            }
        }
    }

    fn cached_listing(&self) -> Option<BaselineIndex> {
        let guard = self.listing.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|l| l.fetched.elapsed() < self.listing_ttl)
            .map(|l| l.index.clone())
    }

    fn invalidate_listing(&self) {
        *self.listing.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn listing_index(&self) -> Result<BaselineIndex> {
        if let Some(index) = self.cached_listing() {
            return Ok(index);
        }
        match self
            .remote
            .fetch_tree(&self.repo, &self.branch, Freshness::MayBeCached)
            .await
        {
            Ok(tree) => {
                let index = tree.blob_index();
                *self.listing.lock().unwrap_or_else(PoisonError::into_inner) = Some(CachedListing {
                    fetched: Instant::now(),
                    index: index.clone(),
                });
                Ok(index)
            }
            Err(e) if e.is_retryable() => {
                warn!(repository = %self.repo, error = %e, "Remote unreachable, listing baseline");
                self.store.baseline(&self.key)
            }
            Err(e) => Err(e),
        }
    }
}

/// Shared store, remote and resolver with one session per repository.
pub struct Engine {
    store: Arc<ContentStore>,
    remote: Arc<dyn RemoteStore>,
    resolver: Arc<dyn ConflictResolver>,
    listing_ttl: Duration,
    sessions: Mutex<HashMap<RepoId, Arc<RepoSession>>>,
}

impl Engine {
    pub fn new(
        store: Arc<ContentStore>,
        remote: Arc<dyn RemoteStore>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        Self {
            store,
            remote,
            resolver,
            listing_ttl: Duration::from_secs(120),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_listing_ttl(mut self, ttl: Duration) -> Self {
        self.listing_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Session for `repo`. A repository is tracked on a single branch.
    pub fn session(&self, repo: &RepoId, branch: &str) -> Result<Arc<RepoSession>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(repo) {
            if existing.branch() != branch {
                return Err(SyncError::InvalidPath(format!(
                    "{} is already open on branch {}",
                    repo,
                    existing.branch()
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let session = Arc::new(
            RepoSession::new(
                Arc::clone(&self.store),
                Arc::clone(&self.remote),
                Arc::clone(&self.resolver),
                repo.clone(),
                branch,
            )?
            .with_listing_ttl(self.listing_ttl),
        );
        sessions.insert(repo.clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Repositories with cached data.
    pub fn repositories(&self) -> Result<Vec<String>> {
        self.store.repositories()
    }

    /// Forget everything cached for `repo`, uncommitted edits included.
    pub async fn clear_repository(&self, repo: &RepoId) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(repo);
        match session {
            Some(session) => {
                let mut phase = session.scope.write().await;
                self.store.clear_repository(&repo.to_string())?;
                *phase = SyncPhase::Uninitialized;
                session.invalidate_listing();
            }
            None => self.store.clear_repository(&repo.to_string())?,
        }
        info!(repository = %repo, "Cleared local cache");
        Ok(())
    }
}
