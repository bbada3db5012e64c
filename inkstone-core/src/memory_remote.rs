//! In-memory remote store
//!
//! A Git-exact stand-in for the hosted repository: blob, tree and commit
//! SHAs are computed the way Git computes them, branch refs fast-forward
//! only. Other clients are simulated with [`MemoryRemote::push_external`],
//! and individual protocol steps can be made to fail for tests.

use crate::error::{Result, SyncError};
use crate::object::{
    BaselineIndex, CommitOperation, CommitReceipt, RepoId, TreeSnapshot, apply_operations,
    blob_sha, build_tree, commit_sha,
};
use crate::remote::{Freshness, RemoteStore};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

const AUTHOR: &str = "InkStone <inkstone@localhost>";

/// A step of the remote protocol that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStep {
    FetchTree,
    FetchBlob,
    GetRef,
    GetCommit,
    CreateTree,
    CreateCommit,
    UpdateRef,
}

#[derive(Debug, Clone)]
struct StoredCommit {
    tree_sha: String,
    index: BaselineIndex,
}

#[derive(Debug, Default)]
struct RemoteRepo {
    branches: HashMap<String, String>,
    commits: HashMap<String, StoredCommit>,
    blobs: HashMap<String, String>,
}

impl RemoteRepo {
    fn head(&self, repo: &RepoId, branch: &str) -> Result<(&String, &StoredCommit)> {
        let head = self
            .branches
            .get(branch)
            .ok_or_else(|| SyncError::not_found(repo.to_string(), branch))?;
        let commit = self
            .commits
            .get(head)
            .ok_or_else(|| SyncError::Decode(format!("dangling ref {} -> {}", branch, head)))?;
        Ok((head, commit))
    }

    /// Create a commit on top of `parent` without moving any ref.
    fn create_commit(
        &mut self,
        parent: Option<&str>,
        operations: &[CommitOperation],
        message: &str,
        timestamp: i64,
    ) -> Result<CommitReceipt> {
        let mut index = match parent {
            Some(p) => self
                .commits
                .get(p)
                .map(|c| c.index.clone())
                .ok_or_else(|| SyncError::Decode(format!("unknown parent {}", p)))?,
            None => BaselineIndex::new(),
        };
        for op in operations {
            if let Some(content) = op.content() {
                self.blobs.insert(blob_sha(content), content.to_string());
            }
        }
        apply_operations(&mut index, operations);
        let tree = build_tree(&index)?;

        let parents: Vec<String> = parent.map(str::to_string).into_iter().collect();
        let sha = commit_sha(&tree.sha, &parents, AUTHOR, timestamp, message);
        self.commits.insert(
            sha.clone(),
            StoredCommit {
                tree_sha: tree.sha.clone(),
                index,
            },
        );
        Ok(CommitReceipt {
            commit_sha: sha,
            tree_sha: tree.sha,
            parent_sha: parent.unwrap_or_default().to_string(),
        })
    }
}

/// In-memory [`RemoteStore`].
pub struct MemoryRemote {
    repos: RwLock<HashMap<RepoId, RemoteRepo>>,
    /// Steps that fail on their next call
    failures: Mutex<Vec<RemoteStep>>,
    /// Operations other clients land right before upcoming ref updates
    races: Mutex<VecDeque<Vec<CommitOperation>>>,
    clock: AtomicI64,
    write_calls: AtomicUsize,
    tree_fetches: AtomicUsize,
    blob_fetches: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            repos: RwLock::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
            races: Mutex::new(VecDeque::new()),
            clock: AtomicI64::new(1_700_000_000),
            write_calls: AtomicUsize::new(0),
            tree_fetches: AtomicUsize::new(0),
            blob_fetches: AtomicUsize::new(0),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Create `branch` with a root commit holding `files`.
    pub async fn seed(&self, repo: &RepoId, branch: &str, files: &[(&str, &str)]) -> Result<CommitReceipt> {
        let ops: Vec<CommitOperation> = files
            .iter()
            .map(|(path, content)| CommitOperation::create(*path, *content))
            .collect();
        let timestamp = self.tick();
        let mut repos = self.repos.write().await;
        let state = repos.entry(repo.clone()).or_default();
        let receipt = state.create_commit(None, &ops, "Initial commit", timestamp)?;
        state
            .branches
            .insert(branch.to_string(), receipt.commit_sha.clone());
        Ok(receipt)
    }

    /// Land a commit as another client would.
    pub async fn push_external(
        &self,
        repo: &RepoId,
        branch: &str,
        operations: &[CommitOperation],
        message: &str,
    ) -> Result<CommitReceipt> {
        let timestamp = self.tick();
        let mut repos = self.repos.write().await;
        let state = repos
            .get_mut(repo)
            .ok_or_else(|| SyncError::not_found(repo.to_string(), branch))?;
        let parent = state.head(repo, branch)?.0.clone();
        let receipt = state.create_commit(Some(&parent), operations, message, timestamp)?;
        state
            .branches
            .insert(branch.to_string(), receipt.commit_sha.clone());
        Ok(receipt)
    }

    /// Make the next call of `step` fail with a transient error.
    pub async fn fail_next(&self, step: RemoteStep) {
        self.failures.lock().await.push(step);
    }

    /// Have another client push `operations` between commit creation and
    /// the ref update of a coming commit batch. Races queue up, one per batch.
    pub async fn race_next_commit(&self, operations: Vec<CommitOperation>) {
        self.races.lock().await.push_back(operations);
    }

    /// Head commit of `branch`.
    pub async fn head(&self, repo: &RepoId, branch: &str) -> Option<String> {
        let repos = self.repos.read().await;
        repos.get(repo)?.branches.get(branch).cloned()
    }

    /// Root tree SHA at the head of `branch`.
    pub async fn tree_sha(&self, repo: &RepoId, branch: &str) -> Option<String> {
        let repos = self.repos.read().await;
        let state = repos.get(repo)?;
        state.head(repo, branch).ok().map(|(_, c)| c.tree_sha.clone())
    }

    /// Content of `path` at the head of `branch`.
    pub async fn file(&self, repo: &RepoId, branch: &str, path: &str) -> Option<String> {
        let repos = self.repos.read().await;
        let state = repos.get(repo)?;
        let (_, commit) = state.head(repo, branch).ok()?;
        let entry = commit.index.get(path)?;
        state.blobs.get(&entry.sha).cloned()
    }

    /// Number of tree, commit and ref writes performed through [`RemoteStore`].
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn tree_fetches(&self) -> usize {
        self.tree_fetches.load(Ordering::SeqCst)
    }

    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    async fn check(&self, step: RemoteStep) -> Result<()> {
        let mut failures = self.failures.lock().await;
        if let Some(pos) = failures.iter().position(|s| *s == step) {
            failures.remove(pos);
            return Err(SyncError::TransientNetwork(format!("injected failure at {:?}", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_tree(&self, repo: &RepoId, reference: &str, _freshness: Freshness) -> Result<TreeSnapshot> {
        self.check(RemoteStep::FetchTree).await?;
        self.tree_fetches.fetch_add(1, Ordering::SeqCst);
        let repos = self.repos.read().await;
        let state = repos
            .get(repo)
            .ok_or_else(|| SyncError::not_found(repo.to_string(), reference))?;
        let (_, commit) = state.head(repo, reference)?;
        build_tree(&commit.index)
    }

    async fn fetch_blob(&self, repo: &RepoId, path: &str, reference: &str) -> Result<String> {
        self.check(RemoteStep::FetchBlob).await?;
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let repos = self.repos.read().await;
        let state = repos
            .get(repo)
            .ok_or_else(|| SyncError::not_found(path, reference))?;
        let (_, commit) = state.head(repo, reference)?;
        commit
            .index
            .get(path)
            .and_then(|entry| state.blobs.get(&entry.sha))
            .cloned()
            .ok_or_else(|| SyncError::not_found(path, reference))
    }

    async fn commit_batch(
        &self,
        repo: &RepoId,
        reference: &str,
        operations: &[CommitOperation],
        message: &str,
        expected_base_tree: Option<&str>,
    ) -> Result<CommitReceipt> {
        // (1) resolve the ref, (2) read the parent tree
        self.check(RemoteStep::GetRef).await?;
        let parent = {
            let repos = self.repos.read().await;
            let state = repos
                .get(repo)
                .ok_or_else(|| SyncError::not_found(repo.to_string(), reference))?;
            state.head(repo, reference)?.0.clone()
        };
        self.check(RemoteStep::GetCommit).await?;
        let base_tree = {
            let repos = self.repos.read().await;
            repos
                .get(repo)
                .and_then(|s| s.commits.get(&parent))
                .map(|c| c.tree_sha.clone())
                .unwrap_or_default()
        };
        if let Some(expected) = expected_base_tree {
            if expected != base_tree {
                return Err(SyncError::Conflict(format!(
                    "{} moved: base tree {} is not {}",
                    reference, base_tree, expected
                )));
            }
        }

        // (3) tree and (4) commit
        self.check(RemoteStep::CreateTree).await?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check(RemoteStep::CreateCommit).await?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let timestamp = self.tick();
        let receipt = {
            let mut repos = self.repos.write().await;
            let state = repos.entry(repo.clone()).or_default();
            state.create_commit(Some(&parent), operations, message, timestamp)?
        };

        let racing = self.races.lock().await.pop_front();
        if let Some(racing) = racing {
            self.push_external(repo, reference, &racing, "Concurrent change").await?;
        }

        // (5) fast-forward only
        self.check(RemoteStep::UpdateRef).await?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut repos = self.repos.write().await;
        let state = repos.entry(repo.clone()).or_default();
        let current = state.branches.get(reference).cloned().unwrap_or_default();
        if current != parent {
            return Err(SyncError::Conflict(format!(
                "update of {} is not a fast forward",
                reference
            )));
        }
        state
            .branches
            .insert(reference.to_string(), receipt.commit_sha.clone());
        debug!(repository = %repo, commit = %receipt.commit_sha, ops = operations.len(), "Committed batch");
        Ok(receipt)
    }
}
