//! Remote tree port
//!
//! The engine talks to the hosted Git store only through [`RemoteStore`].
//! Implementations classify their failures into [`SyncError`] variants; the
//! engine propagates them unchanged except for `Conflict` at commit time.
//!
//! [`SyncError`]: crate::error::SyncError

use crate::error::Result;
use crate::object::{CommitOperation, CommitReceipt, RepoId, TreeSnapshot};
use async_trait::async_trait;

/// Whether a read may be answered from an intermediate cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Good enough for browsing.
    MayBeCached,
    /// Feeds a reconcile or commit decision; must bypass every cache.
    Fresh,
}

/// Access to the remote repository's trees, blobs and branch refs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Root tree SHA and recursive listing of `reference`.
    async fn fetch_tree(&self, repo: &RepoId, reference: &str, freshness: Freshness)
    -> Result<TreeSnapshot>;

    /// UTF-8 content of one blob path at `reference`.
    ///
    /// Fails with `NotFound` unless the path resolves to a single blob.
    async fn fetch_blob(&self, repo: &RepoId, path: &str, reference: &str) -> Result<String>;

    /// Turn `operations` into one commit on `reference` and fast-forward it.
    ///
    /// When `expected_base_tree` is given and the parent commit's tree differs,
    /// nothing is written and `Conflict` is returned. A ref that moves between
    /// reading the parent and updating it also yields `Conflict`.
    async fn commit_batch(
        &self,
        repo: &RepoId,
        reference: &str,
        operations: &[CommitOperation],
        message: &str,
        expected_base_tree: Option<&str>,
    ) -> Result<CommitReceipt>;
}
