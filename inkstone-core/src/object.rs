//! Core object model for InkStone
//!
//! Git-compatible object identifiers (SHA-1 over `<kind> <len>\0<payload>`),
//! the remote tree listing types, and the commit operations the planner
//! hands to a remote store.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Regular file mode as it appears in Git trees
pub const FILE_MODE: &str = "100644";

/// Directory mode as it appears in Git trees
pub const TREE_MODE: &str = "40000";

/// Git object identifier (SHA-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Hash a payload with the Git object header for `kind`
    pub fn hash_object(kind: ObjectKind, payload: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", kind.as_str(), payload.len()).as_bytes());
        hasher.update(payload);
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

/// Blob SHA of a text file, hex encoded.
pub fn blob_sha(content: &str) -> String {
    ObjectId::hash_object(ObjectKind::Blob, content.as_bytes()).to_hex()
}

/// Normalize a repository-relative path.
///
/// Leading slashes are dropped; empty, `.` and `..` segments are rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') || trimmed.contains('\0') {
        return Err(SyncError::InvalidPath(path.to_string()));
    }
    if trimmed
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(SyncError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

// ─────────────────────────────────────────────────────
// Repository identity
// ─────────────────────────────────────────────────────

/// `owner/name` of a remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(SyncError::InvalidPath(format!(
                "repository must be owner/name, got {:?}",
                s
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────
// Remote tree listing
// ─────────────────────────────────────────────────────

/// One entry of a recursive tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTreeEntry {
    pub path: String,
    pub sha: String,
    pub mode: String,
    pub kind: ObjectKind,
    /// Byte size; only reported for blobs
    pub size: Option<u64>,
}

/// Result of one recursive tree fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
    /// Root tree SHA
    pub sha: String,
    pub entries: Vec<RemoteTreeEntry>,
    /// The remote cut the listing short
    pub truncated: bool,
}

impl TreeSnapshot {
    /// Map of blob paths to their entries (directories excluded).
    pub fn blob_index(&self) -> BTreeMap<String, BaselineEntry> {
        self.entries
            .iter()
            .filter(|e| e.kind == ObjectKind::Blob)
            .map(|e| {
                (
                    e.path.clone(),
                    BaselineEntry {
                        sha: e.sha.clone(),
                        mode: e.mode.clone(),
                        size: e.size,
                    },
                )
            })
            .collect()
    }
}

/// Persisted per-path slice of the last reconciled tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub sha: String,
    pub mode: String,
    pub size: Option<u64>,
}

/// Path → entry map of a tree, blobs only.
pub type BaselineIndex = BTreeMap<String, BaselineEntry>;

/// Root tree SHA and full recursive listing for a flat blob index, computed
/// exactly as Git would for the nested directory structure.
pub fn build_tree(index: &BaselineIndex) -> Result<TreeSnapshot> {
    #[derive(Default)]
    struct Dir {
        dirs: BTreeMap<String, Dir>,
        files: BTreeMap<String, (String, String)>,
    }

    fn hash_dir(dir: &Dir, prefix: &str, out: &mut Vec<RemoteTreeEntry>) -> Result<ObjectId> {
        // Git orders a directory named `a` as if it were `a/`.
        let mut items: Vec<(String, &str, ObjectId)> = Vec::new();
        for (name, sub) in &dir.dirs {
            let path = join(prefix, name);
            let id = hash_dir(sub, &path, out)?;
            out.push(RemoteTreeEntry {
                path,
                sha: id.to_hex(),
                mode: TREE_MODE.to_string(),
                kind: ObjectKind::Tree,
                size: None,
            });
            items.push((format!("{}/", name), TREE_MODE, id));
        }
        for (name, (mode, sha)) in &dir.files {
            let id = ObjectId::from_hex(sha)
                .map_err(|e| SyncError::Decode(format!("blob sha {:?}: {}", sha, e)))?;
            items.push((name.clone(), mode.as_str(), id));
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));

        let mut payload = Vec::new();
        for (key, mode, id) in &items {
            let name = key.trim_end_matches('/');
            payload.extend_from_slice(mode.as_bytes());
            payload.push(b' ');
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(id.as_bytes());
        }
        Ok(ObjectId::hash_object(ObjectKind::Tree, &payload))
    }

    fn join(prefix: &str, name: &str) -> String {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    let mut root = Dir::default();
    for (path, entry) in index {
        let mut parts: Vec<&str> = path.split('/').collect();
        let file = parts.pop().unwrap_or_default();
        let mut dir = &mut root;
        for part in parts {
            dir = dir.dirs.entry(part.to_string()).or_default();
        }
        dir.files
            .insert(file.to_string(), (entry.mode.clone(), entry.sha.clone()));
    }

    let mut entries = Vec::new();
    let root_id = hash_dir(&root, "", &mut entries)?;
    for (path, entry) in index {
        entries.push(RemoteTreeEntry {
            path: path.clone(),
            sha: entry.sha.clone(),
            mode: entry.mode.clone(),
            kind: ObjectKind::Blob,
            size: entry.size,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(TreeSnapshot {
        sha: root_id.to_hex(),
        entries,
        truncated: false,
    })
}

/// Commit object SHA for a single-parent (or root) commit.
pub fn commit_sha(tree: &str, parents: &[String], author: &str, timestamp: i64, message: &str) -> String {
    let mut body = format!("tree {}\n", tree);
    for parent in parents {
        body.push_str(&format!("parent {}\n", parent));
    }
    body.push_str(&format!("author {} {} +0000\n", author, timestamp));
    body.push_str(&format!("committer {} {} +0000\n\n", author, timestamp));
    body.push_str(message);
    body.push('\n');
    ObjectId::hash_object(ObjectKind::Commit, body.as_bytes()).to_hex()
}

// ─────────────────────────────────────────────────────
// Commit operations
// ─────────────────────────────────────────────────────

/// What a commit does to one path. Content travels with create/update only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "content", rename_all = "lowercase")]
pub enum CommitAction {
    Create(String),
    Update(String),
    Delete,
}

/// One entry of a commit batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOperation {
    pub path: String,
    #[serde(flatten)]
    pub action: CommitAction,
    /// Git file mode the blob is written with
    #[serde(default = "default_file_mode")]
    pub mode: String,
}

fn default_file_mode() -> String {
    FILE_MODE.to_string()
}

impl CommitOperation {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: CommitAction::Create(content.into()),
            mode: default_file_mode(),
        }
    }

    pub fn update(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: CommitAction::Update(content.into()),
            mode: default_file_mode(),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: CommitAction::Delete,
            mode: default_file_mode(),
        }
    }

    /// Same operation with another file mode (e.g. `100755`).
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Inline content; `None` exactly for deletions.
    pub fn content(&self) -> Option<&str> {
        match &self.action {
            CommitAction::Create(c) | CommitAction::Update(c) => Some(c),
            CommitAction::Delete => None,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self.action {
            CommitAction::Create(_) => "create",
            CommitAction::Update(_) => "update",
            CommitAction::Delete => "delete",
        }
    }
}

/// Outcome of a successful commit batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub commit_sha: String,
    pub tree_sha: String,
    pub parent_sha: String,
}

/// Apply committed operations to a baseline index.
pub fn apply_operations(index: &mut BaselineIndex, operations: &[CommitOperation]) {
    for op in operations {
        match &op.action {
            CommitAction::Create(content) | CommitAction::Update(content) => {
                index.insert(
                    op.path.clone(),
                    BaselineEntry {
                        sha: blob_sha(content),
                        mode: op.mode.clone(),
                        size: Some(content.len() as u64),
                    },
                );
            }
            CommitAction::Delete => {
                index.remove(&op.path);
            }
        }
    }
}
