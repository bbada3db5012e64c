//! GitHub REST payloads
//!
//! Only the fields the engine reads are modelled; everything else in the
//! responses is ignored.

use inkstone_core::object::{ObjectKind, RemoteTreeEntry, TreeSnapshot};
use inkstone_core::{CommitAction, CommitOperation};
use serde::{Deserialize, Serialize};

/// `GET /repos/{owner}/{repo}/git/trees/{ref}?recursive=1`
#[derive(Debug, Clone, Deserialize)]
pub struct TreeResponse {
    pub sha: String,
    #[serde(default)]
    pub truncated: bool,
    pub tree: Vec<TreeItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeItem {
    pub path: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
    pub size: Option<u64>,
}

impl TreeResponse {
    /// Blobs and directories; submodule entries are dropped.
    pub fn into_snapshot(self) -> TreeSnapshot {
        let entries = self
            .tree
            .into_iter()
            .filter_map(|item| {
                let kind = match item.kind.as_str() {
                    "blob" => ObjectKind::Blob,
                    "tree" => ObjectKind::Tree,
                    _ => return None,
                };
                Some(RemoteTreeEntry {
                    path: item.path,
                    sha: item.sha,
                    mode: item.mode,
                    kind,
                    size: item.size,
                })
            })
            .collect();
        TreeSnapshot {
            sha: self.sha,
            entries,
            truncated: self.truncated,
        }
    }
}

/// `GET /repos/{owner}/{repo}/contents/{path}` for a single file.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// `GET /repos/{owner}/{repo}/git/blobs/{sha}`
#[derive(Debug, Clone, Deserialize)]
pub struct BlobResponse {
    pub sha: String,
    pub encoding: String,
    pub content: String,
}

/// `GET /repos/{owner}/{repo}/git/ref/heads/{branch}`
#[derive(Debug, Clone, Deserialize)]
pub struct RefResponse {
    pub object: ShaRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShaRef {
    pub sha: String,
}

/// `GET /repos/{owner}/{repo}/git/commits/{sha}` and the create-commit reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitResponse {
    pub sha: String,
    pub tree: ShaRef,
}

/// Body of `POST /repos/{owner}/{repo}/git/trees`
#[derive(Debug, Clone, Serialize)]
pub struct CreateTreeRequest<'a> {
    pub base_tree: &'a str,
    pub tree: Vec<TreeItemRequest<'a>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeItemRequest<'a> {
    pub path: &'a str,
    pub mode: &'a str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub payload: TreeItemPayload<'a>,
}

/// Inline content, or a null SHA that removes the path from the base tree.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TreeItemPayload<'a> {
    Content { content: &'a str },
    Remove { sha: Option<&'a str> },
}

impl<'a> TreeItemRequest<'a> {
    pub fn from_operation(op: &'a CommitOperation) -> Self {
        let payload = match &op.action {
            CommitAction::Create(content) | CommitAction::Update(content) => {
                TreeItemPayload::Content { content }
            }
            CommitAction::Delete => TreeItemPayload::Remove { sha: None },
        };
        Self {
            path: &op.path,
            mode: &op.mode,
            kind: "blob",
            payload,
        }
    }
}

/// Reply of `POST /repos/{owner}/{repo}/git/trees`
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedTree {
    pub sha: String,
}

/// Body of `POST /repos/{owner}/{repo}/git/commits`
#[derive(Debug, Clone, Serialize)]
pub struct CreateCommitRequest<'a> {
    pub message: &'a str,
    pub tree: &'a str,
    pub parents: Vec<&'a str>,
}

/// Body of `PATCH /repos/{owner}/{repo}/git/refs/heads/{branch}`
#[derive(Debug, Clone, Serialize)]
pub struct UpdateRefRequest<'a> {
    pub sha: &'a str,
    pub force: bool,
}

/// `GET /user`
#[derive(Debug, Clone, Deserialize)]
pub struct UserResponse {
    pub login: String,
}

/// `GET /repos/{owner}/{repo}`
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryResponse {
    pub full_name: String,
    pub default_branch: String,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub push: bool,
}

/// Error body returned with unsuccessful responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
}

/// What the credential may do with a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessReport {
    pub login: String,
    pub repository: String,
    pub push_access: bool,
    pub default_branch: String,
    pub branch_exists: bool,
}

impl AccessReport {
    /// Whether the engine can both read and commit.
    pub fn is_usable(&self) -> bool {
        self.push_access && self.branch_exists
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tree_response_into_snapshot() {
        let body = json!({
            "sha": "abc",
            "url": "https://api.github.com/...",
            "truncated": false,
            "tree": [
                {"path": "docs", "mode": "040000", "type": "tree", "sha": "t1"},
                {"path": "docs/a.md", "mode": "100644", "type": "blob", "sha": "b1", "size": 12},
                {"path": "vendor/lib", "mode": "160000", "type": "commit", "sha": "c1"}
            ]
        });
        let snapshot = serde_json::from_value::<TreeResponse>(body)
            .unwrap()
            .into_snapshot();

        assert_eq!(snapshot.sha, "abc");
        assert_eq!(snapshot.entries.len(), 2);
        let index = snapshot.blob_index();
        assert_eq!(index.len(), 1);
        assert_eq!(index["docs/a.md"].sha, "b1");
        assert_eq!(index["docs/a.md"].size, Some(12));
    }

    #[test]
    fn test_tree_item_requests() {
        let create = CommitOperation::create("a.md", "");
        let delete = CommitOperation::delete("b.md");

        let value = serde_json::to_value(TreeItemRequest::from_operation(&create)).unwrap();
        assert_eq!(
            value,
            json!({"path": "a.md", "mode": "100644", "type": "blob", "content": ""})
        );

        let value = serde_json::to_value(TreeItemRequest::from_operation(&delete)).unwrap();
        assert_eq!(
            value,
            json!({"path": "b.md", "mode": "100644", "type": "blob", "sha": null})
        );
    }

    #[test]
    fn test_tree_item_keeps_executable_mode() {
        let op = CommitOperation::update("bin/run.sh", "echo hi").with_mode("100755");
        let value = serde_json::to_value(TreeItemRequest::from_operation(&op)).unwrap();
        assert_eq!(value["mode"], "100755");
        assert_eq!(value["content"], "echo hi");
    }

    #[test]
    fn test_repository_permissions() {
        let body = json!({
            "full_name": "alice/notes",
            "default_branch": "main",
            "permissions": {"admin": false, "push": true, "pull": true}
        });
        let repo: RepositoryResponse = serde_json::from_value(body).unwrap();
        assert!(repo.permissions.unwrap_or_default().push);

        let body = json!({"full_name": "alice/notes", "default_branch": "main"});
        let repo: RepositoryResponse = serde_json::from_value(body).unwrap();
        assert!(!repo.permissions.unwrap_or_default().push);
    }
}
