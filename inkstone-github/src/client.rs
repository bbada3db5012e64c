//! GitHub REST client implementing the remote tree port.
//!
//! Reads go through the Git-Data and contents endpoints; a commit batch is
//! the usual get-ref / get-commit / create-tree / create-commit / update-ref
//! sequence. Reads that feed a commit decision bypass every cache with a
//! `t=<millis>` query parameter and `Cache-Control: no-cache`.

use crate::types::{
    AccessReport, BlobResponse, CommitResponse, ContentResponse, CreateCommitRequest,
    CreateTreeRequest, CreatedTree, ErrorBody, RefResponse, RepositoryResponse, TreeItemRequest,
    TreeResponse, UpdateRefRequest, UserResponse,
};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use inkstone_core::remote::{Freshness, RemoteStore};
use inkstone_core::{
    CommitOperation, CommitReceipt, EngineConfig, RepoId, Result, SyncError, TreeSnapshot,
};
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

/// Request step, used to classify failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Read,
    UpdateRef,
}

/// Map an unsuccessful response onto the engine's error taxonomy.
pub fn classify_status(status: u16, message: &str, step: Step, path: &str, reference: &str) -> SyncError {
    let lower = message.to_ascii_lowercase();
    match status {
        401 => SyncError::Unauthorized(message.to_string()),
        403 if lower.contains("rate limit") => SyncError::TransientNetwork(message.to_string()),
        404 => SyncError::not_found(path, reference),
        409 | 422 if step == Step::UpdateRef => SyncError::Conflict(message.to_string()),
        429 | 500..=599 => SyncError::TransientNetwork(format!("{}: {}", status, message)),
        _ => SyncError::Remote {
            status,
            message: message.to_string(),
        },
    }
}

fn transport_error(e: reqwest::Error) -> SyncError {
    if e.is_decode() {
        SyncError::Decode(e.to_string())
    } else {
        // Timeouts, refused connections and broken bodies alike
        SyncError::TransientNetwork(e.to_string())
    }
}

/// Decode a Base64 payload (GitHub wraps it at 60 columns) as UTF-8 text.
pub fn decode_content(raw: &str) -> Result<String> {
    let compact: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SyncError::Decode(format!("base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|_| SyncError::Decode("blob is not UTF-8 text".to_string()))
}

/// Error context for one request.
struct Target<'a> {
    path: &'a str,
    reference: &'a str,
    step: Step,
}

/// GitHub implementation of [`RemoteStore`].
pub struct GitHubClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl GitHubClient {
    /// Create a client for `api_base_url` (e.g. `https://api.github.com`).
    pub fn new(token: &str, api_base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
        let base = format!("{}/", api_base_url.trim_end_matches('/'));
        let base_url = Url::parse(&base)
            .map_err(|e| SyncError::InvalidPath(format!("API base URL {:?}: {}", api_base_url, e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(transport_error)?;

        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
        })
    }

    pub fn from_config(token: &str, config: &EngineConfig) -> Result<Self> {
        Self::new(
            token,
            &config.api_base_url,
            &config.user_agent,
            config.request_timeout(),
        )
    }

    /// URL for `segments` below the API root, each segment percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidPath(format!("API base URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments.iter().flat_map(|s| s.split('/')));
        Ok(url)
    }

    fn repo_endpoint(&self, repo: &RepoId, rest: &[&str]) -> Result<Url> {
        let mut segments = vec!["repos", repo.owner.as_str(), repo.name.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    async fn request<B, T>(
        &self,
        method: Method,
        mut url: Url,
        body: Option<&B>,
        freshness: Freshness,
        target: Target<'_>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if freshness == Freshness::Fresh {
            let stamp = chrono::Utc::now().timestamp_millis().to_string();
            url.query_pairs_mut().append_pair("t", &stamp);
        }
        debug!(%method, url = %url, "GitHub request");

        let mut req = self.http.request(method, url);
        // Anonymous access for public repositories
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        if freshness == Freshness::Fresh {
            req = req.header(CACHE_CONTROL, "no-cache");
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.message)
                .unwrap_or(text);
            return Err(classify_status(
                status.as_u16(),
                &message,
                target.step,
                target.path,
                target.reference,
            ));
        }
        resp.json().await.map_err(transport_error)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url, freshness: Freshness, target: Target<'_>) -> Result<T> {
        self.request::<(), T>(Method::GET, url, None, freshness, target)
            .await
    }

    async fn head_commit(&self, repo: &RepoId, branch: &str) -> Result<String> {
        let url = self.repo_endpoint(repo, &["git", "ref", "heads", branch])?;
        let r: RefResponse = self
            .get(url, Freshness::Fresh, Target { path: "", reference: branch, step: Step::Read })
            .await?;
        Ok(r.object.sha)
    }

    async fn fetch_git_blob(&self, repo: &RepoId, path: &str, reference: &str, sha: &str) -> Result<String> {
        let url = self.repo_endpoint(repo, &["git", "blobs", sha])?;
        let blob: BlobResponse = self
            .get(url, Freshness::MayBeCached, Target { path, reference, step: Step::Read })
            .await?;
        if blob.encoding != "base64" {
            return Err(SyncError::Decode(format!("unexpected blob encoding {:?}", blob.encoding)));
        }
        decode_content(&blob.content)
    }

    /// Check the credential's login, push permission and the branch.
    pub async fn check_access(&self, repo: &RepoId, branch: &str) -> Result<AccessReport> {
        let url = self.endpoint(&["user"])?;
        let user: UserResponse = self
            .get(url, Freshness::MayBeCached, Target { path: "", reference: "", step: Step::Read })
            .await?;

        let url = self.repo_endpoint(repo, &[])?;
        let repository: RepositoryResponse = self
            .get(url, Freshness::MayBeCached, Target { path: "", reference: branch, step: Step::Read })
            .await?;

        let url = self.repo_endpoint(repo, &["branches", branch])?;
        let branch_exists = match self
            .get::<serde_json::Value>(url, Freshness::MayBeCached, Target { path: "", reference: branch, step: Step::Read })
            .await
        {
            Ok(_) => true,
            Err(SyncError::NotFound { .. }) => false,
            Err(e) => return Err(e),
        };

        Ok(AccessReport {
            login: user.login,
            repository: repository.full_name,
            push_access: repository.permissions.unwrap_or_default().push,
            default_branch: repository.default_branch,
            branch_exists,
        })
    }
}

#[async_trait]
impl RemoteStore for GitHubClient {
    async fn fetch_tree(&self, repo: &RepoId, reference: &str, freshness: Freshness) -> Result<TreeSnapshot> {
        let mut url = self.repo_endpoint(repo, &["git", "trees", reference])?;
        url.query_pairs_mut().append_pair("recursive", "1");
        let tree: TreeResponse = self
            .get(url, freshness, Target { path: "", reference, step: Step::Read })
            .await?;
        Ok(tree.into_snapshot())
    }

    async fn fetch_blob(&self, repo: &RepoId, path: &str, reference: &str) -> Result<String> {
        let mut url = self.repo_endpoint(repo, &["contents", path])?;
        url.query_pairs_mut().append_pair("ref", reference);
        let target = Target { path, reference, step: Step::Read };
        let value: serde_json::Value = self.get(url, Freshness::Fresh, target).await?;

        // Directories come back as a listing
        if value.is_array() {
            return Err(SyncError::not_found(path, reference));
        }
        let content: ContentResponse = serde_json::from_value(value)?;
        if content.kind != "file" {
            return Err(SyncError::not_found(path, reference));
        }

        match (content.encoding.as_deref(), content.content.as_deref()) {
            (Some("base64"), Some(raw)) => decode_content(raw),
            // Files over 1 MB arrive without inline content
            _ => self.fetch_git_blob(repo, path, reference, &content.sha).await,
        }
    }

    async fn commit_batch(
        &self,
        repo: &RepoId,
        reference: &str,
        operations: &[CommitOperation],
        message: &str,
        expected_base_tree: Option<&str>,
    ) -> Result<CommitReceipt> {
        let read = |path| Target { path, reference, step: Step::Read };

        // (1) parent commit, (2) its root tree
        let parent = self.head_commit(repo, reference).await?;
        let url = self.repo_endpoint(repo, &["git", "commits", &parent])?;
        let parent_commit: CommitResponse = self.get(url, Freshness::Fresh, read("")).await?;
        let base_tree = parent_commit.tree.sha;
        if let Some(expected) = expected_base_tree {
            if expected != base_tree {
                return Err(SyncError::Conflict(format!(
                    "{} moved: base tree {} is not {}",
                    reference, base_tree, expected
                )));
            }
        }

        // Narrow the race window before writing anything
        if self.head_commit(repo, reference).await? != parent {
            return Err(SyncError::Conflict(format!("{} moved while preparing the commit", reference)));
        }

        // (3) tree layered on the parent tree
        let body = CreateTreeRequest {
            base_tree: &base_tree,
            tree: operations.iter().map(TreeItemRequest::from_operation).collect(),
        };
        let url = self.repo_endpoint(repo, &["git", "trees"])?;
        let tree: CreatedTree = self
            .request(Method::POST, url, Some(&body), Freshness::MayBeCached, read(""))
            .await?;

        // (4) commit with the parent as sole ancestor
        let body = CreateCommitRequest {
            message,
            tree: &tree.sha,
            parents: vec![&parent],
        };
        let url = self.repo_endpoint(repo, &["git", "commits"])?;
        let commit: CommitResponse = self
            .request(Method::POST, url, Some(&body), Freshness::MayBeCached, read(""))
            .await?;

        // (5) fast-forward only
        let body = UpdateRefRequest {
            sha: &commit.sha,
            force: false,
        };
        let url = self.repo_endpoint(repo, &["git", "refs", "heads", reference])?;
        let target = Target { path: "", reference, step: Step::UpdateRef };
        let _: serde_json::Value = self
            .request(Method::PATCH, url, Some(&body), Freshness::MayBeCached, target)
            .await?;

        info!(repository = %repo, commit = %commit.sha, ops = operations.len(), "Pushed commit");
        Ok(CommitReceipt {
            commit_sha: commit.sha,
            tree_sha: commit.tree.sha,
            parent_sha: parent,
        })
    }
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}
