//! Shared fixtures for the session and commit tests

#![allow(dead_code)]

use async_trait::async_trait;
use inkstone_core::{
    Conflict, ConflictResolver, ContentStore, MemoryRemote, RepoId, RepoSession, Resolution,
    Result, SyncError,
};
use std::sync::{Arc, Mutex};

pub const BRANCH: &str = "main";
pub const KEY: &str = "alice/notes";

pub fn repo() -> RepoId {
    RepoId::new("alice", "notes")
}

/// Resolver that answers every conflict the same way (or fails) and
/// remembers what it was asked.
pub struct ScriptedResolver {
    answer: Option<Resolution>,
    seen: Mutex<Vec<Conflict>>,
}

impl ScriptedResolver {
    pub fn answering(answer: Resolution) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(answer),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<Conflict> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConflictResolver for ScriptedResolver {
    async fn resolve(&self, conflict: &Conflict) -> Result<Resolution> {
        self.seen.lock().unwrap().push(conflict.clone());
        self.answer
            .ok_or_else(|| SyncError::Resolver("prompt dismissed".into()))
    }
}

/// Resolver whose prompt is never answered.
pub struct SilentResolver;

#[async_trait]
impl ConflictResolver for SilentResolver {
    async fn resolve(&self, _conflict: &Conflict) -> Result<Resolution> {
        std::future::pending().await
    }
}

pub struct Fixture {
    pub remote: Arc<MemoryRemote>,
    pub store: Arc<ContentStore>,
    pub session: RepoSession,
}

/// Remote seeded with `files`, an in-memory store and a synced session.
pub async fn synced(files: &[(&str, &str)], resolver: Arc<dyn ConflictResolver>) -> Fixture {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(&repo(), BRANCH, files).await.unwrap();
    let store = Arc::new(ContentStore::open_in_memory().unwrap());
    let session = RepoSession::new(store.clone(), remote.clone(), resolver, repo(), BRANCH).unwrap();
    session.sync().await.unwrap();
    Fixture {
        remote,
        store,
        session,
    }
}
