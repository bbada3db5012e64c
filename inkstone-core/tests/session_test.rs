//! Session integration tests: read-through cache, local edits and
//! reconciliation against an in-memory remote

mod common;

use common::{BRANCH, KEY, ScriptedResolver, SilentResolver, repo, synced};
use inkstone_core::{
    CommitOperation, ConflictKind, ContentStore, DirtyState, Engine, FixedResolver, MemoryRemote,
    RemoteStep, RepoId, RepoSession, Resolution, SyncError, SyncPhase, blob_sha,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn keep() -> Arc<FixedResolver> {
    Arc::new(FixedResolver(Resolution::KeepLocal))
}

#[tokio::test]
async fn test_first_sync_adopts_tree() {
    let remote = Arc::new(MemoryRemote::new());
    let seed = remote
        .seed(&repo(), BRANCH, &[("a.md", "a"), ("docs/b.md", "b")])
        .await
        .unwrap();
    let store = Arc::new(ContentStore::open_in_memory().unwrap());
    let session = RepoSession::new(store.clone(), remote.clone(), keep(), repo(), BRANCH).unwrap();
    assert_eq!(session.phase().await, SyncPhase::Uninitialized);

    let report = session.sync().await.unwrap();
    assert!(report.first_sync);
    assert!(report.conflicts.is_empty());
    assert_eq!(report.tree_sha, seed.tree_sha);
    assert_eq!(session.phase().await, SyncPhase::Synced);

    let state = store.sync_state(KEY).unwrap().unwrap();
    assert_eq!(state.last_known_tree_sha, Some(seed.tree_sha));
    assert_eq!(store.baseline(KEY).unwrap().len(), 2);
    assert!(store.list(KEY).unwrap().is_empty());

    let again = session.sync().await.unwrap();
    assert!(again.is_unchanged());
}

#[tokio::test]
async fn test_open_file_reads_through_and_caches() {
    let fx = synced(&[("a.md", "hello")], keep()).await;

    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "hello");
    assert_eq!(fx.session.open_file("/a.md").await.unwrap(), "hello");
    assert_eq!(fx.remote.blob_fetches(), 1);

    let record = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(record.dirty_state, DirtyState::Clean);
    assert_eq!(record.origin_blob_sha, Some(blob_sha("hello")));

    let err = fx.session.open_file("missing.md").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }));
    let err = fx.session.open_file("../a.md").await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidPath(_)));
}

#[tokio::test]
async fn test_remote_update_conflict_keep_local() {
    let resolver = ScriptedResolver::answering(Resolution::KeepLocal);
    let fx = synced(&[("a.md", "v1")], resolver.clone()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.save_file("a.md", "mine").await.unwrap();

    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::update("a.md", "theirs")], "remote edit")
        .await
        .unwrap();

    let report = fx.session.sync().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    let (conflict, resolution) = &report.conflicts[0];
    assert_eq!(conflict.path, "a.md");
    assert_eq!(conflict.kind, ConflictKind::RemoteUpdate);
    assert_eq!(*resolution, Resolution::KeepLocal);
    assert_eq!(resolver.seen().len(), 1);
    assert_eq!(report.changes.modified, vec!["a.md"]);

    let record = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(record.dirty_state, DirtyState::ModifiedLocally);
    assert_eq!(record.origin_blob_sha, Some(blob_sha("theirs")));
    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "mine");
    assert_eq!(fx.session.phase().await, SyncPhase::Synced);
}

#[tokio::test]
async fn test_remote_update_conflict_discard_local() {
    let fx = synced(&[("a.md", "v1")], Arc::new(FixedResolver(Resolution::DiscardLocal))).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.save_file("a.md", "mine").await.unwrap();
    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::update("a.md", "theirs")], "remote edit")
        .await
        .unwrap();

    let report = fx.session.sync().await.unwrap();
    assert_eq!(report.conflicts[0].1, Resolution::DiscardLocal);
    assert_eq!(report.stale, vec!["a.md"]);

    let record = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(record.dirty_state, DirtyState::ChangedRemotely);
    assert!(record.content.is_none());

    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "theirs");
    let record = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(record.dirty_state, DirtyState::Clean);
    assert!(fx.session.get_diff_summary().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upstream_update_of_clean_file_is_not_a_conflict() {
    let resolver = ScriptedResolver::answering(Resolution::KeepLocal);
    let fx = synced(&[("a.md", "v1")], resolver.clone()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::update("a.md", "v2")], "remote edit")
        .await
        .unwrap();

    let report = fx.session.sync().await.unwrap();
    assert!(report.conflicts.is_empty());
    assert!(resolver.seen().is_empty());
    assert_eq!(report.stale, vec!["a.md"]);
    assert_eq!(
        fx.store.get("a.md", KEY).unwrap().unwrap().dirty_state,
        DirtyState::ChangedRemotely
    );

    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "v2");
    let record = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(record.dirty_state, DirtyState::Clean);
    assert_eq!(record.origin_blob_sha, Some(blob_sha("v2")));
}

#[tokio::test]
async fn test_remote_delete_conflict_keep_recreates() {
    let fx = synced(&[("a.md", "v1"), ("b.md", "b")], keep()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.save_file("a.md", "mine").await.unwrap();
    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::delete("a.md")], "remote delete")
        .await
        .unwrap();

    let report = fx.session.sync().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].0.kind, ConflictKind::RemoteDelete);
    assert_eq!(report.changes.removed, vec!["a.md"]);

    let record = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(record.dirty_state, DirtyState::CreatedLocally);
    assert!(record.origin_blob_sha.is_none());
    assert_eq!(
        fx.session.get_diff_summary().await.unwrap(),
        vec![CommitOperation::create("a.md", "mine")]
    );
}

#[tokio::test]
async fn test_remote_delete_of_locally_deleted_file_is_purged() {
    let resolver = ScriptedResolver::answering(Resolution::KeepLocal);
    let fx = synced(&[("a.md", "v1")], resolver.clone()).await;
    fx.session.delete_file("a.md").await.unwrap();
    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::delete("a.md")], "remote delete")
        .await
        .unwrap();

    let report = fx.session.sync().await.unwrap();
    assert!(report.conflicts.is_empty());
    assert!(resolver.seen().is_empty());
    assert_eq!(report.purged, vec!["a.md"]);
    assert!(fx.store.get("a.md", KEY).unwrap().is_none());
    assert!(fx.session.get_diff_summary().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unresolved_conflict_leaves_state_unchanged() {
    let resolver = ScriptedResolver::failing();
    let fx = synced(&[("a.md", "v1"), ("b.md", "b")], resolver.clone()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.open_file("b.md").await.unwrap();
    fx.session.save_file("a.md", "mine").await.unwrap();

    let state_before = fx.store.sync_state(KEY).unwrap();
    let baseline_before = fx.store.baseline(KEY).unwrap();
    let records_before = fx.store.list(KEY).unwrap();

    fx.remote
        .push_external(
            &repo(),
            BRANCH,
            &[CommitOperation::update("a.md", "theirs"), CommitOperation::update("b.md", "b2")],
            "remote edit",
        )
        .await
        .unwrap();

    let err = fx.session.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Resolver(_)));
    assert_eq!(resolver.seen().len(), 1);
    assert_eq!(fx.session.phase().await, SyncPhase::Diverged);

    // Not even the conflict-free b.md was touched
    assert_eq!(fx.store.sync_state(KEY).unwrap(), state_before);
    assert_eq!(fx.store.baseline(KEY).unwrap(), baseline_before);
    assert_eq!(fx.store.list(KEY).unwrap(), records_before);
}

#[tokio::test]
async fn test_created_then_deleted_is_purged() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    let record = fx.session.create_file("new.md", "draft").await.unwrap();
    assert_eq!(record.dirty_state, DirtyState::CreatedLocally);
    assert!(record.origin_blob_sha.is_none());

    fx.session.delete_file("new.md").await.unwrap();
    assert!(fx.store.get("new.md", KEY).unwrap().is_none());
    assert!(fx.session.get_diff_summary().await.unwrap().is_empty());
    assert!(fx.session.list_deleted().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_file_rejects_existing_paths() {
    let fx = synced(&[("a.md", "a")], keep()).await;

    let err = fx.session.create_file("a.md", "x").await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyExists(_)));

    fx.session.create_file("new.md", "x").await.unwrap();
    let err = fx.session.create_file("new.md", "y").await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_delete_unpulled_remote_file_and_restore() {
    let fx = synced(&[("a.md", "a")], keep()).await;

    fx.session.delete_file("a.md").await.unwrap();
    let deleted = fx.session.list_deleted().await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].content.is_none());
    assert_eq!(
        fx.session.get_diff_summary().await.unwrap(),
        vec![CommitOperation::delete("a.md")]
    );
    assert!(matches!(
        fx.session.open_file("a.md").await.unwrap_err(),
        SyncError::NotFound { .. }
    ));

    fx.session.restore_file("a.md").await.unwrap();
    assert!(fx.session.get_diff_summary().await.unwrap().is_empty());
    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "a");

    let err = fx.session.restore_file("a.md").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }));
}

#[tokio::test]
async fn test_delete_missing_file_is_not_found() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    let err = fx.session.delete_file("nope.md").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }));
}

#[tokio::test]
async fn test_save_unpulled_remote_file_is_an_update() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    let record = fx.session.save_file("a.md", "rewritten").await.unwrap();
    assert_eq!(record.dirty_state, DirtyState::ModifiedLocally);
    assert_eq!(record.origin_blob_sha, Some(blob_sha("a")));
    assert_eq!(
        fx.session.get_diff_summary().await.unwrap(),
        vec![CommitOperation::update("a.md", "rewritten")]
    );
}

#[tokio::test]
async fn test_list_files_merges_local_state() {
    let fx = synced(&[("a.md", "a"), ("docs/b.md", "b")], keep()).await;
    fx.session.create_file("c.md", "c").await.unwrap();
    fx.session.save_file("a.md", "edited").await.unwrap();
    fx.session.delete_file("docs/b.md").await.unwrap();

    let files = fx.session.list_files().await.unwrap();
    let listing: Vec<_> = files.iter().map(|f| (f.path.as_str(), f.state)).collect();
    assert_eq!(
        listing,
        vec![
            ("a.md", Some(DirtyState::ModifiedLocally)),
            ("c.md", Some(DirtyState::CreatedLocally)),
            ("docs/b.md", Some(DirtyState::DeletedLocally)),
        ]
    );
    assert_eq!(files[0].size, Some(6));

    let tree = fx.session.file_tree().await.unwrap();
    let names: Vec<_> = tree.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["a.md", "c.md"]);
}

#[tokio::test]
async fn test_list_files_uses_listing_cache() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    let fetches = fx.remote.tree_fetches();

    fx.session.list_files().await.unwrap();
    fx.session.list_files().await.unwrap();
    assert_eq!(fx.remote.tree_fetches(), fetches + 1);

    // A sync drops the cached listing
    fx.session.sync().await.unwrap();
    fx.session.list_files().await.unwrap();
    assert_eq!(fx.remote.tree_fetches(), fetches + 3);
}

#[tokio::test]
async fn test_list_files_offline_falls_back_to_baseline() {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(&repo(), BRANCH, &[("a.md", "a"), ("b.md", "b")]).await.unwrap();
    let store = Arc::new(ContentStore::open_in_memory().unwrap());
    let session = RepoSession::new(store, remote.clone(), keep(), repo(), BRANCH)
        .unwrap()
        .with_listing_ttl(Duration::ZERO);
    session.sync().await.unwrap();

    remote.fail_next(RemoteStep::FetchTree).await;
    let files = session.list_files().await.unwrap();
    let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a.md", "b.md"]);
    assert!(files.iter().all(|f| f.state.is_none()));
}

#[tokio::test]
async fn test_refresh_stale_pulls_every_stale_file() {
    let fx = synced(&[("a.md", "a"), ("b.md", "b"), ("c.md", "c")], keep()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.open_file("b.md").await.unwrap();
    fx.remote
        .push_external(
            &repo(),
            BRANCH,
            &[CommitOperation::update("a.md", "a2"), CommitOperation::update("b.md", "b2")],
            "remote edit",
        )
        .await
        .unwrap();
    fx.session.sync().await.unwrap();

    let refreshed = fx.session.refresh_stale().await.unwrap();
    assert_eq!(refreshed, vec!["a.md", "b.md"]);
    assert_eq!(fx.store.read("a.md", KEY).unwrap().as_deref(), Some("a2"));
    assert_eq!(fx.store.read("b.md", KEY).unwrap().as_deref(), Some("b2"));
    assert!(fx.session.status().await.unwrap().stale.is_empty());
}

#[tokio::test]
async fn test_stale_open_offline_surfaces_error() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::update("a.md", "a2")], "remote edit")
        .await
        .unwrap();
    fx.session.sync().await.unwrap();

    fx.remote.fail_next(RemoteStep::FetchBlob).await;
    let err = fx.session.open_file("a.md").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "a2");
}

#[tokio::test]
async fn test_corrupt_record_is_pulled_again() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("inkstone.sqlite");
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(&repo(), BRANCH, &[("a.md", "a")]).await.unwrap();
    let store = Arc::new(ContentStore::open(&db).unwrap());
    let session = RepoSession::new(store.clone(), remote.clone(), keep(), repo(), BRANCH).unwrap();
    session.sync().await.unwrap();
    session.open_file("a.md").await.unwrap();

    let raw = rusqlite::Connection::open(&db).unwrap();
    raw.execute("UPDATE files SET content = X'FFFE00' WHERE path = 'a.md'", [])
        .unwrap();
    drop(raw);

    assert_eq!(session.open_file("a.md").await.unwrap(), "a");
    assert_eq!(remote.blob_fetches(), 2);
    assert_eq!(
        store.get("a.md", KEY).unwrap().unwrap().dirty_state,
        DirtyState::Clean
    );
}

#[tokio::test]
async fn test_engine_isolates_repositories() {
    let other = RepoId::new("bob", "journal");
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(&repo(), BRANCH, &[("a.md", "a")]).await.unwrap();
    remote.seed(&other, BRANCH, &[("a.md", "bob's a")]).await.unwrap();

    let store = Arc::new(ContentStore::open_in_memory().unwrap());
    let engine = Engine::new(store.clone(), remote, keep());
    let notes = engine.session(&repo(), BRANCH).unwrap();
    let journal = engine.session(&other, BRANCH).unwrap();
    assert!(Arc::ptr_eq(&notes, &engine.session(&repo(), BRANCH).unwrap()));
    assert!(engine.session(&repo(), "dev").is_err());

    notes.sync().await.unwrap();
    journal.sync().await.unwrap();
    notes.save_file("a.md", "edited").await.unwrap();

    assert_eq!(journal.open_file("a.md").await.unwrap(), "bob's a");
    assert!(journal.get_diff_summary().await.unwrap().is_empty());
    assert_eq!(notes.get_diff_summary().await.unwrap().len(), 1);
    assert_eq!(engine.repositories().unwrap(), vec!["alice/notes", "bob/journal"]);

    engine.clear_repository(&repo()).await.unwrap();
    assert!(store.list(KEY).unwrap().is_empty());
    assert!(store.sync_state(KEY).unwrap().is_none());
    assert_eq!(store.list("bob/journal").unwrap().len(), 1);
}

#[tokio::test]
async fn test_restore_after_kept_delete_serves_remote_version() {
    let resolver = ScriptedResolver::answering(Resolution::KeepLocal);
    let fx = synced(&[("a.md", "v1")], resolver.clone()).await;
    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "v1");
    fx.session.delete_file("a.md").await.unwrap();

    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::update("a.md", "v2")], "remote edit")
        .await
        .unwrap();
    let report = fx.session.sync().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(resolver.seen()[0].kind, ConflictKind::RemoteUpdate);

    fx.session.restore_file("a.md").await.unwrap();
    let record = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(record.origin_blob_sha, Some(blob_sha("v2")));
    assert_ne!(record.content.as_deref(), Some("v1"));

    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "v2");
    let record = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(record.dirty_state, DirtyState::Clean);
    assert!(fx.session.get_diff_summary().await.unwrap().is_empty());
    assert!(fx.session.commit("nothing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_sync_returns_to_diverged() {
    let fx = synced(&[("a.md", "v1"), ("b.md", "b")], Arc::new(SilentResolver)).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.save_file("a.md", "mine").await.unwrap();
    let records_before = fx.store.list(KEY).unwrap();
    let state_before = fx.store.sync_state(KEY).unwrap();

    fx.remote
        .push_external(
            &repo(),
            BRANCH,
            &[CommitOperation::update("a.md", "theirs"), CommitOperation::update("b.md", "b2")],
            "remote edit",
        )
        .await
        .unwrap();

    let waited = tokio::time::timeout(Duration::from_millis(100), fx.session.sync()).await;
    assert!(waited.is_err());
    assert_eq!(fx.session.phase().await, SyncPhase::Diverged);
    assert_eq!(fx.store.list(KEY).unwrap(), records_before);
    assert_eq!(fx.store.sync_state(KEY).unwrap(), state_before);

    // The scope is free again for edits
    fx.session.save_file("a.md", "mine again").await.unwrap();
    assert_eq!(fx.session.open_file("a.md").await.unwrap(), "mine again");
}
