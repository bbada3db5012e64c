//! Commit batching tests against an in-memory remote

mod common;

use common::{BRANCH, KEY, ScriptedResolver, repo, synced};
use inkstone_core::{
    CommitOperation, ConflictKind, DirtyState, FixedResolver, Freshness, RemoteStep, RemoteStore,
    Resolution, SyncError, SyncPhase, blob_sha,
};
use std::sync::Arc;

fn keep() -> Arc<FixedResolver> {
    Arc::new(FixedResolver(Resolution::KeepLocal))
}

#[tokio::test]
async fn test_update_and_delete_make_one_commit() {
    let fx = synced(&[("a.md", "a"), ("b.md", "b"), ("c.md", "c")], keep()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.save_file("a.md", "a2").await.unwrap();
    fx.session.delete_file("b.md").await.unwrap();

    let outcome = fx.session.commit("Update notes").await.unwrap().unwrap();
    assert_eq!(
        outcome.operations,
        vec![CommitOperation::update("a.md", "a2"), CommitOperation::delete("b.md")]
    );
    assert!(outcome.operations[1].content().is_none());
    assert!(!outcome.retried());

    let a = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(a.dirty_state, DirtyState::Clean);
    assert_eq!(a.origin_blob_sha, Some(blob_sha("a2")));
    assert!(fx.store.get("b.md", KEY).unwrap().is_none());
    assert!(fx.store.list_dirty(KEY).unwrap().is_empty());

    assert_eq!(fx.remote.file(&repo(), BRANCH, "a.md").await.as_deref(), Some("a2"));
    assert!(fx.remote.file(&repo(), BRANCH, "b.md").await.is_none());
    assert_eq!(fx.remote.head(&repo(), BRANCH).await, Some(outcome.receipt.commit_sha.clone()));
}

#[tokio::test]
async fn test_commit_advances_state_to_the_new_tree() {
    let fx = synced(&[("docs/a.md", "a")], keep()).await;
    fx.session.create_file("docs/new/b.md", "b").await.unwrap();

    let outcome = fx.session.commit("Add b").await.unwrap().unwrap();
    let state = fx.store.sync_state(KEY).unwrap().unwrap();
    assert_eq!(state.last_known_tree_sha, Some(outcome.receipt.tree_sha.clone()));
    assert_eq!(state.last_commit_sha, Some(outcome.receipt.commit_sha.clone()));
    assert_eq!(
        fx.remote.tree_sha(&repo(), BRANCH).await,
        Some(outcome.receipt.tree_sha.clone())
    );

    // The locally derived baseline matches what the remote now lists
    let remote_tree = fx.remote.tree_sha(&repo(), BRANCH).await.unwrap();
    let report = fx.session.sync().await.unwrap();
    assert_eq!(report.tree_sha, remote_tree);
    assert!(report.is_unchanged());
    let paths: Vec<_> = fx.store.baseline(KEY).unwrap().into_keys().collect();
    assert_eq!(paths, vec!["docs/a.md", "docs/new/b.md"]);
    assert_eq!(fx.session.phase().await, SyncPhase::Synced);
}

#[tokio::test]
async fn test_second_commit_without_edits_is_a_no_op() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    fx.session.save_file("a.md", "edited").await.unwrap();

    assert!(fx.session.commit("first").await.unwrap().is_some());
    let writes = fx.remote.write_calls();
    let head = fx.remote.head(&repo(), BRANCH).await;

    assert!(fx.session.commit("second").await.unwrap().is_none());
    assert_eq!(fx.remote.write_calls(), writes);
    assert_eq!(fx.remote.head(&repo(), BRANCH).await, head);
}

#[tokio::test]
async fn test_created_then_deleted_never_commits() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    fx.session.create_file("new.md", "draft").await.unwrap();
    fx.session.delete_file("new.md").await.unwrap();

    assert!(fx.session.commit("nothing").await.unwrap().is_none());
    assert_eq!(fx.remote.write_calls(), 0);
}

#[tokio::test]
async fn test_failed_tree_creation_changes_nothing() {
    let fx = synced(&[("a.md", "a"), ("b.md", "b")], keep()).await;
    fx.session.save_file("a.md", "a2").await.unwrap();
    fx.session.delete_file("b.md").await.unwrap();
    fx.session.create_file("c.md", "c").await.unwrap();

    let state_before = fx.store.sync_state(KEY).unwrap();
    let dirty_before = fx.store.list_dirty(KEY).unwrap();
    let head_before = fx.remote.head(&repo(), BRANCH).await;

    fx.remote.fail_next(RemoteStep::CreateTree).await;
    let err = fx.session.commit("Update notes").await.unwrap_err();
    assert!(err.is_retryable());

    assert_eq!(fx.store.sync_state(KEY).unwrap(), state_before);
    assert_eq!(fx.store.list_dirty(KEY).unwrap(), dirty_before);
    assert_eq!(fx.remote.head(&repo(), BRANCH).await, head_before);

    // Retry is the caller's call
    let outcome = fx.session.commit("Update notes").await.unwrap().unwrap();
    assert_eq!(outcome.operations.len(), 3);
    assert!(fx.store.list_dirty(KEY).unwrap().is_empty());
}

#[tokio::test]
async fn test_ref_conflict_reconciles_once_and_retries() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    fx.session.save_file("a.md", "mine").await.unwrap();
    fx.remote
        .race_next_commit(vec![CommitOperation::create("other.md", "theirs")])
        .await;

    let outcome = fx.session.commit("Edit a").await.unwrap().unwrap();
    assert!(outcome.retried());
    assert_eq!(outcome.reconciliations[1].changes.added, vec!["other.md"]);

    assert_eq!(fx.remote.file(&repo(), BRANCH, "a.md").await.as_deref(), Some("mine"));
    assert_eq!(fx.remote.file(&repo(), BRANCH, "other.md").await.as_deref(), Some("theirs"));
    let state = fx.store.sync_state(KEY).unwrap().unwrap();
    assert_eq!(state.last_known_tree_sha, fx.remote.tree_sha(&repo(), BRANCH).await);
}

#[tokio::test]
async fn test_second_ref_conflict_is_surfaced() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    fx.session.save_file("a.md", "mine").await.unwrap();
    fx.remote
        .race_next_commit(vec![CommitOperation::create("x.md", "x")])
        .await;
    fx.remote
        .race_next_commit(vec![CommitOperation::create("y.md", "y")])
        .await;

    let err = fx.session.commit("Edit a").await.unwrap_err();
    assert!(matches!(err, SyncError::Conflict(_)));

    let a = fx.store.get("a.md", KEY).unwrap().unwrap();
    assert_eq!(a.dirty_state, DirtyState::ModifiedLocally);
    assert_eq!(fx.remote.file(&repo(), BRANCH, "a.md").await.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_commit_reconciles_remote_moves_first() {
    let resolver = ScriptedResolver::answering(Resolution::KeepLocal);
    let fx = synced(&[("a.md", "v1")], resolver.clone()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.save_file("a.md", "mine").await.unwrap();
    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::update("a.md", "theirs")], "remote edit")
        .await
        .unwrap();

    // Conflict is raised before anything is pushed; local wins
    let outcome = fx.session.commit("Keep mine").await.unwrap().unwrap();
    let seen = resolver.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, ConflictKind::RemoteUpdate);
    assert!(!outcome.retried());
    assert_eq!(fx.remote.file(&repo(), BRANCH, "a.md").await.as_deref(), Some("mine"));
}

#[tokio::test]
async fn test_unresolved_conflict_blocks_commit() {
    let fx = synced(&[("a.md", "v1")], ScriptedResolver::failing()).await;
    fx.session.open_file("a.md").await.unwrap();
    fx.session.save_file("a.md", "mine").await.unwrap();
    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::update("a.md", "theirs")], "remote edit")
        .await
        .unwrap();

    let err = fx.session.commit("Edit").await.unwrap_err();
    assert!(matches!(err, SyncError::Resolver(_)));
    assert_eq!(fx.remote.write_calls(), 0);
    assert_eq!(fx.session.phase().await, SyncPhase::Diverged);
    assert_eq!(fx.remote.file(&repo(), BRANCH, "a.md").await.as_deref(), Some("theirs"));
}

#[tokio::test]
async fn test_edit_after_commit_is_pending() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    fx.session.save_file("a.md", "first").await.unwrap();
    fx.session.commit("first").await.unwrap();

    fx.session.save_file("a.md", "second").await.unwrap();
    let pending = fx.session.get_diff_summary().await.unwrap();
    assert_eq!(pending, vec![CommitOperation::update("a.md", "second")]);

    let status = fx.session.status().await.unwrap();
    assert_eq!(status.pending, pending);
    assert_eq!(status.phase, SyncPhase::Synced);
}

#[tokio::test]
async fn test_commit_keeps_executable_mode() {
    let fx = synced(&[("README.md", "r")], keep()).await;
    fx.remote
        .push_external(
            &repo(),
            BRANCH,
            &[CommitOperation::create("bin/run.sh", "echo 1").with_mode("100755")],
            "Add script",
        )
        .await
        .unwrap();
    fx.session.sync().await.unwrap();
    assert_eq!(fx.store.baseline(KEY).unwrap()["bin/run.sh"].mode, "100755");

    fx.session.open_file("bin/run.sh").await.unwrap();
    fx.session.save_file("bin/run.sh", "echo 2").await.unwrap();
    let outcome = fx.session.commit("Bump script").await.unwrap().unwrap();
    assert_eq!(outcome.operations[0].mode, "100755");
    assert_eq!(fx.store.baseline(KEY).unwrap()["bin/run.sh"].mode, "100755");

    let tree = fx.remote.fetch_tree(&repo(), BRANCH, Freshness::Fresh).await.unwrap();
    let script = tree.entries.iter().find(|e| e.path == "bin/run.sh").unwrap();
    assert_eq!(script.mode, "100755");
    assert_eq!(script.sha, blob_sha("echo 2"));

    // Derived baseline agrees with the remote listing
    assert!(fx.session.sync().await.unwrap().is_unchanged());
}

#[tokio::test]
async fn test_sync_after_external_push_forgets_own_head() {
    let fx = synced(&[("a.md", "a")], keep()).await;
    fx.session.save_file("a.md", "mine").await.unwrap();
    fx.session.commit("Mine").await.unwrap().unwrap();
    assert!(fx.store.sync_state(KEY).unwrap().unwrap().last_commit_sha.is_some());

    fx.remote
        .push_external(&repo(), BRANCH, &[CommitOperation::create("b.md", "b")], "Theirs")
        .await
        .unwrap();
    let report = fx.session.sync().await.unwrap();
    let state = fx.store.sync_state(KEY).unwrap().unwrap();
    assert_eq!(state.last_known_tree_sha, Some(report.tree_sha));
    assert!(state.last_commit_sha.is_none());
}
