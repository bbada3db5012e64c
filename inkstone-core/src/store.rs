//! SQLite-backed content store
//!
//! Durable cache of file records keyed by (repository, path), plus the
//! per-repository sync state and baseline index. Every mutating call commits
//! before it returns; the journal runs in WAL mode with `synchronous = FULL`
//! so an acknowledged write survives a crash.
//!
//! Multi-record outcomes (a reconciliation pass, a finished commit) are
//! applied in one transaction together with the sync state they justify.

use crate::error::{Result, SyncError};
use crate::object::{BaselineEntry, BaselineIndex, CommitAction, CommitOperation, ObjectId, blob_sha};
use crate::sync_state::RepositorySyncState;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Local classification of a cached file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyState {
    /// Content matches `origin_blob_sha` on the remote.
    Clean,
    /// Exists only locally; never committed.
    CreatedLocally,
    /// Edited locally on top of `origin_blob_sha`.
    ModifiedLocally,
    /// Tombstone; removed on the next commit.
    DeletedLocally,
    /// Cached copy is behind the remote and must be re-pulled.
    ChangedRemotely,
}

impl DirtyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirtyState::Clean => "clean",
            DirtyState::CreatedLocally => "created",
            DirtyState::ModifiedLocally => "modified",
            DirtyState::DeletedLocally => "deleted",
            DirtyState::ChangedRemotely => "changed_remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(DirtyState::Clean),
            "created" => Some(DirtyState::CreatedLocally),
            "modified" => Some(DirtyState::ModifiedLocally),
            "deleted" => Some(DirtyState::DeletedLocally),
            "changed_remote" => Some(DirtyState::ChangedRemotely),
            _ => None,
        }
    }
}

/// A cached file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub repository: String,
    /// `None` when the file has never been pulled (or was dropped for re-pull).
    pub content: Option<String>,
    /// Blob SHA this record was last known to match on the remote.
    pub origin_blob_sha: Option<String>,
    pub dirty_state: DirtyState,
    /// State a tombstone was created from.
    pub deleted_from: Option<DirtyState>,
    pub updated_at: i64,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.dirty_state == DirtyState::DeletedLocally
    }

    /// Whether the cached content can be served without a remote pull.
    pub fn is_fresh(&self) -> bool {
        self.content.is_some()
            && matches!(
                self.dirty_state,
                DirtyState::Clean | DirtyState::CreatedLocally | DirtyState::ModifiedLocally
            )
    }
}

/// A record mutation decided by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate {
    /// Remove the record.
    Purge(String),
    /// Recreate the path on the next commit.
    MarkCreated(String),
    /// The cached copy is stale; optionally drop its content.
    MarkStale { path: String, drop_content: bool },
    /// Keep local state but acknowledge a newer remote blob.
    AdoptOrigin { path: String, origin_sha: String },
    /// Local content already equals the remote blob.
    MarkClean { path: String, origin_sha: String },
}

impl RecordUpdate {
    pub fn path(&self) -> &str {
        match self {
            RecordUpdate::Purge(p) | RecordUpdate::MarkCreated(p) => p,
            RecordUpdate::MarkStale { path, .. }
            | RecordUpdate::AdoptOrigin { path, .. }
            | RecordUpdate::MarkClean { path, .. } => path,
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    repository TEXT NOT NULL,
    path TEXT NOT NULL,
    content BLOB,
    origin_sha TEXT,
    dirty_state TEXT NOT NULL,
    deleted_from TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (repository, path)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS sync_state (
    repository TEXT PRIMARY KEY,
    tree_sha TEXT,
    commit_sha TEXT,
    last_sync INTEGER NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS baseline_entries (
    repository TEXT NOT NULL,
    path TEXT NOT NULL,
    sha TEXT NOT NULL,
    mode TEXT NOT NULL,
    size INTEGER,
    PRIMARY KEY (repository, path)
) WITHOUT ROWID;
";

const RECORD_COLUMNS: &str = "path, content, origin_sha, dirty_state, deleted_from, updated_at";

fn configure(conn: Connection) -> Result<Connection> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────
// Row helpers (usable inside a transaction)
// ─────────────────────────────────────────────────────

fn decode_fields(repo: &str, path: &str, row: &Row<'_>) -> std::result::Result<FileRecord, String> {
    let content = match row.get_ref(1).map_err(|e| e.to_string())? {
        ValueRef::Null => None,
        ValueRef::Text(b) | ValueRef::Blob(b) => Some(
            String::from_utf8(b.to_vec()).map_err(|_| "content is not valid UTF-8".to_string())?,
        ),
        other => return Err(format!("unexpected content type {:?}", other.data_type())),
    };
    let origin_blob_sha: Option<String> = row.get(2).map_err(|e| e.to_string())?;
    let state: String = row.get(3).map_err(|e| e.to_string())?;
    let dirty_state =
        DirtyState::parse(&state).ok_or_else(|| format!("unknown dirty state {:?}", state))?;
    let deleted_from = match row.get::<_, Option<String>>(4).map_err(|e| e.to_string())? {
        Some(s) => Some(DirtyState::parse(&s).ok_or_else(|| format!("unknown prior state {:?}", s))?),
        None => None,
    };
    let updated_at: i64 = row.get(5).map_err(|e| e.to_string())?;
    Ok(FileRecord {
        path: path.to_string(),
        repository: repo.to_string(),
        content,
        origin_blob_sha,
        dirty_state,
        deleted_from,
        updated_at,
    })
}

type DecodedRow = (String, std::result::Result<FileRecord, String>);

fn decode_row(repo: &str, row: &Row<'_>) -> rusqlite::Result<DecodedRow> {
    let path: String = row.get(0)?;
    let decoded = decode_fields(repo, &path, row);
    Ok((path, decoded))
}

/// Replace an undecodable row by a content-less stale record so the next
/// open re-pulls it, or drop it when not even the origin SHA survives.
fn conn_quarantine(conn: &Connection, repo: &str, path: &str) -> Result<()> {
    let origin = conn
        .query_row(
            "SELECT origin_sha FROM files WHERE repository=?1 AND path=?2",
            params![repo, path],
            // A mistyped origin counts as unreadable; engine errors propagate.
            |r| {
                Ok(match r.get_ref(0)? {
                    ValueRef::Text(b) => std::str::from_utf8(b).ok().map(str::to_string),
                    _ => None,
                })
            },
        )
        .optional()?
        .flatten()
        .filter(|sha| ObjectId::from_hex(sha).is_ok());

    if origin.is_some() {
        conn.execute(
            "UPDATE files SET content=NULL, dirty_state=?3, deleted_from=NULL, updated_at=?4 \
             WHERE repository=?1 AND path=?2",
            params![repo, path, DirtyState::ChangedRemotely.as_str(), now()],
        )?;
    } else {
        conn_delete(conn, repo, path)?;
    }
    Ok(())
}

fn conn_load(conn: &Connection, repo: &str, path: &str) -> Result<Option<FileRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM files WHERE repository=?1 AND path=?2", RECORD_COLUMNS),
            params![repo, path],
            |r| decode_row(repo, r),
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((_, Ok(record))) => Ok(Some(record)),
        Some((path, Err(reason))) => {
            warn!(repository = repo, path = %path, %reason, "Quarantining undecodable record");
            conn_quarantine(conn, repo, &path)?;
            Err(SyncError::LocalStoreCorruption { path, reason })
        }
    }
}

/// Load a record, quarantining it first if it does not decode.
fn conn_load_repaired(conn: &Connection, repo: &str, path: &str) -> Result<Option<FileRecord>> {
    match conn_load(conn, repo, path) {
        Err(SyncError::LocalStoreCorruption { .. }) => conn_load(conn, repo, path),
        other => other,
    }
}

fn conn_list(conn: &Connection, repo: &str, filter: &str) -> Result<Vec<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files WHERE repository=?1 {} ORDER BY path",
        RECORD_COLUMNS, filter
    );
    let rows: Vec<DecodedRow> = {
        let mut stmt = conn.prepare_cached(&sql)?;
        let mapped = stmt.query_map(params![repo], |r| decode_row(repo, r))?;
        mapped.collect::<rusqlite::Result<_>>()?
    };

    let mut records = Vec::with_capacity(rows.len());
    for (path, decoded) in rows {
        match decoded {
            Ok(record) => records.push(record),
            Err(reason) => {
                warn!(repository = repo, path = %path, %reason, "Quarantining undecodable record");
                conn_quarantine(conn, repo, &path)?;
            }
        }
    }
    Ok(records)
}

fn conn_upsert(conn: &Connection, record: &FileRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO files (repository,path,content,origin_sha,dirty_state,deleted_from,updated_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7) \
         ON CONFLICT(repository,path) DO UPDATE SET content=excluded.content, \
         origin_sha=excluded.origin_sha, dirty_state=excluded.dirty_state, \
         deleted_from=excluded.deleted_from, updated_at=excluded.updated_at",
        params![
            record.repository,
            record.path,
            record.content.as_deref().map(str::as_bytes),
            record.origin_blob_sha,
            record.dirty_state.as_str(),
            record.deleted_from.map(|s| s.as_str()),
            record.updated_at,
        ],
    )?;
    Ok(())
}

fn conn_delete(conn: &Connection, repo: &str, path: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM files WHERE repository=?1 AND path=?2",
        params![repo, path],
    )?;
    Ok(n > 0)
}

fn conn_save_state(conn: &Connection, state: &RepositorySyncState) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (repository,tree_sha,commit_sha,last_sync) VALUES (?1,?2,?3,?4) \
         ON CONFLICT(repository) DO UPDATE SET tree_sha=excluded.tree_sha, \
         commit_sha=excluded.commit_sha, last_sync=excluded.last_sync",
        params![
            state.repository,
            state.last_known_tree_sha,
            state.last_commit_sha,
            state.last_sync_timestamp,
        ],
    )?;
    Ok(())
}

fn conn_replace_baseline(conn: &Connection, repo: &str, baseline: &BaselineIndex) -> Result<()> {
    conn.execute("DELETE FROM baseline_entries WHERE repository=?1", params![repo])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO baseline_entries (repository,path,sha,mode,size) VALUES (?1,?2,?3,?4,?5)",
    )?;
    for (path, entry) in baseline {
        stmt.execute(params![repo, path, entry.sha, entry.mode, entry.size.map(|s| s as i64)])?;
    }
    Ok(())
}

fn conn_apply_update(conn: &Connection, repo: &str, update: &RecordUpdate) -> Result<()> {
    match update {
        RecordUpdate::Purge(path) => {
            conn_delete(conn, repo, path)?;
        }
        RecordUpdate::MarkCreated(path) => {
            conn.execute(
                "UPDATE files SET dirty_state=?3, origin_sha=NULL, deleted_from=NULL, updated_at=?4 \
                 WHERE repository=?1 AND path=?2",
                params![repo, path, DirtyState::CreatedLocally.as_str(), now()],
            )?;
        }
        RecordUpdate::MarkStale { path, drop_content } => {
            conn.execute(
                "UPDATE files SET dirty_state=?3, deleted_from=NULL, updated_at=?4, \
                 content=CASE WHEN ?5 THEN NULL ELSE content END \
                 WHERE repository=?1 AND path=?2",
                params![repo, path, DirtyState::ChangedRemotely.as_str(), now(), drop_content],
            )?;
        }
        RecordUpdate::AdoptOrigin { path, origin_sha } => {
            conn.execute(
                "UPDATE files SET origin_sha=?3, updated_at=?4, \
                 dirty_state=CASE dirty_state WHEN 'created' THEN 'modified' ELSE dirty_state END \
                 WHERE repository=?1 AND path=?2",
                params![repo, path, origin_sha, now()],
            )?;
        }
        RecordUpdate::MarkClean { path, origin_sha } => {
            conn.execute(
                "UPDATE files SET dirty_state=?3, origin_sha=?4, deleted_from=NULL, updated_at=?5 \
                 WHERE repository=?1 AND path=?2",
                params![repo, path, DirtyState::Clean.as_str(), origin_sha, now()],
            )?;
        }
    }
    Ok(())
}

/// Fold one committed operation into the cache.
fn conn_fold_commit(conn: &Connection, repo: &str, op: &CommitOperation) -> Result<()> {
    let content = match &op.action {
        CommitAction::Delete => {
            conn_delete(conn, repo, &op.path)?;
            return Ok(());
        }
        CommitAction::Create(c) | CommitAction::Update(c) => c,
    };
    let committed_sha = blob_sha(content);

    let record = match conn_load_repaired(conn, repo, &op.path)? {
        Some(mut record) => {
            // Edits made after the plan was taken stay dirty on top of the new blob.
            let unchanged = record.content.as_deref() == Some(content.as_str());
            record.dirty_state = if unchanged {
                DirtyState::Clean
            } else {
                DirtyState::ModifiedLocally
            };
            record.origin_blob_sha = Some(committed_sha);
            record.deleted_from = None;
            record.updated_at = now();
            record
        }
        None => FileRecord {
            path: op.path.clone(),
            repository: repo.to_string(),
            content: Some(content.clone()),
            origin_blob_sha: Some(committed_sha),
            dirty_state: DirtyState::Clean,
            deleted_from: None,
            updated_at: now(),
        },
    };
    conn_upsert(conn, &record)
}

// ─────────────────────────────────────────────────────
// Public store
// ─────────────────────────────────────────────────────

/// Durable local cache shared by every repository session.
pub struct ContentStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl ContentStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = configure(Connection::open(path)?)?;
        debug!(path = %path.display(), "Opened content store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Non-durable store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = configure(Connection::open_in_memory()?)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Records ====================

    /// Whether a live (non-tombstoned) record exists.
    pub fn exists(&self, path: &str, repo: &str) -> Result<bool> {
        Ok(self.get(path, repo)?.is_some_and(|r| !r.is_deleted()))
    }

    /// Cached content of a live record. Never touches the remote.
    pub fn read(&self, path: &str, repo: &str) -> Result<Option<String>> {
        Ok(self
            .get(path, repo)?
            .filter(|r| !r.is_deleted())
            .and_then(|r| r.content))
    }

    /// Full record, tombstones included.
    pub fn get(&self, path: &str, repo: &str) -> Result<Option<FileRecord>> {
        conn_load(&self.conn(), repo, path)
    }

    /// Store a local edit and advance the dirty state.
    pub fn write(&self, path: &str, repo: &str, content: &str) -> Result<FileRecord> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = conn_load_repaired(&tx, repo, path)?;

        let record = match existing {
            None => FileRecord {
                path: path.to_string(),
                repository: repo.to_string(),
                content: Some(content.to_string()),
                origin_blob_sha: None,
                dirty_state: DirtyState::CreatedLocally,
                deleted_from: None,
                updated_at: now(),
            },
            Some(prev) => {
                // Writing to a tombstone revives it first.
                let base = match prev.dirty_state {
                    DirtyState::DeletedLocally => {
                        prev.deleted_from.unwrap_or(DirtyState::ModifiedLocally)
                    }
                    state => state,
                };
                let dirty_state = match base {
                    DirtyState::CreatedLocally if prev.origin_blob_sha.is_none() => {
                        DirtyState::CreatedLocally
                    }
                    _ => DirtyState::ModifiedLocally,
                };
                FileRecord {
                    content: Some(content.to_string()),
                    dirty_state,
                    deleted_from: None,
                    updated_at: now(),
                    ..prev
                }
            }
        };

        conn_upsert(&tx, &record)?;
        tx.commit()?;
        debug!(repository = repo, path, state = record.dirty_state.as_str(), "Wrote file");
        Ok(record)
    }

    /// Cache remote content as a clean record.
    pub fn cache_remote(&self, path: &str, repo: &str, content: &str, blob_sha: &str) -> Result<()> {
        let record = FileRecord {
            path: path.to_string(),
            repository: repo.to_string(),
            content: Some(content.to_string()),
            origin_blob_sha: Some(blob_sha.to_string()),
            dirty_state: DirtyState::Clean,
            deleted_from: None,
            updated_at: now(),
        };
        conn_upsert(&self.conn(), &record)
    }

    /// Track a remote file that has not been pulled. No-op if a record exists.
    pub fn track_remote(&self, path: &str, repo: &str, blob_sha: &str) -> Result<bool> {
        let n = self.conn().execute(
            "INSERT INTO files (repository,path,content,origin_sha,dirty_state,deleted_from,updated_at) \
             VALUES (?1,?2,NULL,?3,?4,NULL,?5) ON CONFLICT(repository,path) DO NOTHING",
            params![repo, path, blob_sha, DirtyState::Clean.as_str(), now()],
        )?;
        Ok(n > 0)
    }

    /// Tombstone a record. A record created locally is purged outright.
    ///
    /// Returns `false` when no record exists.
    pub fn mark_deleted(&self, path: &str, repo: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(record) = conn_load_repaired(&tx, repo, path)? else {
            return Ok(false);
        };

        match record.dirty_state {
            DirtyState::CreatedLocally => {
                conn_delete(&tx, repo, path)?;
            }
            DirtyState::DeletedLocally => {}
            prior => {
                tx.execute(
                    "UPDATE files SET dirty_state=?3, deleted_from=?4, updated_at=?5 \
                     WHERE repository=?1 AND path=?2",
                    params![repo, path, DirtyState::DeletedLocally.as_str(), prior.as_str(), now()],
                )?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Undo a tombstone. Returns `false` when the path is not tombstoned.
    pub fn unmark_deleted(&self, path: &str, repo: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = match conn_load_repaired(&tx, repo, path)? {
            Some(r) if r.is_deleted() => r,
            _ => return Ok(false),
        };

        let restored = match record.deleted_from {
            Some(prior) => prior,
            None => match (&record.content, &record.origin_blob_sha) {
                (Some(content), Some(origin)) if blob_sha(content) == *origin => DirtyState::Clean,
                (Some(_), Some(_)) => DirtyState::ModifiedLocally,
                (None, _) => DirtyState::ChangedRemotely,
                (Some(_), None) => DirtyState::CreatedLocally,
            },
        };
        // A clean record must match its origin; the origin may have moved on
        // while the path was tombstoned.
        let behind = restored == DirtyState::Clean
            && match (&record.content, &record.origin_blob_sha) {
                (Some(content), Some(origin)) => blob_sha(content) != *origin,
                _ => false,
            };
        if behind {
            debug!(repository = repo, path, "Restored copy is behind its origin, flagged for re-pull");
            conn_apply_update(
                &tx,
                repo,
                &RecordUpdate::MarkStale {
                    path: path.to_string(),
                    drop_content: true,
                },
            )?;
        } else {
            tx.execute(
                "UPDATE files SET dirty_state=?3, deleted_from=NULL, updated_at=?4 \
                 WHERE repository=?1 AND path=?2",
                params![repo, path, restored.as_str(), now()],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Every record of a repository, tombstones included, ordered by path.
    pub fn list(&self, repo: &str) -> Result<Vec<FileRecord>> {
        conn_list(&self.conn(), repo, "")
    }

    /// Records whose state is not clean.
    pub fn list_dirty(&self, repo: &str) -> Result<Vec<FileRecord>> {
        conn_list(&self.conn(), repo, "AND dirty_state <> 'clean'")
    }

    /// Tombstoned records.
    pub fn list_deleted(&self, repo: &str) -> Result<Vec<FileRecord>> {
        conn_list(&self.conn(), repo, "AND dirty_state = 'deleted'")
    }

    /// Permanently remove a record.
    pub fn purge(&self, path: &str, repo: &str) -> Result<bool> {
        conn_delete(&self.conn(), repo, path)
    }

    /// Mark every local edit as committed: created/modified records become
    /// clean at the blob SHA of their content, tombstones are purged.
    pub fn clear_all_dirty(&self, repo: &str) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let dirty = conn_list(
            &tx,
            repo,
            "AND dirty_state IN ('created','modified','deleted')",
        )?;

        for record in &dirty {
            match (&record.dirty_state, &record.content) {
                (DirtyState::DeletedLocally, _) => {
                    conn_delete(&tx, repo, &record.path)?;
                }
                (_, Some(content)) => {
                    tx.execute(
                        "UPDATE files SET dirty_state=?3, origin_sha=?4, deleted_from=NULL, \
                         updated_at=?5 WHERE repository=?1 AND path=?2",
                        params![repo, record.path, DirtyState::Clean.as_str(), blob_sha(content), now()],
                    )?;
                }
                (_, None) => {
                    conn_apply_update(
                        &tx,
                        repo,
                        &RecordUpdate::MarkStale {
                            path: record.path.clone(),
                            drop_content: true,
                        },
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(dirty.len())
    }

    // ==================== Sync state & baseline ====================

    pub fn sync_state(&self, repo: &str) -> Result<Option<RepositorySyncState>> {
        let state = self
            .conn()
            .query_row(
                "SELECT tree_sha, commit_sha, last_sync FROM sync_state WHERE repository=?1",
                params![repo],
                |r| {
                    Ok(RepositorySyncState {
                        repository: repo.to_string(),
                        last_known_tree_sha: r.get(0)?,
                        last_commit_sha: r.get(1)?,
                        last_sync_timestamp: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Baseline index of the last reconciled tree.
    pub fn baseline(&self, repo: &str) -> Result<BaselineIndex> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT path, sha, mode, size FROM baseline_entries WHERE repository=?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![repo], |r| {
            let size: Option<i64> = r.get(3)?;
            Ok((
                r.get::<_, String>(0)?,
                BaselineEntry {
                    sha: r.get(1)?,
                    mode: r.get(2)?,
                    size: size.map(|s| s as u64),
                },
            ))
        })?;
        let mut index = BaselineIndex::new();
        for row in rows {
            let (path, entry) = row?;
            index.insert(path, entry);
        }
        Ok(index)
    }

    /// Blob SHA of one path in the baseline.
    pub fn baseline_sha(&self, repo: &str, path: &str) -> Result<Option<String>> {
        let sha = self
            .conn()
            .query_row(
                "SELECT sha FROM baseline_entries WHERE repository=?1 AND path=?2",
                params![repo, path],
                |r| r.get(0),
            )
            .optional()?;
        Ok(sha)
    }

    /// Apply a finished reconciliation pass: record updates, new baseline and
    /// advanced sync state land together or not at all.
    pub fn apply_reconciliation(
        &self,
        state: &RepositorySyncState,
        updates: &[RecordUpdate],
        baseline: &BaselineIndex,
    ) -> Result<()> {
        let repo = state.repository.as_str();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for update in updates {
            conn_apply_update(&tx, repo, update)?;
        }
        conn_replace_baseline(&tx, repo, baseline)?;
        conn_save_state(&tx, state)?;
        tx.commit()?;
        Ok(())
    }

    /// Fold a successful commit into the cache and advance the sync state.
    pub fn apply_commit(
        &self,
        state: &RepositorySyncState,
        operations: &[CommitOperation],
        baseline: &BaselineIndex,
    ) -> Result<()> {
        let repo = state.repository.as_str();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for op in operations {
            conn_fold_commit(&tx, repo, op)?;
        }
        conn_replace_baseline(&tx, repo, baseline)?;
        conn_save_state(&tx, state)?;
        tx.commit()?;
        Ok(())
    }

    /// Repositories with any cached data.
    pub fn repositories(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT repository FROM files UNION SELECT repository FROM sync_state ORDER BY 1",
        )?;
        let repos = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(repos)
    }

    /// Drop every record, the baseline and the sync state of a repository.
    pub fn clear_repository(&self, repo: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM files WHERE repository=?1", params![repo])?;
        tx.execute("DELETE FROM baseline_entries WHERE repository=?1", params![repo])?;
        tx.execute("DELETE FROM sync_state WHERE repository=?1", params![repo])?;
        tx.commit()?;
        Ok(())
    }
}
