//! InkStone Core Library
//!
//! Local-first cache and sync engine for text files kept in a hosted Git
//! repository:
//! - Git-compatible object hashing (blob, tree, commit)
//! - SQLite content store with per-path dirty tracking (WAL mode)
//! - Remote tree port and an in-memory remote
//! - Reconciliation against the remote tree with pluggable conflict resolution
//! - Commit planning and batching
//! - Per-repository sessions

pub mod config;
pub mod error;
pub mod file_tree;
pub mod memory_remote;
pub mod object;
pub mod planner;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod store;
pub mod sync_state;

pub use config::EngineConfig;
pub use error::{Result, SyncError};
pub use file_tree::{TreeNode, build_file_tree};
pub use memory_remote::{MemoryRemote, RemoteStep};
pub use object::{
    BaselineEntry, BaselineIndex, CommitAction, CommitOperation, CommitReceipt, ObjectId,
    ObjectKind, RemoteTreeEntry, RepoId, TreeSnapshot, blob_sha, normalize_path,
};
pub use planner::{CommitOutcome, plan, plan_and_commit};
pub use reconcile::{
    Conflict, ConflictKind, ConflictResolver, FixedResolver, ReconcileReport, RemoteChanges,
    Resolution, reconcile,
};
pub use remote::{Freshness, RemoteStore};
pub use session::{Engine, FileEntry, RepoSession, SessionStatus};
pub use store::{ContentStore, DirtyState, FileRecord, RecordUpdate};
pub use sync_state::{RepositorySyncState, SyncPhase};
