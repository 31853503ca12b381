//! Store configuration.

use std::path::{Path, PathBuf};

/// Default number of versions between checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: i64 = 100;

/// Default soft row threshold per inner save transaction.
pub const DEFAULT_SAVE_BATCH_SIZE: usize = 200_000;

/// Default number of rows deleted per prune sub-transaction.
pub const DEFAULT_PRUNE_BATCH_SIZE: u64 = 500_000;

/// Default number of orphan rows fetched per cooperative prune step.
pub const DEFAULT_PRUNE_STEP_ROWS: usize = 1_000;

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Directory holding the tree and leaf database files.
    pub path: PathBuf,
    /// A committed version becomes a checkpoint once it is at least this far
    /// past the previous checkpoint. The first committed version is always a
    /// checkpoint so that shard routing is total.
    pub checkpoint_interval: i64,
    /// Soft row threshold per inner save transaction; a crash loses at most
    /// one inner transaction of rows.
    pub save_batch_size: usize,
    /// Rows deleted per prune sub-transaction; each sub-transaction commit
    /// is followed by a WAL checkpoint of kind RESTART.
    pub prune_batch_size: u64,
    /// Orphan rows fetched per cooperative prune step. Smaller values yield
    /// to save and prune signals more often.
    pub prune_step_rows: usize,
    /// Maintain the `latest` key-to-value projection alongside leaf rows.
    pub store_latest_leaves: bool,
}

impl DbOptions {
    /// Options with defaults for a store rooted at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            save_batch_size: DEFAULT_SAVE_BATCH_SIZE,
            prune_batch_size: DEFAULT_PRUNE_BATCH_SIZE,
            prune_step_rows: DEFAULT_PRUNE_STEP_ROWS,
            store_latest_leaves: false,
        }
    }

    /// Set the checkpoint interval.
    pub fn with_checkpoint_interval(mut self, interval: i64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the soft row threshold per inner save transaction.
    pub fn with_save_batch_size(mut self, size: usize) -> Self {
        self.save_batch_size = size;
        self
    }

    /// Set the rows deleted per prune sub-transaction.
    pub fn with_prune_batch_size(mut self, size: u64) -> Self {
        self.prune_batch_size = size;
        self
    }

    /// Set the orphan rows fetched per cooperative prune step.
    pub fn with_prune_step_rows(mut self, rows: usize) -> Self {
        self.prune_step_rows = rows;
        self
    }

    /// Enable or disable the `latest` leaf projection.
    pub fn with_store_latest_leaves(mut self, enabled: bool) -> Self {
        self.store_latest_leaves = enabled;
        self
    }

    /// Path of the tree database file.
    pub(crate) fn tree_path(&self) -> PathBuf {
        self.path.join("tree.sqlite")
    }

    /// Path of the leaf database file.
    pub(crate) fn leaf_path(&self) -> PathBuf {
        self.path.join("leaf.sqlite")
    }
}
