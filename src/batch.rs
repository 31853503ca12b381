//! Save batch: one staged version routed into shard and leaf tables.

use rusqlite::{params, Connection};

use crate::db::{create_shard_sql, insert_branch_sql};
use crate::error::Error;
use crate::node::{DeletedLeaf, Node, NodeKey, Orphan};
use crate::options::DbOptions;
use crate::version::VersionRange;

/// One staged version handed over by the in-memory tree engine.
///
/// Branches and leaves are the nodes produced by the version's mutations;
/// orphan records are the obligations to later delete nodes the mutations
/// made unreachable; `deletes` are tombstones for explicitly removed leaves.
#[derive(Debug, Clone)]
pub struct VersionCommit {
    /// The version being committed.
    pub version: i64,
    /// Root node key, or `None` for an empty tree.
    pub root: Option<NodeKey>,
    /// Interior nodes produced by this version.
    pub branches: Vec<Node>,
    /// Leaf nodes produced by this version.
    pub leaves: Vec<Node>,
    /// Branch orphan records produced by this version.
    pub orphans: Vec<Orphan>,
    /// Leaf orphan records produced by this version.
    pub leaf_orphans: Vec<Orphan>,
    /// Tombstones for leaves explicitly deleted by this version.
    pub deletes: Vec<DeletedLeaf>,
}

impl VersionCommit {
    /// An empty commit for `version`.
    pub fn new(version: i64) -> Self {
        Self {
            version,
            root: None,
            branches: Vec::new(),
            leaves: Vec::new(),
            orphans: Vec::new(),
            leaf_orphans: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

/// A staged version bound to its shard routing snapshot, consumed once by
/// each writer: the branch writer calls [`save_branches`](Self::save_branches),
/// the leaf writer [`save_leaves`](Self::save_leaves).
///
/// The batch reports [`is_checkpoint`](Self::is_checkpoint) but never
/// decides checkpoint policy.
#[derive(Debug)]
pub(crate) struct SaveBatch {
    version: i64,
    branches: Vec<Node>,
    leaves: Vec<Node>,
    orphans: Vec<Orphan>,
    leaf_orphans: Vec<Orphan>,
    deletes: Vec<DeletedLeaf>,
    shards: VersionRange,
    checkpoint: bool,
    store_latest_leaves: bool,
    size: usize,
}

impl SaveBatch {
    pub(crate) fn new(
        commit: VersionCommit,
        shards: VersionRange,
        checkpoint: bool,
        opts: &DbOptions,
    ) -> Self {
        Self {
            version: commit.version,
            branches: commit.branches,
            leaves: commit.leaves,
            orphans: commit.orphans,
            leaf_orphans: commit.leaf_orphans,
            deletes: commit.deletes,
            shards,
            checkpoint,
            store_latest_leaves: opts.store_latest_leaves,
            size: opts.save_batch_size.max(1),
        }
    }

    /// Whether this save establishes a new checkpoint (and shard table).
    pub(crate) fn is_checkpoint(&self) -> bool {
        self.checkpoint
    }

    /// Insert branch rows into their shard tables and orphan records into
    /// `orphan`, in sub-transactions of `size` rows.
    ///
    /// When the connection is already inside a transaction (the branch
    /// writer mid-prune), the rows join that transaction and no transaction
    /// boundaries are issued here; durability then rides on the next prune
    /// sub-commit.
    pub(crate) fn save_branches(&self, conn: &Connection) -> Result<i64, Error> {
        let owns_tx = conn.is_autocommit();
        if owns_tx {
            conn.execute_batch("BEGIN")?;
        }
        let result = self.insert_branches(conn, owns_tx);
        match &result {
            Ok(_) => {
                if owns_tx {
                    conn.execute_batch("COMMIT")?;
                }
            }
            Err(_) => {
                if owns_tx {
                    // leave the loop outside any transaction for the next signal
                    let _ = conn.execute_batch("ROLLBACK");
                }
            }
        }
        result
    }

    fn insert_branches(&self, conn: &Connection, owns_tx: bool) -> Result<i64, Error> {
        if self.checkpoint {
            conn.execute_batch(&create_shard_sql(self.version))?;
        }
        let mut count: i64 = 0;
        for node in &self.branches {
            let version = node.node_key.version();
            let shard = self
                .shards
                .find_previous(version)
                .ok_or(Error::MissingShard(version))?;
            let bytes = node.to_bytes()?;
            {
                let mut stmt = conn.prepare_cached(&insert_branch_sql(shard))?;
                stmt.execute(params![version, node.node_key.sequence(), bytes])?;
            }
            count += 1;
            self.maybe_rotate(conn, owns_tx, count)?;
        }
        for orphan in &self.orphans {
            {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO orphan (version, sequence, at) VALUES (?1, ?2, ?3)",
                )?;
                stmt.execute(params![orphan.version, orphan.sequence, orphan.at])?;
            }
            count += 1;
            self.maybe_rotate(conn, owns_tx, count)?;
        }
        Ok(count)
    }

    /// Insert leaf rows, leaf orphan records, and deletion tombstones, in
    /// sub-transactions of `size` rows; maintains the `latest` projection
    /// when enabled.
    pub(crate) fn save_leaves(&self, conn: &Connection) -> Result<i64, Error> {
        let owns_tx = conn.is_autocommit();
        if owns_tx {
            conn.execute_batch("BEGIN")?;
        }
        let result = self.insert_leaves(conn, owns_tx);
        match &result {
            Ok(_) => {
                if owns_tx {
                    conn.execute_batch("COMMIT")?;
                }
            }
            Err(_) => {
                if owns_tx {
                    let _ = conn.execute_batch("ROLLBACK");
                }
            }
        }
        result
    }

    fn insert_leaves(&self, conn: &Connection, owns_tx: bool) -> Result<i64, Error> {
        let mut count: i64 = 0;
        for node in &self.leaves {
            let bytes = node.to_bytes()?;
            {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO leaf (version, sequence, bytes) VALUES (?1, ?2, ?3)",
                )?;
                stmt.execute(params![
                    node.node_key.version(),
                    node.node_key.sequence(),
                    bytes
                ])?;
            }
            if self.store_latest_leaves {
                let value = node.value.as_deref().ok_or_else(|| {
                    Error::NodeEncode(format!("leaf {} without value", node.node_key))
                })?;
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO latest (key, value) VALUES (?1, ?2)",
                )?;
                stmt.execute(params![node.key, value])?;
            }
            count += 1;
            self.maybe_rotate(conn, owns_tx, count)?;
        }
        for orphan in &self.leaf_orphans {
            {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO leaf_orphan (version, sequence, at) VALUES (?1, ?2, ?3)",
                )?;
                stmt.execute(params![orphan.version, orphan.sequence, orphan.at])?;
            }
            count += 1;
            self.maybe_rotate(conn, owns_tx, count)?;
        }
        for delete in &self.deletes {
            {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO leaf_delete (version, sequence, key) VALUES (?1, ?2, ?3)",
                )?;
                stmt.execute(params![delete.version, delete.sequence, delete.key])?;
            }
            if self.store_latest_leaves {
                let mut stmt = conn.prepare_cached("DELETE FROM latest WHERE key = ?1")?;
                stmt.execute(params![delete.key])?;
            }
            count += 1;
            self.maybe_rotate(conn, owns_tx, count)?;
        }
        Ok(count)
    }

    /// Commit the current sub-transaction and begin the next once `size`
    /// rows have accumulated. Only when this batch owns the transaction.
    fn maybe_rotate(&self, conn: &Connection, owns_tx: bool, count: i64) -> Result<(), Error> {
        if owns_tx && count as usize % self.size == 0 {
            conn.execute_batch("COMMIT")?;
            conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }
}
