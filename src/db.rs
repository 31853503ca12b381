//! Store front door: database files, schema, and the public write surface.
//!
//! A store is a directory with two SQLite files. The *tree* database holds
//! version-sharded branch tables, the `orphan` queue, and the `root` index;
//! the *leaf* database holds the unsharded `leaf` table, its orphan queue,
//! deletion tombstones, and the optional `latest` projection. Each file is
//! written by exactly one writer thread; readers open their own connections
//! and observe committed data only.

use std::fs;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::batch::{SaveBatch, VersionCommit};
use crate::error::Error;
use crate::metrics::WriteMetrics;
use crate::node::NodeKey;
use crate::options::DbOptions;
use crate::version::VersionRange;
use crate::writer::Writer;

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A versioned, authenticated key-value store's persistent write path.
///
/// `commit` blocks until both writers have acknowledged the version;
/// `prune` returns immediately and the writers reclaim space cooperatively
/// between commits.
pub struct Db {
    opts: DbOptions,
    checkpoints: VersionRange,
    last_version: i64,
    writer: Writer,
    metrics: WriteMetrics,
}

impl Db {
    /// Open (or create) the store at `opts.path` and start both writer
    /// threads.
    pub fn open(opts: DbOptions) -> Result<Self, Error> {
        fs::create_dir_all(&opts.path)?;

        let tree = Connection::open(opts.tree_path())?;
        configure(&tree)?;
        create_tree_schema(&tree)?;

        let leaf = Connection::open(opts.leaf_path())?;
        configure(&leaf)?;
        create_leaf_schema(&leaf)?;

        let checkpoints = load_checkpoints(&tree)?;
        let last_version = load_last_version(&tree)?;
        debug!(
            path = %opts.path.display(),
            last_version,
            checkpoints = checkpoints.len(),
            "opened store"
        );

        let writer = Writer::start(tree, leaf, &opts);
        Ok(Self {
            opts,
            checkpoints,
            last_version,
            writer,
            metrics: WriteMetrics::default(),
        })
    }

    /// Durably commit one staged version.
    ///
    /// Fans the save out to both writers and blocks until each has
    /// acknowledged; returns the total row count written. The in-memory
    /// checkpoint set advances only when both writers succeeded.
    pub fn commit(&mut self, commit: VersionCommit) -> Result<i64, Error> {
        let version = commit.version;
        let root = commit.root;
        let leaves = commit.leaves.len() as i64;
        let branches = commit.branches.len() as i64;

        let want_checkpoint = self.should_checkpoint(version);
        let mut shards = self.checkpoints.clone();
        if want_checkpoint {
            shards.add(version);
        }
        let batch = SaveBatch::new(commit, shards.clone(), want_checkpoint, &self.opts);

        let start = Instant::now();
        let count = self.writer.save(batch, root, version, want_checkpoint)?;
        self.metrics.record(start.elapsed(), leaves, branches);

        self.checkpoints = shards;
        self.last_version = version;
        Ok(count)
    }

    /// Request asynchronous pruning of rows orphaned at or before `version`.
    ///
    /// Branch pruning advances to `version` itself; leaf pruning only to the
    /// greatest checkpoint at or below it. If a prune is already running the
    /// writers finish the current cursor first and then restart against the
    /// newer target.
    pub fn prune(&self, version: i64) -> Result<(), Error> {
        self.writer.prune(version, self.checkpoints.clone())
    }

    /// The most recently committed version, or 0 for an empty store.
    pub fn latest_version(&self) -> i64 {
        self.last_version
    }

    /// The current checkpoint set.
    pub fn checkpoints(&self) -> &VersionRange {
        &self.checkpoints
    }

    /// Write-path metrics recorded so far.
    pub fn metrics(&self) -> &WriteMetrics {
        &self.metrics
    }

    /// The root node key recorded for `version`, if the version exists.
    ///
    /// The outer `Option` distinguishes a missing version from a committed
    /// empty tree (`Some(None)`).
    pub fn root_key(&self, version: i64) -> Result<Option<Option<NodeKey>>, Error> {
        let conn = self.tree_reader()?;
        let row: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT node_key FROM root WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(None) => Ok(Some(None)),
            Some(Some(bytes)) => Ok(Some(Some(NodeKey::from_bytes(&bytes)?))),
        }
    }

    /// Open a fresh read connection to the tree database.
    pub fn tree_reader(&self) -> Result<Connection, Error> {
        let conn = Connection::open(self.opts.tree_path())?;
        configure(&conn)?;
        Ok(conn)
    }

    /// Open a fresh read connection to the leaf database.
    pub fn leaf_reader(&self) -> Result<Connection, Error> {
        let conn = Connection::open(self.opts.leaf_path())?;
        configure(&conn)?;
        Ok(conn)
    }

    /// Stop both writers and wait for them to exit. In-flight prune
    /// sub-transactions are rolled back when the connections close.
    pub fn close(self) -> Result<(), Error> {
        self.writer.shutdown()
    }

    fn should_checkpoint(&self, version: i64) -> bool {
        match self.checkpoints.last() {
            // the first committed version opens the first shard
            None => true,
            Some(last) => version - last >= self.opts.checkpoint_interval,
        }
    }
}

/// Apply connection-wide pragmas: WAL journaling and a busy timeout.
pub(crate) fn configure(conn: &Connection) -> Result<(), Error> {
    pragma(conn, "PRAGMA journal_mode=WAL")?;
    pragma(conn, "PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Execute a pragma, tolerating both row-reporting and silent pragmas.
fn pragma(conn: &Connection, sql: &str) -> Result<(), rusqlite::Error> {
    conn.query_row(sql, [], |_row| Ok(())).optional()?;
    Ok(())
}

/// Flush the write-ahead log. `mode` is `RESTART` or `TRUNCATE`; must be
/// issued outside an open transaction.
pub(crate) fn wal_checkpoint(conn: &Connection, mode: &str) -> Result<(), Error> {
    // wal_checkpoint reports a (busy, log, checkpointed) row
    conn.query_row(&format!("PRAGMA wal_checkpoint({mode})"), [], |_row| Ok(()))?;
    Ok(())
}

pub(crate) fn create_tree_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS root (
            version    INTEGER PRIMARY KEY,
            node_key   BLOB,
            checkpoint INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS orphan (
            version  INTEGER NOT NULL,
            sequence INTEGER NOT NULL,
            at       INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS orphan_at_idx ON orphan (at);",
    )?;
    Ok(())
}

pub(crate) fn create_leaf_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS leaf (
            version  INTEGER,
            sequence INTEGER,
            bytes    BLOB NOT NULL,
            PRIMARY KEY (version, sequence)
        );
        CREATE TABLE IF NOT EXISTS leaf_orphan (
            version  INTEGER NOT NULL,
            sequence INTEGER NOT NULL,
            at       INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS leaf_orphan_at_idx ON leaf_orphan (at);
        CREATE TABLE IF NOT EXISTS leaf_delete (
            version  INTEGER NOT NULL,
            sequence INTEGER NOT NULL,
            key      BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS latest (
            key   BLOB PRIMARY KEY,
            value BLOB NOT NULL
        );",
    )?;
    Ok(())
}

/// DDL for the shard table that begins at checkpoint `version`.
pub(crate) fn create_shard_sql(version: i64) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS tree_{version} (
            version  INTEGER,
            sequence INTEGER,
            bytes    BLOB NOT NULL,
            PRIMARY KEY (version, sequence)
        );"
    )
}

pub(crate) fn insert_branch_sql(shard: i64) -> String {
    format!("INSERT OR REPLACE INTO tree_{shard} (version, sequence, bytes) VALUES (?1, ?2, ?3)")
}

pub(crate) fn delete_branch_sql(shard: i64) -> String {
    format!("DELETE FROM tree_{shard} WHERE version = ?1 AND sequence = ?2")
}

/// Upsert the `root` row for `version`.
pub(crate) fn save_root(
    conn: &Connection,
    version: i64,
    root: Option<NodeKey>,
    checkpoint: bool,
) -> Result<(), Error> {
    let node_key: Option<Vec<u8>> = root.map(|nk| nk.to_bytes().to_vec());
    conn.execute(
        "INSERT OR REPLACE INTO root (version, node_key, checkpoint) VALUES (?1, ?2, ?3)",
        params![version, node_key, checkpoint],
    )?;
    Ok(())
}

/// Load the checkpoint set from the `root` table.
fn load_checkpoints(conn: &Connection) -> Result<VersionRange, Error> {
    let mut stmt =
        conn.prepare("SELECT version FROM root WHERE checkpoint != 0 ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(VersionRange::from_versions(versions))
}

/// Load the greatest committed version, or 0 for an empty store.
fn load_last_version(conn: &Connection) -> Result<i64, Error> {
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM root", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}
