//! Dual-writer save and prune engine.
//!
//! Two long-lived threads each own one database connection: the branch
//! writer persists interior nodes into version-sharded tables and prunes
//! orphaned branches; the leaf writer persists leaf rows and prunes
//! orphaned leaves at checkpoint boundaries. The commit coordinator fans a
//! single save signal out to both writers over rendezvous channels and
//! waits for both results; the prune dispatcher publishes prune signals and
//! never waits.
//!
//! Within a writer, pruning is cooperative: while a prune is in progress
//! the loop takes one bounded prune step whenever no save, prune, or cancel
//! signal is pending. A prune may be interrupted by saves, retargeted by a
//! newer prune signal, or cancelled outright; its sub-transactions make
//! progress durable in `prune_batch_size` slices, each followed by a WAL
//! checkpoint of kind RESTART.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use rusqlite::{params, Connection};
use tracing::{debug, error, warn};

use crate::batch::SaveBatch;
use crate::db::{delete_branch_sql, save_root, wal_checkpoint};
use crate::error::{self, Error};
use crate::node::NodeKey;
use crate::options::DbOptions;
use crate::version::VersionRange;

/// One save, fanned out to both writers. The batch is shared; each writer
/// consumes only its half.
struct SaveSignal {
    batch: Arc<SaveBatch>,
    root: Option<NodeKey>,
    version: i64,
    want_checkpoint: bool,
}

/// A prune request: target version plus the checkpoint set it was issued
/// under.
struct PruneSignal {
    prune_version: i64,
    checkpoints: VersionRange,
}

/// Per-writer outcome of one save signal.
struct SaveResult {
    count: i64,
    err: Option<Error>,
}

/// What a writer loop observed at its suspension point.
enum LoopEvent {
    Save(SaveSignal),
    Prune(PruneSignal),
    Cancel,
    /// Nothing pending while pruning: take one prune step.
    Step,
}

/// Wait for the next signal. While pruning, a non-blocking select with a
/// default arm drives prune stepping; while idle, the select blocks.
fn next_event(
    save_rx: &Receiver<SaveSignal>,
    prune_rx: &Receiver<PruneSignal>,
    cancel_rx: &Receiver<()>,
    pruning: bool,
) -> LoopEvent {
    if pruning {
        select! {
            recv(save_rx) -> sig => match sig {
                Ok(sig) => LoopEvent::Save(sig),
                Err(_) => LoopEvent::Cancel,
            },
            recv(prune_rx) -> sig => match sig {
                Ok(sig) => LoopEvent::Prune(sig),
                Err(_) => LoopEvent::Cancel,
            },
            recv(cancel_rx) -> _ => LoopEvent::Cancel,
            default => LoopEvent::Step,
        }
    } else {
        select! {
            recv(save_rx) -> sig => match sig {
                Ok(sig) => LoopEvent::Save(sig),
                Err(_) => LoopEvent::Cancel,
            },
            recv(prune_rx) -> sig => match sig {
                Ok(sig) => LoopEvent::Prune(sig),
                Err(_) => LoopEvent::Cancel,
            },
            recv(cancel_rx) -> _ => LoopEvent::Cancel,
        }
    }
}

/// Prune progress owned by one writer. `version == 0` means idle.
struct PruneState {
    version: i64,
    next_version: i64,
    checkpoints: VersionRange,
    count: u64,
    started: Instant,
}

impl PruneState {
    fn idle() -> Self {
        Self {
            version: 0,
            next_version: 0,
            checkpoints: VersionRange::default(),
            count: 0,
            started: Instant::now(),
        }
    }

    fn active(&self) -> bool {
        self.version != 0
    }
}

/// Handle to the two writer threads: the commit coordinator and prune
/// dispatcher live here.
pub(crate) struct Writer {
    tree_save_tx: Sender<SaveSignal>,
    tree_prune_tx: Sender<PruneSignal>,
    tree_result_rx: Receiver<SaveResult>,
    leaf_save_tx: Sender<SaveSignal>,
    leaf_prune_tx: Sender<PruneSignal>,
    leaf_result_rx: Receiver<SaveResult>,
    cancel_tx: Option<Sender<()>>,
    tree_handle: Option<JoinHandle<()>>,
    leaf_handle: Option<JoinHandle<()>>,
}

impl Writer {
    /// Spawn both writer threads, moving the write connections into them.
    pub(crate) fn start(tree: Connection, leaf: Connection, opts: &DbOptions) -> Self {
        let (tree_save_tx, tree_save_rx) = bounded(0);
        let (tree_prune_tx, tree_prune_rx) = bounded(0);
        // capacity 1 so a writer never blocks handing back its result
        let (tree_result_tx, tree_result_rx) = bounded(1);
        let (leaf_save_tx, leaf_save_rx) = bounded(0);
        let (leaf_prune_tx, leaf_prune_rx) = bounded(0);
        let (leaf_result_tx, leaf_result_rx) = bounded(1);
        let (cancel_tx, cancel_rx) = bounded::<()>(0);

        let mut tree_loop = TreeLoop {
            conn: tree,
            save_rx: tree_save_rx,
            prune_rx: tree_prune_rx,
            result_tx: tree_result_tx,
            cancel_rx: cancel_rx.clone(),
            prune: PruneState::idle(),
            prune_batch_size: opts.prune_batch_size.max(1),
            prune_step_rows: opts.prune_step_rows.max(1),
        };
        let tree_handle = thread::Builder::new()
            .name("copse-tree-writer".to_string())
            .spawn(move || {
                if let Err(err) = tree_loop.run() {
                    error!(%err, "tree writer loop failed");
                }
            })
            .expect("failed to spawn tree writer thread");

        let mut leaf_loop = LeafLoop {
            conn: leaf,
            save_rx: leaf_save_rx,
            prune_rx: leaf_prune_rx,
            result_tx: leaf_result_tx,
            cancel_rx,
            prune: PruneState::idle(),
            prune_batch_size: opts.prune_batch_size.max(1),
            prune_step_rows: opts.prune_step_rows.max(1),
        };
        let leaf_handle = thread::Builder::new()
            .name("copse-leaf-writer".to_string())
            .spawn(move || {
                if let Err(err) = leaf_loop.run() {
                    error!(%err, "leaf writer loop failed");
                }
            })
            .expect("failed to spawn leaf writer thread");

        Self {
            tree_save_tx,
            tree_prune_tx,
            tree_result_rx,
            leaf_save_tx,
            leaf_prune_tx,
            leaf_result_rx,
            cancel_tx: Some(cancel_tx),
            tree_handle: Some(tree_handle),
            leaf_handle: Some(leaf_handle),
        }
    }

    /// Commit coordinator: deliver one save to both writers and block until
    /// each has acknowledged. Returns the combined row count, or the joined
    /// error if either writer failed.
    pub(crate) fn save(
        &self,
        batch: SaveBatch,
        root: Option<NodeKey>,
        version: i64,
        want_checkpoint: bool,
    ) -> Result<i64, Error> {
        let batch = Arc::new(batch);
        self.tree_save_tx
            .send(SaveSignal {
                batch: Arc::clone(&batch),
                root,
                version,
                want_checkpoint,
            })
            .map_err(|_| Error::WriterExited)?;
        self.leaf_save_tx
            .send(SaveSignal {
                batch,
                root,
                version,
                want_checkpoint,
            })
            .map_err(|_| Error::WriterExited)?;

        let tree = self
            .tree_result_rx
            .recv()
            .map_err(|_| Error::WriterExited)?;
        let leaf = self
            .leaf_result_rx
            .recv()
            .map_err(|_| Error::WriterExited)?;

        let count = tree.count + leaf.count;
        match error::join(tree.err, leaf.err) {
            None => Ok(count),
            Some(err) => Err(err),
        }
    }

    /// Prune dispatcher: publish the target to both writers. Delivery
    /// blocks only until each writer's next suspension point; completion is
    /// not awaited.
    pub(crate) fn prune(&self, version: i64, checkpoints: VersionRange) -> Result<(), Error> {
        self.tree_prune_tx
            .send(PruneSignal {
                prune_version: version,
                checkpoints: checkpoints.clone(),
            })
            .map_err(|_| Error::WriterExited)?;
        self.leaf_prune_tx
            .send(PruneSignal {
                prune_version: version,
                checkpoints,
            })
            .map_err(|_| Error::WriterExited)?;
        Ok(())
    }

    /// Stop both writers and wait for them to exit.
    pub(crate) fn shutdown(mut self) -> Result<(), Error> {
        self.cancel_tx.take();
        if let Some(handle) = self.tree_handle.take() {
            handle.join().map_err(|_| Error::WriterExited)?;
        }
        if let Some(handle) = self.leaf_handle.take() {
            handle.join().map_err(|_| Error::WriterExited)?;
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // dropping the cancel sender wakes both loops at their next select
        self.cancel_tx.take();
        // unblock a writer stuck handing back a result nobody will read
        let (_tx, dummy) = bounded(1);
        drop(std::mem::replace(&mut self.tree_result_rx, dummy));
        let (_tx, dummy) = bounded(1);
        drop(std::mem::replace(&mut self.leaf_result_rx, dummy));
        if let Some(handle) = self.tree_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.leaf_handle.take() {
            let _ = handle.join();
        }
    }
}

/// The branch writer: owns the tree database connection.
struct TreeLoop {
    conn: Connection,
    save_rx: Receiver<SaveSignal>,
    prune_rx: Receiver<PruneSignal>,
    result_tx: Sender<SaveResult>,
    cancel_rx: Receiver<()>,
    prune: PruneState,
    prune_batch_size: u64,
    prune_step_rows: usize,
}

impl TreeLoop {
    fn run(&mut self) -> Result<(), Error> {
        loop {
            match next_event(
                &self.save_rx,
                &self.prune_rx,
                &self.cancel_rx,
                self.prune.active(),
            ) {
                LoopEvent::Save(sig) => {
                    if self.prune.active() && sig.want_checkpoint {
                        // the WAL truncation inside a checkpoint save must
                        // not run inside the open prune transaction
                        self.commit_prune()?;
                        self.save_tree(&sig);
                        self.begin_prune_batch()?;
                    } else {
                        self.save_tree(&sig);
                    }
                }
                LoopEvent::Prune(sig) => {
                    if self.prune.active() {
                        warn!(
                            current = self.prune.version,
                            next = sig.prune_version,
                            "tree prune signal received while pruning"
                        );
                        self.prune.checkpoints = sig.checkpoints;
                        self.prune.next_version = sig.prune_version;
                    } else {
                        self.prune.checkpoints = sig.checkpoints;
                        self.start_prune(sig.prune_version)?;
                    }
                }
                LoopEvent::Cancel => return Ok(()),
                LoopEvent::Step => self.step_pruning()?,
            }
        }
    }

    /// Execute one save signal; failures are reported in the result, not
    /// returned, so the loop survives transient save errors.
    fn save_tree(&mut self, sig: &SaveSignal) {
        let mut res = SaveResult {
            count: 0,
            err: None,
        };
        match sig.batch.save_branches(&self.conn) {
            Ok(count) => {
                res.count = count;
                if let Err(err) =
                    save_root(&self.conn, sig.version, sig.root, sig.want_checkpoint)
                {
                    res.err = Some(err);
                }
            }
            Err(err) => res.err = Some(err),
        }
        if sig.batch.is_checkpoint() {
            if let Err(err) = wal_checkpoint(&self.conn, "TRUNCATE") {
                res.err = Some(err);
            }
        }
        // a dropped coordinator means shutdown is already in progress
        let _ = self.result_tx.send(res);
    }

    fn start_prune(&mut self, version: i64) -> Result<(), Error> {
        if version <= 0 {
            // version 0 is the idle sentinel
            debug!(version, "skipping tree prune: non-positive target");
            return Ok(());
        }
        debug!(version, "tree prune starting");
        self.prune.version = version;
        self.prune.count = 0;
        self.prune.started = Instant::now();
        self.begin_prune_batch()
    }

    fn begin_prune_batch(&self) -> Result<(), Error> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit_prune(&self) -> Result<(), Error> {
        self.conn.execute_batch("COMMIT")?;
        debug!(count = self.prune.count, "commit tree prune");
        wal_checkpoint(&self.conn, "RESTART")?;
        Ok(())
    }

    /// Delete one bounded chunk of orphans and their branch rows. Deleted
    /// rows no longer match the orphan query, so the scan resumes after the
    /// last processed row across any interruption.
    fn step_pruning(&mut self) -> Result<(), Error> {
        let rows: Vec<(i64, u32, i64)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT version, sequence, rowid FROM orphan WHERE at <= ?1 LIMIT ?2",
            )?;
            let mapped = stmt.query_map(
                params![self.prune.version, self.prune_step_rows as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            mapped.collect::<Result<Vec<_>, _>>()?
        };
        if rows.is_empty() {
            return self.finish_prune();
        }
        for (version, sequence, rowid) in rows {
            let shard = self
                .prune
                .checkpoints
                .find_previous(version)
                .ok_or(Error::MissingShard(version))?;
            {
                let mut stmt = self.conn.prepare_cached(&delete_branch_sql(shard))?;
                stmt.execute(params![version, sequence])?;
            }
            {
                let mut stmt = self
                    .conn
                    .prepare_cached("DELETE FROM orphan WHERE rowid = ?1")?;
                stmt.execute(params![rowid])?;
            }
            self.prune.count += 1;
            if self.prune.count % self.prune_batch_size == 0 {
                self.commit_prune()?;
                self.begin_prune_batch()?;
            }
        }
        Ok(())
    }

    /// The orphan scan is exhausted: commit, drop root rows behind the
    /// retained checkpoint, then start the queued target or go idle.
    fn finish_prune(&mut self) -> Result<(), Error> {
        self.commit_prune()?;
        if let Some(retain) = self.prune.checkpoints.find_previous(self.prune.version) {
            self.conn
                .execute("DELETE FROM root WHERE version < ?1", params![retain])?;
        }
        debug!(
            count = self.prune.count,
            elapsed_ms = self.prune.started.elapsed().as_millis() as u64,
            to = self.prune.version,
            "done tree prune"
        );
        let next = self.prune.next_version;
        self.prune.version = 0;
        self.prune.next_version = 0;
        if next != 0 {
            self.start_prune(next)?;
        }
        Ok(())
    }
}

/// The leaf writer: owns the leaf database connection.
struct LeafLoop {
    conn: Connection,
    save_rx: Receiver<SaveSignal>,
    prune_rx: Receiver<PruneSignal>,
    result_tx: Sender<SaveResult>,
    cancel_rx: Receiver<()>,
    prune: PruneState,
    prune_batch_size: u64,
    prune_step_rows: usize,
}

impl LeafLoop {
    fn run(&mut self) -> Result<(), Error> {
        loop {
            match next_event(
                &self.save_rx,
                &self.prune_rx,
                &self.cancel_rx,
                self.prune.active(),
            ) {
                LoopEvent::Save(sig) => {
                    if self.prune.active() {
                        // leaf saves can be large; never make them wait on
                        // prune progress
                        self.commit_prune()?;
                        self.save_leaves(&sig);
                        self.begin_prune_batch()?;
                    } else {
                        self.save_leaves(&sig);
                    }
                }
                LoopEvent::Prune(sig) => {
                    if self.prune.active() {
                        warn!(
                            current = self.prune.version,
                            next = sig.prune_version,
                            "leaf prune signal received while pruning"
                        );
                        self.prune.checkpoints = sig.checkpoints;
                        self.prune.next_version = sig.prune_version;
                    } else {
                        self.prune.checkpoints = sig.checkpoints;
                        self.start_prune(sig.prune_version)?;
                    }
                }
                LoopEvent::Cancel => return Ok(()),
                LoopEvent::Step => self.step_pruning()?,
            }
        }
    }

    fn save_leaves(&mut self, sig: &SaveSignal) {
        let mut res = SaveResult {
            count: 0,
            err: None,
        };
        match sig.batch.save_leaves(&self.conn) {
            Ok(count) => res.count = count,
            Err(err) => res.err = Some(err),
        }
        if sig.batch.is_checkpoint() {
            if let Err(err) = wal_checkpoint(&self.conn, "TRUNCATE") {
                res.err = Some(err);
            }
        }
        let _ = self.result_tx.send(res);
    }

    fn start_prune(&mut self, requested: i64) -> Result<(), Error> {
        // only prune leaves to checkpoint boundaries.
        // e.g. given checkpoints = [100, 200, 300]:
        // requested = 150 -> prune to 100
        // requested = 350 -> prune to 300
        // requested = 50  -> do nothing
        let prune_to = match self.prune.checkpoints.find_previous(requested) {
            Some(version) => version,
            None => {
                debug!(
                    requested,
                    "skipping leaf prune: requested version precedes first checkpoint"
                );
                return Ok(());
            }
        };
        debug!(requested, prune_to, "leaf prune starting");
        self.prune.version = prune_to;
        self.prune.count = 0;
        self.prune.started = Instant::now();
        self.begin_prune_batch()
    }

    fn begin_prune_batch(&self) -> Result<(), Error> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit_prune(&self) -> Result<(), Error> {
        self.conn.execute_batch("COMMIT")?;
        debug!(count = self.prune.count, "commit leaf prune");
        wal_checkpoint(&self.conn, "RESTART")?;
        Ok(())
    }

    fn step_pruning(&mut self) -> Result<(), Error> {
        let rows: Vec<(i64, u32, i64)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT version, sequence, rowid FROM leaf_orphan WHERE at <= ?1 LIMIT ?2",
            )?;
            let mapped = stmt.query_map(
                params![self.prune.version, self.prune_step_rows as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            mapped.collect::<Result<Vec<_>, _>>()?
        };
        if rows.is_empty() {
            return self.finish_prune();
        }
        for (version, sequence, rowid) in rows {
            {
                let mut stmt = self
                    .conn
                    .prepare_cached("DELETE FROM leaf WHERE version = ?1 AND sequence = ?2")?;
                stmt.execute(params![version, sequence])?;
            }
            {
                let mut stmt = self
                    .conn
                    .prepare_cached("DELETE FROM leaf_orphan WHERE rowid = ?1")?;
                stmt.execute(params![rowid])?;
            }
            self.prune.count += 1;
            if self.prune.count % self.prune_batch_size == 0 {
                self.commit_prune()?;
                self.begin_prune_batch()?;
            }
        }
        Ok(())
    }

    fn finish_prune(&mut self) -> Result<(), Error> {
        self.commit_prune()?;
        self.conn.execute(
            "DELETE FROM leaf_delete WHERE version < ?1",
            params![self.prune.version],
        )?;
        debug!(
            count = self.prune.count,
            elapsed_ms = self.prune.started.elapsed().as_millis() as u64,
            to = self.prune.version,
            "done leaf prune"
        );
        let next = self.prune.next_version;
        self.prune.version = 0;
        self.prune.next_version = 0;
        if next != 0 {
            self.start_prune(next)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rusqlite::Connection;
    use tempfile::TempDir;

    use crate::batch::VersionCommit;
    use crate::db::Db;
    use crate::error::Error;
    use crate::node::{DeletedLeaf, Node, NodeKey, Orphan};
    use crate::options::DbOptions;

    /// Route writer logs through `RUST_LOG` when a test needs them; later
    /// calls are no-ops once a global subscriber is set.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .expect("count query")
    }

    /// Poll until `pred` holds; pruning is asynchronous, so observable
    /// effects arrive some time after `Db::prune` returns.
    fn wait_for(what: &str, mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if pred() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {what}");
    }

    fn leaf(version: i64, sequence: u32) -> Node {
        Node::new_leaf(
            NodeKey::new(version, sequence),
            format!("key-{version}-{sequence}").into_bytes(),
            format!("value-{version}-{sequence}").into_bytes(),
        )
    }

    fn branch(version: i64, sequence: u32) -> Node {
        Node::new_branch(
            NodeKey::new(version, sequence),
            b"split".to_vec(),
            [9u8; 32],
            NodeKey::new(version, sequence + 1000),
            NodeKey::new(version, sequence + 2000),
            2,
            1,
        )
    }

    #[test]
    fn two_version_commit_no_prune() {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let mut db = Db::open(DbOptions::new(dir.path())).expect("open");

        let mut v1 = VersionCommit::new(1);
        v1.leaves = vec![leaf(1, 0), leaf(1, 1), leaf(1, 2)];
        v1.root = Some(NodeKey::new(1, 0));
        db.commit(v1).expect("commit v1");

        let mut v2 = VersionCommit::new(2);
        v2.leaves = vec![leaf(2, 0), leaf(2, 1)];
        v2.leaf_orphans = vec![Orphan {
            version: 1,
            sequence: 2,
            at: 2,
        }];
        v2.root = Some(NodeKey::new(2, 0));
        db.commit(v2).expect("commit v2");

        let leaf_conn = db.leaf_reader().expect("leaf reader");
        assert_eq!(count(&leaf_conn, "leaf"), 5);
        assert_eq!(count(&leaf_conn, "leaf_orphan"), 1);

        let tree_conn = db.tree_reader().expect("tree reader");
        assert_eq!(count(&tree_conn, "root"), 2);
        db.close().expect("close");
    }

    #[test]
    fn prune_below_first_checkpoint_deletes_nothing() {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let mut db = Db::open(DbOptions::new(dir.path())).expect("open");

        // first commit at version 100: checkpoints = {100}
        let mut v100 = VersionCommit::new(100);
        v100.branches = vec![branch(100, 1)];
        v100.leaves = vec![leaf(100, 10), leaf(100, 11)];
        v100.orphans = vec![Orphan {
            version: 100,
            sequence: 1,
            at: 120,
        }];
        v100.leaf_orphans = vec![Orphan {
            version: 100,
            sequence: 10,
            at: 120,
        }];
        v100.root = Some(NodeKey::new(100, 1));
        db.commit(v100).expect("commit v100");

        db.prune(50).expect("prune request");
        std::thread::sleep(Duration::from_millis(200));

        let tree_conn = db.tree_reader().expect("tree reader");
        assert_eq!(count(&tree_conn, "tree_100"), 1);
        assert_eq!(count(&tree_conn, "orphan"), 1);
        assert_eq!(count(&tree_conn, "root"), 1);

        let leaf_conn = db.leaf_reader().expect("leaf reader");
        assert_eq!(count(&leaf_conn, "leaf"), 2);
        assert_eq!(count(&leaf_conn, "leaf_orphan"), 1);

        // both writers are back in (or never left) idle and still serve saves
        let mut v101 = VersionCommit::new(101);
        v101.leaves = vec![leaf(101, 0)];
        v101.root = Some(NodeKey::new(101, 0));
        db.commit(v101).expect("commit after skipped prune");
        db.close().expect("close");
    }

    /// Checkpoints {100, 200, 300}; orphans at {120, 180, 220}; prune(250).
    /// The branch writer deletes all three; the leaf writer only advances to
    /// checkpoint 200.
    #[test]
    fn prune_respects_checkpoint_alignment() {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let opts = DbOptions::new(dir.path()).with_checkpoint_interval(100);
        let mut db = Db::open(opts).expect("open");

        let mut v100 = VersionCommit::new(100);
        v100.branches = vec![branch(100, 1), branch(100, 2), branch(100, 3)];
        v100.leaves = vec![leaf(100, 10), leaf(100, 11), leaf(100, 12)];
        v100.root = Some(NodeKey::new(100, 1));
        db.commit(v100).expect("commit v100");

        let mut v200 = VersionCommit::new(200);
        v200.leaves = vec![leaf(200, 1)];
        v200.orphans = vec![
            Orphan {
                version: 100,
                sequence: 1,
                at: 120,
            },
            Orphan {
                version: 100,
                sequence: 2,
                at: 180,
            },
        ];
        v200.leaf_orphans = vec![
            Orphan {
                version: 100,
                sequence: 10,
                at: 120,
            },
            Orphan {
                version: 100,
                sequence: 11,
                at: 180,
            },
        ];
        v200.root = Some(NodeKey::new(200, 1));
        db.commit(v200).expect("commit v200");

        let mut v300 = VersionCommit::new(300);
        v300.leaves = vec![leaf(300, 1)];
        v300.orphans = vec![Orphan {
            version: 100,
            sequence: 3,
            at: 220,
        }];
        v300.leaf_orphans = vec![Orphan {
            version: 100,
            sequence: 12,
            at: 220,
        }];
        v300.root = Some(NodeKey::new(300, 1));
        db.commit(v300).expect("commit v300");

        assert_eq!(
            db.checkpoints().iter().collect::<Vec<_>>(),
            vec![100, 200, 300]
        );

        db.prune(250).expect("prune request");

        let tree_conn = db.tree_reader().expect("tree reader");
        wait_for("branch prune to finish", || {
            count(&tree_conn, "orphan") == 0
        });
        assert_eq!(count(&tree_conn, "tree_100"), 0);
        // root rows behind the retained checkpoint (200) are gone
        wait_for("root pruning", || count(&tree_conn, "root") == 2);

        let leaf_conn = db.leaf_reader().expect("leaf reader");
        wait_for("leaf prune to finish", || {
            count(&leaf_conn, "leaf_orphan") == 1
        });
        // leaves orphaned past checkpoint 200 survive
        assert_eq!(count(&leaf_conn, "leaf"), 3);
        db.close().expect("close");
    }

    /// A prune signal during pruning retargets the stream once the current
    /// cursor completes; the final state reflects the newer target.
    #[test]
    fn retarget_prune_to_newer_version() {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let opts = DbOptions::new(dir.path())
            .with_checkpoint_interval(100)
            .with_prune_step_rows(1);
        let mut db = Db::open(opts).expect("open");

        let mut v100 = VersionCommit::new(100);
        v100.branches = (1..=4).map(|seq| branch(100, seq)).collect();
        v100.leaves = (10..=13).map(|seq| leaf(100, seq)).collect();
        v100.root = Some(NodeKey::new(100, 1));
        db.commit(v100).expect("commit v100");

        for (version, at) in [(200, 120), (300, 220)] {
            let mut commit = VersionCommit::new(version);
            commit.leaves = vec![leaf(version, 1)];
            let seq = (version / 100) as u32 - 1;
            commit.orphans = vec![Orphan {
                version: 100,
                sequence: seq,
                at,
            }];
            commit.leaf_orphans = vec![Orphan {
                version: 100,
                sequence: 9 + seq,
                at,
            }];
            commit.root = Some(NodeKey::new(version, 1));
            db.commit(commit).expect("commit");
        }

        let mut v400 = VersionCommit::new(400);
        v400.leaves = vec![leaf(400, 1)];
        v400.orphans = vec![
            Orphan {
                version: 100,
                sequence: 3,
                at: 260,
            },
            Orphan {
                version: 100,
                sequence: 4,
                at: 320,
            },
        ];
        v400.leaf_orphans = vec![
            Orphan {
                version: 100,
                sequence: 12,
                at: 260,
            },
            Orphan {
                version: 100,
                sequence: 13,
                at: 320,
            },
        ];
        v400.root = Some(NodeKey::new(400, 1));
        db.commit(v400).expect("commit v400");

        db.prune(250).expect("first prune");
        db.prune(350).expect("second prune");

        let tree_conn = db.tree_reader().expect("tree reader");
        // the newer target covers every orphan (at <= 350)
        wait_for("retargeted branch prune", || {
            count(&tree_conn, "orphan") == 0
        });
        assert_eq!(count(&tree_conn, "tree_100"), 0);

        let leaf_conn = db.leaf_reader().expect("leaf reader");
        // leaf pruning aligns to checkpoint 300; the at=320 orphan survives
        wait_for("retargeted leaf prune", || {
            count(&leaf_conn, "leaf_orphan") == 1
        });
        db.close().expect("close");
    }

    /// While the branch writer is mid-cursor, a checkpoint save must commit
    /// the open prune sub-transaction, truncate the WAL, save, and resume
    /// pruning against the same target.
    #[test]
    fn checkpoint_save_interrupts_branch_prune() {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let opts = DbOptions::new(dir.path())
            .with_checkpoint_interval(1)
            .with_prune_step_rows(1);
        let mut db = Db::open(opts).expect("open");

        let orphans = 500u32;
        let mut v1 = VersionCommit::new(1);
        v1.branches = (1..=orphans).map(|seq| branch(1, seq)).collect();
        v1.leaves = vec![leaf(1, 0)];
        v1.root = Some(NodeKey::new(1, 1));
        db.commit(v1).expect("commit v1");

        let mut v2 = VersionCommit::new(2);
        v2.leaves = vec![leaf(2, 0)];
        v2.orphans = (1..=orphans)
            .map(|seq| Orphan {
                version: 1,
                sequence: seq,
                at: 2,
            })
            .collect();
        v2.root = Some(NodeKey::new(2, 0));
        db.commit(v2).expect("commit v2");

        db.prune(2).expect("prune request");

        // a checkpoint save lands while the prune cursor is (very likely)
        // still mid-stream; it must succeed either way
        let mut v3 = VersionCommit::new(3);
        v3.branches = vec![branch(3, 1)];
        v3.leaves = vec![leaf(3, 0)];
        v3.root = Some(NodeKey::new(3, 1));
        db.commit(v3).expect("checkpoint save during prune");

        let tree_conn = db.tree_reader().expect("tree reader");
        wait_for("prune to finish after interruption", || {
            count(&tree_conn, "orphan") == 0
        });
        assert_eq!(count(&tree_conn, "tree_1"), 0);
        assert_eq!(count(&tree_conn, "tree_3"), 1);
        // roots behind the retained checkpoint are pruned; v2 and v3 remain
        wait_for("root pruning", || count(&tree_conn, "root") == 2);
        db.close().expect("close");
    }

    /// Tombstones are inserted with saves and cleared once leaf pruning
    /// passes their version.
    #[test]
    fn leaf_delete_tombstones_are_pruned() {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let opts = DbOptions::new(dir.path()).with_checkpoint_interval(1);
        let mut db = Db::open(opts).expect("open");

        let mut v1 = VersionCommit::new(1);
        v1.leaves = vec![leaf(1, 0)];
        v1.root = Some(NodeKey::new(1, 0));
        db.commit(v1).expect("commit v1");

        let mut v2 = VersionCommit::new(2);
        v2.deletes = vec![DeletedLeaf {
            version: 2,
            sequence: 0,
            key: b"key-1-0".to_vec(),
        }];
        v2.leaf_orphans = vec![Orphan {
            version: 1,
            sequence: 0,
            at: 2,
        }];
        v2.root = None;
        db.commit(v2).expect("commit v2");

        let mut v3 = VersionCommit::new(3);
        v3.leaves = vec![leaf(3, 0)];
        v3.root = Some(NodeKey::new(3, 0));
        db.commit(v3).expect("commit v3");

        let leaf_conn = db.leaf_reader().expect("leaf reader");
        assert_eq!(count(&leaf_conn, "leaf_delete"), 1);

        db.prune(3).expect("prune request");
        wait_for("leaf prune", || count(&leaf_conn, "leaf_orphan") == 0);
        wait_for("tombstone pruning", || {
            count(&leaf_conn, "leaf_delete") == 0
        });
        db.close().expect("close");
    }

    /// A fatal prune error (orphan without a covering shard) terminates the
    /// branch writer; afterwards no further commits are accepted.
    #[test]
    fn fatal_writer_error_rejects_further_commits() {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let mut db = Db::open(DbOptions::new(dir.path())).expect("open");

        let mut v1 = VersionCommit::new(1);
        v1.leaves = vec![leaf(1, 0)];
        v1.root = Some(NodeKey::new(1, 0));
        db.commit(v1).expect("commit v1");

        // an orphan below the first checkpoint has no shard to delete from
        let mut v2 = VersionCommit::new(2);
        v2.orphans = vec![Orphan {
            version: 0,
            sequence: 9,
            at: 1,
        }];
        v2.root = None;
        db.commit(v2).expect("commit v2");

        db.prune(2).expect("prune request");

        let mut version = 3;
        wait_for("writer exit to surface", || {
            let mut commit = VersionCommit::new(version);
            commit.leaves = vec![leaf(version, 0)];
            match db.commit(commit) {
                Err(Error::WriterExited) => true,
                Ok(_) => {
                    version += 1;
                    false
                }
                Err(err) => panic!("unexpected commit error: {err}"),
            }
        });
    }

    /// Cancelling mid-prune must not hang: the loop yields between steps
    /// and the in-flight sub-transaction is rolled back on connection drop.
    #[test]
    fn close_during_prune_returns_cleanly() {
        init_tracing();
        let dir = TempDir::new().expect("temp dir");
        let opts = DbOptions::new(dir.path()).with_prune_step_rows(1);
        let mut db = Db::open(opts).expect("open");

        let rows = 2_000u32;
        let mut v1 = VersionCommit::new(1);
        v1.branches = (1..=rows).map(|seq| branch(1, seq)).collect();
        v1.root = Some(NodeKey::new(1, 1));
        db.commit(v1).expect("commit v1");

        let mut v2 = VersionCommit::new(2);
        v2.orphans = (1..=rows)
            .map(|seq| Orphan {
                version: 1,
                sequence: seq,
                at: 2,
            })
            .collect();
        v2.root = None;
        db.commit(v2).expect("commit v2");

        db.prune(2).expect("prune request");
        db.close().expect("close during prune");
    }
}
