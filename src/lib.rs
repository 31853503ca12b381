#![warn(missing_docs)]
//! Persistent write path of a versioned, authenticated key-value store.
//!
//! An IAVL+ tree's staged versions are committed durably to SQLite by a
//! dual-writer engine: a *branch writer* owning the tree database
//! (version-sharded branch tables, orphan queue, root index) and a *leaf
//! writer* owning the leaf database (leaf rows, orphan queue, deletion
//! tombstones, optional latest-value projection).
//!
//! # Architecture
//!
//! - [`Db::commit`] fans one save signal out to both writers and blocks
//!   until each acknowledges; versions are durable in commit order.
//! - [`Db::prune`] publishes a prune target and returns immediately. Each
//!   writer interleaves cooperative prune steps with incoming saves:
//!   pruning can be interrupted by a save, retargeted by a newer prune
//!   request, or cancelled at shutdown, without corrupting either stream.
//! - Branch rows are sharded by checkpoint: a branch created at version `v`
//!   lives in the shard table of the greatest checkpoint `<= v`
//!   ([`VersionRange::find_previous`]). Leaves are unsharded and leaf
//!   pruning only advances to checkpoint boundaries.
//! - After each committed prune sub-transaction the WAL is checkpointed
//!   with `RESTART`; after each checkpoint save it is truncated.
//!
//! The in-memory tree algorithm, node hashing, proofs, and read-side
//! iteration live elsewhere; this crate consumes staged
//! [`VersionCommit`]s and owns everything between them and the disk.

mod batch;
mod db;
mod error;
mod metrics;
mod node;
mod options;
mod version;
mod writer;

pub use batch::VersionCommit;
pub use db::Db;
pub use error::Error;
pub use metrics::WriteMetrics;
pub use node::{DeletedLeaf, Node, NodeKey, Orphan, HASH_LENGTH, NODE_KEY_LENGTH};
pub use options::{
    DbOptions, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_PRUNE_BATCH_SIZE, DEFAULT_PRUNE_STEP_ROWS,
    DEFAULT_SAVE_BATCH_SIZE,
};
pub use version::VersionRange;

pub use rusqlite;
