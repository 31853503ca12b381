//! Errors

/// Errors produced by the write path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error from the underlying SQLite connection.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An I/O error while creating or opening the store directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A node blob failed to parse.
    #[error("node decode error: {0}")]
    NodeDecode(String),

    /// A node could not be serialized.
    #[error("node encode error: {0}")]
    NodeEncode(String),

    /// No shard covers the given version.
    #[error("no shard found for version {0}")]
    MissingShard(i64),

    /// A writer task has terminated; the store accepts no further commits.
    #[error("writer task terminated")]
    WriterExited,

    /// Both writers failed on the same save.
    #[error("branch write: {tree}; leaf write: {leaf}")]
    Join {
        /// The branch writer's error.
        tree: Box<Error>,
        /// The leaf writer's error.
        leaf: Box<Error>,
    },
}

/// Join the per-writer save errors: `None` if both writers succeeded, the
/// single error if one failed, [`Error::Join`] if both did.
pub(crate) fn join(tree: Option<Error>, leaf: Option<Error>) -> Option<Error> {
    match (tree, leaf) {
        (None, None) => None,
        (Some(err), None) | (None, Some(err)) => Some(err),
        (Some(tree), Some(leaf)) => Some(Error::Join {
            tree: Box::new(tree),
            leaf: Box::new(leaf),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_combines_both_errors() {
        assert!(join(None, None).is_none());

        let only_tree = join(Some(Error::MissingShard(7)), None).expect("one error");
        assert!(matches!(only_tree, Error::MissingShard(7)));

        let both = join(
            Some(Error::MissingShard(7)),
            Some(Error::WriterExited),
        )
        .expect("joined error");
        match both {
            Error::Join { tree, leaf } => {
                assert!(matches!(*tree, Error::MissingShard(7)));
                assert!(matches!(*leaf, Error::WriterExited));
            }
            other => panic!("expected Join, got {other}"),
        }
    }
}
