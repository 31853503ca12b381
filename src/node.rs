//! Tree node identity, wire encoding, and the records flushed with a save.

use integer_encoding::VarInt;

use crate::error::Error;

/// Byte length of an encoded [`NodeKey`].
pub const NODE_KEY_LENGTH: usize = 12;

/// Byte length of a node hash.
pub const HASH_LENGTH: usize = 32;

/// 12-byte node identity: 8-byte big-endian version concatenated with a
/// 4-byte big-endian sequence. Unique within a store; the big-endian layout
/// keeps encoded keys ordered by `(version, sequence)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    version: i64,
    sequence: u32,
}

impl NodeKey {
    /// Create a node key from its parts.
    pub fn new(version: i64, sequence: u32) -> Self {
        Self { version, sequence }
    }

    /// The version this node was created at.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The per-version sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Encode to the 12-byte wire form.
    pub fn to_bytes(&self) -> [u8; NODE_KEY_LENGTH] {
        let mut out = [0u8; NODE_KEY_LENGTH];
        out[..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    /// Decode from the 12-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != NODE_KEY_LENGTH {
            return Err(Error::NodeDecode(format!(
                "node key must be {NODE_KEY_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        let version = i64::from_be_bytes(bytes[..8].try_into().unwrap());
        let sequence = u32::from_be_bytes(bytes[8..].try_into().unwrap());
        Ok(Self { version, sequence })
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.version, self.sequence)
    }
}

/// A single tree node staged for persistence.
///
/// Branches (`subtree_height >= 1`) carry the split key, subtree size and
/// hash, and the node keys of both children. Leaves (`subtree_height == 0`)
/// carry the user key and value; a leaf's hash is recomputed from its value
/// on load and does not travel with the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// This node's identity.
    pub node_key: NodeKey,
    /// Split key (branch) or user key (leaf).
    pub key: Vec<u8>,
    /// User value; set iff this is a leaf.
    pub value: Option<Vec<u8>>,
    /// Subtree hash; meaningful for branches.
    pub hash: [u8; HASH_LENGTH],
    /// Left child; set iff this is a branch.
    pub left_node_key: Option<NodeKey>,
    /// Right child; set iff this is a branch.
    pub right_node_key: Option<NodeKey>,
    /// Number of leaves under this node.
    pub size: i64,
    /// Height of the subtree rooted here; 0 for leaves.
    pub subtree_height: i8,
}

impl Node {
    /// Construct a branch node.
    pub fn new_branch(
        node_key: NodeKey,
        key: Vec<u8>,
        hash: [u8; HASH_LENGTH],
        left_node_key: NodeKey,
        right_node_key: NodeKey,
        size: i64,
        subtree_height: i8,
    ) -> Self {
        Self {
            node_key,
            key,
            value: None,
            hash,
            left_node_key: Some(left_node_key),
            right_node_key: Some(right_node_key),
            size,
            subtree_height,
        }
    }

    /// Construct a leaf node.
    pub fn new_leaf(node_key: NodeKey, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            node_key,
            key,
            value: Some(value),
            hash: [0u8; HASH_LENGTH],
            left_node_key: None,
            right_node_key: None,
            size: 1,
            subtree_height: 0,
        }
    }

    /// Whether this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.subtree_height == 0
    }

    /// Serialize into `buf`.
    ///
    /// Wire format:
    ///
    /// ```text
    /// height:   1 byte (i8)
    /// size:     varint
    /// key:      varint length || bytes
    /// leaf:     value: varint length || bytes
    /// branch:   hash: 32 || left node key: 12 || right node key: 12
    /// ```
    ///
    /// The node key itself is not encoded; it is the row key and is supplied
    /// again to [`Node::from_bytes`].
    pub fn write_bytes(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        buf.push(self.subtree_height as u8);
        buf.extend_from_slice(&self.size.encode_var_vec());
        write_length_prefixed(buf, &self.key);
        if self.is_leaf() {
            let value = self
                .value
                .as_deref()
                .ok_or_else(|| Error::NodeEncode(format!("leaf {} without value", self.node_key)))?;
            write_length_prefixed(buf, value);
        } else {
            buf.extend_from_slice(&self.hash);
            let left = self.left_node_key.ok_or_else(|| {
                Error::NodeEncode(format!("branch {} without left child", self.node_key))
            })?;
            let right = self.right_node_key.ok_or_else(|| {
                Error::NodeEncode(format!("branch {} without right child", self.node_key))
            })?;
            buf.extend_from_slice(&left.to_bytes());
            buf.extend_from_slice(&right.to_bytes());
        }
        Ok(())
    }

    /// Serialize to a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(
            1 + 10 + self.key.len() + self.value.as_ref().map_or(HASH_LENGTH + 2 * NODE_KEY_LENGTH, Vec::len),
        );
        self.write_bytes(&mut buf)?;
        Ok(buf)
    }

    /// Parse a node blob produced by [`write_bytes`](Self::write_bytes),
    /// keyed by `node_key`.
    pub fn from_bytes(node_key: NodeKey, bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Err(Error::NodeDecode("empty node blob".to_string()));
        }
        let subtree_height = bytes[0] as i8;
        let mut pos = 1usize;
        let (size, read) = i64::decode_var(&bytes[pos..])
            .ok_or_else(|| Error::NodeDecode("truncated size".to_string()))?;
        pos += read;
        let key = read_length_prefixed(bytes, &mut pos, "key")?;

        let node = if subtree_height == 0 {
            let value = read_length_prefixed(bytes, &mut pos, "value")?;
            Node {
                node_key,
                key,
                value: Some(value),
                hash: [0u8; HASH_LENGTH],
                left_node_key: None,
                right_node_key: None,
                size,
                subtree_height,
            }
        } else {
            if pos + HASH_LENGTH + 2 * NODE_KEY_LENGTH > bytes.len() {
                return Err(Error::NodeDecode("truncated branch node".to_string()));
            }
            let hash: [u8; HASH_LENGTH] = bytes[pos..pos + HASH_LENGTH].try_into().unwrap();
            pos += HASH_LENGTH;
            let left = NodeKey::from_bytes(&bytes[pos..pos + NODE_KEY_LENGTH])?;
            pos += NODE_KEY_LENGTH;
            let right = NodeKey::from_bytes(&bytes[pos..pos + NODE_KEY_LENGTH])?;
            pos += NODE_KEY_LENGTH;
            Node {
                node_key,
                key,
                value: None,
                hash,
                left_node_key: Some(left),
                right_node_key: Some(right),
                size,
                subtree_height,
            }
        };
        if pos != bytes.len() {
            return Err(Error::NodeDecode(format!(
                "{} trailing bytes after node",
                bytes.len() - pos
            )));
        }
        Ok(node)
    }
}

/// An obligation to eventually delete the node row at `(version, sequence)`.
///
/// `at` is the version at which the node became unreachable; the pruner
/// deletes the node row and the orphan record together once it advances to
/// or past `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orphan {
    /// Version of the orphaned node's key.
    pub version: i64,
    /// Sequence of the orphaned node's key.
    pub sequence: u32,
    /// Version at which the node became unreachable.
    pub at: i64,
}

/// A tombstone for a leaf that was explicitly deleted at `version`.
///
/// Tombstones feed the `latest` projection and are themselves cleared once
/// leaf pruning advances past their version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedLeaf {
    /// Version the deletion was committed at.
    pub version: i64,
    /// Sequence of the deleted leaf.
    pub sequence: u32,
    /// User key of the deleted leaf.
    pub key: Vec<u8>,
}

fn write_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).encode_var_vec());
    buf.extend_from_slice(bytes);
}

fn read_length_prefixed(bytes: &[u8], pos: &mut usize, field: &str) -> Result<Vec<u8>, Error> {
    let (len, read) = u64::decode_var(&bytes[*pos..])
        .ok_or_else(|| Error::NodeDecode(format!("truncated {field} length")))?;
    *pos += read;
    let len = len as usize;
    if *pos + len > bytes.len() {
        return Err(Error::NodeDecode(format!("truncated {field}")));
    }
    let out = bytes[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(out)
}
