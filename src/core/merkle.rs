//! Merkle tree over blob content
//!
//! Content is split into `NODE_SIZE` leaves. Every leaf is hashed with
//! SHA-256 over `level || offset || length || bytes`; the digests of one level
//! are packed into zero-padded `NODE_SIZE` nodes which are hashed the same way
//! to form the next level, until a single digest (the root) remains.
//!
//! The stored tree is every packed level from the lowest to the highest. A blob
//! that fits in one leaf has an empty tree and its root is the leaf hash.
//!
//! Because each stored level is kept, [`verify_range`] only re-hashes the
//! leaves overlapping the requested range plus the nodes on their path to the
//! root.

use crate::digest::{Digest, DIGEST_LEN};
use crate::error::{BlobfsError, Result};
use sha2::{Digest as _, Sha256};

/// Leaf and node size in bytes
pub const NODE_SIZE: usize = 8192;

/// Digests packed into one tree node
pub const DIGESTS_PER_NODE: usize = NODE_SIZE / DIGEST_LEN;

fn hash_node(level: u32, offset: u64, data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(level.to_le_bytes());
    hasher.update(offset.to_le_bytes());
    hasher.update((data.len() as u32).to_le_bytes());
    hasher.update(data);
    Digest::from_bytes(hasher.finalize().into())
}

fn leaf_count(content_len: u64) -> u64 {
    content_len.div_ceil(NODE_SIZE as u64).max(1)
}

/// Byte size of each stored level, lowest first
fn level_sizes(content_len: u64) -> Vec<u64> {
    let mut sizes = Vec::new();
    let mut count = leaf_count(content_len);

    while count > 1 {
        let bytes = (count * DIGEST_LEN as u64).div_ceil(NODE_SIZE as u64) * NODE_SIZE as u64;
        sizes.push(bytes);
        count = bytes / NODE_SIZE as u64;
    }

    sizes
}

/// Size in bytes of the stored tree for content of `content_len` bytes
///
/// Zero when the content fits in a single leaf.
pub fn tree_size(content_len: u64) -> u64 {
    level_sizes(content_len).iter().sum()
}

/// Build the tree for `content`, returning the stored tree bytes and the root
pub fn build_tree(content: &[u8]) -> (Vec<u8>, Digest) {
    let mut hashes: Vec<Digest> = if content.is_empty() {
        vec![hash_node(0, 0, &[])]
    } else {
        content
            .chunks(NODE_SIZE)
            .enumerate()
            .map(|(i, leaf)| hash_node(0, (i * NODE_SIZE) as u64, leaf))
            .collect()
    };

    let mut tree = Vec::with_capacity(tree_size(content.len() as u64) as usize);
    let mut level = 1u32;

    while hashes.len() > 1 {
        let start = tree.len();
        for digest in &hashes {
            tree.extend_from_slice(digest.as_bytes());
        }
        let padded = (tree.len() - start).div_ceil(NODE_SIZE) * NODE_SIZE;
        tree.resize(start + padded, 0);

        hashes = tree[start..]
            .chunks(NODE_SIZE)
            .enumerate()
            .map(|(i, node)| hash_node(level, (i * NODE_SIZE) as u64, node))
            .collect();
        level += 1;
    }

    (tree, hashes[0])
}

/// Root digest of `content`
pub fn root_digest(content: &[u8]) -> Digest {
    build_tree(content).1
}

/// Verify `[offset, offset + len)` of `content` against `expected`
///
/// `content` is the whole blob and `tree` its stored tree; only the leaves
/// overlapping the range are hashed. Returns `BadState` on any mismatch and
/// `InvalidArgs` when the range or tree size does not fit the content.
pub fn verify_range(
    content: &[u8],
    tree: &[u8],
    offset: u64,
    len: u64,
    expected: &Digest,
) -> Result<()> {
    let content_len = content.len() as u64;
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= content_len)
        .ok_or_else(|| {
            BlobfsError::invalid(format!(
                "range {}+{} outside blob of {} bytes",
                offset, len, content_len
            ))
        })?;

    let sizes = level_sizes(content_len);
    if tree.len() as u64 != sizes.iter().sum::<u64>() {
        return Err(BlobfsError::invalid(format!(
            "tree of {} bytes does not match blob of {} bytes",
            tree.len(),
            content_len
        )));
    }

    // An empty range still proves the leaf containing `offset`
    let first_leaf = (offset as usize / NODE_SIZE).min(leaf_count(content_len) as usize - 1);
    let last_leaf = if len == 0 {
        first_leaf
    } else {
        (end as usize - 1) / NODE_SIZE
    };

    let mut computed: Vec<Digest> = (first_leaf..=last_leaf)
        .map(|i| {
            let start = i * NODE_SIZE;
            let stop = (start + NODE_SIZE).min(content.len());
            hash_node(0, start as u64, &content[start..stop])
        })
        .collect();
    let mut first = first_leaf;
    let mut level_offset = 0usize;

    for (level, &size) in sizes.iter().enumerate() {
        let level_bytes = &tree[level_offset..level_offset + size as usize];

        for (j, digest) in computed.iter().enumerate() {
            let at = (first + j) * DIGEST_LEN;
            if &level_bytes[at..at + DIGEST_LEN] != digest.as_bytes() {
                return Err(BlobfsError::bad_state(format!(
                    "merkle mismatch at level {} entry {}",
                    level,
                    first + j
                )));
            }
        }

        let node_first = first / DIGESTS_PER_NODE;
        let node_last = (first + computed.len() - 1) / DIGESTS_PER_NODE;
        computed = (node_first..=node_last)
            .map(|n| {
                let node = &level_bytes[n * NODE_SIZE..(n + 1) * NODE_SIZE];
                hash_node(level as u32 + 1, (n * NODE_SIZE) as u64, node)
            })
            .collect();
        first = node_first;
        level_offset += size as usize;
    }

    if computed.len() != 1 || computed[0] != *expected {
        return Err(BlobfsError::bad_state(format!(
            "merkle root mismatch: expected {}",
            expected
        )));
    }

    Ok(())
}
