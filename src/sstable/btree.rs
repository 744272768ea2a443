//! The embedded B+Tree index used inside each SST file.
//!
//! Every node is a fixed 4096-byte block so that a node offset alone
//! (no separate length) is enough to slice it out of a memory-mapped
//! file. Keys are 8-byte signed integers (`_seq` values fit comfortably
//! within `i64`); fanout ("Order") is 200.

use super::SSTableError;

/// Size in bytes of every node, including its header.
pub const NODE_SIZE: usize = 4096;
/// Size in bytes of the fixed node header.
pub const NODE_HEADER_SIZE: usize = 32;
/// Maximum keys per leaf / children per internal node.
pub const ORDER: usize = 200;

const NODE_TYPE_INTERNAL: u8 = 0;
const NODE_TYPE_LEAF: u8 = 1;

/// A pointer into the SST's data region for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPointer {
    pub offset: u64,
    pub size: u32,
}

/// Encodes one leaf node into a fresh 4096-byte block.
fn encode_leaf(keys: &[i64], pointers: &[DataPointer]) -> Result<Vec<u8>, SSTableError> {
    debug_assert_eq!(keys.len(), pointers.len());
    if keys.len() > ORDER {
        return Err(SSTableError::Internal(format!(
            "leaf node key count {} exceeds ORDER {ORDER}",
            keys.len()
        )));
    }
    let mut buf = vec![0u8; NODE_SIZE];
    buf[0] = NODE_TYPE_LEAF;
    buf[1..3].copy_from_slice(&(keys.len() as u16).to_le_bytes());
    buf[3] = 0;

    let mut offset = NODE_HEADER_SIZE;
    for key in keys {
        buf[offset..offset + 8].copy_from_slice(&key.to_le_bytes());
        offset += 8;
    }
    for ptr in pointers {
        buf[offset..offset + 8].copy_from_slice(&ptr.offset.to_le_bytes());
        offset += 8;
        buf[offset..offset + 4].copy_from_slice(&ptr.size.to_le_bytes());
        offset += 4;
    }
    if offset > NODE_SIZE {
        return Err(SSTableError::Internal("leaf node body overflowed 4096 bytes".into()));
    }
    Ok(buf)
}

/// Encodes one internal node into a fresh 4096-byte block.
///
/// `children.len()` must equal `separator_keys.len() + 1`.
fn encode_internal(separator_keys: &[i64], children: &[u64]) -> Result<Vec<u8>, SSTableError> {
    if children.len() != separator_keys.len() + 1 {
        return Err(SSTableError::Internal(
            "internal node must have exactly one more child than separator key".into(),
        ));
    }
    if children.len() > ORDER + 1 {
        return Err(SSTableError::Internal(format!(
            "internal node child count {} exceeds ORDER+1 {}",
            children.len(),
            ORDER + 1
        )));
    }
    let mut buf = vec![0u8; NODE_SIZE];
    buf[0] = NODE_TYPE_INTERNAL;
    buf[1..3].copy_from_slice(&(separator_keys.len() as u16).to_le_bytes());
    buf[3] = 0;

    let mut offset = NODE_HEADER_SIZE;
    for key in separator_keys {
        buf[offset..offset + 8].copy_from_slice(&key.to_le_bytes());
        offset += 8;
    }
    for child in children {
        buf[offset..offset + 8].copy_from_slice(&child.to_le_bytes());
        offset += 8;
    }
    if offset > NODE_SIZE {
        return Err(SSTableError::Internal("internal node body overflowed 4096 bytes".into()));
    }
    Ok(buf)
}

/// A parsed node, decoded by borrowing directly from a raw 4096-byte
/// slice (no payload copying beyond the small fixed-width keys and
/// pointers themselves).
enum Node {
    Internal { keys: Vec<i64>, children: Vec<u64> },
    Leaf { keys: Vec<i64>, pointers: Vec<DataPointer> },
}

/// Parses a node out of a raw 4096-byte slice sliced from an mmap.
fn decode_node(bytes: &[u8]) -> Result<Node, SSTableError> {
    if bytes.len() < NODE_SIZE {
        return Err(SSTableError::Corruption(format!(
            "node slice too short: {} < {NODE_SIZE}",
            bytes.len()
        )));
    }
    let node_type = bytes[0];
    let key_count = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
    if key_count > ORDER {
        return Err(SSTableError::Corruption(format!(
            "node key count {key_count} exceeds ORDER {ORDER}"
        )));
    }

    let mut offset = NODE_HEADER_SIZE;
    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        keys.push(i64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()));
        offset += 8;
    }

    match node_type {
        NODE_TYPE_LEAF => {
            let mut pointers = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                let data_offset = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
                offset += 8;
                let data_size = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
                offset += 4;
                pointers.push(DataPointer { offset: data_offset, size: data_size });
            }
            Ok(Node::Leaf { keys, pointers })
        }
        NODE_TYPE_INTERNAL => {
            let mut children = Vec::with_capacity(key_count + 1);
            for _ in 0..=key_count {
                children.push(u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()));
                offset += 8;
            }
            Ok(Node::Internal { keys, children })
        }
        other => Err(SSTableError::Corruption(format!("unrecognised node type byte {other}"))),
    }
}

/// Descends the tree rooted at `root_offset` within `region`, the
/// byte slice of the whole SST file (typically an mmap), returning the
/// data pointer for `key` if present.
///
/// Node reads are zero-copy slices of `region`; only the small,
/// fixed-width key and pointer arrays are materialised per node.
pub fn get(region: &[u8], root_offset: u64, key: i64) -> Result<Option<DataPointer>, SSTableError> {
    let mut offset = root_offset as usize;
    loop {
        let end = offset
            .checked_add(NODE_SIZE)
            .filter(|&e| e <= region.len())
            .ok_or_else(|| SSTableError::Corruption(format!("node offset {offset} out of bounds")))?;
        let bytes = &region[offset..end];
        match decode_node(bytes)? {
            Node::Leaf { keys, pointers } => {
                return Ok(keys.binary_search(&key).ok().map(|idx| pointers[idx]));
            }
            Node::Internal { keys, children } => {
                let idx = keys.partition_point(|&k| k <= key);
                offset = children[idx] as usize;
            }
        }
    }
}

/// Collects every `(key, pointer)` pair reachable from `root_offset`,
/// in ascending key order, via an in-order descent. Used for full
/// scans and compaction merges, which the original B+Tree contract
/// does not otherwise support (there are no leaf sibling pointers).
pub fn iter_all(region: &[u8], root_offset: u64) -> Result<Vec<(i64, DataPointer)>, SSTableError> {
    let mut out = Vec::new();
    collect(region, root_offset, &mut out)?;
    Ok(out)
}

fn collect(region: &[u8], offset: u64, out: &mut Vec<(i64, DataPointer)>) -> Result<(), SSTableError> {
    let start = offset as usize;
    let end = start
        .checked_add(NODE_SIZE)
        .filter(|&e| e <= region.len())
        .ok_or_else(|| SSTableError::Corruption(format!("node offset {start} out of bounds")))?;
    match decode_node(&region[start..end])? {
        Node::Leaf { keys, pointers } => {
            out.extend(keys.into_iter().zip(pointers));
        }
        Node::Internal { children, .. } => {
            for child in children {
                collect(region, child, out)?;
            }
        }
    }
    Ok(())
}

/// Bottom-up builder: accepts `(key, pointer)` triples in strictly
/// ascending key order, buffers encoded nodes in memory, and produces
/// a root offset once [`BTreeBuilder::finish`] is called. The caller
/// writes the resulting buffer into the SST's pre-reserved index
/// region and zero-pads the remainder.
pub struct BTreeBuilder {
    base_offset: u64,
    reserved_bytes: u64,
    buf: Vec<u8>,
    leaf_keys: Vec<i64>,
    leaf_pointers: Vec<DataPointer>,
    leaf_level: Vec<(i64, u64)>,
}

impl BTreeBuilder {
    /// `base_offset` is the absolute file offset the index region
    /// starts at (`IndexOffset`, always 256); `reserved_bytes` is the
    /// pre-reserved index region size.
    pub fn new(base_offset: u64, reserved_bytes: u64) -> Self {
        Self {
            base_offset,
            reserved_bytes,
            buf: Vec::new(),
            leaf_keys: Vec::new(),
            leaf_pointers: Vec::new(),
            leaf_level: Vec::new(),
        }
    }

    /// Adds one `(key, pointer)` pair. Keys must arrive in strictly
    /// ascending order.
    pub fn add(&mut self, key: i64, pointer: DataPointer) -> Result<(), SSTableError> {
        self.leaf_keys.push(key);
        self.leaf_pointers.push(pointer);
        if self.leaf_keys.len() == ORDER {
            self.flush_leaf()?;
        }
        Ok(())
    }

    fn append_node(&mut self, bytes: Vec<u8>) -> Result<u64, SSTableError> {
        if self.buf.len() as u64 + NODE_SIZE as u64 > self.reserved_bytes {
            return Err(SSTableError::IndexExhausted);
        }
        let offset = self.base_offset + self.buf.len() as u64;
        self.buf.extend_from_slice(&bytes);
        Ok(offset)
    }

    fn flush_leaf(&mut self) -> Result<(), SSTableError> {
        if self.leaf_keys.is_empty() {
            return Ok(());
        }
        let first_key = self.leaf_keys[0];
        let bytes = encode_leaf(&self.leaf_keys, &self.leaf_pointers)?;
        let offset = self.append_node(bytes)?;
        self.leaf_level.push((first_key, offset));
        self.leaf_keys.clear();
        self.leaf_pointers.clear();
        Ok(())
    }

    /// Finalises the tree, returning `(root_offset, index_bytes)`.
    /// `index_bytes` is shorter than `reserved_bytes`; the caller
    /// zero-pads the remainder when writing it to disk.
    pub fn finish(mut self) -> Result<(u64, Vec<u8>), SSTableError> {
        self.flush_leaf()?;

        if self.leaf_level.is_empty() {
            // Empty table: emit a single empty leaf as the root so
            // reads against it behave like "not found" rather than
            // dereferencing an invalid offset.
            let bytes = encode_leaf(&[], &[])?;
            let root = self.append_node(bytes)?;
            return Ok((root, self.buf));
        }

        let mut level = std::mem::take(&mut self.leaf_level);
        while level.len() > 1 {
            let mut next_level = Vec::new();
            for group in level.chunks(ORDER) {
                let first_key = group[0].0;
                let separator_keys: Vec<i64> = group[1..].iter().map(|(k, _)| *k).collect();
                let children: Vec<u64> = group.iter().map(|(_, off)| *off).collect();
                let bytes = encode_internal(&separator_keys, &children)?;
                let offset = self.append_node(bytes)?;
                next_level.push((first_key, offset));
            }
            level = next_level;
        }

        let root = level[0].1;
        Ok((root, self.buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_tree_round_trips() {
        let mut builder = BTreeBuilder::new(256, 10 * 1024 * 1024);
        for key in 0..50i64 {
            builder
                .add(key, DataPointer { offset: key as u64 * 10, size: 10 })
                .unwrap();
        }
        let (root, index_bytes) = builder.finish().unwrap();

        let mut region = vec![0u8; 256];
        region.extend_from_slice(&index_bytes);

        for key in 0..50i64 {
            let ptr = get(&region, root, key).unwrap();
            assert_eq!(ptr.unwrap(), DataPointer { offset: key as u64 * 10, size: 10 });
        }
    }

    #[test]
    fn missing_key_returns_none() {
        let mut builder = BTreeBuilder::new(256, 10 * 1024 * 1024);
        for key in [1i64, 3, 5, 7] {
            builder.add(key, DataPointer { offset: key as u64, size: 1 }).unwrap();
        }
        let (root, index_bytes) = builder.finish().unwrap();
        let mut region = vec![0u8; 256];
        region.extend_from_slice(&index_bytes);

        assert!(get(&region, root, 4).unwrap().is_none());
        assert!(get(&region, root, 0).unwrap().is_none());
        assert!(get(&region, root, 8).unwrap().is_none());
    }

    #[test]
    fn multi_level_tree_builds_and_resolves() {
        let mut builder = BTreeBuilder::new(256, 10 * 1024 * 1024);
        // Force multiple leaves and an internal level above ORDER.
        for key in 0..(ORDER as i64 * 3 + 7) {
            builder.add(key, DataPointer { offset: key as u64, size: 4 }).unwrap();
        }
        let (root, index_bytes) = builder.finish().unwrap();
        let mut region = vec![0u8; 256];
        region.extend_from_slice(&index_bytes);

        for key in [0i64, 1, ORDER as i64, ORDER as i64 * 2 + 3, ORDER as i64 * 3 + 6] {
            let ptr = get(&region, root, key).unwrap();
            assert_eq!(ptr.unwrap().offset, key as u64);
        }
    }

    #[test]
    fn empty_tree_root_is_empty_leaf() {
        let builder = BTreeBuilder::new(256, 10 * 1024 * 1024);
        let (root, index_bytes) = builder.finish().unwrap();
        let mut region = vec![0u8; 256];
        region.extend_from_slice(&index_bytes);

        assert!(get(&region, root, 1).unwrap().is_none());
    }

    #[test]
    fn index_exhaustion_is_reported() {
        // Reserve barely enough for one node; the second leaf flush
        // must fail loudly rather than silently truncate the index.
        let mut builder = BTreeBuilder::new(256, NODE_SIZE as u64);
        let mut result = Ok(());
        for key in 0..(ORDER as i64 * 2) {
            result = builder.add(key, DataPointer { offset: key as u64, size: 1 });
            if result.is_err() {
                break;
            }
        }
        let err = result.and_then(|_| builder.finish().map(|_| ())).unwrap_err();
        assert!(matches!(err, SSTableError::IndexExhausted));
    }
}
