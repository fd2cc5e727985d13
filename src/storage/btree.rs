//! B+tree serialized into a record body, used for records with many children.
//! Leaf values hold the same value-info bytes a linear child entry would.
//!
//! Mutation is two-tier: a batched `transaction` rewrites affected leaves in
//! place when their slack allows, and reports `NeedsRebuild` otherwise, at
//! which point the caller enumerates everything into a `TreeBuilder` and
//! serializes a fresh tree.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::convert::TryInto;

use tracing::trace;

use crate::error::{Result, TreeError};

const NODE_INTERNAL: u8 = 1;
const NODE_LEAF: u8 = 2;

const TREE_HEADER_SIZE: usize = 16;
const LEAF_HEADER_SIZE: usize = 11;

/// Byte capacity of a leaf's entry area.
const LEAF_CAPACITY: usize = 512;
/// Maximum children per internal node.
const INTERNAL_ORDER: usize = 24;

/// Fill factors: append-friendly when every key looks numeric, dense
/// otherwise.
pub const FILL_FACTOR_NUMERIC: u8 = 50;
pub const FILL_FACTOR_DEFAULT: u8 = 95;

/// Byte source/sink for tree nodes; implemented by the record view that maps
/// logical body offsets through the chunk table, and by plain buffers in
/// tests and the builder.
pub trait TreeIo {
    fn tree_len(&self) -> usize;
    fn tree_read(&mut self, offset: usize, length: usize) -> Result<Vec<u8>>;
    fn tree_write(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

impl TreeIo for Vec<u8> {
    fn tree_len(&self) -> usize {
        self.len()
    }

    fn tree_read(&mut self, offset: usize, length: usize) -> Result<Vec<u8>> {
        if offset + length > self.len() {
            return Err(TreeError::Truncated(
                "tree read past end of record body".into(),
            ));
        }
        Ok(self[offset..offset + length].to_vec())
    }

    fn tree_write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.len() {
            return Err(TreeError::Truncated(
                "tree write past end of record body".into(),
            ));
        }
        self[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A child's key inside the tree: a property name or an array index. Indexes
/// order before names so array records sort numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TreeKey {
    Index(u32),
    Name(String),
}

impl Ord for TreeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TreeKey::Index(a), TreeKey::Index(b)) => a.cmp(b),
            (TreeKey::Name(a), TreeKey::Name(b)) => a.cmp(b),
            (TreeKey::Index(_), TreeKey::Name(_)) => Ordering::Less,
            (TreeKey::Name(_), TreeKey::Index(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for TreeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TreeKey {
    fn encoded_len(&self) -> usize {
        match self {
            TreeKey::Index(_) => 5,
            TreeKey::Name(name) => 2 + name.len(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            TreeKey::Index(index) => {
                out.push(1);
                out.extend_from_slice(&index.to_be_bytes());
            }
            TreeKey::Name(name) => {
                out.push(0);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
    }

    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(TreeError::Truncated("tree key truncated".into()));
        }
        match data[0] {
            1 => {
                if data.len() < 5 {
                    return Err(TreeError::Truncated("tree index key truncated".into()));
                }
                let index = u32::from_be_bytes(data[1..5].try_into().expect("4 bytes"));
                Ok((TreeKey::Index(index), 5))
            }
            0 => {
                if data.len() < 2 {
                    return Err(TreeError::Truncated("tree name key truncated".into()));
                }
                let len = data[1] as usize;
                if data.len() < 2 + len {
                    return Err(TreeError::Truncated("tree name key truncated".into()));
                }
                let name = std::str::from_utf8(&data[2..2 + len])
                    .map_err(|_| TreeError::Corrupt("tree key is not valid UTF-8".into()))?;
                Ok((TreeKey::Name(name.to_string()), 2 + len))
            }
            other => Err(TreeError::Corrupt(format!(
                "unknown tree key tag: 0x{other:02X}"
            ))),
        }
    }

    /// True when the key is an index or a name that parses as one; such
    /// records typically grow by appending.
    pub fn is_numeric(&self) -> bool {
        match self {
            TreeKey::Index(_) => true,
            TreeKey::Name(name) => !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    pub fill_factor: u8,
    pub depth: u8,
    pub entry_count: u32,
    pub root_offset: u32,
    pub first_leaf_offset: u32,
}

impl TreeHeader {
    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < TREE_HEADER_SIZE {
            return Err(TreeError::Truncated("tree header truncated".into()));
        }
        Ok(Self {
            fill_factor: data[0],
            depth: data[1],
            entry_count: u32::from_be_bytes(data[2..6].try_into().expect("4 bytes")),
            root_offset: u32::from_be_bytes(data[6..10].try_into().expect("4 bytes")),
            first_leaf_offset: u32::from_be_bytes(data[10..14].try_into().expect("4 bytes")),
        })
    }

    fn encode(&self) -> [u8; TREE_HEADER_SIZE] {
        let mut out = [0u8; TREE_HEADER_SIZE];
        out[0] = self.fill_factor;
        out[1] = self.depth;
        out[2..6].copy_from_slice(&self.entry_count.to_be_bytes());
        out[6..10].copy_from_slice(&self.root_offset.to_be_bytes());
        out[10..14].copy_from_slice(&self.first_leaf_offset.to_be_bytes());
        out
    }
}

/// A decoded leaf, including the geometry needed to rewrite it in place.
#[derive(Debug, Clone)]
pub struct TreeLeaf {
    pub offset: u32,
    pub next_leaf_offset: u32,
    pub capacity: u16,
    pub entries: Vec<(TreeKey, Vec<u8>)>,
}

impl TreeLeaf {
    fn used_bytes(entries: &[(TreeKey, Vec<u8>)]) -> usize {
        entries
            .iter()
            .map(|(key, value)| key.encoded_len() + 2 + value.len())
            .sum()
    }
}

#[derive(Debug)]
struct InternalNode {
    keys: Vec<TreeKey>,
    child_offsets: Vec<u32>,
}

/// Result of an in-place transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Applied,
    /// A leaf would outgrow its slack (or the batch needs structural
    /// changes); fall back to `to_builder`.
    NeedsRebuild,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeOp {
    Add { key: TreeKey, value: Vec<u8> },
    Update { key: TreeKey, value: Vec<u8> },
    Remove { key: TreeKey },
}

impl TreeOp {
    fn key(&self) -> &TreeKey {
        match self {
            TreeOp::Add { key, .. } | TreeOp::Update { key, .. } | TreeOp::Remove { key } => key,
        }
    }
}

/// Read/mutate access to a serialized tree through a `TreeIo`.
pub struct EmbeddedTree<'a, S: TreeIo> {
    io: &'a mut S,
}

impl<'a, S: TreeIo> EmbeddedTree<'a, S> {
    pub fn new(io: &'a mut S) -> Self {
        Self { io }
    }

    pub fn header(&mut self) -> Result<TreeHeader> {
        let bytes = self.io.tree_read(0, TREE_HEADER_SIZE)?;
        TreeHeader::decode(&bytes)
    }

    /// Looks up the value bytes stored for `key`.
    pub fn find(&mut self, key: &TreeKey) -> Result<Option<Vec<u8>>> {
        let leaf = self.find_leaf(key)?;
        Ok(leaf
            .entries
            .into_iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value))
    }

    pub fn first_leaf(&mut self) -> Result<TreeLeaf> {
        let header = self.header()?;
        self.read_leaf(header.first_leaf_offset)
    }

    pub fn next_leaf(&mut self, leaf: &TreeLeaf) -> Result<Option<TreeLeaf>> {
        if leaf.next_leaf_offset == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_leaf(leaf.next_leaf_offset)?))
    }

    /// Applies a batch of operations atomically in place. Either every
    /// affected leaf is rewritten or nothing is written at all.
    pub fn transaction(&mut self, ops: &[TreeOp]) -> Result<TxnOutcome> {
        let mut header = self.header()?;
        // Group operations per target leaf.
        let mut leaves: Vec<TreeLeaf> = Vec::new();
        let mut op_targets: Vec<usize> = Vec::with_capacity(ops.len());
        for op in ops {
            let leaf = self.find_leaf(op.key())?;
            let index = match leaves.iter().position(|l| l.offset == leaf.offset) {
                Some(index) => index,
                None => {
                    leaves.push(leaf);
                    leaves.len() - 1
                }
            };
            op_targets.push(index);
        }

        let mut entry_delta: i64 = 0;
        for (op, &target) in ops.iter().zip(&op_targets) {
            let entries = &mut leaves[target].entries;
            match op {
                TreeOp::Add { key, value } => {
                    match entries.binary_search_by(|(k, _)| k.cmp(key)) {
                        Ok(_) => return Ok(TxnOutcome::NeedsRebuild),
                        Err(pos) => entries.insert(pos, (key.clone(), value.clone())),
                    }
                    entry_delta += 1;
                }
                TreeOp::Update { key, value } => {
                    match entries.binary_search_by(|(k, _)| k.cmp(key)) {
                        Ok(pos) => entries[pos].1 = value.clone(),
                        Err(_) => return Ok(TxnOutcome::NeedsRebuild),
                    }
                }
                TreeOp::Remove { key } => {
                    match entries.binary_search_by(|(k, _)| k.cmp(key)) {
                        Ok(pos) => {
                            entries.remove(pos);
                        }
                        Err(_) => return Ok(TxnOutcome::NeedsRebuild),
                    }
                    entry_delta -= 1;
                }
            }
        }

        // Validate every touched leaf before writing any of them.
        for leaf in &leaves {
            let used = TreeLeaf::used_bytes(&leaf.entries);
            if used > leaf.capacity as usize || leaf.entries.is_empty() {
                trace!(
                    offset = leaf.offset,
                    used,
                    capacity = leaf.capacity,
                    "tree transaction falls back to rebuild"
                );
                return Ok(TxnOutcome::NeedsRebuild);
            }
        }

        for leaf in &leaves {
            self.write_leaf(leaf)?;
        }
        header.entry_count = (header.entry_count as i64 + entry_delta) as u32;
        self.io.tree_write(0, &header.encode())?;
        Ok(TxnOutcome::Applied)
    }

    /// Enumerates every entry into a builder for a full rebuild.
    pub fn to_builder(&mut self, fill_factor: u8) -> Result<TreeBuilder> {
        let mut builder = TreeBuilder::new(fill_factor);
        let mut leaf = self.first_leaf()?;
        loop {
            for (key, value) in &leaf.entries {
                builder.set(key.clone(), value.clone());
            }
            match self.next_leaf(&leaf)? {
                Some(next) => leaf = next,
                None => break,
            }
        }
        Ok(builder)
    }

    fn find_leaf(&mut self, key: &TreeKey) -> Result<TreeLeaf> {
        let header = self.header()?;
        let mut offset = header.root_offset;
        for _ in 0..header.depth {
            let kind = self.io.tree_read(offset as usize, 1)?[0];
            match kind {
                NODE_LEAF => return self.read_leaf(offset),
                NODE_INTERNAL => {
                    let node = self.read_internal(offset)?;
                    let child = match node.keys.binary_search(key) {
                        // Equal separator keys live in the right child.
                        Ok(pos) => pos + 1,
                        Err(pos) => pos,
                    };
                    offset = node.child_offsets[child];
                }
                other => {
                    return Err(TreeError::Corrupt(format!(
                        "unknown tree node kind: 0x{other:02X}"
                    )))
                }
            }
        }
        Err(TreeError::Corrupt("tree deeper than its header claims".into()))
    }

    fn read_internal(&mut self, offset: u32) -> Result<InternalNode> {
        let offset = offset as usize;
        let head = self.io.tree_read(offset, 3)?;
        if head[0] != NODE_INTERNAL {
            return Err(TreeError::Corrupt("expected internal tree node".into()));
        }
        let key_count = u16::from_be_bytes([head[1], head[2]]) as usize;
        // Upper bound: every key at its maximum encoded size.
        let max_body = key_count * (2 + 255 + 4) + 4;
        let window_len = max_body.min(self.io.tree_len().saturating_sub(offset + 3));
        let body = self.io.tree_read(offset + 3, window_len)?;
        let mut keys = Vec::with_capacity(key_count);
        let mut child_offsets = Vec::with_capacity(key_count + 1);
        let mut pos = 0;
        for _ in 0..key_count {
            let (key, consumed) = TreeKey::decode(&body[pos..])?;
            pos += consumed;
            if pos + 4 > body.len() {
                return Err(TreeError::Truncated("internal node truncated".into()));
            }
            child_offsets.push(u32::from_be_bytes(
                body[pos..pos + 4].try_into().expect("4 bytes"),
            ));
            pos += 4;
            keys.push(key);
        }
        if pos + 4 > body.len() {
            return Err(TreeError::Truncated("internal node truncated".into()));
        }
        child_offsets.push(u32::from_be_bytes(
            body[pos..pos + 4].try_into().expect("4 bytes"),
        ));
        Ok(InternalNode { keys, child_offsets })
    }

    fn read_leaf(&mut self, offset: u32) -> Result<TreeLeaf> {
        let start = offset as usize;
        let head = self.io.tree_read(start, LEAF_HEADER_SIZE)?;
        if head[0] != NODE_LEAF {
            return Err(TreeError::Corrupt("expected leaf tree node".into()));
        }
        let entry_count = u16::from_be_bytes([head[1], head[2]]) as usize;
        let next_leaf_offset = u32::from_be_bytes(head[3..7].try_into().expect("4 bytes"));
        let capacity = u16::from_be_bytes([head[7], head[8]]);
        let used = u16::from_be_bytes([head[9], head[10]]) as usize;
        let body = self.io.tree_read(start + LEAF_HEADER_SIZE, used)?;
        let mut entries = Vec::with_capacity(entry_count);
        let mut pos = 0;
        for _ in 0..entry_count {
            let (key, consumed) = TreeKey::decode(&body[pos..])?;
            pos += consumed;
            if pos + 2 > body.len() {
                return Err(TreeError::Truncated("leaf entry truncated".into()));
            }
            let value_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
            pos += 2;
            if pos + value_len > body.len() {
                return Err(TreeError::Truncated("leaf entry truncated".into()));
            }
            entries.push((key, body[pos..pos + value_len].to_vec()));
            pos += value_len;
        }
        Ok(TreeLeaf {
            offset,
            next_leaf_offset,
            capacity,
            entries,
        })
    }

    fn write_leaf(&mut self, leaf: &TreeLeaf) -> Result<()> {
        let mut out = Vec::with_capacity(LEAF_HEADER_SIZE + leaf.capacity as usize);
        out.push(NODE_LEAF);
        out.extend_from_slice(&(leaf.entries.len() as u16).to_be_bytes());
        out.extend_from_slice(&leaf.next_leaf_offset.to_be_bytes());
        out.extend_from_slice(&leaf.capacity.to_be_bytes());
        let used = TreeLeaf::used_bytes(&leaf.entries);
        out.extend_from_slice(&(used as u16).to_be_bytes());
        for (key, value) in &leaf.entries {
            key.encode(&mut out);
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value);
        }
        out.resize(LEAF_HEADER_SIZE + leaf.capacity as usize, 0);
        self.io.tree_write(leaf.offset as usize, &out)
    }
}

/// In-memory accumulator producing a freshly packed tree body.
#[derive(Debug)]
pub struct TreeBuilder {
    fill_factor: u8,
    entries: BTreeMap<TreeKey, Vec<u8>>,
}

impl TreeBuilder {
    pub fn new(fill_factor: u8) -> Self {
        Self {
            fill_factor: fill_factor.clamp(1, 100),
            entries: BTreeMap::new(),
        }
    }

    /// Re-targets the fill factor, typically after mutating the entry set.
    pub fn with_fill_factor(mut self, fill_factor: u8) -> Self {
        self.fill_factor = fill_factor.clamp(1, 100);
        self
    }

    /// 50% when every key is numeric (append-friendly), 95% otherwise.
    pub fn fill_factor_for<'k>(keys: impl IntoIterator<Item = &'k TreeKey>) -> u8 {
        let mut any = false;
        for key in keys {
            any = true;
            if !key.is_numeric() {
                return FILL_FACTOR_DEFAULT;
            }
        }
        if any {
            FILL_FACTOR_NUMERIC
        } else {
            FILL_FACTOR_DEFAULT
        }
    }

    pub fn set(&mut self, key: TreeKey, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &TreeKey) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TreeKey> {
        self.entries.keys()
    }

    /// Serializes the tree: header, internal levels root-first, then leaves
    /// in key order.
    pub fn build(&self) -> Result<Vec<u8>> {
        let target = LEAF_CAPACITY * self.fill_factor as usize / 100;

        // Pack entries into leaves up to the fill target.
        let mut leaves: Vec<Vec<(TreeKey, Vec<u8>)>> = Vec::new();
        let mut current: Vec<(TreeKey, Vec<u8>)> = Vec::new();
        let mut current_used = 0usize;
        for (key, value) in &self.entries {
            let entry_size = key.encoded_len() + 2 + value.len();
            if entry_size > LEAF_CAPACITY {
                return Err(TreeError::InvalidArgument(
                    "tree entry larger than leaf capacity".into(),
                ));
            }
            if !current.is_empty() && current_used + entry_size > target {
                leaves.push(std::mem::take(&mut current));
                current_used = 0;
            }
            current_used += entry_size;
            current.push((key.clone(), value.clone()));
        }
        if !current.is_empty() || leaves.is_empty() {
            leaves.push(current);
        }

        // Build internal levels bottom-up. Each level holds, per node, the
        // minimum key of its subtree and the indexes of its children in the
        // level below.
        struct Level {
            groups: Vec<(TreeKey, Vec<usize>)>,
        }
        let leaf_min_keys: Vec<TreeKey> = leaves
            .iter()
            .map(|leaf| {
                leaf.first()
                    .map(|(key, _)| key.clone())
                    .unwrap_or(TreeKey::Index(0))
            })
            .collect();

        let mut levels: Vec<Level> = Vec::new();
        let mut child_count = leaves.len();
        let mut min_keys = leaf_min_keys.clone();
        while child_count > 1 {
            let mut groups = Vec::new();
            let mut index = 0;
            while index < child_count {
                let end = (index + INTERNAL_ORDER).min(child_count);
                groups.push((min_keys[index].clone(), (index..end).collect()));
                index = end;
            }
            min_keys = groups.iter().map(|(key, _)| key.clone()).collect();
            child_count = groups.len();
            levels.push(Level { groups });
        }
        levels.reverse(); // root level first

        let depth = levels.len() + 1;

        // Compute per-node encoded sizes and assign offsets: header, internal
        // levels in order, then leaves.
        let leaf_size = LEAF_HEADER_SIZE + LEAF_CAPACITY;
        let mut internal_sizes: Vec<Vec<usize>> = Vec::with_capacity(levels.len());
        for (level_index, level) in levels.iter().enumerate() {
            let mut sizes = Vec::with_capacity(level.groups.len());
            for (_, children) in &level.groups {
                // Separator keys are the minimum keys of children 1..n.
                let child_keys: Vec<&TreeKey> = children
                    .iter()
                    .skip(1)
                    .map(|&child| {
                        if level_index + 1 < levels.len() {
                            &levels[level_index + 1].groups[child].0
                        } else {
                            &leaf_min_keys[child]
                        }
                    })
                    .collect();
                let keys_len: usize = child_keys.iter().map(|key| key.encoded_len()).sum();
                sizes.push(3 + keys_len + 4 * children.len());
            }
            internal_sizes.push(sizes);
        }

        let mut offset = TREE_HEADER_SIZE;
        let mut internal_offsets: Vec<Vec<u32>> = Vec::with_capacity(levels.len());
        for sizes in &internal_sizes {
            let mut offsets = Vec::with_capacity(sizes.len());
            for size in sizes {
                offsets.push(offset as u32);
                offset += size;
            }
            internal_offsets.push(offsets);
        }
        let mut leaf_offsets = Vec::with_capacity(leaves.len());
        for _ in &leaves {
            leaf_offsets.push(offset as u32);
            offset += leaf_size;
        }
        let total_len = offset;

        let root_offset = if levels.is_empty() {
            leaf_offsets[0]
        } else {
            internal_offsets[0][0]
        };

        let mut out = vec![0u8; total_len];
        let header = TreeHeader {
            fill_factor: self.fill_factor,
            depth: depth as u8,
            entry_count: self.entries.len() as u32,
            root_offset,
            first_leaf_offset: leaf_offsets[0],
        };
        out[..TREE_HEADER_SIZE].copy_from_slice(&header.encode());

        for (level_index, level) in levels.iter().enumerate() {
            for (group_index, (_, children)) in level.groups.iter().enumerate() {
                let child_offset = |child: usize| -> u32 {
                    if level_index + 1 < levels.len() {
                        internal_offsets[level_index + 1][child]
                    } else {
                        leaf_offsets[child]
                    }
                };
                let child_key = |child: usize| -> &TreeKey {
                    if level_index + 1 < levels.len() {
                        &levels[level_index + 1].groups[child].0
                    } else {
                        &leaf_min_keys[child]
                    }
                };
                let mut node = Vec::new();
                node.push(NODE_INTERNAL);
                node.extend_from_slice(&((children.len() - 1) as u16).to_be_bytes());
                for window in children.windows(2) {
                    child_key(window[1]).encode(&mut node);
                    node.extend_from_slice(&child_offset(window[0]).to_be_bytes());
                }
                node.extend_from_slice(
                    &child_offset(*children.last().expect("non-empty group")).to_be_bytes(),
                );
                let start = internal_offsets[level_index][group_index] as usize;
                out[start..start + node.len()].copy_from_slice(&node);
            }
        }

        for (index, entries) in leaves.iter().enumerate() {
            let next = leaf_offsets.get(index + 1).copied().unwrap_or(0);
            let mut node = Vec::with_capacity(leaf_size);
            node.push(NODE_LEAF);
            node.extend_from_slice(&(entries.len() as u16).to_be_bytes());
            node.extend_from_slice(&next.to_be_bytes());
            node.extend_from_slice(&(LEAF_CAPACITY as u16).to_be_bytes());
            let used = TreeLeaf::used_bytes(entries);
            node.extend_from_slice(&(used as u16).to_be_bytes());
            for (key, value) in entries {
                key.encode(&mut node);
                node.extend_from_slice(&(value.len() as u16).to_be_bytes());
                node.extend_from_slice(value);
            }
            node.resize(leaf_size, 0);
            let start = leaf_offsets[index] as usize;
            out[start..start + leaf_size].copy_from_slice(&node);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_for(i: u32) -> Vec<u8> {
        format!("value-{i}").into_bytes()
    }

    fn build_tree(count: u32) -> Vec<u8> {
        let mut builder = TreeBuilder::new(FILL_FACTOR_DEFAULT);
        for i in 0..count {
            builder.set(TreeKey::Name(format!("key{i:04}")), value_for(i));
        }
        builder.build().expect("build")
    }

    #[test]
    fn key_order_indexes_before_names() {
        let mut keys = vec![
            TreeKey::Name("a".into()),
            TreeKey::Index(10),
            TreeKey::Name("0".into()),
            TreeKey::Index(2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                TreeKey::Index(2),
                TreeKey::Index(10),
                TreeKey::Name("0".into()),
                TreeKey::Name("a".into()),
            ]
        );
    }

    #[test]
    fn find_every_key_in_large_tree() {
        let mut body = build_tree(500);
        let mut tree = EmbeddedTree::new(&mut body);
        assert_eq!(tree.header().expect("header").entry_count, 500);
        assert!(tree.header().expect("header").depth > 1);
        for i in (0..500).step_by(31) {
            let found = tree
                .find(&TreeKey::Name(format!("key{i:04}")))
                .expect("find");
            assert_eq!(found, Some(value_for(i)));
        }
        assert_eq!(
            tree.find(&TreeKey::Name("missing".into())).expect("find"),
            None
        );
    }

    #[test]
    fn leaf_walk_yields_sorted_entries() {
        let mut body = build_tree(200);
        let mut tree = EmbeddedTree::new(&mut body);
        let mut seen = Vec::new();
        let mut leaf = tree.first_leaf().expect("first leaf");
        loop {
            for (key, _) in &leaf.entries {
                seen.push(key.clone());
            }
            match tree.next_leaf(&leaf).expect("next") {
                Some(next) => leaf = next,
                None => break,
            }
        }
        assert_eq!(seen.len(), 200);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn transaction_updates_in_place() {
        let mut body = build_tree(100);
        let mut tree = EmbeddedTree::new(&mut body);
        let outcome = tree
            .transaction(&[
                TreeOp::Update {
                    key: TreeKey::Name("key0007".into()),
                    value: b"patched".to_vec(),
                },
                TreeOp::Remove {
                    key: TreeKey::Name("key0008".into()),
                },
                TreeOp::Add {
                    key: TreeKey::Name("key0007b".into()),
                    value: b"inserted".to_vec(),
                },
            ])
            .expect("transaction");
        assert_eq!(outcome, TxnOutcome::Applied);
        assert_eq!(
            tree.find(&TreeKey::Name("key0007".into())).expect("find"),
            Some(b"patched".to_vec())
        );
        assert_eq!(
            tree.find(&TreeKey::Name("key0008".into())).expect("find"),
            None
        );
        assert_eq!(
            tree.find(&TreeKey::Name("key0007b".into())).expect("find"),
            Some(b"inserted".to_vec())
        );
        assert_eq!(tree.header().expect("header").entry_count, 100);
    }

    #[test]
    fn transaction_overflow_reports_rebuild_and_writes_nothing() {
        let mut body = build_tree(100);
        let before = body.clone();
        let mut tree = EmbeddedTree::new(&mut body);
        // A dense 95% tree cannot absorb many fat inserts into one leaf.
        let ops: Vec<TreeOp> = (0..40)
            .map(|i| TreeOp::Add {
                key: TreeKey::Name(format!("key0000a{i:02}")),
                value: vec![0xAB; 60],
            })
            .collect();
        let outcome = tree.transaction(&ops).expect("transaction");
        assert_eq!(outcome, TxnOutcome::NeedsRebuild);
        assert_eq!(body, before, "failed transaction must not write");
    }

    #[test]
    fn transaction_on_unknown_key_reports_rebuild() {
        let mut body = build_tree(10);
        let mut tree = EmbeddedTree::new(&mut body);
        let outcome = tree
            .transaction(&[TreeOp::Update {
                key: TreeKey::Name("nope".into()),
                value: Vec::new(),
            }])
            .expect("transaction");
        assert_eq!(outcome, TxnOutcome::NeedsRebuild);
    }

    #[test]
    fn rebuild_round_trips_all_entries() {
        let mut body = build_tree(300);
        let mut tree = EmbeddedTree::new(&mut body);
        let mut builder = tree.to_builder(FILL_FACTOR_DEFAULT).expect("builder");
        assert_eq!(builder.len(), 300);
        builder.set(TreeKey::Name("key0301".into()), b"new".to_vec());
        builder.remove(&TreeKey::Name("key0000".into()));

        let mut rebuilt = builder.build().expect("build");
        let mut tree = EmbeddedTree::new(&mut rebuilt);
        assert_eq!(tree.header().expect("header").entry_count, 300);
        assert_eq!(
            tree.find(&TreeKey::Name("key0301".into())).expect("find"),
            Some(b"new".to_vec())
        );
        assert_eq!(
            tree.find(&TreeKey::Name("key0000".into())).expect("find"),
            None
        );
    }

    #[test]
    fn fill_factor_policy() {
        let numeric = vec![TreeKey::Index(1), TreeKey::Name("42".into())];
        assert_eq!(
            TreeBuilder::fill_factor_for(numeric.iter()),
            FILL_FACTOR_NUMERIC
        );
        let mixed = vec![TreeKey::Index(1), TreeKey::Name("a42".into())];
        assert_eq!(
            TreeBuilder::fill_factor_for(mixed.iter()),
            FILL_FACTOR_DEFAULT
        );
        assert_eq!(
            TreeBuilder::fill_factor_for(std::iter::empty()),
            FILL_FACTOR_DEFAULT
        );
    }

    #[test]
    fn single_entry_tree() {
        let mut builder = TreeBuilder::new(FILL_FACTOR_DEFAULT);
        builder.set(TreeKey::Index(3), b"x".to_vec());
        let mut body = builder.build().expect("build");
        let mut tree = EmbeddedTree::new(&mut body);
        let header = tree.header().expect("header");
        assert_eq!(header.depth, 1);
        assert_eq!(header.entry_count, 1);
        assert_eq!(
            tree.find(&TreeKey::Index(3)).expect("find"),
            Some(b"x".to_vec())
        );
    }
}
