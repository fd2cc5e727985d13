//! The write path: per-update choice between inline parent entries, in-place
//! record mutation (embedded tree transactions, same-size rewrites) and
//! reallocation with a parent-chain address patch. Freed allocations are
//! released to the free-space table only after the parent chain is patched,
//! so an interrupted update can leak space but never break reachability.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use super::TreeDB;
use crate::db::core::reads::ValueFilter;
use crate::db::subscriptions::NodeChange;
use crate::error::{Result, TreeError};
use crate::model::{NodeAddress, RecordAddress, Value, ValueType};
use crate::path::{child_path, is_ancestor, parent_path, path_key, path_keys, PathKey};
use crate::storage::btree::{EmbeddedTree, TreeBuilder, TreeOp, TxnOutcome};
use crate::storage::fst::StorageRange;
use crate::storage::locks::{LockOptions, NodeLock, TransactionId};
use crate::storage::reader::{read_record_info, stream_children, tree_key_for, RecordInfo, RecordView};
use crate::storage::record::{
    build_record_header, encode_child_entry, encode_primitive_body, encode_wire_value,
    header_byte_length, wire_from_value, WireValue, KEY_TREE_THRESHOLD,
};

/// One child-level change applied by the merge engine. `NodeRef` is the
/// internal marker for a child whose storage already moved: the parent entry
/// is patched to the new address and nothing is deallocated.
#[derive(Debug, Clone)]
pub(crate) enum MergeValue {
    Assign(Value),
    NodeRef(ValueType, RecordAddress),
    Remove,
}

type ChangeSet = Vec<(PathKey, MergeValue)>;

impl TreeDB {
    /// Replaces the value at `path` entirely.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        self.update_node_entry(path, value, false, None)
    }

    /// Merges `value` (an object patch) into the node at `path`. Patch keys
    /// set to `Value::Null` remove the targeted child.
    pub fn update(&mut self, path: &str, value: Value) -> Result<()> {
        self.update_node_entry(path, value, true, None)
    }

    /// Removes the node at `path` and every descendant.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.update_node_entry(path, Value::Null, false, None)
    }

    /// Appends `value` under a generated time-ordered key and returns the
    /// key.
    pub fn push(&mut self, path: &str, value: Value) -> Result<String> {
        let key = self.generate_push_key();
        self.set(&child_path(path, &PathKey::Key(key.clone())), value)?;
        Ok(key)
    }

    /// Reads the current value at `path` under a write lock, passes it to
    /// `mutate`, and stores the returned value. Returning `None` cancels the
    /// transaction without writing.
    pub fn transaction(
        &mut self,
        path: &str,
        mutate: impl FnOnce(Option<Value>) -> Option<Value>,
    ) -> Result<()> {
        let tid = self.next_tid();
        let lock = self
            .locks
            .lock(path, tid, true, "transaction", LockOptions::default())?;
        let current = match self.get_value_with_tid(path, &ValueFilter::default(), tid) {
            Ok(value) => value,
            Err(err) => {
                let _ = lock.release();
                return Err(err);
            }
        };
        let result = match mutate(current) {
            None => {
                trace!(path, tid, "transaction cancelled");
                Ok(())
            }
            Some(value) => self.update_node_entry(path, value, false, Some(tid)),
        };
        lock.release()?;
        result
    }

    fn update_node_entry(
        &mut self,
        path: &str,
        value: Value,
        merge: bool,
        tid: Option<TransactionId>,
    ) -> Result<()> {
        let tid = match tid {
            Some(tid) => tid,
            None => self.next_tid(),
        };

        // The highest subscribed path decides where old/new values are
        // captured; without subscribers that work is skipped entirely.
        let top_path = self.subscriptions.top_event_path(path);
        let spine_start = match &top_path {
            Some(top) if top == path || is_ancestor(top, path) => top.clone(),
            _ => path.to_string(),
        };

        let mut lock = self
            .locks
            .lock(&spine_start, tid, true, "update", LockOptions::default())?;
        let old_top = match &top_path {
            Some(top) => match self.get_value_with_tid(top, &ValueFilter::default(), tid) {
                Ok(value) => value,
                Err(err) => {
                    let _ = lock.release();
                    return Err(err);
                }
            },
            None => None,
        };

        let result = self.update_node_inner(path, value, merge, tid, &mut lock);

        let new_top = match (&result, &top_path) {
            (Ok(()), Some(top)) => self
                .get_value_with_tid(top, &ValueFilter::default(), tid)
                .ok()
                .flatten(),
            _ => None,
        };
        let released = lock.release();
        result?;
        released?;

        if let Some(top) = top_path {
            self.subscriptions.notify(&NodeChange {
                path: top,
                old: old_top,
                new: new_top,
            });
        }
        Ok(())
    }

    fn update_node_inner(
        &mut self,
        path: &str,
        value: Value,
        merge: bool,
        tid: TransactionId,
        lock: &mut NodeLock,
    ) -> Result<()> {
        if value.is_null() {
            if path.is_empty() {
                // Clearing the root resets it to an empty object.
                return self.overwrite_at(path, Value::Object(Default::default()), tid, lock);
            }
            let parent = parent_path(path).expect("non-root path has a parent");
            let key = path_key(path)?.expect("non-root path has a key");
            if !self.locate_with_tid(&parent, tid)?.exists {
                return Ok(());
            }
            return self.merge_into(&parent, vec![(key, MergeValue::Remove)], tid, lock);
        }

        // Merging a non-object value degrades to a plain set.
        if merge && matches!(value, Value::Object(_)) {
            let Value::Object(map) = value else {
                unreachable!("checked above")
            };
            if map.is_empty() {
                return Ok(());
            }
            let changes: ChangeSet = map
                .into_iter()
                .map(|(key, child)| {
                    let change = if child.is_null() {
                        MergeValue::Remove
                    } else {
                        MergeValue::Assign(child)
                    };
                    (PathKey::Key(key), change)
                })
                .collect();
            return self.merge_into(path, changes, tid, lock);
        }

        if !path.is_empty()
            && wire_from_value(&value, self.config.max_inline_value_size as usize)?.is_some()
        {
            // The value fits inside the parent record; delegate.
            let parent = parent_path(path).expect("non-root path has a parent");
            let key = path_key(path)?.expect("non-root path has a key");
            return self.merge_into(&parent, vec![(key, MergeValue::Assign(value))], tid, lock);
        }

        self.overwrite_at(path, value, tid, lock)
    }

    /// Merges a change set into the node at `path`, materializing the node
    /// first when it does not exist or has no record of its own.
    fn merge_into(
        &mut self,
        path: &str,
        changes: ChangeSet,
        tid: TransactionId,
        lock: &mut NodeLock,
    ) -> Result<()> {
        let target = self.locate_with_tid(path, tid)?;
        if !target.exists {
            if changes
                .iter()
                .all(|(_, change)| matches!(change, MergeValue::Remove))
            {
                return Ok(());
            }
            let value = changes_to_value(changes)?;
            return self.create_with_ancestors(path, value, tid, lock);
        }

        let has_composite_record = match target.address {
            Some(address) => read_record_info(&mut self.file, address)?
                .value_type
                .is_composite(),
            None => false,
        };
        if !has_composite_record {
            // The node is inline in its parent, or a primitive record:
            // merging turns it into a composite built from the changes.
            if changes
                .iter()
                .all(|(_, change)| matches!(change, MergeValue::Remove))
            {
                return Ok(());
            }
            let value = changes_to_value(changes)?;
            return self.overwrite_at(path, value, tid, lock);
        }

        self.propagate_changes(path, changes, tid, lock, Vec::new())
    }

    /// Materializes missing ancestors as nested objects and merges the
    /// wrapped value at the deepest existing one.
    fn create_with_ancestors(
        &mut self,
        path: &str,
        value: Value,
        tid: TransactionId,
        lock: &mut NodeLock,
    ) -> Result<()> {
        let keys = path_keys(path)?;
        let mut anchor_depth = keys.len() - 1;
        loop {
            let anchor: String = {
                let mut rebuilt = String::new();
                for key in &keys[..anchor_depth] {
                    rebuilt = child_path(&rebuilt, key);
                }
                rebuilt
            };
            if anchor.is_empty() || self.locate_with_tid(&anchor, tid)?.exists {
                // Wrap the value in objects for every missing step.
                let mut wrapped = value;
                for key in keys[anchor_depth + 1..].iter().rev() {
                    let name = key.as_key().ok_or_else(|| {
                        TreeError::UnsupportedValue(format!(
                            "cannot create missing array ancestor in \"{path}\""
                        ))
                    })?;
                    wrapped = Value::Object(BTreeMap::from([(name.to_string(), wrapped)]));
                }
                let first_key = keys[anchor_depth].clone();
                debug!(path, anchor = %anchor, "creating missing ancestors");
                return self.merge_into(
                    &anchor,
                    vec![(first_key, MergeValue::Assign(wrapped))],
                    tid,
                    lock,
                );
            }
            anchor_depth -= 1;
        }
    }

    /// Replaces the node at `path` with a freshly written record, scheduling
    /// the previous subtree for deallocation and patching the parent chain.
    fn overwrite_at(
        &mut self,
        path: &str,
        value: Value,
        tid: TransactionId,
        lock: &mut NodeLock,
    ) -> Result<()> {
        let target = self.locate_with_tid(path, tid)?;
        if !target.exists && !path.is_empty() {
            return self.create_with_ancestors(path, value, tid, lock);
        }
        lock.move_to(path, true)?;

        let mut deallocs = Vec::new();
        if let Some(address) = target.address {
            let info = read_record_info(&mut self.file, address)?;
            deallocs = self.collect_subtree_ranges(&info, true)?;
        }
        self.cache.invalidate(path, false);

        let (value_type, new_info) = self.write_value_record(path, &value, tid)?;
        if path.is_empty() {
            self.fst.release(&deallocs);
            return Ok(());
        }

        let parent = parent_path(path).expect("non-root path has a parent");
        let key = path_key(path)?.expect("non-root path has a key");
        lock.move_to_parent()?;
        self.propagate_changes(
            &parent,
            vec![(key, MergeValue::NodeRef(value_type, new_info.address))],
            tid,
            lock,
            deallocs,
        )
    }

    /// Applies a change set to the record at `path`, then walks the parent
    /// chain patching addresses as long as records relocate. Deallocations
    /// are released only after the chain is stable.
    fn propagate_changes(
        &mut self,
        path: &str,
        changes: ChangeSet,
        tid: TransactionId,
        lock: &mut NodeLock,
        mut deallocs: Vec<StorageRange>,
    ) -> Result<()> {
        let mut current_path = path.to_string();
        let mut current_changes = changes;
        loop {
            lock.move_to(&current_path, true)?;
            let (new_info, moved) =
                self.apply_changes_at(&current_path, &current_changes, tid, &mut deallocs)?;
            if !moved || current_path.is_empty() {
                break;
            }
            let key = path_key(&current_path)?.expect("non-root path has a key");
            let parent = parent_path(&current_path).expect("non-root path has a parent");
            trace!(
                path = %current_path,
                address = %new_info.address,
                "record relocated, patching parent"
            );
            current_changes = vec![(
                key,
                MergeValue::NodeRef(new_info.value_type, new_info.address),
            )];
            lock.move_to_parent()?;
            current_path = parent;
        }
        self.fst.release(&deallocs);
        Ok(())
    }

    /// The merge engine proper: rewrites one composite record's child set.
    /// Returns the resulting record info and whether the record relocated.
    fn apply_changes_at(
        &mut self,
        path: &str,
        changes: &ChangeSet,
        tid: TransactionId,
        deallocs: &mut Vec<StorageRange>,
    ) -> Result<(RecordInfo, bool)> {
        let address = self
            .locate_with_tid(path, tid)?
            .address
            .ok_or_else(|| TreeError::Corrupt(format!("node \"{path}\" has no record to merge")))?;
        let record = read_record_info(&mut self.file, address)?;
        if !record.value_type.is_composite() {
            return Err(TreeError::Corrupt(format!(
                "cannot merge children into a {:?} record",
                record.value_type
            )));
        }
        let is_array = record.value_type == ValueType::Array;

        // Affected children only, via a key-filtered stream.
        let filter_keys: Vec<PathKey> = changes.iter().map(|(key, _)| key.clone()).collect();
        let mut existing: Vec<(PathKey, WireValue)> = Vec::new();
        stream_children(
            &mut self.file,
            &self.kit,
            &record,
            Some(&filter_keys),
            |child| {
                existing.push((child.key, child.value));
                Ok(true)
            },
        )?;
        let existing_wire = |key: &PathKey| {
            existing
                .iter()
                .find(|(existing_key, _)| existing_key == key)
                .map(|(_, wire)| wire.clone())
        };

        // Array entries in a tree record are keyed by index; reject a batch
        // that would leave the index sequence non-contiguous before anything
        // is mutated. The same rule guards the linear layout below; here it
        // covers both the in-place tree transaction and its rebuild fallback.
        if is_array && record.has_key_tree {
            let count = {
                let mut view = RecordView::new(&mut self.file, &record);
                EmbeddedTree::new(&mut view).header()?.entry_count
            };
            let mut indexes: BTreeSet<u32> = (0..count).collect();
            for (key, change) in changes {
                let index = key.as_index().ok_or_else(|| {
                    TreeError::Corrupt("child key kind does not match record layout".into())
                })?;
                match change {
                    MergeValue::Remove => {
                        if existing_wire(key).is_some() {
                            indexes.remove(&index);
                        }
                    }
                    MergeValue::Assign(_) | MergeValue::NodeRef(..) => {
                        indexes.insert(index);
                    }
                }
            }
            for (expected, index) in indexes.iter().enumerate() {
                if *index != expected as u32 {
                    return Err(TreeError::UnsupportedValue(format!(
                        "update leaves array \"{path}\" non-contiguous"
                    )));
                }
            }
        }

        // Schedule replaced/removed external children for deallocation and
        // keep the address cache honest. An incoming NodeRef means the
        // child's storage already moved; that is an address swap only.
        for (key, change) in changes {
            let target_path = child_path(path, key);
            match change {
                MergeValue::Assign(_) => self.cache.invalidate(&target_path, false),
                MergeValue::Remove => self.cache.invalidate(&target_path, true),
                MergeValue::NodeRef(..) => {}
            }
            if let Some(old_address) = existing_wire(key).and_then(|wire| wire.address()) {
                if matches!(change, MergeValue::NodeRef(..)) {
                    continue;
                }
                if old_address == address {
                    return Err(TreeError::Corrupt(format!(
                        "record {address} references itself as a child"
                    )));
                }
                let child_lock = self.locks.lock(
                    &target_path,
                    tid,
                    false,
                    "merge reclaim",
                    LockOptions::default(),
                )?;
                let result = (|| {
                    let child_info = read_record_info(&mut self.file, old_address)?;
                    self.collect_subtree_ranges(&child_info, true)
                })();
                child_lock.release()?;
                deallocs.extend(result?);
            }
        }

        // Compute the new wire form of every change; children that no longer
        // fit inline get their own records first.
        let mut ops: Vec<(PathKey, Option<WireValue>)> = Vec::new();
        for (key, change) in changes {
            match change {
                MergeValue::Remove => {
                    if existing_wire(key).is_some() {
                        ops.push((key.clone(), None));
                    }
                }
                MergeValue::NodeRef(value_type, new_address) => {
                    ops.push((
                        key.clone(),
                        Some(WireValue::Record {
                            value_type: *value_type,
                            address: *new_address,
                        }),
                    ));
                }
                MergeValue::Assign(value) => {
                    let wire =
                        match wire_from_value(value, self.config.max_inline_value_size as usize)? {
                            Some(wire) => wire,
                            None => {
                                let target_path = child_path(path, key);
                                let (value_type, child_info) =
                                    self.write_value_record(&target_path, value, tid)?;
                                WireValue::Record {
                                    value_type,
                                    address: child_info.address,
                                }
                            }
                        };
                    ops.push((key.clone(), Some(wire)));
                }
            }
        }

        if ops.is_empty() {
            // Nothing survives the change set (e.g. removing absent keys).
            return Ok((record, false));
        }

        if record.has_key_tree {
            let mut tree_ops = Vec::with_capacity(ops.len());
            for (key, op) in &ops {
                let tree_key = tree_key_for(key);
                let tree_op = match op {
                    None => TreeOp::Remove { key: tree_key },
                    Some(wire) => {
                        let mut bytes = Vec::new();
                        encode_wire_value(wire, &mut bytes)?;
                        if existing_wire(key).is_some() {
                            TreeOp::Update {
                                key: tree_key,
                                value: bytes,
                            }
                        } else {
                            TreeOp::Add {
                                key: tree_key,
                                value: bytes,
                            }
                        }
                    }
                };
                tree_ops.push(tree_op);
            }

            let outcome = {
                let mut view = RecordView::new(&mut self.file, &record);
                EmbeddedTree::new(&mut view).transaction(&tree_ops)?
            };
            if outcome == TxnOutcome::Applied {
                return Ok((record, false));
            }

            // Rebuild through the builder with a recomputed fill factor.
            let mut builder = {
                let mut view = RecordView::new(&mut self.file, &record);
                EmbeddedTree::new(&mut view).to_builder(100)?
            };
            for (key, op) in &ops {
                match op {
                    None => builder.remove(&tree_key_for(key)),
                    Some(wire) => {
                        let mut bytes = Vec::new();
                        encode_wire_value(wire, &mut bytes)?;
                        builder.set(tree_key_for(key), bytes);
                    }
                }
            }
            let fill_factor = TreeBuilder::fill_factor_for(builder.keys());
            let builder = builder.with_fill_factor(fill_factor);
            let body = builder.build()?;
            debug!(path, entries = builder.len(), "embedded tree rebuilt");
            let (new_info, reused) =
                self.write_record(path, record.value_type, &body, true, Some(&record))?;
            if !reused {
                deallocs.extend(record.allocation.ranges.iter().copied());
            }
            return Ok((new_info, !reused));
        }

        // Linear layout: rebuild the full child list. External children keep
        // their addresses, so their storage is preserved untouched.
        let mut all: Vec<(PathKey, WireValue)> = Vec::new();
        stream_children(&mut self.file, &self.kit, &record, None, |child| {
            all.push((child.key, child.value));
            Ok(true)
        })?;
        for (key, op) in ops {
            let position = all.iter().position(|(existing_key, _)| *existing_key == key);
            match (position, op) {
                (Some(index), Some(wire)) => all[index].1 = wire,
                (Some(index), None) => {
                    all.remove(index);
                }
                (None, Some(wire)) => all.push((key, wire)),
                (None, None) => {}
            }
        }

        if is_array {
            all.sort_by_key(|(key, _)| key.as_index().unwrap_or(u32::MAX));
            for (expected, (key, _)) in all.iter().enumerate() {
                if key.as_index() != Some(expected as u32) {
                    return Err(TreeError::UnsupportedValue(format!(
                        "update leaves array \"{path}\" non-contiguous"
                    )));
                }
            }
        }

        let (body, has_tree) = self.serialize_children(&all, is_array)?;
        let (new_info, reused) =
            self.write_record(path, record.value_type, &body, has_tree, Some(&record))?;
        if !reused {
            deallocs.extend(record.allocation.ranges.iter().copied());
        }
        Ok((new_info, !reused))
    }

    /// Writes a full value as a fresh record, recursing into children that
    /// need records of their own (children first, then the parent that
    /// references them).
    pub(crate) fn write_value_record(
        &mut self,
        path: &str,
        value: &Value,
        tid: TransactionId,
    ) -> Result<(ValueType, RecordInfo)> {
        let value_type = value.value_type()?;
        let (body, has_tree) = match value {
            Value::Object(map) => {
                let mut entries: Vec<(PathKey, WireValue)> = Vec::with_capacity(map.len());
                for (key, child) in map {
                    if child.is_null() {
                        continue;
                    }
                    let key = PathKey::Key(key.clone());
                    let wire = self.child_wire(path, &key, child, tid)?;
                    entries.push((key, wire));
                }
                self.serialize_children(&entries, false)?
            }
            Value::Array(items) => {
                let mut entries: Vec<(PathKey, WireValue)> = Vec::with_capacity(items.len());
                for (index, child) in items.iter().enumerate() {
                    if child.is_null() {
                        return Err(TreeError::UnsupportedValue(format!(
                            "array at \"{path}\" contains null"
                        )));
                    }
                    let key = PathKey::Index(index as u32);
                    let wire = self.child_wire(path, &key, child, tid)?;
                    entries.push((key, wire));
                }
                self.serialize_children(&entries, true)?
            }
            primitive => (encode_primitive_body(primitive)?, false),
        };
        let (info, _) = self.write_record(path, value_type, &body, has_tree, None)?;
        Ok((value_type, info))
    }

    fn child_wire(
        &mut self,
        path: &str,
        key: &PathKey,
        child: &Value,
        tid: TransactionId,
    ) -> Result<WireValue> {
        match wire_from_value(child, self.config.max_inline_value_size as usize)? {
            Some(wire) => Ok(wire),
            None => {
                let target_path = child_path(path, key);
                let (value_type, info) = self.write_value_record(&target_path, child, tid)?;
                Ok(WireValue::Record {
                    value_type,
                    address: info.address,
                })
            }
        }
    }

    /// Serializes a child set as either a linear entry list or, past the
    /// promotion threshold, an embedded key tree.
    fn serialize_children(
        &mut self,
        entries: &[(PathKey, WireValue)],
        is_array: bool,
    ) -> Result<(Vec<u8>, bool)> {
        if entries.len() > KEY_TREE_THRESHOLD {
            let mut builder = TreeBuilder::new(100);
            for (key, wire) in entries {
                let mut bytes = Vec::new();
                encode_wire_value(wire, &mut bytes)?;
                builder.set(tree_key_for(key), bytes);
            }
            let fill_factor = TreeBuilder::fill_factor_for(builder.keys());
            let builder = builder.with_fill_factor(fill_factor);
            return Ok((builder.build()?, true));
        }

        let mut body = Vec::new();
        for (key, wire) in entries {
            let name = match (key, is_array) {
                (PathKey::Key(name), false) => Some(name.as_str()),
                (PathKey::Index(_), true) => None,
                _ => {
                    return Err(TreeError::Corrupt(
                        "child key kind does not match record layout".into(),
                    ))
                }
            };
            encode_child_entry(name, wire, &mut self.kit, &mut body)?;
        }
        Ok((body, false))
    }

    /// Allocates (or reuses) storage for a record and writes header plus
    /// body across its ranges. Registers the new address in the cache, or in
    /// the root pointer for the root path.
    pub(crate) fn write_record(
        &mut self,
        path: &str,
        value_type: ValueType,
        body: &[u8],
        has_key_tree: bool,
        current: Option<&RecordInfo>,
    ) -> Result<(RecordInfo, bool)> {
        let record_size = self.header.record_size as usize;
        let records_for = |header_len: usize| -> u32 {
            ((header_len + body.len() + record_size - 1) / record_size).max(1) as u32
        };

        let mut reused = false;
        let mut allocation = None;
        if let Some(current) = current {
            let needed = records_for(header_byte_length(&current.allocation.ranges));
            if needed == current.allocation.total_records() {
                allocation = Some(current.allocation.clone());
                reused = true;
            }
        }

        let mut allocation = match allocation {
            Some(allocation) => allocation,
            None => {
                // Worst-case chunking grows the header, which can grow the
                // record count; iterate until the allocation covers both the
                // body and its own chunk table, with the whole header inside
                // the first range.
                let mut request = records_for(4);
                if request > 1 {
                    request = records_for(4 + 3);
                }
                let mut min_first: u16 = 1;
                let mut attempts = 0;
                loop {
                    let mut alloc = self.fst.allocate_with_min_first(request, min_first)?;
                    let header_len = header_byte_length(&alloc.ranges);
                    let needed = records_for(header_len);
                    let first_covers_header =
                        alloc.ranges[0].length as usize * record_size >= header_len;
                    if needed <= alloc.total_records() && first_covers_header {
                        let tail = alloc.trim(needed);
                        self.fst.release(&tail);
                        break alloc;
                    }
                    self.fst.release(&alloc.ranges);
                    request = request.max(needed);
                    min_first = min_first
                        .max(((header_len + record_size - 1) / record_size) as u16)
                        .min(self.header.page_size);
                    attempts += 1;
                    if attempts > 32 {
                        return Err(TreeError::Corrupt(
                            "record allocation did not converge".into(),
                        ));
                    }
                }
            }
        };

        // Trimming may have dropped ranges and shrunk the header below a
        // record boundary; trim again until stable.
        loop {
            let needed = records_for(header_byte_length(&allocation.ranges));
            if needed >= allocation.total_records() {
                break;
            }
            let tail = allocation.trim(needed);
            self.fst.release(&tail);
        }

        let header_len = header_byte_length(&allocation.ranges);
        let total_records = allocation.total_records();
        let total_bytes = header_len + body.len();
        let last_chunk_size = (total_bytes - (total_records as usize - 1) * record_size) as u16;
        let header = build_record_header(value_type, has_key_tree, &allocation, last_chunk_size);
        debug_assert_eq!(header.len(), header_len);

        let mut bytes = header;
        bytes.extend_from_slice(body);
        let mut offset = 0usize;
        for range in &allocation.ranges {
            let range_bytes = range.length as usize * record_size;
            let end = (offset + range_bytes).min(bytes.len());
            let file_index = self.file.file_index(range.page_nr, range.record_nr);
            self.file.write_data(file_index, &bytes[offset..end])?;
            offset = end;
        }

        let address = allocation.address();
        let info = RecordInfo {
            address,
            value_type,
            has_key_tree,
            allocation,
            header_length: header_len,
            last_chunk_size,
            bytes_per_record: record_size as u16,
        };

        if path.is_empty() {
            self.header.root = Some(address);
            self.write_file_header()?;
        } else {
            self.cache.update(&NodeAddress::new(path, address));
            if self.kit.take_dirty() {
                self.write_file_header()?;
            }
        }
        trace!(path, %address, records = total_records, reused, "record written");
        Ok((info, reused))
    }
}

/// Builds the value a change set stands for when there is no existing node to
/// merge into.
fn changes_to_value(changes: ChangeSet) -> Result<Value> {
    let mut object = BTreeMap::new();
    let mut items: Vec<(u32, Value)> = Vec::new();
    for (key, change) in changes {
        let value = match change {
            MergeValue::Assign(value) => value,
            MergeValue::Remove => continue,
            MergeValue::NodeRef(..) => {
                return Err(TreeError::Corrupt(
                    "address patch targets a missing node".into(),
                ))
            }
        };
        match key {
            PathKey::Key(name) => {
                object.insert(name, value);
            }
            PathKey::Index(index) => items.push((index, value)),
        }
    }
    if !object.is_empty() && !items.is_empty() {
        return Err(TreeError::UnsupportedValue(
            "change set mixes object keys and array indexes".into(),
        ));
    }
    if !items.is_empty() {
        items.sort_by_key(|(index, _)| *index);
        for (expected, (index, _)) in items.iter().enumerate() {
            if *index != expected as u32 {
                return Err(TreeError::UnsupportedValue(
                    "array creation requires contiguous indexes from 0".into(),
                ));
            }
        }
        return Ok(Value::Array(items.into_iter().map(|(_, v)| v).collect()));
    }
    Ok(Value::Object(object))
}
