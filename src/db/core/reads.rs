use std::collections::BTreeMap;

use regex::Regex;
use tracing::trace;

use super::TreeDB;
use crate::error::{Result, TreeError};
use crate::model::{NodeAddress, NodeInfo, RecordAddress, Value, ValueType};
use crate::path::{child_path, path_key, path_keys, PathKey};
use crate::storage::locks::{LockOptions, TransactionId};
use crate::storage::reader::{read_record_info, stream_children, RecordView};
use crate::storage::record::{value_from_wire, decode_primitive, WireValue};

/// Include/exclude filtering for `get_value`. Entries are slash-separated key
/// paths relative to the read node; `*` matches any key at its depth.
#[derive(Debug, Clone, Default)]
pub struct ValueFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// `Some(false)` drops object/array children entirely.
    pub child_objects: Option<bool>,
}

impl ValueFilter {
    pub fn include(keys: &[&str]) -> Self {
        Self {
            include: keys.iter().map(|k| k.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn exclude(keys: &[&str]) -> Self {
        Self {
            exclude: keys.iter().map(|k| k.to_string()).collect(),
            ..Self::default()
        }
    }

    fn segment_matches(segment: &str, key: &PathKey) -> bool {
        if segment == "*" {
            return true;
        }
        match key {
            PathKey::Key(name) => segment == name,
            PathKey::Index(index) => segment.parse::<u32>() == Ok(*index),
        }
    }

    /// Whether a child at this depth survives the filter.
    fn allows(&self, key: &PathKey) -> bool {
        if self
            .exclude
            .iter()
            .any(|entry| !entry.contains('/') && Self::segment_matches(entry, key))
        {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|entry| {
            let head = entry.split('/').next().unwrap_or(entry);
            Self::segment_matches(head, key)
        })
    }

    /// The filter that applies one level deeper, under `key`.
    fn descend(&self, key: &PathKey) -> Self {
        let descend_entries = |entries: &[String]| -> (Vec<String>, bool) {
            let mut deeper = Vec::new();
            let mut matched_leaf = false;
            for entry in entries {
                let (head, tail) = match entry.split_once('/') {
                    Some((head, tail)) => (head, Some(tail)),
                    None => (entry.as_str(), None),
                };
                if Self::segment_matches(head, key) {
                    match tail {
                        Some(tail) => deeper.push(tail.to_string()),
                        None => matched_leaf = true,
                    }
                }
            }
            (deeper, matched_leaf)
        };
        let (include, include_leaf) = descend_entries(&self.include);
        let (exclude, _) = descend_entries(&self.exclude);
        Self {
            // A leaf include ("a") admits the whole subtree under "a".
            include: if include_leaf { Vec::new() } else { include },
            exclude,
            child_objects: self.child_objects,
        }
    }
}

/// One filter term of `matches`. All criteria must hold.
pub struct QueryCriterion {
    pub key: String,
    pub op: QueryOp,
}

pub enum QueryOp {
    LessThan(Value),
    LessOrEqual(Value),
    Equal(Value),
    NotEqual(Value),
    GreaterThan(Value),
    GreaterOrEqual(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Matches(Regex),
    NotMatches(Regex),
    Between(Value, Value),
    NotBetween(Value, Value),
    Has(String),
    NotHas(String),
    Contains(Value),
    NotContains(Value),
    Exists,
    NotExists,
    Custom(Box<dyn Fn(Option<&Value>) -> bool>),
}

impl TreeDB {
    /// Walks from the nearest cached ancestor (or the root) to `path`,
    /// acquiring a read lock per hop.
    pub fn locate(&mut self, path: &str) -> Result<NodeInfo> {
        let tid = self.next_tid();
        self.locate_with_tid(path, tid)
    }

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.locate(path)?.exists)
    }

    pub fn get_value(&mut self, path: &str) -> Result<Option<Value>> {
        self.get_value_filtered(path, &ValueFilter::default())
    }

    pub fn get_value_filtered(
        &mut self,
        path: &str,
        filter: &ValueFilter,
    ) -> Result<Option<Value>> {
        let tid = self.next_tid();
        self.get_value_with_tid(path, filter, tid)
    }

    /// Streams the children of the node at `path`. The callback returns
    /// `false` to cancel the stream.
    pub fn get_children(
        &mut self,
        path: &str,
        key_filter: Option<&[PathKey]>,
        mut callback: impl FnMut(NodeInfo) -> bool,
    ) -> Result<()> {
        let tid = self.next_tid();
        let info = self.locate_with_tid(path, tid)?;
        if !info.exists {
            return Err(TreeError::NodeNotFound(path.to_string()));
        }
        let Some(address) = info.address else {
            // Inline values (including empty composites) hold no child
            // records of their own.
            return Ok(());
        };

        let lock = self
            .locks
            .lock(path, tid, false, "get_children", LockOptions::default())?;
        let result = (|| {
            let record = read_record_info(&mut self.file, address)?;
            if !record.value_type.is_composite() {
                return Ok(());
            }
            let Self {
                ref mut file,
                ref kit,
                ref mut cache,
                ..
            } = *self;
            stream_children(file, kit, &record, key_filter, |child| {
                let child_path = child_path(path, &child.key);
                let value_type = child.value.value_type();
                let address = child.value.address();
                if let Some(address) = address {
                    cache.update_from_read(&NodeAddress::new(child_path.clone(), address));
                }
                let value = match &child.value {
                    WireValue::Record { .. } => None,
                    other => Some(value_from_wire(other)?),
                };
                Ok(callback(NodeInfo {
                    path: child_path,
                    key: Some(child.key),
                    exists: true,
                    value_type: Some(value_type),
                    address,
                    value,
                }))
            })
        })();
        lock.release()?;
        result
    }

    /// Info for one child of the node at `path`; `exists` is false when the
    /// child is absent.
    pub fn get_child_info(&mut self, path: &str, key: &PathKey) -> Result<NodeInfo> {
        let tid = self.next_tid();
        self.get_child_info_with_tid(path, key, tid)
    }

    /// Streams this node's children named by the criteria and evaluates every
    /// operator against them.
    pub fn matches(&mut self, path: &str, criteria: &[QueryCriterion]) -> Result<bool> {
        let tid = self.next_tid();
        for criterion in criteria {
            if !self.matches_criterion(path, criterion, tid)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn locate_with_tid(&mut self, path: &str, tid: TransactionId) -> Result<NodeInfo> {
        if path.is_empty() {
            let root = self.root_address()?;
            let info = read_record_info(&mut self.file, root)?;
            return Ok(NodeInfo {
                path: String::new(),
                key: None,
                exists: true,
                value_type: Some(info.value_type),
                address: Some(root),
                value: None,
            });
        }

        if self.cache.is_deleted(path) {
            return Ok(NodeInfo::missing(path));
        }
        if let Some(address) = self.cache.find(path) {
            match read_record_info(&mut self.file, address) {
                Ok(info) => {
                    let mut node = NodeInfo::missing(path);
                    node.key = path_key(path)?;
                    node.exists = true;
                    node.value_type = Some(info.value_type);
                    node.address = Some(address);
                    return Ok(node);
                }
                Err(_) => {
                    // Suspected stale entry: drop it and fall back to the
                    // ancestor walk.
                    trace!(path, "cached address failed to read, invalidating");
                    self.cache.invalidate(path, false);
                }
            }
        }

        let anchor = self
            .cache
            .find_ancestor(path)
            .map(Ok)
            .unwrap_or_else(|| self.root_address().map(|a| NodeAddress::new("", a)))?;
        let anchor_depth = path_keys(&anchor.path)?.len();
        let keys = path_keys(path)?;

        let mut current_path = anchor.path.clone();
        let mut current_address = anchor.address;
        for (depth, key) in keys.iter().enumerate().skip(anchor_depth) {
            let is_last = depth == keys.len() - 1;
            let found = self.find_child_wire(&current_path, current_address, key, tid)?;
            let next_path = child_path(&current_path, key);
            match found {
                None => return Ok(NodeInfo::missing(path)),
                Some(WireValue::Record {
                    value_type,
                    address,
                }) => {
                    if address == current_address {
                        return Err(TreeError::Corrupt(format!(
                            "record {address} references itself as a child"
                        )));
                    }
                    self.cache
                        .update_from_read(&NodeAddress::new(next_path.clone(), address));
                    if is_last {
                        return Ok(NodeInfo {
                            path: path.to_string(),
                            key: Some(key.clone()),
                            exists: true,
                            value_type: Some(value_type),
                            address: Some(address),
                            value: None,
                        });
                    }
                    current_path = next_path;
                    current_address = address;
                }
                Some(wire) => {
                    // Inline values hold no nested records, so any deeper
                    // path cannot exist.
                    if !is_last {
                        return Ok(NodeInfo::missing(path));
                    }
                    return Ok(NodeInfo {
                        path: path.to_string(),
                        key: Some(key.clone()),
                        exists: true,
                        value_type: Some(wire.value_type()),
                        address: None,
                        value: Some(value_from_wire(&wire)?),
                    });
                }
            }
        }
        // The anchor itself was the target; the cache paths above cover it.
        Err(TreeError::Corrupt(format!(
            "locate walked zero steps for \"{path}\""
        )))
    }

    pub(crate) fn get_value_with_tid(
        &mut self,
        path: &str,
        filter: &ValueFilter,
        tid: TransactionId,
    ) -> Result<Option<Value>> {
        let info = self.locate_with_tid(path, tid)?;
        if !info.exists {
            return Ok(None);
        }
        if let Some(value) = info.value {
            return Ok(Some(value));
        }
        let address = info
            .address
            .ok_or_else(|| TreeError::Corrupt(format!("node \"{path}\" has no storage")))?;
        let lock = self
            .locks
            .lock(path, tid, false, "get_value", LockOptions::default())?;
        let result = self.read_value_at(address, path, filter, tid);
        lock.release()?;
        result.map(Some)
    }

    pub(crate) fn get_child_info_with_tid(
        &mut self,
        path: &str,
        key: &PathKey,
        tid: TransactionId,
    ) -> Result<NodeInfo> {
        let info = self.locate_with_tid(path, tid)?;
        if !info.exists {
            return Err(TreeError::NodeNotFound(path.to_string()));
        }
        let target_path = child_path(path, key);
        let Some(address) = info.address else {
            return Ok(NodeInfo::missing(target_path));
        };
        let found = self.find_child_wire(path, address, key, tid)?;
        match found {
            None => Ok(NodeInfo::missing(target_path)),
            Some(wire) => {
                let value = match &wire {
                    WireValue::Record { .. } => None,
                    other => Some(value_from_wire(other)?),
                };
                Ok(NodeInfo {
                    path: target_path,
                    key: Some(key.clone()),
                    exists: true,
                    value_type: Some(wire.value_type()),
                    address: wire.address(),
                    value,
                })
            }
        }
    }

    /// Reads one child entry of a composite record under a read lock.
    fn find_child_wire(
        &mut self,
        parent_path: &str,
        parent_address: RecordAddress,
        key: &PathKey,
        tid: TransactionId,
    ) -> Result<Option<WireValue>> {
        let lock = self.locks.lock(
            parent_path,
            tid,
            false,
            "child lookup",
            LockOptions::default(),
        )?;
        let result = (|| {
            let info = read_record_info(&mut self.file, parent_address)?;
            if !info.value_type.is_composite() {
                return Ok(None);
            }
            let mut found = None;
            stream_children(
                &mut self.file,
                &self.kit,
                &info,
                Some(std::slice::from_ref(key)),
                |child| {
                    found = Some(child.value);
                    Ok(false)
                },
            )?;
            Ok(found)
        })();
        lock.release()?;
        result
    }

    /// Recursively materializes the value stored at a record, taking a read
    /// lock on every external child before descending into it.
    pub(crate) fn read_value_at(
        &mut self,
        address: RecordAddress,
        path: &str,
        filter: &ValueFilter,
        tid: TransactionId,
    ) -> Result<Value> {
        let info = read_record_info(&mut self.file, address)?;
        if !info.value_type.is_composite() {
            let data_length = info.data_length();
            let mut view = RecordView::new(&mut self.file, &info);
            let bytes = view.read(0, data_length)?;
            return decode_primitive(info.value_type, &bytes);
        }

        let is_array = info.value_type == ValueType::Array;
        let mut entries: Vec<(PathKey, WireValue)> = Vec::new();
        stream_children(&mut self.file, &self.kit, &info, None, |child| {
            entries.push((child.key, child.value));
            Ok(true)
        })?;

        let mut object = BTreeMap::new();
        let mut items: Vec<(u32, Value)> = Vec::new();
        for (key, wire) in entries {
            if !filter.allows(&key) {
                continue;
            }
            if filter.child_objects == Some(false) && wire.value_type().is_composite() {
                continue;
            }
            let value = match wire {
                WireValue::Record {
                    address: child_address,
                    ..
                } => {
                    if child_address == address {
                        return Err(TreeError::Corrupt(format!(
                            "record {address} references itself as a child"
                        )));
                    }
                    let next_path = child_path(path, &key);
                    let lock = self.locks.lock(
                        &next_path,
                        tid,
                        false,
                        "value descent",
                        LockOptions::default(),
                    )?;
                    let descended = filter.descend(&key);
                    let result = self.read_value_at(child_address, &next_path, &descended, tid);
                    lock.release()?;
                    result?
                }
                other => value_from_wire(&other)?,
            };
            match key {
                PathKey::Key(name) => {
                    object.insert(name, value);
                }
                PathKey::Index(index) => items.push((index, value)),
            }
        }

        if is_array {
            items.sort_by_key(|(index, _)| *index);
            Ok(Value::Array(items.into_iter().map(|(_, v)| v).collect()))
        } else {
            Ok(Value::Object(object))
        }
    }

    fn matches_criterion(
        &mut self,
        path: &str,
        criterion: &QueryCriterion,
        tid: TransactionId,
    ) -> Result<bool> {
        use std::cmp::Ordering;

        let key = PathKey::Key(criterion.key.clone());
        let child = self.get_child_info_with_tid(path, &key, tid)?;

        // Operators that only need existence or structure.
        match &criterion.op {
            QueryOp::Exists => return Ok(child.exists),
            QueryOp::NotExists => return Ok(!child.exists),
            QueryOp::Has(prop) | QueryOp::NotHas(prop) => {
                let has = child.exists
                    && child.value_type == Some(ValueType::Object)
                    && self
                        .get_child_info_with_tid(&child.path, &PathKey::Key(prop.clone()), tid)
                        .map(|info| info.exists)
                        .unwrap_or(false);
                return Ok(matches!(criterion.op, QueryOp::Has(_)) == has);
            }
            QueryOp::Contains(needle) | QueryOp::NotContains(needle) => {
                let mut contains = false;
                if child.exists && child.value_type == Some(ValueType::Array) {
                    if let Some(Value::Array(items)) =
                        self.child_value(&child, tid)?
                    {
                        contains = items.iter().any(|item| item == needle);
                    }
                }
                return Ok(matches!(criterion.op, QueryOp::Contains(_)) == contains);
            }
            _ => {}
        }

        let value = if child.exists {
            self.child_value(&child, tid)?
        } else {
            None
        };

        if let QueryOp::Custom(test) = &criterion.op {
            return Ok(test(value.as_ref()));
        }
        let Some(value) = value else {
            return Ok(matches!(
                criterion.op,
                QueryOp::NotEqual(_)
                    | QueryOp::NotIn(_)
                    | QueryOp::NotMatches(_)
                    | QueryOp::NotBetween(_, _)
            ));
        };

        let ordered = |other: &Value| value.partial_cmp_value(other);
        Ok(match &criterion.op {
            QueryOp::LessThan(other) => ordered(other) == Some(Ordering::Less),
            QueryOp::LessOrEqual(other) => {
                matches!(ordered(other), Some(Ordering::Less | Ordering::Equal))
            }
            QueryOp::Equal(other) => value == *other,
            QueryOp::NotEqual(other) => value != *other,
            QueryOp::GreaterThan(other) => ordered(other) == Some(Ordering::Greater),
            QueryOp::GreaterOrEqual(other) => {
                matches!(ordered(other), Some(Ordering::Greater | Ordering::Equal))
            }
            QueryOp::In(set) => set.iter().any(|item| *item == value),
            QueryOp::NotIn(set) => !set.iter().any(|item| *item == value),
            QueryOp::Matches(pattern) | QueryOp::NotMatches(pattern) => {
                let hit = match &value {
                    Value::String(s) => pattern.is_match(s),
                    _ => false,
                };
                matches!(criterion.op, QueryOp::Matches(_)) == hit
            }
            QueryOp::Between(low, high) => {
                matches!(
                    value.partial_cmp_value(low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    value.partial_cmp_value(high),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            QueryOp::NotBetween(low, high) => {
                !(matches!(
                    value.partial_cmp_value(low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    value.partial_cmp_value(high),
                    Some(Ordering::Less | Ordering::Equal)
                ))
            }
            QueryOp::Exists
            | QueryOp::NotExists
            | QueryOp::Has(_)
            | QueryOp::NotHas(_)
            | QueryOp::Contains(_)
            | QueryOp::NotContains(_)
            | QueryOp::Custom(_) => unreachable!("handled above"),
        })
    }

    fn child_value(&mut self, child: &NodeInfo, tid: TransactionId) -> Result<Option<Value>> {
        if let Some(value) = &child.value {
            return Ok(Some(value.clone()));
        }
        let Some(address) = child.address else {
            return Ok(None);
        };
        let lock = self.locks.lock(
            &child.path,
            tid,
            false,
            "criterion value",
            LockOptions::default(),
        )?;
        let result = self.read_value_at(address, &child.path, &ValueFilter::default(), tid);
        lock.release()?;
        result.map(Some)
    }
}
