use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::model::{NodeAddress, RecordAddress};
use crate::path::{is_self_or_descendant, parent_path};

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` marks a tombstone for a removed node.
    address: Option<RecordAddress>,
    expires: Instant,
}

/// Path → current record address map with idle expiry and ancestor lookup.
/// The root is never cached; it is always read from the dedicated root
/// pointer in the file header.
pub struct NodeAddressCache {
    entries: LruCache<String, CacheEntry>,
    ttl: Duration,
}

impl NodeAddressCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(1000).expect("nonzero"));
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A hit refreshes the entry's expiry. Tombstoned and expired entries
    /// read as misses.
    pub fn find(&mut self, path: &str) -> Option<RecordAddress> {
        let now = Instant::now();
        match self.entries.get_mut(path) {
            Some(entry) if entry.expires <= now => {
                self.entries.pop(path);
                None
            }
            Some(entry) => {
                entry.expires = now + self.ttl;
                entry.address
            }
            None => None,
        }
    }

    /// True when the path carries a live tombstone.
    pub fn is_deleted(&mut self, path: &str) -> bool {
        let now = Instant::now();
        match self.entries.peek(path) {
            Some(entry) if entry.expires > now => entry.address.is_none(),
            _ => false,
        }
    }

    /// Inserts or replaces the entry for the address's path. Used by the
    /// write path; overrides tombstones.
    pub fn update(&mut self, address: &NodeAddress) {
        if address.path.is_empty() {
            return;
        }
        self.entries.put(
            address.path.clone(),
            CacheEntry {
                address: Some(address.address),
                expires: Instant::now() + self.ttl,
            },
        );
    }

    /// Like `update`, but refuses to overwrite a tombstone so a read racing a
    /// delete cannot re-populate a removed path.
    pub fn update_from_read(&mut self, address: &NodeAddress) {
        if self.is_deleted(&address.path) {
            return;
        }
        self.update(address);
    }

    /// Drops the entry for `path` and every cached descendant. With
    /// `mark_as_deleted`, leaves a tombstone at `path` itself.
    pub fn invalidate(&mut self, path: &str, mark_as_deleted: bool) {
        if !path.is_empty() || !mark_as_deleted {
            let doomed: Vec<String> = self
                .entries
                .iter()
                .filter(|(cached, _)| is_self_or_descendant(cached, path))
                .map(|(cached, _)| cached.clone())
                .collect();
            let count = doomed.len();
            for cached in doomed {
                self.entries.pop(&cached);
            }
            if count > 0 {
                trace!(path, count, "invalidated cached addresses");
            }
        }
        if mark_as_deleted && !path.is_empty() {
            self.entries.put(
                path.to_string(),
                CacheEntry {
                    address: None,
                    expires: Instant::now() + self.ttl,
                },
            );
        }
    }

    /// Walks up parent paths until a cached entry is found.
    pub fn find_ancestor(&mut self, path: &str) -> Option<NodeAddress> {
        let mut current = parent_path(path)?;
        while !current.is_empty() {
            if let Some(address) = self.find(&current) {
                return Some(NodeAddress::new(current, address));
            }
            current = parent_path(&current)?;
        }
        None
    }
}
