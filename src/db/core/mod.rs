mod reads;
mod writes;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::db::config::Config;
use crate::db::subscriptions::{NodeChange, SubscriptionRegistry, SubscriptionId};
use crate::error::{Result, TreeError};
use crate::model::{RecordAddress, Value};
use crate::pager::PagedFile;
use crate::storage::cache::NodeAddressCache;
use crate::storage::fst::{FreeSpaceTable, StorageRange};
use crate::storage::header::Header;
use crate::storage::kit::KeyIndexTable;
use crate::storage::locks::{LockManager, TransactionId};
use crate::storage::reader::{read_record_info, stream_children, RecordInfo};

pub use reads::{QueryCriterion, QueryOp, ValueFilter};

/// Allocation and cache counters; also the instrumentation hook over the
/// free-space table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub page_count: u32,
    pub allocated_records: u64,
    pub free_records: u64,
    pub cached_addresses: usize,
}

/// The storage engine: a hierarchical, schemaless value tree in one paged
/// binary file. Every path resolves, through parent records, to either an
/// inline child entry or a record of its own.
pub struct TreeDB {
    pub(crate) path: PathBuf,
    pub(crate) file: PagedFile,
    pub(crate) header: Header,
    pub(crate) kit: KeyIndexTable,
    pub(crate) cache: NodeAddressCache,
    pub(crate) fst: FreeSpaceTable,
    pub(crate) locks: LockManager,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) config: Config,
    pub(crate) next_tid: TransactionId,
    pub(crate) push_counter: u32,
}

impl std::fmt::Debug for TreeDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeDB")
            .field("path", &self.path)
            .field("root", &self.header.root)
            .field("page_count", &self.fst.page_count())
            .field("config", &self.config)
            .finish()
    }
}

impl TreeDB {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, Config::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let path_ref = path.as_ref();
        let mut file = PagedFile::open(
            path_ref,
            config.page_size,
            config.record_size,
            config.use_mmap,
        )?;

        let header = match Header::read(&file.read_header_region()?)? {
            Some(header) => {
                if header.page_size != config.page_size || header.record_size != config.record_size
                {
                    // The file's own geometry wins over the configured one.
                    file = PagedFile::open(
                        path_ref,
                        header.page_size,
                        header.record_size,
                        config.use_mmap,
                    )?;
                }
                header
            }
            None => {
                let header = Header::new(config.page_size, config.record_size);
                file.write_header_region(&header.to_bytes()?)?;
                debug!(path = %path_ref.display(), "created fresh database file");
                header
            }
        };

        let kit = KeyIndexTable::new(header.kit_keys.clone(), header.kit_bytes_free());
        let mut db = Self {
            path: path_ref.to_path_buf(),
            file,
            kit,
            cache: NodeAddressCache::new(config.cache_capacity, config.cache_timeout),
            fst: FreeSpaceTable::new(header.page_size),
            locks: LockManager::new(config.lock_timeout),
            subscriptions: SubscriptionRegistry::default(),
            header,
            config,
            next_tid: 1,
            push_counter: 0,
        };

        match db.header.root {
            Some(root) => db.rebuild_free_space(root)?,
            None => db.bootstrap_root()?,
        }
        debug!(
            path = %db.path.display(),
            pages = db.fst.page_count(),
            allocated = db.fst.allocated_records(),
            "database opened"
        );
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            page_count: self.fst.page_count(),
            allocated_records: self.fst.allocated_records(),
            free_records: self.fst.free_records(),
            cached_addresses: self.cache.len(),
        }
    }

    pub fn subscribe(
        &mut self,
        path: &str,
        callback: impl Fn(&NodeChange) + Send + 'static,
    ) -> SubscriptionId {
        self.subscriptions.subscribe(path, Box::new(callback))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id);
    }

    pub fn flush(&mut self) -> Result<()> {
        self.write_file_header()?;
        self.file.sync()
    }

    pub(crate) fn next_tid(&mut self) -> TransactionId {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    pub(crate) fn root_address(&self) -> Result<RecordAddress> {
        self.header
            .root
            .ok_or_else(|| TreeError::Corrupt("root record pointer missing".into()))
    }

    /// Rewrites the file header region when the root pointer or the key
    /// index table changed.
    pub(crate) fn write_file_header(&mut self) -> Result<()> {
        self.header.kit_keys = self.kit.keys().to_vec();
        let bytes = self.header.to_bytes()?;
        self.file.write_header_region(&bytes)
    }

    /// A fresh database starts with an empty object at the root so every
    /// update has an anchor record to merge into.
    fn bootstrap_root(&mut self) -> Result<()> {
        let tid = self.next_tid();
        self.write_value_record("", &Value::Object(Default::default()), tid)?;
        self.write_file_header()
    }

    /// Reconstructs the free-space table from a depth-first reachability walk
    /// of every allocation under the root.
    fn rebuild_free_space(&mut self, root: RecordAddress) -> Result<()> {
        let mut used = Vec::new();
        self.collect_used_ranges(root, &mut used)?;
        self.fst = FreeSpaceTable::rebuild(self.header.page_size, self.file.page_count(), &used);
        Ok(())
    }

    fn collect_used_ranges(
        &mut self,
        address: RecordAddress,
        used: &mut Vec<StorageRange>,
    ) -> Result<()> {
        let info = read_record_info(&mut self.file, address)?;
        used.extend(info.allocation.ranges.iter().copied());
        if info.value_type.is_composite() {
            let mut children = Vec::new();
            stream_children(&mut self.file, &self.kit, &info, None, |child| {
                if let Some(child_address) = child.value.address() {
                    children.push(child_address);
                }
                Ok(true)
            })?;
            for child_address in children {
                if child_address == address {
                    return Err(TreeError::Corrupt(format!(
                        "record {address} references itself as a child"
                    )));
                }
                self.collect_used_ranges(child_address, used)?;
            }
        }
        Ok(())
    }

    /// Depth-first collection of the allocation ranges of a record and every
    /// descendant record; used to release a whole subtree.
    pub(crate) fn collect_subtree_ranges(
        &mut self,
        info: &RecordInfo,
        include_self: bool,
    ) -> Result<Vec<StorageRange>> {
        let mut ranges = Vec::new();
        if include_self {
            ranges.extend(info.allocation.ranges.iter().copied());
        }
        if info.value_type.is_composite() {
            let mut children = Vec::new();
            stream_children(&mut self.file, &self.kit, info, None, |child| {
                if let Some(child_address) = child.value.address() {
                    children.push(child_address);
                }
                Ok(true)
            })?;
            for child_address in children {
                if child_address == info.address {
                    return Err(TreeError::Corrupt(format!(
                        "record {} references itself as a child",
                        info.address
                    )));
                }
                let child_info = read_record_info(&mut self.file, child_address)?;
                let child_ranges = self.collect_subtree_ranges(&child_info, true)?;
                ranges.extend(child_ranges);
            }
        }
        Ok(ranges)
    }

    /// 24-character time-ordered key for `push`: a marker, a millisecond
    /// timestamp, a per-process counter, a process fingerprint and random
    /// tail, all base-36. Lexicographic order follows insertion order.
    pub(crate) fn generate_push_key(&mut self) -> String {
        use rand::Rng;

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.push_counter = self.push_counter.wrapping_add(1);
        let fingerprint = std::process::id() as u64;
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();

        let mut key = String::with_capacity(24);
        key.push('c');
        key.push_str(&base36(millis, 9));
        key.push_str(&base36(self.push_counter as u64, 4));
        key.push_str(&base36(fingerprint, 4));
        key.push_str(&base36(random, 6));
        key
    }
}

/// Fixed-width base-36 rendering, truncated to the lowest `width` digits.
fn base36(mut value: u64, width: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = vec![b'0'; width];
    for slot in out.iter_mut().rev() {
        *slot = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8(out).expect("base36 digits are ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_pads_and_truncates() {
        assert_eq!(base36(0, 4), "0000");
        assert_eq!(base36(35, 2), "0z");
        assert_eq!(base36(36, 2), "10");
        // Truncates to the lowest digits when the value overflows the width.
        assert_eq!(base36(36 * 36 + 1, 2), "01");
    }
}
