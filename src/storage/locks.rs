use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::error::{Result, TreeError};
use crate::path::{parent_path, paths_overlap};

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Pending,
    Locked,
    Expired,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// Jumps the FIFO queue; reserved for path migration.
    pub with_priority: bool,
    /// Suppresses the granted-lock expiry timer.
    pub no_timeout: bool,
}

#[derive(Debug)]
struct LockEntry {
    id: u64,
    path: String,
    tid: TransactionId,
    for_writing: bool,
    state: LockState,
    priority: bool,
    seq: u64,
    expires_at: Option<Instant>,
    comment: String,
}

impl LockEntry {
    fn conflicts_with(&self, path: &str, tid: TransactionId, for_writing: bool) -> bool {
        self.tid != tid
            && self.state == LockState::Locked
            && (self.for_writing || for_writing)
            && paths_overlap(&self.path, path)
    }
}

#[derive(Debug, Default)]
struct LockRegistry {
    locks: Vec<LockEntry>,
    next_id: u64,
    next_seq: u64,
}

impl LockRegistry {
    /// Transitions granted locks past their deadline to `Expired`. Expired
    /// locks stop blocking others but poison their transaction id.
    fn expire_stale(&mut self, now: Instant) {
        for entry in &mut self.locks {
            if entry.state == LockState::Locked
                && entry.expires_at.map(|at| at <= now).unwrap_or(false)
            {
                warn!(
                    path = %entry.path,
                    tid = entry.tid,
                    comment = %entry.comment,
                    "lock expired"
                );
                entry.state = LockState::Expired;
            }
        }
    }

    fn tid_is_poisoned(&self, tid: TransactionId) -> bool {
        self.locks
            .iter()
            .any(|entry| entry.tid == tid && entry.state == LockState::Expired)
    }

    fn is_grantable(&self, path: &str, tid: TransactionId, for_writing: bool) -> bool {
        !self
            .locks
            .iter()
            .any(|entry| entry.conflicts_with(path, tid, for_writing))
    }

    /// One scan over the queue: priority requests first, then insertion
    /// order; every request whose conflict is gone is granted.
    fn process_queue(&mut self, timeout: Duration, now: Instant) {
        let mut pending: Vec<(bool, u64, u64)> = self
            .locks
            .iter()
            .filter(|entry| entry.state == LockState::Pending)
            .map(|entry| (!entry.priority, entry.seq, entry.id))
            .collect();
        pending.sort_unstable();
        for (_, _, id) in pending {
            let candidate = self
                .locks
                .iter()
                .find(|entry| entry.id == id)
                .map(|entry| (entry.path.clone(), entry.tid, entry.for_writing));
            let Some((path, tid, for_writing)) = candidate else {
                continue;
            };
            if self.is_grantable(&path, tid, for_writing) {
                let entry = self
                    .locks
                    .iter_mut()
                    .find(|entry| entry.id == id)
                    .expect("entry still present");
                entry.state = LockState::Locked;
                // Expiry restarts from the grant, not the request.
                entry.expires_at = entry.expires_at.map(|_| now + timeout);
                trace!(path = %entry.path, tid = entry.tid, "queued lock granted");
            }
        }
    }

    fn remove(&mut self, id: u64) -> Option<LockEntry> {
        let index = self.locks.iter().position(|entry| entry.id == id)?;
        Some(self.locks.remove(index))
    }
}

#[derive(Debug)]
struct LockShared {
    registry: Mutex<LockRegistry>,
    released: Condvar,
    timeout: Duration,
}

/// Hierarchical read/write locks keyed by path and transaction id. A write
/// lock conflicts with any other-transaction lock on the same root-to-leaf
/// line; two reads never conflict; locks of one transaction id never conflict
/// with each other. Cloning yields another handle to the same lock space.
#[derive(Debug, Clone)]
pub struct LockManager {
    shared: Arc<LockShared>,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(LockShared {
                registry: Mutex::new(LockRegistry::default()),
                released: Condvar::new(),
                timeout,
            }),
        }
    }

    pub fn lock(
        &self,
        path: &str,
        tid: TransactionId,
        for_writing: bool,
        comment: &str,
        options: LockOptions,
    ) -> Result<NodeLock> {
        let mut registry = self.shared.registry.lock();
        let now = Instant::now();
        registry.expire_stale(now);
        if registry.tid_is_poisoned(tid) {
            return Err(TreeError::LockExpired(format!(
                "transaction {tid} holds an expired lock; start a new transaction"
            )));
        }

        let id = registry.next_id;
        registry.next_id += 1;
        let seq = registry.next_seq;
        registry.next_seq += 1;
        let expires_at = if options.no_timeout {
            None
        } else {
            Some(now + self.shared.timeout)
        };
        let grantable = registry.is_grantable(path, tid, for_writing);
        registry.locks.push(LockEntry {
            id,
            path: path.to_string(),
            tid,
            for_writing,
            state: if grantable {
                LockState::Locked
            } else {
                LockState::Pending
            },
            priority: options.with_priority,
            seq,
            expires_at,
            comment: comment.to_string(),
        });

        if grantable {
            trace!(path, tid, for_writing, comment, "lock granted");
        } else {
            trace!(path, tid, for_writing, comment, "lock queued");
            self.wait_for_grant(&mut registry, id, path, tid)?;
        }
        drop(registry);
        Ok(NodeLock {
            manager: self.clone(),
            id,
            path: path.to_string(),
            tid,
            for_writing,
            released: false,
        })
    }

    fn wait_for_grant(
        &self,
        registry: &mut MutexGuard<'_, LockRegistry>,
        id: u64,
        path: &str,
        tid: TransactionId,
    ) -> Result<()> {
        let deadline = Instant::now() + self.shared.timeout;
        loop {
            let state = registry
                .locks
                .iter()
                .find(|entry| entry.id == id)
                .map(|entry| entry.state);
            match state {
                Some(LockState::Locked) => return Ok(()),
                Some(LockState::Pending) => {}
                _ => {
                    return Err(TreeError::LockConflict(format!(
                        "pending lock on \"{path}\" vanished"
                    )))
                }
            }
            if self
                .shared
                .released
                .wait_until(registry, deadline)
                .timed_out()
            {
                registry.remove(id);
                return Err(TreeError::LockConflict(format!(
                    "timed out waiting for lock on \"{path}\" (tid {tid})"
                )));
            }
            let now = Instant::now();
            registry.expire_stale(now);
            registry.process_queue(self.shared.timeout, now);
        }
    }

    fn release_entry(&self, id: u64) -> Option<LockState> {
        let mut registry = self.shared.registry.lock();
        let removed = registry.remove(id).map(|entry| entry.state);
        let now = Instant::now();
        registry.expire_stale(now);
        registry.process_queue(self.shared.timeout, now);
        drop(registry);
        self.shared.released.notify_all();
        removed
    }

    /// Number of currently granted locks; test and diagnostics hook.
    pub fn granted_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .locks
            .iter()
            .filter(|entry| entry.state == LockState::Locked)
            .count()
    }
}

/// A held lock. Dropping it releases; explicit `release` surfaces expiry.
pub struct NodeLock {
    manager: LockManager,
    id: u64,
    path: String,
    tid: TransactionId,
    for_writing: bool,
    released: bool,
}

impl NodeLock {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    pub fn for_writing(&self) -> bool {
        self.for_writing
    }

    /// Moves this lock to the parent path, keeping the write flag.
    pub fn move_to_parent(&mut self) -> Result<()> {
        let Some(parent) = parent_path(&self.path) else {
            return Ok(()); // already at root
        };
        let for_writing = self.for_writing;
        self.move_to(&parent, for_writing)
    }

    /// Migrates this lock to another path. When the target is immediately
    /// grantable the lock's path is mutated in place; otherwise the lock is
    /// released and re-acquired with priority, ahead of ordinary waiters.
    pub fn move_to(&mut self, other_path: &str, for_writing: bool) -> Result<()> {
        let manager = self.manager.clone();
        let mut registry = manager.shared.registry.lock();
        let now = Instant::now();
        registry.expire_stale(now);

        let state = registry
            .locks
            .iter()
            .find(|entry| entry.id == self.id)
            .map(|entry| entry.state);
        match state {
            Some(LockState::Expired) => {
                return Err(TreeError::LockExpired(format!(
                    "lock on \"{}\" expired before migration (tid {})",
                    self.path, self.tid
                )))
            }
            Some(_) => {}
            None => {
                return Err(TreeError::LockConflict(format!(
                    "lock on \"{}\" is no longer held",
                    self.path
                )))
            }
        }

        if registry.is_grantable(other_path, self.tid, for_writing) {
            let entry = registry
                .locks
                .iter_mut()
                .find(|entry| entry.id == self.id)
                .expect("entry present");
            entry.path = other_path.to_string();
            entry.for_writing = for_writing;
            self.path = other_path.to_string();
            self.for_writing = for_writing;
            // The vacated path may unblock waiters.
            registry.process_queue(manager.shared.timeout, now);
            drop(registry);
            manager.shared.released.notify_all();
            return Ok(());
        }

        // Re-acquire with priority. The current entry is removed without a
        // queue drain so no ordinary waiter slips in between.
        registry.remove(self.id);
        let id = registry.next_id;
        registry.next_id += 1;
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.locks.push(LockEntry {
            id,
            path: other_path.to_string(),
            tid: self.tid,
            for_writing,
            state: LockState::Pending,
            priority: true,
            seq,
            expires_at: Some(now + manager.shared.timeout),
            comment: format!("migrated from \"{}\"", self.path),
        });
        registry.process_queue(manager.shared.timeout, now);
        let outcome = manager.wait_for_grant(&mut registry, id, other_path, self.tid);
        drop(registry);
        match outcome {
            Ok(()) => {
                self.id = id;
                self.path = other_path.to_string();
                self.for_writing = for_writing;
                manager.shared.released.notify_all();
                Ok(())
            }
            Err(err) => {
                self.released = true;
                Err(err)
            }
        }
    }

    /// Releases the lock. Returns `LockExpired` when the lock had already
    /// expired, signalling the caller to abort its transaction.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match self.manager.release_entry(self.id) {
            Some(LockState::Expired) => Err(TreeError::LockExpired(format!(
                "lock on \"{}\" expired while held (tid {})",
                self.path, self.tid
            ))),
            _ => Ok(()),
        }
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release_entry(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn manager() -> LockManager {
        LockManager::new(Duration::from_secs(5))
    }

    #[test]
    fn reads_share_writes_exclude() {
        let manager = manager();
        let r1 = manager
            .lock("a/b", 1, false, "read 1", LockOptions::default())
            .expect("read 1");
        let _r2 = manager
            .lock("a/b", 2, false, "read 2", LockOptions::default())
            .expect("read 2");
        assert_eq!(manager.granted_count(), 2);
        drop(r1);
    }

    #[test]
    fn same_tid_never_conflicts() {
        let manager = manager();
        let _w = manager
            .lock("a", 7, true, "outer", LockOptions::default())
            .expect("write");
        let _r = manager
            .lock("a/b/c", 7, false, "inner", LockOptions::default())
            .expect("re-entrant read");
        let _w2 = manager
            .lock("a/b", 7, true, "inner write", LockOptions::default())
            .expect("re-entrant write");
    }

    #[test]
    fn write_blocks_descendant_and_ancestor() {
        let manager = LockManager::new(Duration::from_millis(100));
        let held = manager
            .lock("a/b", 1, true, "holder", LockOptions::default())
            .expect("write");
        assert!(matches!(
            manager.lock("a/b/c", 2, false, "below", LockOptions::default()),
            Err(TreeError::LockConflict(_))
        ));
        assert!(matches!(
            manager.lock("a", 2, true, "above", LockOptions::default()),
            Err(TreeError::LockConflict(_))
        ));
        // Unrelated subtree is fine.
        let _other = manager
            .lock("x/y", 2, true, "elsewhere", LockOptions::default())
            .expect("unrelated");
        drop(held);
    }

    #[test]
    fn queued_request_granted_on_release() {
        let manager = manager();
        let held = manager
            .lock("a", 1, true, "holder", LockOptions::default())
            .expect("write");
        let manager2 = manager.clone();
        let waiter = thread::spawn(move || {
            manager2
                .lock("a/b", 2, true, "waiter", LockOptions::default())
                .map(|lock| lock.release())
        });
        thread::sleep(Duration::from_millis(50));
        held.release().expect("release");
        waiter
            .join()
            .expect("join")
            .expect("grant after release")
            .expect("clean release");
    }

    #[test]
    fn fifo_order_without_priority() {
        let manager = manager();
        let held = manager
            .lock("p", 1, true, "holder", LockOptions::default())
            .expect("write");
        let order = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for (i, tid) in [(0usize, 2u64), (1, 3), (2, 4)] {
            let manager = manager.clone();
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let lock = manager
                    .lock("p", tid, true, "queued", LockOptions::default())
                    .expect("granted");
                let position = order.fetch_add(1, Ordering::SeqCst);
                let ok = position == i;
                lock.release().expect("release");
                ok
            }));
            // Stagger so insertion order matches spawn order.
            thread::sleep(Duration::from_millis(50));
        }
        held.release().expect("release");
        for handle in handles {
            assert!(handle.join().expect("join"), "FIFO order violated");
        }
    }

    #[test]
    fn priority_jumps_the_queue() {
        let manager = manager();
        let held = manager
            .lock("p", 1, true, "holder", LockOptions::default())
            .expect("write");
        let order = Arc::new(AtomicUsize::new(0));

        let normal = {
            let manager = manager.clone();
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let lock = manager
                    .lock("p", 2, true, "normal", LockOptions::default())
                    .expect("granted");
                let position = order.fetch_add(1, Ordering::SeqCst);
                lock.release().expect("release");
                position
            })
        };
        thread::sleep(Duration::from_millis(50));
        let priority = {
            let manager = manager.clone();
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let lock = manager
                    .lock(
                        "p",
                        3,
                        true,
                        "priority",
                        LockOptions {
                            with_priority: true,
                            no_timeout: false,
                        },
                    )
                    .expect("granted");
                let position = order.fetch_add(1, Ordering::SeqCst);
                lock.release().expect("release");
                position
            })
        };
        thread::sleep(Duration::from_millis(50));
        held.release().expect("release");
        assert_eq!(priority.join().expect("join"), 0);
        assert_eq!(normal.join().expect("join"), 1);
    }

    #[test]
    fn expiry_poisons_the_tid_but_not_new_tids() {
        let manager = LockManager::new(Duration::from_millis(20));
        let held = manager
            .lock("a", 1, true, "will expire", LockOptions::default())
            .expect("write");
        thread::sleep(Duration::from_millis(40));
        // The expired lock no longer blocks another transaction.
        let other = manager
            .lock("a", 2, true, "fresh tid", LockOptions::default())
            .expect("granted despite expired lock");
        other.release().expect("release");
        // The poisoned tid is refused.
        assert!(matches!(
            manager.lock("b", 1, false, "poisoned", LockOptions::default()),
            Err(TreeError::LockExpired(_))
        ));
        assert!(matches!(held.release(), Err(TreeError::LockExpired(_))));
        // Once the expired lock is gone its tid has no history left; a
        // brand-new tid was never affected at all.
        let _fresh = manager
            .lock("b", 3, false, "new tid", LockOptions::default())
            .expect("granted");
    }

    #[test]
    fn no_timeout_locks_do_not_expire() {
        let manager = LockManager::new(Duration::from_millis(20));
        let held = manager
            .lock(
                "a",
                1,
                true,
                "pinned",
                LockOptions {
                    with_priority: false,
                    no_timeout: true,
                },
            )
            .expect("write");
        thread::sleep(Duration::from_millis(40));
        held.release().expect("still valid");
    }

    #[test]
    fn move_to_parent_mutates_in_place() {
        let manager = manager();
        let mut lock = manager
            .lock("a/b/c", 1, true, "leaf", LockOptions::default())
            .expect("write");
        lock.move_to_parent().expect("migrate");
        assert_eq!(lock.path(), "a/b");
        lock.move_to_parent().expect("migrate");
        assert_eq!(lock.path(), "a");
        lock.move_to_parent().expect("migrate to root");
        assert_eq!(lock.path(), "");
    }

    #[test]
    fn move_to_reacquires_with_priority_when_blocked() {
        let manager = manager();
        let blocker = manager
            .lock("target", 2, true, "blocker", LockOptions::default())
            .expect("write");
        let mut lock = manager
            .lock("source", 1, true, "migrating", LockOptions::default())
            .expect("write");
        let handle = thread::spawn(move || {
            lock.move_to("target", true).expect("migration");
            assert_eq!(lock.path(), "target");
            lock.release().expect("release");
        });
        thread::sleep(Duration::from_millis(50));
        blocker.release().expect("release blocker");
        handle.join().expect("join");
    }
}
