//! Page-level lock manager.
//!
//! Strict two-phase locking with shared/exclusive modes and shared-to-
//! exclusive upgrade. There is no wait-for-graph deadlock detection:
//! a request that cannot be granted within the timeout fails with
//! `LockTimeout`, and the caller resolves the (potential) deadlock by
//! aborting. A timed-out request's pending entry stays queued; it is
//! removed by `release_all_locks` when the transaction finishes.

use crate::error::{DbError, DbResult};
use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock for reads; compatible with other shared holders.
    Shared,
    /// Exclusive lock for writes; excludes every other holder.
    Exclusive,
}

/// One entry in a page's lock queue: a (page, transaction) request that is
/// either granted or still pending. Entries are ordered by arrival, except
/// that an upgrade request is re-queued just behind the last granted shared
/// holder.
#[derive(Debug)]
struct LockEntry {
    tid: TransactionId,
    exclusive: bool,
    granted: bool,
}

/// Lock manager for every transaction in the engine.
///
/// One mutex guards the whole page-keyed table; waiters block on a condvar
/// with a deadline instead of polling.
pub struct LockManager {
    table: Mutex<HashMap<PageId, Vec<LockEntry>>>,
    released: Condvar,
    timeout: Duration,
}

/// How long a request may wait before timing out.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

impl LockManager {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquires a lock on `pid` for `tid`, blocking until compatible or
    /// until the timeout elapses.
    pub fn acquire_lock(&self, pid: PageId, tid: TransactionId, mode: LockMode) -> DbResult<()> {
        let exclusive = mode == LockMode::Exclusive;
        let mut table = self.table.lock();

        if Self::try_grant(&mut table, pid, tid, exclusive) {
            return Ok(());
        }

        log::debug!("{} waiting for {:?} lock on page {}", tid, mode, pid);
        let deadline = Instant::now() + self.timeout;
        loop {
            let timed_out = self.released.wait_until(&mut table, deadline).timed_out();
            if Self::try_grant(&mut table, pid, tid, exclusive) {
                return Ok(());
            }
            if timed_out {
                // The pending entry stays in the queue; the caller cleans
                // it up via release_all_locks when it aborts.
                log::debug!("{} timed out waiting on page {}", tid, pid);
                return Err(DbError::LockTimeout { tid, pid });
            }
        }
    }

    /// Checks compatibility and, when compatible, grants the request in
    /// place (enqueueing it first if this is its initial attempt). Returns
    /// false after enqueueing a pending entry when incompatible.
    fn try_grant(
        table: &mut HashMap<PageId, Vec<LockEntry>>,
        pid: PageId,
        tid: TransactionId,
        exclusive: bool,
    ) -> bool {
        let entries = table.entry(pid).or_default();

        let mut own_granted_shared = None;
        let mut own_pending = None;
        let mut last_shared_granted = None;
        let mut other_exclusive = false;
        for (i, e) in entries.iter().enumerate() {
            if e.tid == tid {
                if e.granted {
                    if !e.exclusive && exclusive {
                        own_granted_shared = Some(i);
                    } else {
                        // Re-request of the same mode, or a shared request
                        // while holding exclusive: already satisfied.
                        return true;
                    }
                } else if e.exclusive == exclusive {
                    own_pending = Some(i);
                }
            } else if e.granted {
                if e.exclusive {
                    other_exclusive = true;
                } else {
                    last_shared_granted = Some(i);
                }
            }
        }

        // Shared -> exclusive upgrade.
        if let Some(i) = own_granted_shared {
            return match last_shared_granted {
                None => {
                    // Sole granted holder: upgrade in place.
                    entries[i].exclusive = true;
                    true
                }
                Some(last) => {
                    // Other shared holders are granted: give up the shared
                    // grant and queue the exclusive request just behind the
                    // last granted shared holder, ahead of later requests.
                    entries.remove(i);
                    let last = if i < last { last - 1 } else { last };
                    let pos = (last + 1).min(entries.len());
                    entries.insert(
                        pos,
                        LockEntry {
                            tid,
                            exclusive: true,
                            granted: false,
                        },
                    );
                    false
                }
            };
        }

        let other_granted = other_exclusive || last_shared_granted.is_some();
        let compatible = !other_exclusive && (!exclusive || !other_granted);
        if compatible {
            match own_pending {
                Some(i) => entries[i].granted = true,
                None => entries.push(LockEntry {
                    tid,
                    exclusive,
                    granted: true,
                }),
            }
            true
        } else {
            if own_pending.is_none() {
                entries.push(LockEntry {
                    tid,
                    exclusive,
                    granted: false,
                });
            }
            false
        }
    }

    /// Removes the single granted entry for (pid, tid), if any.
    pub fn release_lock(&self, pid: PageId, tid: TransactionId) {
        let mut table = self.table.lock();
        if let Some(entries) = table.get_mut(&pid) {
            if let Some(i) = entries.iter().position(|e| e.tid == tid && e.granted) {
                entries.remove(i);
            }
            if entries.is_empty() {
                table.remove(&pid);
            }
        }
        self.released.notify_all();
    }

    /// Removes every entry (granted or pending) owned by `tid`. Safe no-op
    /// when the transaction holds none. Called once at transaction end.
    pub fn release_all_locks(&self, tid: TransactionId) {
        let mut table = self.table.lock();
        table.retain(|_, entries| {
            entries.retain(|e| e.tid != tid);
            !entries.is_empty()
        });
        self.released.notify_all();
    }

    /// True iff a granted (not merely pending) entry exists for (tid, pid).
    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        let table = self.table.lock();
        table
            .get(&pid)
            .map(|entries| entries.iter().any(|e| e.tid == tid && e.granted))
            .unwrap_or(false)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn pid(n: u32) -> PageId {
        PageId::new(0, n)
    }

    fn tid(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        lm.acquire_lock(pid(1), tid(1), LockMode::Shared).unwrap();
        lm.acquire_lock(pid(1), tid(2), LockMode::Shared).unwrap();
        lm.acquire_lock(pid(1), tid(3), LockMode::Shared).unwrap();
        assert!(lm.holds_lock(tid(1), pid(1)));
        assert!(lm.holds_lock(tid(2), pid(1)));
        assert!(lm.holds_lock(tid(3), pid(1)));
    }

    #[test]
    fn test_reacquire_is_idempotent() {
        let lm = LockManager::with_timeout(Duration::from_millis(50));
        lm.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();
        lm.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();
        // Exclusive implies shared.
        lm.acquire_lock(pid(1), tid(1), LockMode::Shared).unwrap();
        assert!(lm.holds_lock(tid(1), pid(1)));
    }

    #[test]
    fn test_exclusive_conflict_times_out_holder_unaffected() {
        let lm = LockManager::with_timeout(Duration::from_millis(50));
        lm.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();

        let err = lm
            .acquire_lock(pid(1), tid(2), LockMode::Exclusive)
            .unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(lm.holds_lock(tid(1), pid(1)));
        assert!(!lm.holds_lock(tid(2), pid(1)));
    }

    #[test]
    fn test_shared_blocked_by_exclusive() {
        let lm = LockManager::with_timeout(Duration::from_millis(50));
        lm.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();
        let err = lm
            .acquire_lock(pid(1), tid(2), LockMode::Shared)
            .unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn test_waiter_granted_after_release() {
        let lm = Arc::new(LockManager::with_timeout(Duration::from_secs(5)));
        lm.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();

        let lm2 = Arc::clone(&lm);
        let handle = thread::spawn(move || {
            lm2.acquire_lock(pid(1), tid(2), LockMode::Exclusive).unwrap();
            assert!(lm2.holds_lock(tid(2), pid(1)));
        });

        thread::sleep(Duration::from_millis(30));
        lm.release_all_locks(tid(1));
        handle.join().unwrap();
    }

    #[test]
    fn test_upgrade_sole_holder_is_immediate() {
        let lm = LockManager::with_timeout(Duration::from_millis(50));
        lm.acquire_lock(pid(1), tid(1), LockMode::Shared).unwrap();
        lm.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();
        assert!(lm.holds_lock(tid(1), pid(1)));

        // The upgrade must really be exclusive now.
        let err = lm
            .acquire_lock(pid(1), tid(2), LockMode::Shared)
            .unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn test_upgrade_waits_for_other_shared_holders() {
        let lm = Arc::new(LockManager::with_timeout(Duration::from_secs(5)));
        lm.acquire_lock(pid(1), tid(1), LockMode::Shared).unwrap();
        lm.acquire_lock(pid(1), tid(2), LockMode::Shared).unwrap();

        let upgraded = Arc::new(AtomicBool::new(false));
        let lm2 = Arc::clone(&lm);
        let upgraded2 = Arc::clone(&upgraded);
        let handle = thread::spawn(move || {
            lm2.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();
            upgraded2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!upgraded.load(Ordering::SeqCst));

        lm.release_all_locks(tid(2));
        handle.join().unwrap();
        assert!(upgraded.load(Ordering::SeqCst));
        assert!(lm.holds_lock(tid(1), pid(1)));
    }

    #[test]
    fn test_release_all_clears_pending_entries() {
        let lm = LockManager::with_timeout(Duration::from_millis(50));
        lm.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();
        let _ = lm.acquire_lock(pid(1), tid(2), LockMode::Exclusive);

        // T2's pending entry is still queued after the timeout; abort
        // cleans it up.
        lm.release_all_locks(tid(2));
        lm.release_all_locks(tid(1));
        assert!(!lm.holds_lock(tid(1), pid(1)));

        // Page queue fully drained: a fresh request succeeds immediately.
        lm.acquire_lock(pid(1), tid(3), LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_locks_on_distinct_pages_do_not_conflict() {
        let lm = LockManager::with_timeout(Duration::from_millis(50));
        lm.acquire_lock(pid(1), tid(1), LockMode::Exclusive).unwrap();
        lm.acquire_lock(pid(2), tid(2), LockMode::Exclusive).unwrap();
        assert!(lm.holds_lock(tid(1), pid(1)));
        assert!(lm.holds_lock(tid(2), pid(2)));
    }

    #[test]
    fn test_no_two_exclusive_holders() {
        // Hammer one page from many threads; at most one exclusive holder
        // may be granted at any instant.
        let lm = Arc::new(LockManager::with_timeout(Duration::from_secs(5)));
        let in_section = Arc::new(AtomicBool::new(false));
        let mut handles = vec![];
        for n in 1..=8u64 {
            let lm = Arc::clone(&lm);
            let in_section = Arc::clone(&in_section);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    lm.acquire_lock(pid(9), tid(n), LockMode::Exclusive).unwrap();
                    assert!(!in_section.swap(true, Ordering::SeqCst));
                    thread::sleep(Duration::from_micros(100));
                    in_section.store(false, Ordering::SeqCst);
                    lm.release_all_locks(tid(n));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
