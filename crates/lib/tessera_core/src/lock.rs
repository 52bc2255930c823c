//! Named, reference-counted async locks.
//!
//! A registry maps a name to a mutex. Each acquisition bumps the entry's
//! reference count while holding the map shard's write lock; the last holder to
//! release removes the entry, again under the shard lock and only if the count
//! is still zero. A name that is no longer in use therefore never lingers, and
//! an entry cannot be removed while another caller is about to lock it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

static SHARED: LazyLock<Arc<NamedLocks>> = LazyLock::new(|| Arc::new(NamedLocks::new()));

#[derive(Debug, Default)]
struct LockEntry {
    mutex: Arc<Mutex<()>>,
    refs: AtomicUsize,
}

/// Registry of locks keyed by name.
#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: DashMap<String, Arc<LockEntry>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// The process-wide registry.
    pub fn shared() -> Arc<NamedLocks> {
        Arc::clone(&SHARED)
    }

    /// Acquire the lock called `name`, waiting for the current holder if any.
    ///
    /// The lock is released when the returned guard is dropped, including when
    /// this future is dropped before the lock was obtained.
    pub async fn lock(&self, name: &str) -> NamedLockGuard<'_> {
        let entry = {
            let slot = self
                .locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(LockEntry::default()));
            slot.refs.fetch_add(1, Ordering::SeqCst);
            Arc::clone(slot.value())
        };

        let mut held = NamedLockGuard {
            registry: self,
            name: name.to_string(),
            entry: Arc::clone(&entry),
            guard: None,
        };
        held.guard = Some(Arc::clone(&entry.mutex).lock_owned().await);
        trace!(lock = name, "named lock acquired");
        held
    }

    /// Number of names currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn release(&self, name: &str, entry: &Arc<LockEntry>) {
        if entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.locks.remove_if(name, |_, current| {
                Arc::ptr_eq(current, entry) && current.refs.load(Ordering::SeqCst) == 0
            });
        }
    }
}

/// Scoped ownership of a named lock.
#[derive(Debug)]
pub struct NamedLockGuard<'a> {
    registry: &'a NamedLocks,
    name: String,
    entry: Arc<LockEntry>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NamedLockGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        // Unlock before giving up the reference so a waiter can proceed.
        drop(self.guard.take());
        self.registry.release(&self.name, &self.entry);
        trace!(lock = %self.name, "named lock released");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn entry_is_removed_after_last_release() {
        let locks = NamedLocks::new();
        {
            let guard = locks.lock("a").await;
            assert_eq!(guard.name(), "a");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_names_do_not_block_each_other() {
        let locks = NamedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn same_name_is_mutually_exclusive() {
        let locks = Arc::new(NamedLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let max_inside = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("keys").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_reference() {
        let locks = NamedLocks::new();
        let held = locks.lock("a").await;
        let waited = tokio::time::timeout(Duration::from_millis(20), locks.lock("a")).await;
        assert!(waited.is_err());
        drop(held);
        assert!(locks.is_empty());
    }
}
