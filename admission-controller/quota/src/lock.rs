use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Hands out one exclusive lock per quota name.
///
/// Locks are created lazily and dropped once no lock set or caller refers to
/// them. The map lock is held only while looking up, inserting or pruning
/// entries, never while a quota lock is awaited.
#[derive(Debug, Default)]
pub struct LockFactory {
    locks: LockMap,
}

/// Quota locks held for the duration of one evaluation.
///
/// Guards are released in the reverse of their acquisition order when the set
/// is dropped.
#[derive(Debug)]
pub struct LockSet {
    names: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
    locks: LockMap,
}

// === impl LockFactory ===

impl LockFactory {
    pub fn get_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(name) {
            return lock.clone();
        }
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(name.to_string(), lock.clone());
        lock
    }

    /// Acquires the locks for all of the given names, sorted and deduplicated
    /// so that concurrent callers never wait on each other in a cycle.
    pub async fn lock_all(&self, names: impl IntoIterator<Item = String>) -> LockSet {
        let names = names.into_iter().collect::<BTreeSet<_>>();
        let mut set = LockSet {
            names: Vec::with_capacity(names.len()),
            guards: Vec::with_capacity(names.len()),
            locks: self.locks.clone(),
        };
        for name in names {
            let guard = self.get_lock(&name).lock_owned().await;
            set.names.push(name);
            set.guards.push(guard);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl LockSet ===

impl LockSet {
    /// The locked names, in acquisition order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }

        // Entries referenced only by the map are idle.
        let mut locks = self.locks.lock();
        for name in &self.names {
            if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_same_lock() {
        let factory = LockFactory::default();
        let a = factory.get_lock("q1");
        let b = factory.get_lock("q1");
        let c = factory.get_lock("q2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.len(), 2);
    }

    #[tokio::test]
    async fn sorts_and_dedups() {
        let factory = LockFactory::default();
        let set = factory
            .lock_all(vec!["b".to_string(), "a".to_string(), "b".to_string()])
            .await;
        assert_eq!(set.names(), &["a".to_string(), "b".to_string()]);
        assert!(factory.get_lock("a").try_lock().is_err());
        assert!(factory.get_lock("b").try_lock().is_err());

        drop(set);
        assert!(factory.get_lock("a").try_lock().is_ok());
        assert!(factory.get_lock("b").try_lock().is_ok());
    }

    #[tokio::test]
    async fn idle_locks_are_pruned() {
        let factory = LockFactory::default();
        let held = factory.get_lock("kept");

        let set = factory
            .lock_all(vec!["kept".to_string(), "q1".to_string(), "q2".to_string()])
            .await;
        assert_eq!(factory.len(), 3);

        let waiting = factory.lock_all(vec!["q1".to_string()]);
        tokio::pin!(waiting);
        assert!(waiting.as_mut().now_or_never().is_none());

        drop(set);
        assert_eq!(factory.len(), 2, "locks still referenced must be kept");

        let next = waiting.await;
        assert_eq!(next.names(), &["q1".to_string()]);
        drop(next);
        assert_eq!(factory.len(), 1);

        drop(held);
        drop(factory.lock_all(vec!["kept".to_string()]).await);
        assert!(factory.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_sets_do_not_deadlock() {
        let factory = Arc::new(LockFactory::default());
        let tasks = (0..100)
            .map(|i| {
                let factory = factory.clone();
                let names = if i % 2 == 0 {
                    vec!["x".to_string(), "y".to_string(), "z".to_string()]
                } else {
                    vec!["z".to_string(), "x".to_string(), "y".to_string()]
                };
                tokio::spawn(async move {
                    let _set = factory.lock_all(names).await;
                    tokio::task::yield_now().await;
                })
            })
            .collect::<Vec<_>>();

        let all = futures::future::join_all(tasks);
        let results = tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("lock acquisition must not deadlock");
        assert!(results.into_iter().all(|r| r.is_ok()));
    }
}
