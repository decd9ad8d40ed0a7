use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Async mutexes scoped to a string key, created on demand and dropped once
/// no holder or waiter references them.
#[derive(Debug, Default, Clone)]
pub struct KeyLocks {
    table: Arc<LockTable>,
}

/// Held for the lifetime of one keyed critical section. Owned, so it can be
/// moved into a queued job.
#[derive(Debug)]
pub struct KeyGuard {
    table: Arc<LockTable>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let lock = self
            .table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            table: Arc::clone(&self.table),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Keys with a live holder or waiter.
    pub fn active_keys(&self) -> usize {
        self.table.len()
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own reference left: nobody is waiting on this key.
        self.table
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn released_key_is_reclaimed() {
        let locks = KeyLocks::new();
        let guard = locks.acquire("K").await;
        assert_eq!(locks.active_keys(), 1);
        assert_eq!(guard.key(), "K");
        drop(guard);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyLocks::new();
        let _first = locks.acquire("A").await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.acquire("B")).await;
        assert!(second.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_waits_for_holder() {
        let locks = KeyLocks::new();
        let first = locks.acquire("K").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("K").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        assert_eq!(locks.active_keys(), 1);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(locks.active_keys(), 0);
    }
}
