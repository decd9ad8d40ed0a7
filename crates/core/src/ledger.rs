use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::upstream::OperationHandle;

pub const DEFAULT_LEDGER_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub operation_id: OperationHandle,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(skip)]
    expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(LedgerEntry),
    /// A live entry already owned the key; it is returned untouched.
    AlreadyLive(LedgerEntry),
}

#[derive(Debug, Default)]
struct LedgerTable {
    entries: HashMap<String, LedgerEntry>,
    expirations: BinaryHeap<Reverse<(Instant, String)>>,
}

impl LedgerTable {
    fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(Reverse((expires_at, _))) = self.expirations.peek() {
            if *expires_at > now {
                break;
            }
            let Some(Reverse((expires_at, key))) = self.expirations.pop() else {
                break;
            };
            let is_current = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.expires_at == expires_at);
            if is_current {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }
}

/// Volatile map from dedup key to the upstream operation it produced.
///
/// Entries are evicted lazily: every `lookup` and `record` first drops
/// whatever has outlived the TTL, so an expired entry is never observed.
#[derive(Debug)]
pub struct OperationLedger {
    ttl: Duration,
    table: Mutex<LedgerTable>,
}

impl Default for OperationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TTL)
    }
}

impl OperationLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            table: Mutex::new(LedgerTable::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn table(&self) -> MutexGuard<'_, LedgerTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sweep(&self) -> usize {
        let removed = self.table().sweep(Instant::now());
        if removed > 0 {
            debug!(removed, "Evicted expired ledger entries");
        }
        removed
    }

    pub fn lookup(&self, key: &str) -> Option<LedgerEntry> {
        let mut table = self.table();
        let removed = table.sweep(Instant::now());
        if removed > 0 {
            debug!(removed, "Evicted expired ledger entries");
        }
        table.entries.get(key).cloned()
    }

    /// First writer wins: a live entry for `key` is never overwritten.
    pub fn record(
        &self,
        key: &str,
        operation_id: OperationHandle,
        retry_count: u32,
    ) -> RecordOutcome {
        let now = Instant::now();
        let mut table = self.table();
        table.sweep(now);

        if let Some(existing) = table.entries.get(key) {
            return RecordOutcome::AlreadyLive(existing.clone());
        }

        let entry = LedgerEntry {
            operation_id,
            dedup_key: key.to_string(),
            created_at: Utc::now(),
            retry_count,
            expires_at: now + self.ttl,
        };
        table
            .expirations
            .push(Reverse((entry.expires_at, key.to_string())));
        table.entries.insert(key.to_string(), entry.clone());
        RecordOutcome::Recorded(entry)
    }

    /// Live entries, after evicting expired ones.
    pub fn len(&self) -> usize {
        let mut table = self.table();
        table.sweep(Instant::now());
        table.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
