use std::future::ready;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::budget::ledger::{LedgerFuture, SpendPolicy, UsageLedger};

/// In-process ledger: a concurrent map of caller token to atomic counter.
///
/// Counters are created on first write. Reads never insert or allocate.
pub struct MemoryLedger {
    policy: SpendPolicy,
    spend: DashMap<String, AtomicI64>,
}

impl MemoryLedger {
    pub fn new(policy: SpendPolicy) -> Self {
        Self {
            policy,
            spend: DashMap::new(),
        }
    }

    /// Number of callers with a counter.
    pub fn len(&self) -> usize {
        self.spend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spend.is_empty()
    }

    fn spent(&self, caller: &str) -> i64 {
        self.spend
            .get(caller)
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn increment(&self, caller: &str, cost: i64) {
        // Existing callers only take the shard read lock.
        if let Some(counter) = self.spend.get(caller) {
            saturating_add(&counter, cost);
            return;
        }

        // `entry` holds the shard write lock, so two first writers for the same
        // caller end up on one counter.
        let counter = self
            .spend
            .entry(caller.to_string())
            .or_insert_with(|| AtomicI64::new(0));
        saturating_add(&counter, cost);
    }
}

fn saturating_add(counter: &AtomicI64, cost: i64) {
    // The closure always returns `Some`, so the update cannot fail.
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_add(cost))
    });
}

impl UsageLedger for MemoryLedger {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn policy(&self) -> SpendPolicy {
        self.policy
    }

    fn check_allowed<'a>(&'a self, caller: &'a str) -> LedgerFuture<'a, bool> {
        Box::pin(ready(Ok(self.policy.allows(self.spent(caller)))))
    }

    fn add_usage<'a>(&'a self, caller: &'a str, tokens: u64) -> LedgerFuture<'a, ()> {
        self.increment(caller, self.policy.cost(tokens));
        Box::pin(ready(Ok(())))
    }

    fn get_usage<'a>(&'a self, caller: &'a str) -> LedgerFuture<'a, i64> {
        Box::pin(ready(Ok(self.spent(caller))))
    }
}
