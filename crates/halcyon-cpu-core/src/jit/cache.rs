//! Concurrent translation cache: guest address → translated unit.
//!
//! Sharded by address hash so guest threads and the background compiler
//! never contend on a single lock; the running total weight is kept in an
//! atomic outside the shards. Eviction is a two-parameter approximate LRU
//! (weight budget + minimum idle time) swept opportunistically on insert,
//! trading eviction precision for cheap bookkeeping under concurrent
//! access.
//!
//! Timestamps come from a logical clock ticked on every lookup/insert, so
//! eviction behavior is deterministic under test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::unit::TranslatedUnit;

const SHARD_COUNT: usize = 16;

const _: () = {
    assert!(SHARD_COUNT.is_power_of_two());
};

struct Entry {
    unit: Arc<TranslatedUnit>,
    weight: u64,
    last_used: u64,
}

type Shard = Mutex<HashMap<u64, Entry>>;

pub struct TranslationCache {
    shards: Vec<Shard>,
    /// Sum of all resident entry weights. Updated with atomic add/subtract;
    /// transiently imprecise against in-flight inserts, which is fine for a
    /// soft budget.
    total_weight: AtomicU64,
    clock: AtomicU64,
    budget: u64,
    min_idle: u64,
    evictions: AtomicU64,
}

impl TranslationCache {
    /// `budget` is the soft total-weight cap; `min_idle` is the minimum
    /// number of clock ticks an entry must have sat unused before it may be
    /// evicted.
    pub fn new(budget: u64, min_idle: u64) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            total_weight: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            budget,
            min_idle,
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, addr: u64) -> MutexGuard<'_, HashMap<u64, Entry>> {
        // Fibonacci hash; low bits of guest addresses are mostly zero.
        let h = addr.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let idx = (h >> 60) as usize & (SHARD_COUNT - 1);
        self.shards[idx].lock().expect("cache shard poisoned")
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Lookup; refreshes the entry's timestamp on hit.
    pub fn get(&self, addr: u64) -> Option<Arc<TranslatedUnit>> {
        let now = self.tick();
        let mut shard = self.shard(addr);
        let entry = shard.get_mut(&addr)?;
        entry.last_used = now;
        Some(Arc::clone(&entry.unit))
    }

    /// Lookup without touching recency. Used for bookkeeping walks (caller
    /// re-check flagging, worker dedup) that must not keep entries warm.
    pub fn peek(&self, addr: u64) -> Option<Arc<TranslatedUnit>> {
        let shard = self.shard(addr);
        shard.get(&addr).map(|e| Arc::clone(&e.unit))
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.shard(addr).contains_key(&addr)
    }

    /// Insert or replace the unit at `addr`, applying the weight delta and
    /// opportunistically sweeping if the budget is exceeded. Returns the
    /// replaced unit, if any. Concurrent holders of a replaced unit keep
    /// running it to completion; only the map slot changes.
    pub fn insert(
        &self,
        addr: u64,
        unit: Arc<TranslatedUnit>,
        weight: u64,
    ) -> Option<Arc<TranslatedUnit>> {
        let now = self.tick();
        let old = {
            let mut shard = self.shard(addr);
            shard.insert(
                addr,
                Entry {
                    unit,
                    weight,
                    last_used: now,
                },
            )
        };

        self.total_weight.fetch_add(weight, Ordering::Relaxed);
        let old_unit = old.map(|e| {
            self.charge_removal(e.weight);
            e.unit
        });

        if self.total_weight.load(Ordering::Relaxed) > self.budget {
            self.sweep();
        }
        old_unit
    }

    fn charge_removal(&self, weight: u64) {
        let prev = self.total_weight.fetch_sub(weight, Ordering::Relaxed);
        assert!(
            prev >= weight,
            "translation cache weight accounting underflow: total={prev} removing={weight}"
        );
    }

    /// Evict oldest-first until the total weight is back under budget or the
    /// next candidate has not been idle long enough. Entries touched since
    /// the candidate snapshot are skipped rather than evicted.
    fn sweep(&self) {
        let now = self.clock.load(Ordering::Relaxed);

        let mut candidates: Vec<(u64, u64, u64)> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().expect("cache shard poisoned");
            candidates.extend(
                shard
                    .iter()
                    .map(|(addr, e)| (*addr, e.last_used, e.weight)),
            );
        }
        candidates.sort_unstable_by_key(|&(_, last_used, _)| last_used);

        for (addr, last_used, _) in candidates {
            if self.total_weight.load(Ordering::Relaxed) <= self.budget {
                break;
            }
            if now.saturating_sub(last_used) < self.min_idle {
                // Oldest remaining candidate is still inside the idle floor;
                // everything after it is younger.
                break;
            }

            let removed = {
                let mut shard = self.shard(addr);
                match shard.get(&addr) {
                    // Raced with a lookup since the snapshot; entry is warm.
                    Some(e) if e.last_used != last_used => None,
                    Some(_) => shard.remove(&addr),
                    None => None,
                }
            };
            if let Some(e) = removed {
                self.charge_removal(e.weight);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    addr = format_args!("{addr:#x}"),
                    weight = e.weight,
                    "evicted translated unit"
                );
            }
        }
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight.load(Ordering::Relaxed)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn unit_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("cache shard poisoned").len())
            .sum()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TranslationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCache")
            .field("units", &self.unit_count())
            .field("total_weight", &self.total_weight())
            .field("budget", &self.budget)
            .field("min_idle", &self.min_idle)
            .finish()
    }
}
