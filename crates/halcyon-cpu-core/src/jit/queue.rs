//! Bounded blocking queue of pending background compilation requests.
//!
//! Guest threads push without ever blocking: a full queue drops the request
//! (upgrades are best-effort and will be re-issued by the re-check path).
//! The background worker blocks in [`TranslationQueue::pop_wait`] until an
//! item arrives or it observes its exit condition after a force-signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use super::unit::Tier;

/// How a compile request arose. Carried for diagnostics; the worker treats
/// both the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Requested by the sequential hot path (tiering threshold / re-check).
    Sequential,
    /// Requested from an indirect or virtual call site.
    Indirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileRequest {
    pub addr: u64,
    pub mode: ExecMode,
    pub tier: Tier,
}

pub struct TranslationQueue {
    items: Mutex<VecDeque<CompileRequest>>,
    cond: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl TranslationQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "translation queue capacity must be nonzero");
        Self {
            items: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a request. Never blocks. Returns false only when the request
    /// was dropped because the queue is full; a request already pending for
    /// the same address at an equal-or-higher tier is coalesced and counts
    /// as accepted.
    pub fn push(&self, req: CompileRequest) -> bool {
        let mut items = self.items.lock().expect("translation queue poisoned");
        if items
            .iter()
            .any(|p| p.addr == req.addr && p.tier >= req.tier)
        {
            return true;
        }
        if items.len() >= self.capacity {
            drop(items);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                addr = format_args!("{:#x}", req.addr),
                "translation queue full; dropping compile request"
            );
            return false;
        }
        items.push_back(req);
        drop(items);
        self.cond.notify_one();
        true
    }

    /// Dequeue, blocking while the queue is empty. `should_exit` is checked
    /// before sleeping and after every wakeup; once it reports true the call
    /// returns `None` even if items remain (the worker's loop condition has
    /// priority over draining).
    pub fn pop_wait(&self, should_exit: &dyn Fn() -> bool) -> Option<CompileRequest> {
        let mut items = self.items.lock().expect("translation queue poisoned");
        loop {
            if should_exit() {
                return None;
            }
            if let Some(req) = items.pop_front() {
                return Some(req);
            }
            items = self
                .cond
                .wait(items)
                .expect("translation queue poisoned");
        }
    }

    /// Non-blocking dequeue, for tests and opportunistic draining.
    pub fn try_pop(&self) -> Option<CompileRequest> {
        self.items
            .lock()
            .expect("translation queue poisoned")
            .pop_front()
    }

    /// Force-signal all waiters so they re-check their exit condition.
    /// Takes the queue lock first: `pop_wait` checks its exit condition and
    /// goes to sleep under that lock, so an unserialized signal could land
    /// in the window between the check and the wait and be lost.
    pub fn nudge(&self) {
        let _items = self.items.lock().expect("translation queue poisoned");
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("translation queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TranslationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}
