//! Translated units: one compiled native callable plus the metadata the
//! tiering machinery needs.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use halcyon_risc::{Gpr, GuestMemory};

use crate::state::ThreadState;

/// Compilation quality level. Ordering matters: a cached unit satisfies a
/// request for any tier at or below its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Fast compile: one basic block, no cross-block analysis.
    Baseline,
    /// Background compile: full subroutine graph with direct-call inlining.
    Optimized,
}

/// The compiled native callable behind a translated unit.
///
/// ## Continuation protocol
///
/// `run` returns `0` to mean "guest thread halted"; any nonzero value is the
/// next guest PC to resume at. The same value drives the inter-unit direct
/// call convention: a caller compares a callee's result against the address
/// immediately following the call site: equal means control continues
/// inline in the caller, anything else propagates outward to the dispatcher.
///
/// `args` carries the unit's live-in register bindings in declaration order
/// (see [`TranslatedUnit::arg_bindings`]); kernels read bound registers from
/// `args` instead of the full register file.
pub trait BlockKernel: Send + Sync {
    fn run(&self, state: &mut ThreadState, mem: &dyn GuestMemory, args: &[u64]) -> u64;
}

pub struct TranslatedUnit {
    entry: u64,
    tier: Tier,
    kernel: Box<dyn BlockKernel>,
    /// Guest registers the kernel expects pre-loaded, in argument order.
    arg_bindings: Vec<Gpr>,
    /// Abstract cache cost (decoded instruction count), not byte size.
    weight: u64,
    invocations: AtomicU64,
    /// One-shot latch so a hot unit requests its upgrade exactly once.
    upgrade_requested: AtomicBool,
    /// Set when a callee of this unit was replaced at a higher tier; the
    /// orchestrator consumes it to re-optimize this unit in turn.
    needs_recheck: AtomicBool,
    /// Guest addresses of units known to call this one.
    callers: Mutex<BTreeSet<u64>>,
}

impl TranslatedUnit {
    pub fn new(
        entry: u64,
        tier: Tier,
        kernel: Box<dyn BlockKernel>,
        arg_bindings: Vec<Gpr>,
        weight: u64,
    ) -> Self {
        Self {
            entry,
            tier,
            kernel,
            arg_bindings,
            weight,
            invocations: AtomicU64::new(0),
            upgrade_requested: AtomicBool::new(false),
            needs_recheck: AtomicBool::new(false),
            callers: Mutex::new(BTreeSet::new()),
        }
    }

    #[inline]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[inline]
    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn arg_bindings(&self) -> &[Gpr] {
        &self.arg_bindings
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Invoke the kernel, feeding it only the registers declared live-in.
    pub fn execute(&self, state: &mut ThreadState, mem: &dyn GuestMemory) -> u64 {
        debug_assert!(self.arg_bindings.len() <= crate::state::GPR_COUNT);
        let mut args = [0u64; crate::state::GPR_COUNT];
        for (slot, reg) in args.iter_mut().zip(&self.arg_bindings) {
            *slot = state.read_gpr(*reg);
        }
        self.kernel
            .run(state, mem, &args[..self.arg_bindings.len()])
    }

    /// Count one invocation. Returns true exactly once: on the invocation
    /// that crosses `hot_threshold` while the unit is still baseline.
    pub fn note_execution(&self, hot_threshold: u64) -> bool {
        let count = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        if self.tier != Tier::Baseline || count < hot_threshold {
            return false;
        }
        !self.upgrade_requested.swap(true, Ordering::AcqRel)
    }

    pub fn record_caller(&self, caller: u64) {
        self.callers
            .lock()
            .expect("caller set poisoned")
            .insert(caller);
    }

    pub fn caller_addresses(&self) -> Vec<u64> {
        self.callers
            .lock()
            .expect("caller set poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Carry the replaced unit's caller set over to this replacement so a
    /// later upgrade can still propagate re-check flags.
    pub fn adopt_callers(&self, old: &TranslatedUnit) {
        let inherited = old.caller_addresses();
        let mut callers = self.callers.lock().expect("caller set poisoned");
        callers.extend(inherited);
    }

    pub fn flag_recheck(&self) {
        self.needs_recheck.store(true, Ordering::Release);
    }

    pub fn take_recheck(&self) -> bool {
        self.needs_recheck.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for TranslatedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatedUnit")
            .field("entry", &self.entry)
            .field("tier", &self.tier)
            .field("weight", &self.weight)
            .field("invocations", &self.invocations())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopKernel;

    impl BlockKernel for NopKernel {
        fn run(&self, _state: &mut ThreadState, _mem: &dyn GuestMemory, _args: &[u64]) -> u64 {
            0
        }
    }

    fn unit(tier: Tier) -> TranslatedUnit {
        TranslatedUnit::new(0x100, tier, Box::new(NopKernel), Vec::new(), 1)
    }

    #[test]
    fn upgrade_fires_exactly_once_at_threshold() {
        let u = unit(Tier::Baseline);
        for _ in 0..2 {
            assert!(!u.note_execution(3));
        }
        assert!(u.note_execution(3));
        for _ in 0..10 {
            assert!(!u.note_execution(3));
        }
    }

    #[test]
    fn optimized_units_never_request_upgrade() {
        let u = unit(Tier::Optimized);
        for _ in 0..10 {
            assert!(!u.note_execution(1));
        }
    }

    #[test]
    fn caller_sets_are_inherited_and_deduped() {
        let old = unit(Tier::Baseline);
        old.record_caller(0x10);
        old.record_caller(0x20);
        old.record_caller(0x10);

        let new = unit(Tier::Optimized);
        new.record_caller(0x30);
        new.adopt_callers(&old);
        assert_eq!(new.caller_addresses(), vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn tier_ordering_matches_quality() {
        assert!(Tier::Optimized > Tier::Baseline);
    }
}
