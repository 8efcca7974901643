//! The translator orchestrator.
//!
//! `Translator` resolves "have we compiled this address", lazily compiles on
//! miss through the pluggable [`UnitCompiler`], decides tiering policy, and
//! owns the background worker that drains the compile queue while any guest
//! thread is active. Generated code reaches back into it through the
//! [`Dispatch`] capability installed in `ThreadState`; there is no ambient
//! global translator.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use halcyon_risc::{Gpr, GuestMemory, MemFault};
use thiserror::Error;

use super::cache::TranslationCache;
use super::queue::{CompileRequest, ExecMode, TranslationQueue};
use super::unit::{BlockKernel, Tier, TranslatedUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("decode failed for unit at {entry:#x}: {fault}")]
    Decode { entry: u64, fault: MemFault },
}

#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    /// Invocation count at which a baseline unit requests its upgrade.
    pub hot_threshold: u64,
    /// Soft cache budget in weight units (decoded instruction count).
    pub cache_weight_budget: u64,
    /// Minimum idle ticks before a cache entry may be evicted.
    pub cache_min_idle: u64,
    /// Bounded compile-queue capacity.
    pub queue_capacity: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 250,
            cache_weight_budget: 1 << 20,
            cache_min_idle: 16,
            queue_capacity: 256,
        }
    }
}

/// Output of a [`UnitCompiler`] for one guest entry address.
pub struct CompiledUnit {
    pub kernel: Box<dyn BlockKernel>,
    /// Live-in registers the kernel expects pre-loaded, in argument order.
    pub arg_bindings: Vec<Gpr>,
    /// Cache cost of the unit (decoded instruction count).
    pub weight: u64,
}

/// Compilation seam: baseline compiles one basic block, optimized compiles
/// the full subroutine graph. Implemented by `halcyon-jit`.
pub trait UnitCompiler: Send + Sync {
    fn compile(
        &self,
        mem: &dyn GuestMemory,
        entry: u64,
        tier: Tier,
    ) -> Result<CompiledUnit, TranslateError>;
}

/// Capability interface installed into `ThreadState` so generated code can
/// call back into the orchestrator for indirect/virtual targets and caller
/// bookkeeping without a closure capture or global lookup.
pub trait Dispatch: Send + Sync {
    /// Lookup-or-compile at baseline tier.
    fn resolve(
        &self,
        mem: &dyn GuestMemory,
        addr: u64,
    ) -> Result<Arc<TranslatedUnit>, TranslateError>;

    /// Lookup-or-compile for indirect/virtual call sites: baseline on miss,
    /// plus a background request for the optimized tier (virtual sites are
    /// statistically hot and benefit from a fast upgrade).
    fn resolve_virtual(
        &self,
        mem: &dyn GuestMemory,
        addr: u64,
    ) -> Result<Arc<TranslatedUnit>, TranslateError>;

    /// Record that the unit at `caller` direct-calls the unit at `callee`.
    fn record_caller(&self, callee: u64, caller: u64);

    /// Tiering decision hook: count one execution of `unit` and enqueue its
    /// upgrade if it just crossed the hot threshold.
    fn note_unit_executed(&self, unit: &TranslatedUnit);
}

/// Counter snapshot, in the spirit of an engine-stats readout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    pub baseline_compiles: u64,
    pub optimized_compiles: u64,
    pub upgrade_requests: u64,
    pub dropped_requests: u64,
    pub evictions: u64,
    pub cache_units: usize,
    pub cache_weight: u64,
}

struct WorkerSlot {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct Translator<C: UnitCompiler> {
    config: JitConfig,
    compiler: C,
    /// Guest memory handle for the background worker's re-decodes. Guest
    /// threads pass their own memory reference on the hot path.
    mem: Arc<dyn GuestMemory>,
    cache: TranslationCache,
    queue: TranslationQueue,
    active_threads: AtomicUsize,
    worker: Mutex<Option<WorkerSlot>>,
    baseline_compiles: AtomicU64,
    optimized_compiles: AtomicU64,
    upgrade_requests: AtomicU64,
    /// Self-reference so `thread_started` can hand the worker thread an
    /// owning `Arc` from a `&self` receiver.
    self_ref: Weak<Self>,
}

impl<C: UnitCompiler + 'static> Translator<C> {
    pub fn new(config: JitConfig, compiler: C, mem: Arc<dyn GuestMemory>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            cache: TranslationCache::new(config.cache_weight_budget, config.cache_min_idle),
            queue: TranslationQueue::new(config.queue_capacity),
            config,
            compiler,
            mem,
            active_threads: AtomicUsize::new(0),
            worker: Mutex::new(None),
            baseline_compiles: AtomicU64::new(0),
            optimized_compiles: AtomicU64::new(0),
            upgrade_requests: AtomicU64::new(0),
            self_ref: Weak::clone(self_ref),
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn queue(&self) -> &TranslationQueue {
        &self.queue
    }

    pub fn stats(&self) -> TranslatorStats {
        TranslatorStats {
            baseline_compiles: self.baseline_compiles.load(Ordering::Relaxed),
            optimized_compiles: self.optimized_compiles.load(Ordering::Relaxed),
            upgrade_requests: self.upgrade_requests.load(Ordering::Relaxed),
            dropped_requests: self.queue.dropped(),
            evictions: self.cache.evictions(),
            cache_units: self.cache.unit_count(),
            cache_weight: self.cache.total_weight(),
        }
    }

    /// Resolve the unit at `addr`, compiling at `tier` on miss. A cached
    /// unit at an equal-or-higher tier satisfies the request. Two threads
    /// racing to compile the same cold address may both compile; the cache
    /// resolves the race by insert-replace and the loser's work is
    /// discarded (compilation is a pure function of guest bytes).
    pub fn get_or_translate(
        &self,
        mem: &dyn GuestMemory,
        addr: u64,
        tier: Tier,
    ) -> Result<Arc<TranslatedUnit>, TranslateError> {
        if let Some(unit) = self.cache.get(addr) {
            if unit.tier() >= tier {
                self.consume_recheck(&unit);
                return Ok(unit);
            }
        }
        self.compile_and_install(mem, addr, tier)
    }

    /// Indirect/virtual call-site resolution: baseline compile on miss plus
    /// a background optimized-tier request for the target.
    pub fn get_or_translate_virtual(
        &self,
        mem: &dyn GuestMemory,
        addr: u64,
    ) -> Result<Arc<TranslatedUnit>, TranslateError> {
        if let Some(unit) = self.cache.get(addr) {
            self.consume_recheck(&unit);
            return Ok(unit);
        }
        let unit = self.compile_and_install(mem, addr, Tier::Baseline)?;
        self.request_optimize(addr, ExecMode::Indirect);
        Ok(unit)
    }

    /// A unit flagged for re-check had a callee replaced at a higher tier;
    /// re-optimizing it lets the code generator re-bind the direct call
    /// instead of falling back through the indirect path. Propagates
    /// inlining opportunities up the call graph one hop per consumption.
    fn consume_recheck(&self, unit: &TranslatedUnit) {
        if unit.take_recheck() {
            self.request_optimize(unit.entry(), ExecMode::Sequential);
        }
    }

    fn compile_and_install(
        &self,
        mem: &dyn GuestMemory,
        addr: u64,
        tier: Tier,
    ) -> Result<Arc<TranslatedUnit>, TranslateError> {
        let compiled = self.compiler.compile(mem, addr, tier)?;
        match tier {
            Tier::Baseline => self.baseline_compiles.fetch_add(1, Ordering::Relaxed),
            Tier::Optimized => self.optimized_compiles.fetch_add(1, Ordering::Relaxed),
        };

        let weight = compiled.weight;
        let unit = Arc::new(TranslatedUnit::new(
            addr,
            tier,
            compiled.kernel,
            compiled.arg_bindings,
            weight,
        ));
        self.install(addr, Arc::clone(&unit), weight);

        tracing::debug!(
            addr = format_args!("{addr:#x}"),
            ?tier,
            weight,
            "translated unit installed"
        );
        Ok(unit)
    }

    /// Insert-replace at `addr`. When the replacement is a tier upgrade,
    /// every recorded caller of the replaced unit is flagged for re-check.
    fn install(&self, addr: u64, unit: Arc<TranslatedUnit>, weight: u64) {
        let old = self.cache.insert(addr, Arc::clone(&unit), weight);
        if let Some(old) = old {
            unit.adopt_callers(&old);
            if unit.tier() > old.tier() {
                for caller in old.caller_addresses() {
                    if caller == addr {
                        continue;
                    }
                    if let Some(caller_unit) = self.cache.peek(caller) {
                        caller_unit.flag_recheck();
                    }
                }
            }
        }
    }

    /// Enqueue a background optimized-tier compile. Never blocks the calling
    /// guest thread; a full queue drops the request.
    fn request_optimize(&self, addr: u64, mode: ExecMode) {
        self.upgrade_requests.fetch_add(1, Ordering::Relaxed);
        self.queue.push(CompileRequest {
            addr,
            mode,
            tier: Tier::Optimized,
        });
    }

    // ---- Worker + guest-thread lifecycle ------------------------------

    /// Register a guest thread as active. The background worker is started
    /// on the 0 to 1 transition.
    pub fn thread_started(&self) {
        if self.active_threads.fetch_add(1, Ordering::AcqRel) == 0 {
            self.spawn_worker();
        }
    }

    /// Register a guest thread as finished. On the last thread's exit the
    /// queue is force-signaled so the worker observes the zero count and
    /// exits its wait instead of blocking forever; the worker is then
    /// joined.
    pub fn thread_finished(&self) {
        let prev = self.active_threads.fetch_sub(1, Ordering::AcqRel);
        assert!(prev >= 1, "thread_finished without matching thread_started");
        if prev > 1 {
            return;
        }

        let slot = self.worker.lock().expect("worker slot poisoned").take();
        if let Some(slot) = slot {
            slot.stop.store(true, Ordering::Release);
            self.queue.nudge();
            slot.handle.join().expect("background translator panicked");
        }
    }

    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    fn spawn_worker(&self) {
        let mut slot = self.worker.lock().expect("worker slot poisoned");
        if slot.is_some() {
            // A previous worker is still being torn down; it was stop-flagged
            // and will exit on its own. Replace it.
            let old = slot.take().expect("checked is_some above");
            old.stop.store(true, Ordering::Release);
            self.queue.nudge();
            old.handle.join().expect("background translator panicked");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let translator = self.self_ref.upgrade().expect("translator self reference");
        let handle = std::thread::Builder::new()
            .name("halcyon-bg-translate".into())
            .spawn(move || translator.worker_loop(&worker_stop))
            .expect("spawn background translator");
        *slot = Some(WorkerSlot { stop, handle });
    }

    fn worker_loop(self: Arc<Self>, stop: &AtomicBool) {
        tracing::debug!("background translator started");
        let should_exit =
            || stop.load(Ordering::Acquire) || self.active_threads.load(Ordering::Acquire) == 0;

        while let Some(req) = self.queue.pop_wait(&should_exit) {
            // Skip if something equal-or-better landed while the request was
            // queued; guards against redundant recompilation when many call
            // sites race to request the same upgrade.
            if let Some(unit) = self.cache.peek(req.addr) {
                if unit.tier() >= req.tier {
                    continue;
                }
            }

            match self.compile_and_install(&*self.mem, req.addr, req.tier) {
                Ok(_) => {}
                Err(err) => {
                    // Background failures are non-fatal; the address stays at
                    // its current tier.
                    tracing::warn!(
                        addr = format_args!("{:#x}", req.addr),
                        mode = ?req.mode,
                        %err,
                        "background compile failed"
                    );
                }
            }
        }
        tracing::debug!("background translator exited");
    }
}

impl<C: UnitCompiler + 'static> Dispatch for Translator<C> {
    fn resolve(
        &self,
        mem: &dyn GuestMemory,
        addr: u64,
    ) -> Result<Arc<TranslatedUnit>, TranslateError> {
        self.get_or_translate(mem, addr, Tier::Baseline)
    }

    fn resolve_virtual(
        &self,
        mem: &dyn GuestMemory,
        addr: u64,
    ) -> Result<Arc<TranslatedUnit>, TranslateError> {
        self.get_or_translate_virtual(mem, addr)
    }

    fn record_caller(&self, callee: u64, caller: u64) {
        // The callee may not be resident yet (or may have been evicted); the
        // edge is re-recorded the next time the call executes.
        if let Some(unit) = self.cache.peek(callee) {
            unit.record_caller(caller);
        }
    }

    fn note_unit_executed(&self, unit: &TranslatedUnit) {
        if unit.note_execution(self.config.hot_threshold) {
            self.request_optimize(unit.entry(), ExecMode::Sequential);
        }
    }
}

impl<C: UnitCompiler> std::fmt::Debug for Translator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("active_threads", &self.active_threads.load(Ordering::Relaxed))
            .field("cache", &self.cache)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
