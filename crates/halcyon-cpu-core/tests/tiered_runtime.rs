//! Orchestrator tiering policy and worker lifecycle, exercised against a
//! recording compiler so every decision is observable.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use halcyon_cpu_core::{
    BlockKernel, CompileRequest, CompiledUnit, Dispatch, ExecMode, JitConfig, ThreadState, Tier,
    TranslateError, Translator, UnitCompiler,
};
use halcyon_risc::{FlatMemory, GuestMemory};

struct HaltKernel;

impl BlockKernel for HaltKernel {
    fn run(&self, _state: &mut ThreadState, _mem: &dyn GuestMemory, _args: &[u64]) -> u64 {
        0
    }
}

/// Records every compile call; all kernels halt immediately.
#[derive(Default)]
struct RecordingCompiler {
    log: Mutex<Vec<(u64, Tier)>>,
}

impl RecordingCompiler {
    fn log(&self) -> Vec<(u64, Tier)> {
        self.log.lock().unwrap().clone()
    }
}

impl UnitCompiler for RecordingCompiler {
    fn compile(
        &self,
        _mem: &dyn GuestMemory,
        entry: u64,
        tier: Tier,
    ) -> Result<CompiledUnit, TranslateError> {
        self.log.lock().unwrap().push((entry, tier));
        Ok(CompiledUnit {
            kernel: Box::new(HaltKernel),
            arg_bindings: Vec::new(),
            weight: 1,
        })
    }
}

fn translator(config: JitConfig) -> Arc<Translator<RecordingCompiler>> {
    let mem: Arc<dyn GuestMemory> = Arc::new(FlatMemory::new(0x100));
    Translator::new(config, RecordingCompiler::default(), mem)
}

fn mem() -> FlatMemory {
    FlatMemory::new(0x100)
}

#[test]
fn translation_is_cached_after_the_first_miss() {
    let t = translator(JitConfig::default());
    let mem = mem();

    let first = t.get_or_translate(&mem, 0x40, Tier::Baseline).unwrap();
    let second = t.get_or_translate(&mem, 0x40, Tier::Baseline).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(t.stats().baseline_compiles, 1);
}

#[test]
fn higher_tier_unit_satisfies_lower_tier_request() {
    let t = translator(JitConfig::default());
    let mem = mem();

    t.get_or_translate(&mem, 0x40, Tier::Optimized).unwrap();
    let unit = t.get_or_translate(&mem, 0x40, Tier::Baseline).unwrap();
    assert_eq!(unit.tier(), Tier::Optimized);
    assert_eq!(t.stats().baseline_compiles, 0);
    assert_eq!(t.stats().optimized_compiles, 1);
}

#[test]
fn lower_tier_unit_is_recompiled_for_a_higher_tier_request() {
    let t = translator(JitConfig::default());
    let mem = mem();

    t.get_or_translate(&mem, 0x40, Tier::Baseline).unwrap();
    let unit = t.get_or_translate(&mem, 0x40, Tier::Optimized).unwrap();
    assert_eq!(unit.tier(), Tier::Optimized);
    assert_eq!(
        t.compiler().log(),
        vec![(0x40, Tier::Baseline), (0x40, Tier::Optimized)]
    );
}

#[test]
fn crossing_the_hot_threshold_enqueues_exactly_one_upgrade() {
    let config = JitConfig {
        hot_threshold: 3,
        ..JitConfig::default()
    };
    let t = translator(config);
    let mem = mem();

    let unit = t.get_or_translate(&mem, 0x40, Tier::Baseline).unwrap();
    for _ in 0..10 {
        t.note_unit_executed(&unit);
    }

    assert_eq!(t.stats().upgrade_requests, 1);
    assert_eq!(
        t.queue().try_pop(),
        Some(CompileRequest {
            addr: 0x40,
            mode: ExecMode::Sequential,
            tier: Tier::Optimized,
        })
    );
    assert_eq!(t.queue().try_pop(), None);
}

#[test]
fn virtual_resolution_compiles_baseline_and_requests_optimization() {
    let t = translator(JitConfig::default());
    let mem = mem();

    let unit = t.get_or_translate_virtual(&mem, 0x80).unwrap();
    assert_eq!(unit.tier(), Tier::Baseline);
    assert_eq!(
        t.queue().try_pop(),
        Some(CompileRequest {
            addr: 0x80,
            mode: ExecMode::Indirect,
            tier: Tier::Optimized,
        })
    );

    // A later hit resolves from cache without a second request.
    t.get_or_translate_virtual(&mem, 0x80).unwrap();
    assert_eq!(t.stats().baseline_compiles, 1);
    assert_eq!(t.queue().try_pop(), None);
}

#[test]
fn callee_upgrade_flags_callers_for_reoptimization() {
    let t = translator(JitConfig::default());
    let mem = mem();

    let callee = 0x40;
    let caller = 0x80;
    t.get_or_translate(&mem, callee, Tier::Baseline).unwrap();
    t.get_or_translate(&mem, caller, Tier::Baseline).unwrap();
    t.record_caller(callee, caller);

    // Upgrading the callee marks the caller; nothing is queued yet.
    t.get_or_translate(&mem, callee, Tier::Optimized).unwrap();
    assert_eq!(t.queue().try_pop(), None);

    // The next fetch of the caller consumes the flag and requests its
    // re-optimization.
    t.get_or_translate(&mem, caller, Tier::Baseline).unwrap();
    assert_eq!(
        t.queue().try_pop(),
        Some(CompileRequest {
            addr: caller,
            mode: ExecMode::Sequential,
            tier: Tier::Optimized,
        })
    );

    // The flag is one-shot.
    t.get_or_translate(&mem, caller, Tier::Baseline).unwrap();
    assert_eq!(t.queue().try_pop(), None);
}

#[test]
fn caller_sets_survive_tier_replacement() {
    let t = translator(JitConfig::default());
    let mem = mem();

    t.get_or_translate(&mem, 0x40, Tier::Baseline).unwrap();
    t.record_caller(0x40, 0x90);
    let upgraded = t.get_or_translate(&mem, 0x40, Tier::Optimized).unwrap();
    assert_eq!(upgraded.caller_addresses(), vec![0x90]);
}

#[test]
fn record_caller_on_unknown_callee_is_a_noop() {
    let t = translator(JitConfig::default());
    t.record_caller(0x1234, 0x40);
    assert_eq!(t.cache().unit_count(), 0);
}

#[test]
fn worker_drains_requests_while_threads_are_active() {
    let t = translator(JitConfig::default());
    let mem = mem();

    t.thread_started();
    t.get_or_translate_virtual(&mem, 0x40).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match t.cache().peek(0x40) {
            Some(unit) if unit.tier() == Tier::Optimized => break,
            _ => {
                assert!(Instant::now() < deadline, "background upgrade never landed");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    t.thread_finished();
    assert_eq!(t.active_threads(), 0);
    assert_eq!(t.stats().baseline_compiles, 1);
    assert_eq!(t.stats().optimized_compiles, 1);
}

#[test]
fn worker_starts_and_stops_with_the_thread_count() {
    let t = translator(JitConfig::default());

    // Start/finish cycles must not deadlock or leak the worker.
    for _ in 0..3 {
        t.thread_started();
        t.thread_started();
        t.thread_finished();
        t.thread_finished();
        assert_eq!(t.active_threads(), 0);
    }
}
