//! End-to-end guest execution through the full stack: decoder, reference
//! code generator, translation cache, and execution loop.

use std::sync::Arc;
use std::time::Duration;

use halcyon_cpu_core::{
    run_thread, CompileRequest, Dispatch, ExecMode, ExitReason, GuestThread, JitConfig,
    ThreadState, Tier, TranslateError, Translator,
};
use halcyon_jit::{JitCompiler, ReferenceCodegen};
use halcyon_risc::{asm, FlatMemory, Gpr, GuestMemory, LINK_REG};

type Engine = Arc<Translator<JitCompiler<ReferenceCodegen>>>;

fn engine(flat: FlatMemory, config: JitConfig) -> (Engine, Arc<dyn GuestMemory>) {
    let mem: Arc<dyn GuestMemory> = Arc::new(flat);
    let translator = Translator::new(config, JitCompiler::new(ReferenceCodegen), Arc::clone(&mem));
    (translator, mem)
}

/// li r1, n; loop: addi r1, r1, -1; bnez r1, loop; halt
fn countdown_program(n: u16) -> FlatMemory {
    let mut mem = FlatMemory::new(0x1000);
    mem.write_words(
        0,
        &[
            asm::li(Gpr(1), n),
            asm::addi(Gpr(1), Gpr(1), -1),
            asm::bnez(Gpr(1), 0x4),
            asm::halt(),
        ],
    );
    mem
}

#[test]
fn countdown_halts_with_exact_block_count() {
    let (translator, mem) = engine(countdown_program(5), JitConfig::default());
    let mut state = ThreadState::new(0);

    let exit = run_thread(&translator, &mut state, &*mem).unwrap();
    assert_eq!(exit.reason, ExitReason::Halted);
    // Entry block once (li + first decrement), loop body four times, halt
    // block once.
    assert_eq!(exit.blocks_executed, 6);
    assert_eq!(state.read_gpr(Gpr(1)), 0);
    assert_eq!(translator.active_threads(), 0);
}

#[test]
fn call_and_return_follow_the_link_register() {
    let mut flat = FlatMemory::new(0x1000);
    // 0x0:  li r2, 7
    // 0x4:  call 0x10
    // 0x8:  addi r2, r2, 1
    // 0xc:  halt
    // 0x10: addi r2, r2, 10
    // 0x14: ret
    flat.write_words(
        0,
        &[
            asm::li(Gpr(2), 7),
            asm::call(0x10),
            asm::addi(Gpr(2), Gpr(2), 1),
            asm::halt(),
            asm::addi(Gpr(2), Gpr(2), 10),
            asm::ret(),
        ],
    );
    let (translator, mem) = engine(flat, JitConfig::default());
    let mut state = ThreadState::new(0);

    let exit = run_thread(&translator, &mut state, &*mem).unwrap();
    assert_eq!(exit.reason, ExitReason::Halted);
    assert_eq!(exit.blocks_executed, 3);
    assert_eq!(state.read_gpr(Gpr(2)), 18);
}

#[test]
fn optimized_unit_runs_the_whole_loop_inline() {
    let (translator, mem) = engine(countdown_program(20), JitConfig::default());

    let unit = translator
        .get_or_translate(&*mem, 0, Tier::Optimized)
        .unwrap();
    assert_eq!(unit.tier(), Tier::Optimized);

    let mut state = ThreadState::new(0);
    // The graph covers the entire countdown; one invocation reaches halt.
    assert_eq!(unit.execute(&mut state, &*mem), 0);
    assert_eq!(state.read_gpr(Gpr(1)), 0);
    assert_eq!(translator.stats().optimized_compiles, 1);
}

#[test]
fn optimized_graph_continues_inline_after_a_direct_call() {
    let mut flat = FlatMemory::new(0x1000);
    flat.write_words(
        0,
        &[
            asm::li(Gpr(2), 7),
            asm::call(0x10),
            asm::addi(Gpr(2), Gpr(2), 1),
            asm::halt(),
            asm::addi(Gpr(2), Gpr(2), 10),
            asm::ret(),
        ],
    );
    let (translator, mem) = engine(flat, JitConfig::default());

    let unit = translator
        .get_or_translate(&*mem, 0, Tier::Optimized)
        .unwrap();

    let mut state = ThreadState::new(0);
    state.install_dispatch(Arc::clone(&translator) as Arc<dyn Dispatch>);
    // Callee resolves through the dispatcher, returns the continuation, and
    // the graph resumes inline through to the halt.
    assert_eq!(unit.execute(&mut state, &*mem), 0);
    state.clear_dispatch();

    assert_eq!(state.read_gpr(Gpr(2)), 18);
    assert_eq!(state.read_gpr(LINK_REG), 0x8);
    // The callee was compiled on demand at baseline.
    assert_eq!(translator.stats().baseline_compiles, 1);
    assert!(translator.cache().contains(0x10));
}

#[test]
fn virtual_call_resolves_target_and_requests_its_upgrade() {
    let mut flat = FlatMemory::new(0x1000);
    // 0x0:  li r3, 0x20
    // 0x4:  jalr r3
    // 0x8:  halt
    // 0x20: li r4, 9
    // 0x24: ret
    flat.write_words(0, &[asm::li(Gpr(3), 0x20), asm::jalr(Gpr(3)), asm::halt()]);
    flat.write_words(0x20, &[asm::li(Gpr(4), 9), asm::ret()]);
    let (translator, mem) = engine(flat, JitConfig::default());

    let unit = translator
        .get_or_translate(&*mem, 0, Tier::Optimized)
        .unwrap();

    let mut state = ThreadState::new(0);
    state.install_dispatch(Arc::clone(&translator) as Arc<dyn Dispatch>);
    assert_eq!(unit.execute(&mut state, &*mem), 0);
    state.clear_dispatch();

    assert_eq!(state.read_gpr(Gpr(4)), 9);
    // Indirect targets get a background upgrade request on first resolve.
    assert_eq!(
        translator.queue().try_pop(),
        Some(CompileRequest {
            addr: 0x20,
            mode: ExecMode::Indirect,
            tier: Tier::Optimized,
        })
    );
}

#[test]
fn hot_loop_requests_a_background_upgrade() {
    let config = JitConfig {
        hot_threshold: 3,
        ..JitConfig::default()
    };
    let (translator, mem) = engine(countdown_program(50), config);
    let mut state = ThreadState::new(0);

    let exit = run_thread(&translator, &mut state, &*mem).unwrap();
    assert_eq!(exit.reason, ExitReason::Halted);
    assert_eq!(state.read_gpr(Gpr(1)), 0);
    assert!(translator.stats().upgrade_requests >= 1);
}

#[test]
fn stop_request_halts_a_spawned_thread() {
    let mut flat = FlatMemory::new(0x1000);
    flat.write_words(0x100, &[asm::b(0x100)]);
    let (translator, mem) = engine(flat, JitConfig::default());

    let thread = GuestThread::spawn(Arc::clone(&translator), Arc::clone(&mem), 0x100);
    let stop = thread.stop_handle();
    std::thread::sleep(Duration::from_millis(20));
    assert!(stop.is_running());
    stop.request_stop();

    let exit = thread.join().unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert!(exit.blocks_executed >= 1);
    assert_eq!(translator.active_threads(), 0);
}

#[test]
fn concurrent_threads_share_the_translation_cache() {
    let (translator, mem) = engine(countdown_program(30), JitConfig::default());

    let threads: Vec<GuestThread> = (0..4)
        .map(|_| GuestThread::spawn(Arc::clone(&translator), Arc::clone(&mem), 0))
        .collect();
    for thread in threads {
        let exit = thread.join().unwrap();
        assert_eq!(exit.reason, ExitReason::Halted);
    }

    assert_eq!(translator.active_threads(), 0);
    // Every thread ran the same three blocks; racing compiles are allowed
    // but the cache holds one unit per address.
    assert!(translator.cache().unit_count() <= 3);
}

#[test]
fn fetch_fault_surfaces_as_a_decode_error() {
    let (translator, mem) = engine(FlatMemory::new(0x40), JitConfig::default());
    let mut state = ThreadState::new(0x1000);

    let err = run_thread(&translator, &mut state, &*mem).unwrap_err();
    assert!(matches!(err, TranslateError::Decode { entry: 0x1000, .. }));
    assert_eq!(translator.active_threads(), 0);
}
