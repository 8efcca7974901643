//! Per-guest-thread execution driver.
//!
//! A two-state machine: **Running** resolves the unit at the current pc and
//! executes it; a zero continuation or a cleared running flag transitions to
//! **Stopped**, which is terminal for the loop invocation. Stop requests are
//! cooperative and only observed at block boundaries.

use std::sync::Arc;
use std::thread::JoinHandle;

use halcyon_risc::GuestMemory;

use crate::jit::runtime::{Dispatch, TranslateError, Translator, UnitCompiler};
use crate::jit::unit::Tier;
use crate::state::{StopHandle, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The guest program returned the halt continuation (0).
    Halted,
    /// The running flag was cleared externally.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadExit {
    pub reason: ExitReason,
    /// Number of translated units executed before the loop left Running.
    pub blocks_executed: u64,
}

/// Drive `state` until the guest halts, a stop is requested, or translation
/// fails. Registers the thread with the translator (starting the background
/// worker on the 0 → 1 transition) and installs the dispatch capability for
/// the duration of the run.
pub fn run_thread<C: UnitCompiler + 'static>(
    translator: &Arc<Translator<C>>,
    state: &mut ThreadState,
    mem: &dyn GuestMemory,
) -> Result<ThreadExit, TranslateError> {
    translator.thread_started();
    state.install_dispatch(Arc::clone(translator) as Arc<dyn Dispatch>);

    let result = run_loop(translator, state, mem);

    state.clear_dispatch();
    translator.thread_finished();
    result
}

fn run_loop<C: UnitCompiler + 'static>(
    translator: &Arc<Translator<C>>,
    state: &mut ThreadState,
    mem: &dyn GuestMemory,
) -> Result<ThreadExit, TranslateError> {
    let mut blocks_executed = 0u64;
    loop {
        if !state.is_running() {
            tracing::debug!(
                pc = format_args!("{:#x}", state.pc),
                blocks_executed,
                "guest thread stopped"
            );
            return Ok(ThreadExit {
                reason: ExitReason::Stopped,
                blocks_executed,
            });
        }

        // Block-boundary interrupt poll point; delivery is a collaborator's
        // business and out of scope here.
        let _ = state.take_interrupt_request();

        let unit = translator.get_or_translate(mem, state.pc, Tier::Baseline)?;
        let next_pc = unit.execute(state, mem);
        blocks_executed += 1;
        translator.note_unit_executed(&unit);

        // Generated code surfaces translation faults through the state; they
        // cannot cross the native calling convention as a `Result`.
        if let Some(fault) = state.take_fault() {
            return Err(fault);
        }

        if next_pc == 0 {
            tracing::debug!(blocks_executed, "guest thread halted");
            return Ok(ThreadExit {
                reason: ExitReason::Halted,
                blocks_executed,
            });
        }
        state.pc = next_pc;
    }
}

/// A guest thread driven on its own OS thread (one OS thread per guest
/// thread; no cooperative scheduling inside the engine).
pub struct GuestThread {
    handle: JoinHandle<Result<ThreadExit, TranslateError>>,
    stop: StopHandle,
}

impl GuestThread {
    pub fn spawn<C: UnitCompiler + 'static>(
        translator: Arc<Translator<C>>,
        mem: Arc<dyn GuestMemory>,
        entry: u64,
    ) -> Self {
        let mut state = ThreadState::new(entry);
        let stop = state.stop_handle();
        let handle = std::thread::Builder::new()
            .name(format!("halcyon-guest-{entry:#x}"))
            .spawn(move || run_thread(&translator, &mut state, &*mem))
            .expect("spawn guest thread");
        Self { handle, stop }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for the guest thread to leave Running and collect its exit.
    pub fn join(self) -> Result<ThreadExit, TranslateError> {
        self.handle.join().expect("guest thread panicked")
    }
}
