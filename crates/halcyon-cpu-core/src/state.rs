//! Per-guest-thread architectural state.
//!
//! One `ThreadState` exists per guest thread and is owned by the OS thread
//! driving it. The `running`/`interrupt-request` flags are shared through a
//! [`StopHandle`] so other threads can request a cooperative stop; both are
//! observed only at block boundaries, never mid-block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use halcyon_risc::Gpr;

use crate::jit::runtime::{Dispatch, TranslateError};

/// Number of guest general registers.
pub const GPR_COUNT: usize = 32;

/// Number of 128-bit guest vector registers.
pub const VR_COUNT: usize = 32;

/// Cloneable handle for cooperative control of a running guest thread.
#[derive(Clone)]
pub struct StopHandle {
    run: Arc<AtomicBool>,
    irq: Arc<AtomicBool>,
}

impl StopHandle {
    /// Clear the running flag. Observed at the next block boundary; never
    /// pre-empts mid-block execution.
    pub fn request_stop(&self) {
        self.run.store(false, Ordering::Release);
    }

    pub fn request_interrupt(&self) {
        self.irq.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::Acquire)
    }
}

pub struct ThreadState {
    pub pc: u64,
    gpr: [u64; GPR_COUNT],
    vr: [[u64; 2]; VR_COUNT],
    run: Arc<AtomicBool>,
    irq: Arc<AtomicBool>,
    /// Back-pointer to the orchestrator, installed at execution start and
    /// cleared at exit so generated code reached via indirect call has a
    /// path back without global lookup.
    dispatch: Option<Arc<dyn Dispatch>>,
    /// Fault raised by generated code that cannot propagate a `Result`
    /// through the native calling convention; drained by the execution loop.
    fault: Option<TranslateError>,
}

impl ThreadState {
    pub fn new(entry: u64) -> Self {
        Self {
            pc: entry,
            gpr: [0; GPR_COUNT],
            vr: [[0; 2]; VR_COUNT],
            run: Arc::new(AtomicBool::new(true)),
            irq: Arc::new(AtomicBool::new(false)),
            dispatch: None,
            fault: None,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            run: Arc::clone(&self.run),
            irq: Arc::clone(&self.irq),
        }
    }

    #[inline]
    pub fn read_gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg.index()]
    }

    #[inline]
    pub fn write_gpr(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg.index()] = value;
    }

    #[inline]
    pub fn read_vr(&self, index: usize) -> [u64; 2] {
        self.vr[index]
    }

    #[inline]
    pub fn write_vr(&mut self, index: usize, value: [u64; 2]) {
        self.vr[index] = value;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::Acquire)
    }

    /// Consume a pending interrupt request, if any. Delivery itself is a
    /// collaborator's business; the execution loop only exposes the
    /// block-boundary poll point.
    #[inline]
    pub fn take_interrupt_request(&self) -> bool {
        self.irq.swap(false, Ordering::AcqRel)
    }

    pub fn install_dispatch(&mut self, dispatch: Arc<dyn Dispatch>) {
        self.dispatch = Some(dispatch);
    }

    pub fn clear_dispatch(&mut self) {
        self.dispatch = None;
    }

    pub fn dispatch(&self) -> Option<Arc<dyn Dispatch>> {
        self.dispatch.clone()
    }

    pub fn set_fault(&mut self, fault: TranslateError) {
        // First fault wins; later ones are consequences of the unwind.
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }

    pub fn take_fault(&mut self) -> Option<TranslateError> {
        self.fault.take()
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("pc", &self.pc)
            .field("gpr", &self.gpr)
            .field("running", &self.is_running())
            .field("dispatch", &self.dispatch.is_some())
            .finish_non_exhaustive()
    }
}
