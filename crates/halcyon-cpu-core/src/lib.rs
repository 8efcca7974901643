//! Halcyon's CPU-core runtime: the engine half of the tiered dynamic binary
//! translator.
//!
//! This crate owns everything that runs while guest threads execute:
//!
//! - [`state`]: per-guest-thread architectural state plus the dispatch
//!   capability generated code calls back through.
//! - [`jit`]: translated units, the concurrent translation cache, the
//!   background compile queue, and the [`jit::runtime::Translator`]
//!   orchestrator with its worker thread.
//! - [`exec`]: the per-thread Running → Stopped execution loop.
//!
//! Block discovery and code generation live in `halcyon-jit`; they plug in
//! through the [`jit::runtime::UnitCompiler`] seam so the runtime never
//! depends on a concrete compiler.

pub mod exec;
pub mod jit;
pub mod state;

pub use exec::{run_thread, ExitReason, GuestThread, ThreadExit};
pub use jit::cache::TranslationCache;
pub use jit::queue::{CompileRequest, ExecMode, TranslationQueue};
pub use jit::runtime::{
    CompiledUnit, Dispatch, JitConfig, TranslateError, Translator, TranslatorStats, UnitCompiler,
};
pub use jit::unit::{BlockKernel, Tier, TranslatedUnit};
pub use state::{StopHandle, ThreadState};
