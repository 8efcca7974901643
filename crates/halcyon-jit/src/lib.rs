//! Halcyon's translation pipeline: block discovery and code generation.
//!
//! - [`block`]: guest basic-block decoding, both single-block (baseline) and
//!   breadth-first subroutine-graph discovery with overlap splitting
//!   (optimized).
//! - [`codegen`]: the code-generator contract the engine compiles through.
//! - [`reference`]: a reference code generator that executes decoded blocks
//!   directly while honoring the continuation protocol; the unit of
//!   exchange with the runtime is an opaque kernel, so a machine-code
//!   emitting backend drops in behind the same trait.
//! - [`compiler`]: glue implementing `halcyon_cpu_core`'s `UnitCompiler`
//!   seam on top of the decoder and a code generator.

pub mod block;
pub mod codegen;
pub mod compiler;
pub mod reference;

pub use block::{
    decode_basic_block, decode_subroutine, live_in_regs, skip_sched, BasicBlock, BlockEndKind,
    BlockLimits, GraphLimits, SubroutineGraph,
};
pub use codegen::CodeGenerator;
pub use compiler::JitCompiler;
pub use reference::ReferenceCodegen;
