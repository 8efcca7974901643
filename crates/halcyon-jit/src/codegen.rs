//! The code-generation seam.
//!
//! Everything above this trait works with opaque [`BlockKernel`]s, so the
//! engine never sees how a kernel executes. [`crate::reference`] provides an
//! interpreting generator; a machine-code emitting backend implements the
//! same trait.

use halcyon_cpu_core::BlockKernel;

use crate::block::{BasicBlock, SubroutineGraph};

pub trait CodeGenerator: Send + Sync {
    /// Compile a single basic block (baseline tier).
    fn compile_block(&self, block: &BasicBlock) -> Box<dyn BlockKernel>;

    /// Compile a whole subroutine graph (optimized tier). The produced
    /// kernel drives intra-graph control flow itself and only leaves for
    /// calls, returns, and targets outside the graph.
    fn compile_graph(&self, graph: &SubroutineGraph) -> Box<dyn BlockKernel>;
}
