//! Glue implementing the runtime's [`UnitCompiler`] seam: tier selection,
//! block discovery, and hand-off to a [`CodeGenerator`].

use halcyon_cpu_core::{CompiledUnit, Tier, TranslateError, UnitCompiler};
use halcyon_risc::GuestMemory;

use crate::block::{decode_basic_block, decode_subroutine, live_in_regs, GraphLimits};
use crate::codegen::CodeGenerator;

pub struct JitCompiler<G: CodeGenerator> {
    codegen: G,
    limits: GraphLimits,
}

impl<G: CodeGenerator> JitCompiler<G> {
    pub fn new(codegen: G) -> Self {
        Self::with_limits(codegen, GraphLimits::default())
    }

    pub fn with_limits(codegen: G, limits: GraphLimits) -> Self {
        Self { codegen, limits }
    }
}

impl<G: CodeGenerator> UnitCompiler for JitCompiler<G> {
    fn compile(
        &self,
        mem: &dyn GuestMemory,
        entry: u64,
        tier: Tier,
    ) -> Result<CompiledUnit, TranslateError> {
        match tier {
            Tier::Baseline => {
                let block = decode_basic_block(mem, entry, self.limits.block)
                    .map_err(|fault| TranslateError::Decode { entry, fault })?;
                tracing::trace!(
                    entry = format_args!("{entry:#x}"),
                    insts = block.insts.len(),
                    end = ?block.end_kind,
                    "baseline block decoded"
                );
                Ok(CompiledUnit {
                    arg_bindings: live_in_regs(&block.insts),
                    weight: block.insts.len() as u64,
                    kernel: self.codegen.compile_block(&block),
                })
            }
            Tier::Optimized => {
                let graph = decode_subroutine(mem, entry, self.limits)
                    .map_err(|fault| TranslateError::Decode { entry, fault })?;
                tracing::trace!(
                    entry = format_args!("{entry:#x}"),
                    blocks = graph.len(),
                    insts = graph.inst_count(),
                    "subroutine graph decoded"
                );
                Ok(CompiledUnit {
                    arg_bindings: live_in_regs(&graph.entry_block().insts),
                    weight: graph.inst_count(),
                    kernel: self.codegen.compile_graph(&graph),
                })
            }
        }
    }
}
