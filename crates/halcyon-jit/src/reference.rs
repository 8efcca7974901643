//! Reference code generator.
//!
//! Kernels produced here execute the decoded instructions directly instead
//! of emitting native code, but they honor every part of the kernel
//! contract: the continuation protocol (0 halts, nonzero resumes), live-in
//! argument bindings, caller recording, and dispatcher callbacks for calls
//! that leave the unit. The engine cannot tell it apart from a real
//! backend, which makes it the oracle the tiering tests run against.

use std::collections::HashMap;

use halcyon_cpu_core::{BlockKernel, Dispatch, ThreadState};
use halcyon_risc::{Gpr, GuestMemory, Inst, Op, LINK_REG};

use crate::block::{BasicBlock, SubroutineGraph};
use crate::codegen::CodeGenerator;

pub struct ReferenceCodegen;

impl CodeGenerator for ReferenceCodegen {
    fn compile_block(&self, block: &BasicBlock) -> Box<dyn BlockKernel> {
        Box::new(BlockProgram {
            entry: block.start,
            body: block.insts.clone(),
            next: block.next,
            branch: block.branch,
            bindings: crate::block::live_in_regs(&block.insts),
        })
    }

    fn compile_graph(&self, graph: &SubroutineGraph) -> Box<dyn BlockKernel> {
        let blocks = graph
            .blocks()
            .map(|b| {
                (
                    b.start,
                    GraphBlock {
                        body: b.insts.clone(),
                        next: b.next,
                        branch: b.branch,
                    },
                )
            })
            .collect();
        Box::new(GraphProgram {
            entry: graph.entry(),
            bindings: crate::block::live_in_regs(&graph.entry_block().insts),
            blocks,
        })
    }
}

/// Register access window for one kernel invocation.
///
/// Registers listed in `bindings` are read from `args` until first written;
/// writes go through to the architectural state immediately, so state is
/// always current when control leaves the kernel.
struct RegWindow<'a> {
    state: &'a mut ThreadState,
    bindings: &'a [Gpr],
    args: &'a [u64],
    written: u32,
}

impl<'a> RegWindow<'a> {
    fn new(state: &'a mut ThreadState, bindings: &'a [Gpr], args: &'a [u64]) -> Self {
        debug_assert_eq!(bindings.len(), args.len());
        Self {
            state,
            bindings,
            args,
            written: 0,
        }
    }

    fn read(&self, reg: Gpr) -> u64 {
        if self.written & (1 << reg.index()) == 0 {
            if let Some(pos) = self.bindings.iter().position(|b| *b == reg) {
                return self.args[pos];
            }
        }
        self.state.read_gpr(reg)
    }

    fn write(&mut self, reg: Gpr, value: u64) {
        self.state.write_gpr(reg, value);
        self.written |= 1 << reg.index();
    }
}

/// Where control goes after one block's straight-line portion.
enum Step {
    /// Static intra-unit edge.
    Goto(u64),
    /// Direct call; `ret` is the continuation the callee's result is
    /// compared against.
    DirectCall { target: u64, ret: u64 },
    /// Register-indirect call.
    IndirectCall { target: u64, ret: u64 },
    /// Control leaves the unit for `addr`.
    Leave(u64),
    Halt,
}

/// Run a block's instructions against `regs` and classify the exit.
/// `next`/`branch` are the skip-normalized successors recorded at decode
/// time; the raw targets inside the terminal ops are ignored in their
/// favor.
fn exec_block(
    body: &[Inst],
    next: Option<u64>,
    branch: Option<u64>,
    regs: &mut RegWindow<'_>,
) -> Step {
    for inst in body {
        match inst.op {
            Op::Alu { rd, ra, imm } => {
                let value = regs.read(ra).wrapping_add(imm as i64 as u64);
                regs.write(rd, value);
            }
            Op::LoadImm { rd, imm } => regs.write(rd, u64::from(imm)),
            Op::Illegal => {}
            Op::Branch { .. } => {
                return Step::Goto(branch.expect("jump block has branch successor"));
            }
            Op::CondBranch { ra, .. } => {
                let taken = regs.read(ra) != 0;
                let target = if taken { branch } else { next };
                return Step::Goto(target.expect("cond block has both successors"));
            }
            Op::Call { .. } => {
                let ret = next.expect("call block has continuation");
                regs.write(LINK_REG, ret);
                return Step::DirectCall {
                    target: branch.expect("call block has callee"),
                    ret,
                };
            }
            Op::CallIndirect { ra } => {
                let ret = next.expect("call block has continuation");
                let target = regs.read(ra);
                regs.write(LINK_REG, ret);
                return Step::IndirectCall { target, ret };
            }
            Op::BranchIndirect { ra } => return Step::Leave(regs.read(ra)),
            Op::Return => return Step::Leave(regs.read(LINK_REG)),
            Op::Halt => return Step::Halt,
        }
    }
    // Split or budget-limited block: straight line continues.
    Step::Goto(next.expect("fallthrough block has next"))
}

/// Baseline kernel: one basic block. Every exit returns to the dispatcher;
/// calls only set up the link register and report the callee as the next
/// pc.
struct BlockProgram {
    entry: u64,
    body: Vec<Inst>,
    next: Option<u64>,
    branch: Option<u64>,
    bindings: Vec<Gpr>,
}

impl BlockKernel for BlockProgram {
    fn run(&self, state: &mut ThreadState, _mem: &dyn GuestMemory, args: &[u64]) -> u64 {
        let dispatch = state.dispatch();
        let mut regs = RegWindow::new(state, &self.bindings, args);
        match exec_block(&self.body, self.next, self.branch, &mut regs) {
            Step::Goto(addr) | Step::Leave(addr) => addr,
            Step::DirectCall { target, .. } => {
                if let Some(d) = &dispatch {
                    d.record_caller(target, self.entry);
                }
                target
            }
            Step::IndirectCall { target, .. } => target,
            Step::Halt => 0,
        }
    }
}

struct GraphBlock {
    body: Vec<Inst>,
    next: Option<u64>,
    branch: Option<u64>,
}

/// Optimized kernel: a whole subroutine graph. Intra-graph edges are
/// followed without leaving the kernel; direct and indirect calls resolve
/// their callee through the dispatcher, execute it inline, and compare the
/// callee's result against the continuation to decide between resuming
/// inline and propagating outward.
struct GraphProgram {
    entry: u64,
    bindings: Vec<Gpr>,
    blocks: HashMap<u64, GraphBlock>,
}

impl BlockKernel for GraphProgram {
    fn run(&self, state: &mut ThreadState, mem: &dyn GuestMemory, args: &[u64]) -> u64 {
        let dispatch = state.dispatch();
        let mut pc = self.entry;
        let mut entry_block = true;
        loop {
            // Stop requests are honored at block boundaries even inside an
            // optimized unit; pc identifies where to resume.
            if !state.is_running() {
                return pc;
            }
            let Some(block) = self.blocks.get(&pc) else {
                // Unexplored edge (graph budget) or external target.
                return pc;
            };

            let step = {
                let mut regs = if entry_block {
                    RegWindow::new(state, &self.bindings, args)
                } else {
                    RegWindow::new(state, &[], &[])
                };
                exec_block(&block.body, block.next, block.branch, &mut regs)
            };
            entry_block = false;

            let (target, ret, direct) = match step {
                Step::Goto(addr) => {
                    pc = addr;
                    continue;
                }
                Step::Leave(addr) => return addr,
                Step::Halt => return 0,
                Step::DirectCall { target, ret } => (target, ret, true),
                Step::IndirectCall { target, ret } => (target, ret, false),
            };

            let Some(d) = &dispatch else {
                // No dispatcher installed (unit driven standalone): fall back
                // to reporting the callee as the next pc.
                return target;
            };
            if direct {
                d.record_caller(target, self.entry);
            }
            let resolved = if direct {
                d.resolve(mem, target)
            } else {
                d.resolve_virtual(mem, target)
            };
            match resolved {
                Ok(unit) => {
                    let result = unit.execute(state, mem);
                    d.note_unit_executed(&unit);
                    if result == ret {
                        pc = ret;
                    } else {
                        // Halt, a deeper non-local exit, or a fault unwind:
                        // propagate the continuation outward unchanged.
                        return result;
                    }
                }
                Err(err) => {
                    state.set_fault(err);
                    return 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{decode_basic_block, BlockLimits};
    use halcyon_risc::{asm, FlatMemory};

    fn block_kernel(mem: &FlatMemory, entry: u64) -> Box<dyn BlockKernel> {
        let block = decode_basic_block(mem, entry, BlockLimits::default()).expect("decode");
        ReferenceCodegen.compile_block(&block)
    }

    #[test]
    fn straight_line_block_updates_registers_and_reports_branch_target() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_words(
            0,
            &[
                asm::li(Gpr(1), 7),
                asm::addi(Gpr(2), Gpr(1), 3),
                asm::b(0x100),
            ],
        );

        let kernel = block_kernel(&mem, 0);
        let mut state = ThreadState::new(0);
        assert_eq!(kernel.run(&mut state, &mem, &[]), 0x100);
        assert_eq!(state.read_gpr(Gpr(1)), 7);
        assert_eq!(state.read_gpr(Gpr(2)), 10);
    }

    #[test]
    fn cond_branch_picks_successor_from_register() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_words(0, &[asm::bnez(Gpr(5), 0x200)]);
        let kernel = block_kernel(&mem, 0);

        let mut state = ThreadState::new(0);
        state.write_gpr(Gpr(5), 1);
        assert_eq!(kernel.run(&mut state, &mem, &[1]), 0x200);

        state.write_gpr(Gpr(5), 0);
        assert_eq!(kernel.run(&mut state, &mem, &[0]), 4);
    }

    #[test]
    fn call_sets_link_register_to_continuation() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_words(0, &[asm::call(0x300)]);
        let kernel = block_kernel(&mem, 0);

        let mut state = ThreadState::new(0);
        assert_eq!(kernel.run(&mut state, &mem, &[]), 0x300);
        assert_eq!(state.read_gpr(LINK_REG), 4);
    }

    #[test]
    fn halt_returns_zero_continuation() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_words(0, &[asm::halt()]);
        let kernel = block_kernel(&mem, 0);
        let mut state = ThreadState::new(0);
        assert_eq!(kernel.run(&mut state, &mem, &[]), 0);
    }

    #[test]
    fn arg_bindings_shadow_state_until_first_write() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_words(0, &[asm::addi(Gpr(1), Gpr(1), 1), asm::jr(Gpr(1))]);
        let block = decode_basic_block(&mem, 0, BlockLimits::default()).expect("decode");
        assert_eq!(crate::block::live_in_regs(&block.insts), vec![Gpr(1)]);
        let kernel = ReferenceCodegen.compile_block(&block);

        let mut state = ThreadState::new(0);
        state.write_gpr(Gpr(1), 0xdead);
        // The bound argument, not the stale state value, feeds the add.
        assert_eq!(kernel.run(&mut state, &mem, &[0x7f]), 0x80);
        assert_eq!(state.read_gpr(Gpr(1)), 0x80);
    }
}
