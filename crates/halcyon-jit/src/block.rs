//! Guest basic-block discovery.
//!
//! `decode_basic_block` performs the linear baseline scan;
//! `decode_subroutine` expands breadth-first over branch/fallthrough targets
//! and splits overlapping blocks so the result is a proper partition of the
//! explored range: no two blocks share an address, and every `next`/`branch`
//! reference resolves to a block start.

use std::collections::VecDeque;
use std::collections::BTreeMap;
use std::ops::Bound;

use halcyon_risc::{
    decode, is_sched_slot, Gpr, GuestMemory, Inst, MemFault, Op, LINK_REG, WORD_BYTES,
};

/// How a decoded block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEndKind {
    /// Unconditional branch; `branch` is the only successor.
    Jump,
    /// Conditional branch; `branch` is taken, `next` falls through.
    CondJump,
    /// Direct call; `branch` is the callee, `next` the return continuation.
    Call,
    /// Indirect branch; target known only at runtime.
    IndirectJump,
    /// Indirect call; `next` is the return continuation.
    IndirectCall,
    /// Branch to the link register.
    Return,
    /// Guest halt.
    Halt,
    /// No terminal instruction: the decode limit was reached or the block
    /// was split; `next` continues the straight line.
    Fallthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// First instruction address.
    pub start: u64,
    /// Exclusive end of the address range `[start, end)`.
    pub end: u64,
    pub insts: Vec<Inst>,
    /// Fallthrough successor (None if the block ends in an unconditional
    /// exit).
    pub next: Option<u64>,
    /// Taken-branch successor (None if the terminal is not a branch with a
    /// statically known target).
    pub branch: Option<u64>,
    pub end_kind: BlockEndKind,
}

impl BasicBlock {
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Per-block decode budget.
#[derive(Debug, Clone, Copy)]
pub struct BlockLimits {
    /// Maximum decoded instructions per block before forcing a fallthrough
    /// end.
    pub max_insts: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self { max_insts: 128 }
    }
}

/// Budgets for subroutine-graph discovery.
#[derive(Debug, Clone, Copy)]
pub struct GraphLimits {
    pub block: BlockLimits,
    /// Maximum blocks explored; further targets stay exit edges resolved
    /// through the dispatcher at runtime.
    pub max_blocks: usize,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            block: BlockLimits::default(),
            max_blocks: 64,
        }
    }
}

/// Advance past scheduling-metadata slots to the next decodable address.
#[inline]
pub fn skip_sched(mut addr: u64) -> u64 {
    while is_sched_slot(addr) {
        addr += WORD_BYTES;
    }
    addr
}

/// Address of the instruction following the one at `addr`, skipping any
/// scheduling-metadata slots in between.
#[inline]
fn next_fetch_addr(addr: u64) -> u64 {
    skip_sched(addr + WORD_BYTES)
}

/// Linear scan from `entry` until a terminal instruction or the decode
/// budget. Scheduling-metadata words advance the cursor without being
/// decoded; unrecognized encodings are logged and kept as no-op
/// placeholders. Fetch faults surface as decode failures for the whole
/// block.
pub fn decode_basic_block(
    mem: &dyn GuestMemory,
    entry: u64,
    limits: BlockLimits,
) -> Result<BasicBlock, MemFault> {
    let start = skip_sched(entry);
    let mut cursor = start;
    let mut insts = Vec::new();

    loop {
        let raw = mem.read_word(cursor)?;
        let inst = decode(raw, cursor);
        if inst.op == Op::Illegal {
            tracing::warn!(
                addr = format_args!("{cursor:#x}"),
                raw = format_args!("{raw:#010x}"),
                "unrecognized guest encoding; decoding continues past it"
            );
        }
        insts.push(inst);

        if inst.is_terminal() {
            let after = next_fetch_addr(cursor);
            let (end_kind, next, branch) = match inst.op {
                Op::Branch { target } => (BlockEndKind::Jump, None, Some(skip_sched(target))),
                Op::CondBranch { target, .. } => {
                    (BlockEndKind::CondJump, Some(after), Some(skip_sched(target)))
                }
                Op::Call { target } => (BlockEndKind::Call, Some(after), Some(skip_sched(target))),
                Op::BranchIndirect { .. } => (BlockEndKind::IndirectJump, None, None),
                Op::CallIndirect { .. } => (BlockEndKind::IndirectCall, Some(after), None),
                Op::Return => (BlockEndKind::Return, None, None),
                Op::Halt => (BlockEndKind::Halt, None, None),
                Op::Alu { .. } | Op::LoadImm { .. } | Op::Illegal => unreachable!(),
            };
            return Ok(BasicBlock {
                start,
                end: inst.end(),
                insts,
                next,
                branch,
                end_kind,
            });
        }

        if insts.len() >= limits.max_insts {
            return Ok(BasicBlock {
                start,
                end: inst.end(),
                insts,
                next: Some(next_fetch_addr(cursor)),
                branch: None,
                end_kind: BlockEndKind::Fallthrough,
            });
        }
        cursor = next_fetch_addr(cursor);
    }
}

/// A subroutine's blocks, keyed by start address. Blocks never overlap.
#[derive(Debug, Clone)]
pub struct SubroutineGraph {
    entry: u64,
    blocks: BTreeMap<u64, BasicBlock>,
}

impl SubroutineGraph {
    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn entry_block(&self) -> &BasicBlock {
        &self.blocks[&self.entry]
    }

    pub fn block_at(&self, addr: u64) -> Option<&BasicBlock> {
        self.blocks.get(&addr)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total decoded instruction count; the cache weight of an optimized
    /// unit.
    pub fn inst_count(&self) -> u64 {
        self.blocks.values().map(|b| b.insts.len() as u64).sum()
    }
}

/// Successor addresses that belong to the same subroutine. Direct-call
/// *targets* are separate subroutines reached through the dispatcher, so
/// only the return continuation is explored.
fn explored_successors(block: &BasicBlock) -> impl Iterator<Item = u64> {
    let (a, b) = match block.end_kind {
        BlockEndKind::Jump => (block.branch, None),
        BlockEndKind::CondJump => (block.branch, block.next),
        BlockEndKind::Call | BlockEndKind::IndirectCall | BlockEndKind::Fallthrough => {
            (block.next, None)
        }
        BlockEndKind::IndirectJump | BlockEndKind::Return | BlockEndKind::Halt => (None, None),
    };
    a.into_iter().chain(b)
}

/// Breadth-first subroutine expansion from `entry`.
///
/// Overlaps are resolved by splitting the larger block at the smaller's
/// start, in both discovery orders: a target landing inside an
/// already-decoded block splits that block, and a fresh decode running past
/// an already-known start is truncated there.
pub fn decode_subroutine(
    mem: &dyn GuestMemory,
    entry: u64,
    limits: GraphLimits,
) -> Result<SubroutineGraph, MemFault> {
    let entry = skip_sched(entry);
    let mut blocks: BTreeMap<u64, BasicBlock> = BTreeMap::new();
    let mut worklist = VecDeque::from([entry]);

    while let Some(addr) = worklist.pop_front() {
        if blocks.contains_key(&addr) {
            continue;
        }

        // Target inside an existing block: split it rather than re-decode.
        let straddling = blocks
            .range(..addr)
            .next_back()
            .filter(|(_, b)| b.contains(addr))
            .map(|(start, _)| *start);
        if let Some(start) = straddling {
            let whole = blocks.remove(&start).expect("straddling block present");
            let (head, tail) = split_block(whole, addr);
            blocks.insert(head.start, head);
            blocks.insert(tail.start, tail);
            continue;
        }

        if blocks.len() >= limits.max_blocks {
            // Unexplored target: stays an exit edge resolved at runtime.
            continue;
        }

        let mut block = decode_basic_block(mem, addr, limits.block)?;

        // Fresh decode ran past the start of a known block: truncate so the
        // ranges stay disjoint.
        let overlapped = blocks
            .range((Bound::Excluded(block.start), Bound::Excluded(block.end)))
            .next()
            .map(|(start, _)| *start);
        if let Some(at) = overlapped {
            block = truncate_block(block, at);
        }

        for succ in explored_successors(&block) {
            if !blocks.contains_key(&succ) {
                worklist.push_back(succ);
            }
        }
        blocks.insert(block.start, block);
    }

    Ok(SubroutineGraph { entry, blocks })
}

fn split_index(insts: &[Inst], at: u64) -> usize {
    let idx = insts.partition_point(|i| i.addr < at);
    assert!(
        idx < insts.len() && insts[idx].addr == at,
        "split point {at:#x} does not land on an instruction boundary"
    );
    idx
}

/// Split `block` at `at`, producing a fallthrough head and a tail that
/// inherits the original successors.
fn split_block(block: BasicBlock, at: u64) -> (BasicBlock, BasicBlock) {
    let idx = split_index(&block.insts, at);
    assert!(idx > 0, "split point {at:#x} equals the block start");

    let head = BasicBlock {
        start: block.start,
        end: at,
        insts: block.insts[..idx].to_vec(),
        next: Some(at),
        branch: None,
        end_kind: BlockEndKind::Fallthrough,
    };
    let tail = BasicBlock {
        start: at,
        end: block.end,
        insts: block.insts[idx..].to_vec(),
        next: block.next,
        branch: block.branch,
        end_kind: block.end_kind,
    };
    (head, tail)
}

fn truncate_block(mut block: BasicBlock, at: u64) -> BasicBlock {
    let idx = split_index(&block.insts, at);
    assert!(idx > 0, "truncation point {at:#x} equals the block start");
    block.insts.truncate(idx);
    block.end = at;
    block.next = Some(at);
    block.branch = None;
    block.end_kind = BlockEndKind::Fallthrough;
    block
}

/// Registers read before being written over `insts`, in register order.
/// This is the argument-binding list of the unit compiled from the block.
pub fn live_in_regs(insts: &[Inst]) -> Vec<Gpr> {
    let mut written = [false; 32];
    let mut live: Vec<Gpr> = Vec::new();

    fn read(reg: Gpr, written: &[bool; 32], live: &mut Vec<Gpr>) {
        if !written[reg.index()] && !live.contains(&reg) {
            live.push(reg);
        }
    }

    for inst in insts {
        match inst.op {
            Op::Alu { rd, ra, .. } => {
                read(ra, &written, &mut live);
                written[rd.index()] = true;
            }
            Op::LoadImm { rd, .. } => written[rd.index()] = true,
            Op::CondBranch { ra, .. } => read(ra, &written, &mut live),
            Op::BranchIndirect { ra } => read(ra, &written, &mut live),
            Op::CallIndirect { ra } => {
                read(ra, &written, &mut live);
                written[LINK_REG.index()] = true;
            }
            Op::Call { .. } => written[LINK_REG.index()] = true,
            Op::Return => read(LINK_REG, &written, &mut live),
            Op::Branch { .. } | Op::Halt | Op::Illegal => {}
        }
    }

    live.sort_unstable();
    live
}
