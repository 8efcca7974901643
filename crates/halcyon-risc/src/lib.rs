//! Guest ISA boundary for the Halcyon CPU core.
//!
//! The guest is a fixed-width 32-bit big-endian RISC stream. This crate only
//! classifies words far enough for the translation engine: control flow,
//! register operands, and the scheduling-metadata stride. Full per-opcode
//! semantics belong to the code generator behind the [`crate`] boundary and
//! are deliberately not modeled here.

mod isa;
pub mod mem;

pub use isa::{
    asm, decode, is_sched_slot, Gpr, Inst, Op, LINK_REG, SCHED_STRIDE_WORDS, WORD_BYTES,
};
pub use mem::{FlatMemory, GuestMemory, MemFault};
