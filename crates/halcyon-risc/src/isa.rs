use core::fmt;

/// Guest instruction words are 4 bytes, big-endian, word-aligned.
pub const WORD_BYTES: u64 = 4;

/// The guest instruction stream embeds one scheduler-metadata word per
/// `SCHED_STRIDE_WORDS` words: every word whose stream index is
/// `SCHED_STRIDE_WORDS - 1` modulo the stride is metadata, never an
/// instruction. Decoders must advance the byte cursor past such words
/// without consuming them as instructions.
pub const SCHED_STRIDE_WORDS: u64 = 16;

/// General register index for the link register (written by calls, read by
/// returns).
pub const LINK_REG: Gpr = Gpr(31);

const _: () = {
    assert!(SCHED_STRIDE_WORDS > 1);
    assert!(WORD_BYTES == 4);
    assert!(LINK_REG.0 < 32);
};

/// Returns true if `addr` falls on a scheduling-metadata slot of the stream.
#[inline]
pub fn is_sched_slot(addr: u64) -> bool {
    (addr / WORD_BYTES) % SCHED_STRIDE_WORDS == SCHED_STRIDE_WORDS - 1
}

/// One of the 32 guest general registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gpr(pub u8);

impl Gpr {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Decoded classification of one guest word.
///
/// `Alu`/`LoadImm` carry enough operand detail for the reference code
/// generator; everything the engine itself needs is the control-flow shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `rd = ra + imm` (sign-extended 16-bit immediate).
    Alu { rd: Gpr, ra: Gpr, imm: i16 },
    /// `rd = imm` (zero-extended 16-bit immediate).
    LoadImm { rd: Gpr, imm: u16 },
    /// Unconditional branch to an absolute word address.
    Branch { target: u64 },
    /// Branch to `target` if `ra != 0`, otherwise fall through.
    CondBranch { ra: Gpr, target: u64 },
    /// Direct call: link register is set to the address of the following
    /// instruction word.
    Call { target: u64 },
    /// Indirect branch through a register.
    BranchIndirect { ra: Gpr },
    /// Indirect call through a register; sets the link register.
    CallIndirect { ra: Gpr },
    /// Branch to the link register.
    Return,
    /// Guest program halt.
    Halt,
    /// Unrecognized encoding. Non-fatal: treated as a no-op placeholder by
    /// downstream consumers.
    Illegal,
}

/// One decoded guest instruction: address, raw word, classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inst {
    pub addr: u64,
    pub raw: u32,
    pub op: Op,
}

impl Inst {
    /// Address of the instruction word following this one (not accounting
    /// for scheduling-metadata slots; callers that need the next decodable
    /// address must skip those separately).
    #[inline]
    pub fn end(&self) -> u64 {
        self.addr + WORD_BYTES
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self.op,
            Op::Alu { .. } | Op::LoadImm { .. } | Op::Illegal
        )
    }
}

// Encoding: opcode in bits 31..26.
//
//   01 ADDI  rd[25:21] ra[20:16] imm16
//   02 LI    rd[25:21] -         imm16
//   03 B     target26 (absolute word index)
//   04 BNEZ  ra[25:21] target16 (absolute word index)
//   05 CALL  target26 (absolute word index)
//   06 JR    ra[25:21]
//   07 JALR  ra[25:21]
//   08 RET
//   09 HALT
//
// Anything else (including the all-zero word) is an illegal encoding.
const OP_ADDI: u32 = 0x01;
const OP_LI: u32 = 0x02;
const OP_B: u32 = 0x03;
const OP_BNEZ: u32 = 0x04;
const OP_CALL: u32 = 0x05;
const OP_JR: u32 = 0x06;
const OP_JALR: u32 = 0x07;
const OP_RET: u32 = 0x08;
const OP_HALT: u32 = 0x09;

#[inline]
fn rd_field(raw: u32) -> Gpr {
    Gpr(((raw >> 21) & 0x1f) as u8)
}

#[inline]
fn ra_field(raw: u32) -> Gpr {
    Gpr(((raw >> 16) & 0x1f) as u8)
}

#[inline]
fn target26(raw: u32) -> u64 {
    u64::from(raw & 0x03ff_ffff) * WORD_BYTES
}

#[inline]
fn target16(raw: u32) -> u64 {
    u64::from(raw & 0xffff) * WORD_BYTES
}

/// Classify one guest word. Never fails: unknown encodings decode to
/// [`Op::Illegal`] so that data interleaved with code does not abort block
/// discovery.
pub fn decode(raw: u32, addr: u64) -> Inst {
    let op = match raw >> 26 {
        OP_ADDI => Op::Alu {
            rd: rd_field(raw),
            ra: ra_field(raw),
            imm: (raw & 0xffff) as u16 as i16,
        },
        OP_LI => Op::LoadImm {
            rd: rd_field(raw),
            imm: (raw & 0xffff) as u16,
        },
        OP_B => Op::Branch {
            target: target26(raw),
        },
        OP_BNEZ => Op::CondBranch {
            ra: rd_field(raw),
            target: target16(raw),
        },
        OP_CALL => Op::Call {
            target: target26(raw),
        },
        OP_JR => Op::BranchIndirect { ra: rd_field(raw) },
        OP_JALR => Op::CallIndirect { ra: rd_field(raw) },
        OP_RET => Op::Return,
        OP_HALT => Op::Halt,
        _ => Op::Illegal,
    };
    Inst { addr, raw, op }
}

/// Encoding helpers, primarily for tests and tooling that assemble small
/// guest programs.
pub mod asm {
    use super::*;

    pub fn addi(rd: Gpr, ra: Gpr, imm: i16) -> u32 {
        (OP_ADDI << 26)
            | (u32::from(rd.0) << 21)
            | (u32::from(ra.0) << 16)
            | u32::from(imm as u16)
    }

    pub fn li(rd: Gpr, imm: u16) -> u32 {
        (OP_LI << 26) | (u32::from(rd.0) << 21) | u32::from(imm)
    }

    pub fn b(target: u64) -> u32 {
        assert_eq!(target % WORD_BYTES, 0, "branch target must be word-aligned");
        (OP_B << 26) | ((target / WORD_BYTES) as u32 & 0x03ff_ffff)
    }

    pub fn bnez(ra: Gpr, target: u64) -> u32 {
        assert_eq!(target % WORD_BYTES, 0, "branch target must be word-aligned");
        (OP_BNEZ << 26) | (u32::from(ra.0) << 21) | ((target / WORD_BYTES) as u32 & 0xffff)
    }

    pub fn call(target: u64) -> u32 {
        assert_eq!(target % WORD_BYTES, 0, "call target must be word-aligned");
        (OP_CALL << 26) | ((target / WORD_BYTES) as u32 & 0x03ff_ffff)
    }

    pub fn jr(ra: Gpr) -> u32 {
        (OP_JR << 26) | (u32::from(ra.0) << 21)
    }

    pub fn jalr(ra: Gpr) -> u32 {
        (OP_JALR << 26) | (u32::from(ra.0) << 21)
    }

    pub fn ret() -> u32 {
        OP_RET << 26
    }

    pub fn halt() -> u32 {
        OP_HALT << 26
    }
}
