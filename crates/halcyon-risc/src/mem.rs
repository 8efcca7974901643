//! Guest memory collaborator boundary.
//!
//! The translation engine reads instruction words and nothing else; paging,
//! permissions and physical backing live behind this trait. [`FlatMemory`]
//! is the flat test backing used throughout the engine's own tests.

use thiserror::Error;

use crate::isa::WORD_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest instruction fetch out of range at {addr:#x}")]
pub struct MemFault {
    pub addr: u64,
}

/// Read access to the guest instruction stream.
///
/// Implementations must be shareable across guest threads and the background
/// compiler; interior mutability (if any) is the collaborator's business.
pub trait GuestMemory: Send + Sync {
    /// Read one big-endian instruction word at a word-aligned address.
    fn read_word(&self, addr: u64) -> Result<u32, MemFault>;
}

/// Flat, fixed-size guest memory for tests and tools.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Store one big-endian word; used by tests to assemble guest programs.
    pub fn write_word(&mut self, addr: u64, word: u32) {
        assert_eq!(addr % WORD_BYTES, 0, "unaligned word store at {addr:#x}");
        let addr = addr as usize;
        assert!(
            addr + WORD_BYTES as usize <= self.bytes.len(),
            "word store out of range at {addr:#x}"
        );
        self.bytes[addr..addr + 4].copy_from_slice(&word.to_be_bytes());
    }

    /// Lay out `words` contiguously starting at `base`.
    pub fn write_words(&mut self, base: u64, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.write_word(base + i as u64 * WORD_BYTES, *word);
        }
    }
}

impl GuestMemory for FlatMemory {
    fn read_word(&self, addr: u64) -> Result<u32, MemFault> {
        if addr % WORD_BYTES != 0 {
            return Err(MemFault { addr });
        }
        let start = addr as usize;
        let end = start.checked_add(WORD_BYTES as usize).ok_or(MemFault { addr })?;
        if end > self.bytes.len() {
            return Err(MemFault { addr });
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.bytes[start..end]);
        Ok(u32::from_be_bytes(b))
    }
}
