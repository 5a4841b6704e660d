// src/buffers.rs
//
// Page-aligned transfer and check buffers
//
// Buffers are acquired when a phase starts and released when the owning
// value drops, on error paths included. They are never shared between ranks.

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::constants::BUFFER_ALIGNMENT;
use crate::error::BenchError;

/// Heap buffer aligned to `BUFFER_ALIGNMENT`, zeroed on allocation
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer uniquely owns its allocation.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(len: usize) -> Result<Self, BenchError> {
        let layout = Layout::from_size_align(len.max(1), BUFFER_ALIGNMENT)
            .map_err(|_| BenchError::Alloc { bytes: len })?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or(BenchError::Alloc { bytes: len })?;
        Ok(Self { ptr, len, layout })
    }

    /// Allocate and fill with a constant byte
    pub fn filled(len: usize, byte: u8) -> Result<Self, BenchError> {
        let mut buf = Self::new(len)?;
        buf.fill(byte);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len).finish()
    }
}

/// Identifies whose data a pattern encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternSeed {
    /// Task (or item owner) the data belongs to
    pub owner: u64,
    /// Run-wide signature broadcast by rank 0
    pub signature: u32,
}

impl PatternSeed {
    fn word(&self, word_index: u64) -> u64 {
        ((self.owner << 32) | u64::from(self.signature)) ^ word_index
    }
}

/// Fill `buf` with the pattern for file offset `offset`.
///
/// Each 8-byte word encodes owner, signature and its own word index, so a
/// misplaced or stale block is detected as well as corrupted bytes.
pub fn fill_pattern(buf: &mut [u8], seed: PatternSeed, offset: u64) {
    for (i, byte) in buf.iter_mut().enumerate() {
        let abs = offset + i as u64;
        *byte = seed.word(abs / 8).to_le_bytes()[(abs % 8) as usize];
    }
}

/// Count bytes of `buf` that differ from the pattern at `offset`.
pub fn count_mismatches(buf: &[u8], seed: PatternSeed, offset: u64) -> u64 {
    buf.iter()
        .enumerate()
        .filter(|(i, byte)| {
            let abs = offset + *i as u64;
            **byte != seed.word(abs / 8).to_le_bytes()[(abs % 8) as usize]
        })
        .count() as u64
}
