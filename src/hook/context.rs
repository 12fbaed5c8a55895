//! Register snapshot handed to mid-hook callbacks
//!
//! The layout of [`Context`] is the exact block the trampoline pushes onto the stack,
//! so any change here must be mirrored in [`crate::code::stub`].

use std::mem;

/// General-purpose registers a callback may read and write.
///
/// `rsp` is deliberately absent; see [`Context::rsp`].
#[allow(clippy::missing_docs_in_private_items, missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// Vector registers a callback may read and write
#[allow(clippy::missing_docs_in_private_items, missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Xmm {
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

/// A saved 128-bit vector register.
///
/// Stored as bytes because the trampoline only guarantees 8-byte alignment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmmRegister {
    /// Little-endian register contents
    bytes: [u8; 16],
}
impl XmmRegister {
    /// Whole register as an integer
    pub fn u128(&self) -> u128 {
        u128::from_le_bytes(self.bytes)
    }

    /// Overwrites the whole register
    pub fn set_u128(&mut self, value: u128) {
        self.bytes = value.to_le_bytes();
    }

    /// Single-precision lane `lane` (0..4); lane 0 is what scalar `ss` instructions use
    ///
    /// # Panics
    ///
    /// Panics if `lane` is 4 or more
    pub fn f32(&self, lane: usize) -> f32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[lane * 4..lane * 4 + 4]);
        f32::from_le_bytes(raw)
    }

    /// Overwrites single-precision lane `lane` (0..4), leaving the others untouched
    ///
    /// # Panics
    ///
    /// Panics if `lane` is 4 or more
    pub fn set_f32(&mut self, lane: usize, value: f32) {
        self.bytes[lane * 4..lane * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Double-precision lane `lane` (0..2)
    ///
    /// # Panics
    ///
    /// Panics if `lane` is 2 or more
    pub fn f64(&self, lane: usize) -> f64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[lane * 8..lane * 8 + 8]);
        f64::from_le_bytes(raw)
    }

    /// Overwrites double-precision lane `lane` (0..2)
    ///
    /// # Panics
    ///
    /// Panics if `lane` is 2 or more
    pub fn set_f64(&mut self, lane: usize, value: f64) {
        self.bytes[lane * 8..lane * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }
}

/// CPU state at the hooked instruction.
///
/// Writes made through this handle are what the original instruction stream sees when it resumes.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// xmm0..xmm15, lowest address first
    xmm: [XmmRegister; 16],
    /// r15
    r15: u64,
    /// r14
    r14: u64,
    /// r13
    r13: u64,
    /// r12
    r12: u64,
    /// r11
    r11: u64,
    /// r10
    r10: u64,
    /// r9
    r9: u64,
    /// r8
    r8: u64,
    /// rdi
    rdi: u64,
    /// rsi
    rsi: u64,
    /// rbp
    rbp: u64,
    /// Stack pointer at the hook site. Not restored from this slot.
    rsp: u64,
    /// rbx
    rbx: u64,
    /// rdx
    rdx: u64,
    /// rcx
    rcx: u64,
    /// rax
    rax: u64,
    /// Flags register
    rflags: u64,
}

/// Size of the saved register block
pub const CONTEXT_SIZE: usize = 16 * 16 + 17 * 8;
const _: () = assert!(mem::size_of::<Context>() == CONTEXT_SIZE);
const _: () = assert!(mem::align_of::<Context>() <= 8);

impl Context {
    /// Reads a general-purpose register
    pub fn gpr(&self, register: Gpr) -> u64 {
        match register {
            Gpr::Rax => self.rax,
            Gpr::Rcx => self.rcx,
            Gpr::Rdx => self.rdx,
            Gpr::Rbx => self.rbx,
            Gpr::Rbp => self.rbp,
            Gpr::Rsi => self.rsi,
            Gpr::Rdi => self.rdi,
            Gpr::R8 => self.r8,
            Gpr::R9 => self.r9,
            Gpr::R10 => self.r10,
            Gpr::R11 => self.r11,
            Gpr::R12 => self.r12,
            Gpr::R13 => self.r13,
            Gpr::R14 => self.r14,
            Gpr::R15 => self.r15,
        }
    }

    /// Writes a general-purpose register
    pub fn set_gpr(&mut self, register: Gpr, value: u64) {
        *self.gpr_mut(register) = value;
    }

    /// Mutable slot for a general-purpose register
    fn gpr_mut(&mut self, register: Gpr) -> &mut u64 {
        match register {
            Gpr::Rax => &mut self.rax,
            Gpr::Rcx => &mut self.rcx,
            Gpr::Rdx => &mut self.rdx,
            Gpr::Rbx => &mut self.rbx,
            Gpr::Rbp => &mut self.rbp,
            Gpr::Rsi => &mut self.rsi,
            Gpr::Rdi => &mut self.rdi,
            Gpr::R8 => &mut self.r8,
            Gpr::R9 => &mut self.r9,
            Gpr::R10 => &mut self.r10,
            Gpr::R11 => &mut self.r11,
            Gpr::R12 => &mut self.r12,
            Gpr::R13 => &mut self.r13,
            Gpr::R14 => &mut self.r14,
            Gpr::R15 => &mut self.r15,
        }
    }

    /// Stack pointer as it was at the hooked instruction.
    ///
    /// Read-only: moving the stack from inside a detour cannot be made safe.
    pub fn rsp(&self) -> u64 {
        self.rsp
    }

    /// Flags register
    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    /// Overwrites the flags register
    pub fn set_rflags(&mut self, value: u64) {
        self.rflags = value;
    }

    /// A vector register
    pub fn xmm(&self, register: Xmm) -> &XmmRegister {
        &self.xmm[register as usize]
    }

    /// A vector register, for writing
    pub fn xmm_mut(&mut self, register: Xmm) -> &mut XmmRegister {
        &mut self.xmm[register as usize]
    }
}
