//! Mid-hook trampoline assembly
//!
//! The trampoline runs in place of the stolen instructions:
//!
//! 1. steps over the System V red zone, then pushes rflags and every general-purpose register
//! 2. stores xmm0..xmm15 below them, completing a [`Context`](crate::hook::Context) block
//! 3. aligns the stack and calls `dispatch(context, callback)` using the `sysv64` convention
//! 4. restores everything (including any changes the callback made)
//! 5. runs the relocated stolen instructions and jumps back behind them

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError, Instruction};

use crate::freeze::Relocation;
use crate::hook::context::CONTEXT_SIZE;

/// Bytes below rsp a leaf function may use without adjusting rsp
const RED_ZONE: i32 = 0x80;
/// Bytes used by the saved vector registers
const XMM_AREA: i32 = 16 * 16;
/// Distance between the value `push rsp` stores and rsp at the hook site.
/// Red zone, rflags and four registers (rax, rcx, rdx, rbx) are pushed first.
const RSP_FIXUP: i32 = RED_ZONE + 8 + 4 * 8;

// rflags, sixteen pushed registers and the vector area make up exactly one context block
const _: () = assert!((8 + 16 * 8 + XMM_AREA) as usize == CONTEXT_SIZE);

/// Assembled trampoline
#[derive(Debug, Clone)]
pub struct Stub {
    /// Machine code, to be placed at the address it was assembled for
    pub code: Vec<u8>,
    /// Where every displaced instruction but the first ended up.
    /// A thread stopped on the first one takes the hook once it resumes, so it stays put.
    pub relocations: Vec<Relocation>,
}

/// Builds the trampoline for a hook whose trampoline lives at `base`.
///
/// - `dispatch`: address of an `extern "sysv64" fn(*mut Context, *const T)`
/// - `callback`: second argument to `dispatch`
/// - `stolen`: instructions displaced by the detour jump, decoded at their original addresses
/// - `resume`: address right after the displaced instructions
pub fn assemble(
    base: usize,
    dispatch: usize,
    callback: usize,
    stolen: &[Instruction],
    resume: usize,
) -> Result<Stub, IcedError> {
    let xmm = [
        xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
        xmm14, xmm15,
    ];
    let mut a = CodeAssembler::new(64)?;

    a.lea(rsp, ptr(rsp - RED_ZONE))?;
    a.pushfq()?;
    for register in [rax, rcx, rdx, rbx] {
        a.push(register)?;
    }
    a.push(rsp)?;
    a.add(qword_ptr(rsp + 0), RSP_FIXUP)?;
    for register in [rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15] {
        a.push(register)?;
    }
    a.sub(rsp, XMM_AREA)?;
    for (i, register) in xmm.iter().enumerate() {
        a.movdqu(xmmword_ptr(rsp + (i as i32) * 16), *register)?;
    }

    // rbx is callee-saved and holds the context pointer across the call
    a.mov(rbx, rsp)?;
    a.and(rsp, -16)?;
    a.mov(rdi, rbx)?;
    a.mov(rsi, callback as u64)?;
    a.mov(rax, dispatch as u64)?;
    a.call(rax)?;
    a.mov(rsp, rbx)?;

    for (i, register) in xmm.iter().enumerate() {
        a.movdqu(*register, xmmword_ptr(rsp + (i as i32) * 16))?;
    }
    a.add(rsp, XMM_AREA)?;
    for register in [r15, r14, r13, r12, r11, r10, r9, r8, rdi, rsi, rbp] {
        a.pop(register)?;
    }
    // skip the saved rsp
    a.lea(rsp, ptr(rsp + 8))?;
    for register in [rbx, rdx, rcx, rax] {
        a.pop(register)?;
    }
    a.popfq()?;
    a.lea(rsp, ptr(rsp + RED_ZONE))?;

    // an empty marker carries each label so the moved instruction keeps its own ip
    let mut marks = Vec::with_capacity(stolen.len());
    for instruction in stolen {
        let mut mark = a.create_label();
        a.set_label(&mut mark)?;
        a.zero_bytes()?;
        a.add_instruction(*instruction)?;
        marks.push((instruction.ip() as usize, mark));
    }

    let mut resume_slot = a.create_label();
    a.jmp(qword_ptr(resume_slot))?;
    a.set_label(&mut resume_slot)?;
    a.dq(&[resume as u64])?;

    let result =
        a.assemble_options(base as u64, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
    let relocations = marks
        .iter()
        .skip(1)
        .map(|(from, mark)| {
            Ok(Relocation {
                from: *from,
                to: result.label_ip(mark)? as usize,
            })
        })
        .collect::<Result<_, IcedError>>()?;

    Ok(Stub {
        code: result.inner.code_buffer,
        relocations,
    })
}
