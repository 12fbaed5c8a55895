//! x86-64 jump encoders and instruction stealing

use iced_x86::{Decoder, DecoderError, DecoderOptions, FlowControl, Instruction};
use thiserror::Error;

/// Length of `jmp rel32`
pub const JMP_REL32_LEN: usize = 5;
/// Length of `jmp [rip + 0]` followed by its 8-byte target
pub const JMP_ABS_LEN: usize = 14;
/// Longest encodable x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;
/// Single-byte `nop`
const NOP: u8 = 0x90;

/// Generates an absolute jump to `target` that clobbers no registers
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    // jmp qword ptr [rip + 0]
    code[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

/// Generates `jmp rel32` from `source` to `target`, if `target` is within reach
pub fn jmp_rel32(source: usize, target: usize) -> Option<[u8; JMP_REL32_LEN]> {
    let next = (source as i64).wrapping_add(JMP_REL32_LEN as i64);
    let displacement = i32::try_from((target as i64).wrapping_sub(next)).ok()?;

    let mut code = [0u8; JMP_REL32_LEN];
    code[0] = 0xE9;
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Some(code)
}

/// The shortest jump from `source` to `target`
pub fn jmp_to(source: usize, target: usize) -> Vec<u8> {
    match jmp_rel32(source, target) {
        Some(code) => code.to_vec(),
        None => jmp_abs(target).to_vec(),
    }
}

/// Pads `code` with `nop`s up to `len` bytes. Longer code is returned unchanged.
pub fn nop_pad(mut code: Vec<u8>, len: usize) -> Vec<u8> {
    if code.len() < len {
        code.resize(len, NOP);
    }
    code
}

/// Errors while stealing instructions to make room for a jump
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StealError {
    /// Ran out of readable bytes before a whole instruction covered the jump
    #[error("only {available} readable bytes, {needed} needed")]
    TooShort {
        /// Bytes the jump needs
        needed: usize,
        /// Bytes of whole instructions available
        available: usize,
    },
    /// Bytes at `address` do not decode to a valid instruction
    #[error("invalid instruction at {address:#x}")]
    Undecodable {
        /// Address of the bad instruction
        address: u64,
    },
    /// Control leaves the block at `address` before the jump is covered.
    /// Whatever follows may be padding or another function's entry point.
    #[error("control flow ends at {address:#x} after {available} of {needed} bytes")]
    Boundary {
        /// Address of the terminating instruction
        address: u64,
        /// Bytes the jump needs
        needed: usize,
        /// Bytes covered including the terminating instruction
        available: usize,
    },
}

/// Whole instructions moved out of the way of a detour jump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StolenCode {
    /// Decoded instructions, with their original addresses
    pub instructions: Vec<Instruction>,
    /// Total encoded length at the original site
    pub len: usize,
}

/// Decodes whole instructions from `code` (located at `ip`) until at least `min_len` bytes are covered
pub fn steal(code: &[u8], ip: u64, min_len: usize) -> Result<StolenCode, StealError> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut len = 0;

    while len < min_len {
        let too_short = StealError::TooShort {
            needed: min_len,
            available: len,
        };
        if !decoder.can_decode() {
            return Err(too_short);
        }

        let address = ip + len as u64;
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => too_short,
                _ => StealError::Undecodable { address },
            });
        }

        len += instruction.len();
        let terminal = matches!(
            instruction.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
        );
        if terminal && len < min_len {
            return Err(StealError::Boundary {
                address,
                needed: min_len,
                available: len,
            });
        }
        instructions.push(instruction);
    }

    Ok(StolenCode { instructions, len })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jmp_abs() {
        let code = jmp_abs(0x1122_3344_5566_7788);
        assert_eq!(
            code,
            [0xFF, 0x25, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    /// Displacements are relative to the end of the jump, in both directions
    fn test_jmp_rel32() {
        assert_eq!(
            jmp_rel32(0x1000, 0x2000),
            Some([0xE9, 0xFB, 0x0F, 0x00, 0x00])
        );
        assert_eq!(
            jmp_rel32(0x2000, 0x1000),
            Some([0xE9, 0xFB, 0xEF, 0xFF, 0xFF])
        );
        assert_eq!(jmp_rel32(0x1000, 0x1_0000_1000), None);
        assert_eq!(jmp_to(0x1000, 0x1_0000_1000).len(), JMP_ABS_LEN);
        assert_eq!(jmp_to(0x1000, 0x2000).len(), JMP_REL32_LEN);
    }

    #[test]
    fn test_nop_pad() {
        assert_eq!(nop_pad(vec![0xE9, 1, 2, 3, 4], 7), [0xE9, 1, 2, 3, 4, 0x90, 0x90]);
        assert_eq!(nop_pad(vec![0xC3], 1), [0xC3]);
    }

    #[test]
    /// Stealing rounds up to a whole instruction
    fn test_steal_whole_instructions() {
        // lea rax, [rdi+1]; lea rcx, [rdi+2]; add rax, rcx; ret
        let code = [
            0x48, 0x8D, 0x47, 0x01, 0x48, 0x8D, 0x4F, 0x02, 0x48, 0x01, 0xC8, 0xC3,
        ];
        let stolen = steal(&code, 0x40_0000, JMP_REL32_LEN).unwrap();
        assert_eq!(stolen.len, 8);
        assert_eq!(stolen.instructions.len(), 2);
        assert_eq!(stolen.instructions[1].ip(), 0x40_0004);

        // the trailing ret may complete the span
        let stolen = steal(&code[4..], 0x40_0004, 8).unwrap();
        assert_eq!(stolen.len, 8);
    }

    #[test]
    /// A return before enough bytes are covered is a boundary
    fn test_steal_boundary() {
        let code = [0x5B, 0xC3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC];
        assert_eq!(
            steal(&code, 0x1000, JMP_REL32_LEN),
            Err(StealError::Boundary {
                address: 0x1001,
                needed: JMP_REL32_LEN,
                available: 2
            })
        );
    }

    #[test]
    fn test_steal_too_short() {
        // mov rax, [rip+disp32] cut off after three bytes
        let code = [0x90, 0x48, 0x8B, 0x05];
        assert_eq!(
            steal(&code, 0x1000, JMP_REL32_LEN),
            Err(StealError::TooShort {
                needed: JMP_REL32_LEN,
                available: 1
            })
        );
    }

    #[test]
    fn test_steal_invalid() {
        // 0x06 (push es) does not exist in 64-bit mode
        let code = [0x06, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90];
        assert_eq!(
            steal(&code, 0x1000, JMP_REL32_LEN),
            Err(StealError::Undecodable { address: 0x1000 })
        );
    }
}
