//! # Jump Hook
//!
//! This hook type uses a basic `jmp` instruction to redirect execution

use crate::code::x64::{jmp_to, nop_pad};
use crate::patcher::{PatchSite, Patcher};

use super::Hook;

/// Simple jmp hook. Uses `jmp rel32` when the destination is in reach, an absolute jump otherwise
#[derive(Debug)]
pub struct JmpHook<P> {
    /// Underlying patcher to be used to hook
    patcher: P,
}
impl<P: Patcher> JmpHook<P> {
    /// Creates a new jmp hook
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}
unsafe impl<P: Patcher> Hook for JmpHook<P> {
    type Error = P::Error;

    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
        len: usize,
    ) -> Result<PatchSite, Self::Error> {
        // pad out to whole instructions so nothing half-overwritten is left behind
        let code = nop_pad(jmp_to(source as usize, destination as usize), len);
        self.patcher.patch(source as _, &code)
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    use super::*;
    use crate::code::x64::JMP_REL32_LEN;
    use crate::patcher::BytePatcher;

    #[test]
    /// The jump lands on the destination and the remainder is nops
    fn test_hook_pads() {
        let mut buf = vec![0xCCu8; 32];
        let source = buf.as_mut_ptr();
        let destination = unsafe { source.add(24) };

        let hook = JmpHook::new(BytePatcher::new());
        let site = unsafe { hook.hook(source, destination, 8).unwrap() };
        assert_eq!(site.len(), 8);
        assert_eq!(site.original(), [0xCC; 8]);

        let decoded: Vec<_> =
            Decoder::with_ip(64, &buf[..8], source as u64, DecoderOptions::NONE)
                .into_iter()
                .collect();
        assert_eq!(decoded[0].mnemonic(), Mnemonic::Jmp);
        assert_eq!(decoded[0].len(), JMP_REL32_LEN);
        assert_eq!(decoded[0].near_branch_target(), destination as u64);
        assert!(decoded[1..].iter().all(|i| i.mnemonic() == Mnemonic::Nop));
        assert_eq!(buf[8], 0xCC);
    }
}
