//! This module contains a patcher for code other threads may be executing

use std::io;
use std::ptr;

use tracing::{debug, warn};

use crate::freeze::{self, Relocation};

use super::{PatchSite, Patcher};

/// Byte patcher that stops every other thread of the process for the duration of the write.
///
/// A thread stopped on one of `relocations`' sources resumes at the matching copy instead,
/// so it never lands in the middle of what was just written.
#[derive(Debug)]
pub struct LivePatcher<'a> {
    /// Where overwritten instructions can still be found
    relocations: &'a [Relocation],
}
impl<'a> LivePatcher<'a> {
    /// Creates a new [`LivePatcher`]
    pub fn new(relocations: &'a [Relocation]) -> Self {
        Self { relocations }
    }
}
unsafe impl Patcher for LivePatcher<'_> {
    type Error = io::Error;

    unsafe fn patch(&self, target: *mut u8, bytes: &[u8]) -> Result<PatchSite, Self::Error> {
        // allocate before anything is stopped
        let mut original = vec![0u8; bytes.len()];
        ptr::copy(target, original.as_mut_ptr(), bytes.len());

        let ((), frozen) = freeze::frozen(self.relocations, || {
            ptr::copy_nonoverlapping(bytes.as_ptr(), target, bytes.len())
        })?;

        debug!(
            "Patched {:#x} with {} threads stopped, {} moved",
            target as usize, frozen.stopped, frozen.moved
        );
        if frozen.missed > 0 {
            warn!(
                "{} threads kept running while {:#x} was patched",
                frozen.missed, target as usize
            );
        }
        Ok(PatchSite::new(target as usize, original))
    }
}

#[cfg(test)]
mod tests {
    use crate::patcher::live::LivePatcher;
    use crate::patcher::Patcher;

    #[test]
    /// Same observable result as a plain byte patch
    fn test_patch() {
        let mut buf = vec![1u8, 2, 3, 4, 5];
        let ptr = buf.as_mut_ptr();

        let patcher = LivePatcher::new(&[]);
        let site = unsafe { patcher.patch(ptr.add(1), &[9, 9, 9]).unwrap() };

        assert_eq!(buf, [1, 9, 9, 9, 5]);
        assert_eq!(site.original(), [2, 3, 4]);
        assert_eq!(site.address(), buf.as_ptr() as usize + 1);
    }
}
