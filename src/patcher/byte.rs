//! This module contains a byte patcher

use std::convert::Infallible;
use std::ptr;

use super::{PatchSite, Patcher};

/// Patcher for overwriting memory locations with byte arrays.
/// This patcher never fails.
#[derive(Debug, Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = Infallible;

    unsafe fn patch(&self, target: *mut u8, bytes: &[u8]) -> Result<PatchSite, Self::Error> {
        let mut original = vec![0u8; bytes.len()];

        // Safety: caller must pass in a `target` pointer that is valid for the full length of the patch
        ptr::copy(target, original.as_mut_ptr(), bytes.len());

        // Safety: caller must ensure that `target` is writable
        ptr::copy(bytes.as_ptr(), target, bytes.len());

        Ok(PatchSite::new(target as usize, original))
    }
}
