//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another.
//! [`install`] is the entry point: it places a mid hook that hands the interrupted register state to a callback.

pub mod context;
pub mod jmphook;
pub mod mid;

pub use context::{Context, Gpr, Xmm, XmmRegister};
pub use mid::{install, install_boxed, Callback, HookError, HookHandle};

use crate::patcher::PatchSite;

/// Trait for hooks
///
/// # Safety
///
/// Hooks are inherently unsafe; implementors must overwrite exactly `len` bytes at the source
pub unsafe trait Hook {
    /// Errors that could happen during a hook
    type Error;

    /// Creates a hook which redirects `source` to `destination`, overwriting `len` bytes at `source`.
    ///
    /// # Safety
    ///
    /// - Both `source` and `destination` must be valid pointers
    /// - `destination` must be valid executable code
    /// - `len` bytes at `source` must be whole instructions that nothing jumps into
    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
        len: usize,
    ) -> Result<PatchSite, Self::Error>;
}
