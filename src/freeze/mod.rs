//! # Freeze
//!
//! Stops every other thread of the process while live code is rewritten.
//! Threads stopped inside instructions that were moved elsewhere are resumed at the new copy,
//! so nothing ever executes half of an old instruction sequence.
//!
//! The callback runs while other threads may hold any lock in the process (the allocator's included).
//! It must not allocate, log, or block.

use std::io;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod win;

#[cfg(target_os = "linux")]
use self::linux as sys;
#[cfg(windows)]
use self::win as sys;

/// An instruction that was copied to another address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Where the instruction used to start
    pub from: usize,
    /// Where its copy starts
    pub to: usize,
}

/// Where a thread stopped at `ip` has to continue
pub(crate) fn relocate(ip: usize, relocations: &[Relocation]) -> Option<usize> {
    relocations
        .iter()
        .find(|relocation| relocation.from == ip)
        .map(|relocation| relocation.to)
}

/// What happened to the other threads during a freeze
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frozen {
    /// Threads that were stopped
    pub stopped: usize,
    /// Threads that didn't stop in time and kept running
    pub missed: usize,
    /// Stopped threads that were moved to a relocated instruction
    pub moved: usize,
}

/// Runs `f` with every other thread stopped, then moves stopped threads according to `relocations` and resumes them.
///
/// # Safety
///
/// - `f` must not allocate, log, or take locks another thread could be holding
/// - every relocation target must be valid code equivalent to its source
#[cfg(any(target_os = "linux", windows))]
pub unsafe fn frozen<R>(
    relocations: &[Relocation],
    f: impl FnOnce() -> R,
) -> io::Result<(R, Frozen)> {
    sys::frozen(relocations, f)
}

/// Threads can't be stopped on this platform; `f` simply runs
///
/// # Safety
///
/// See the supported platforms' version.
#[cfg(not(any(target_os = "linux", windows)))]
pub unsafe fn frozen<R>(
    _relocations: &[Relocation],
    f: impl FnOnce() -> R,
) -> io::Result<(R, Frozen)> {
    Ok((f(), Frozen::default()))
}
