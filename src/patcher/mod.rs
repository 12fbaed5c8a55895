//! # Patcher
//!
//! Blind byte overwrites of live memory.
//!
//! Patches are permanent: nothing here restores the bytes that were replaced.
//! The replaced bytes are still recorded in [`PatchSite`] so they can be logged.

use std::convert::Infallible;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::pattern::format_bytes;

pub mod byte;
pub mod live;
pub mod mem;

pub use byte::BytePatcher;
pub use live::LivePatcher;
pub use mem::{PermissionError, PermissionWrapper};

/// Writes bytes to a location
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that `patch` writes exactly `bytes.len()` bytes at `target` and nothing else
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use [`Infallible`].
    type Error;

    /// Overwrites `bytes.len()` bytes at `target`
    ///
    /// # Safety
    ///
    /// `target` must be valid for reads of `bytes.len()` bytes, and for writes as far as the specific patcher requires
    unsafe fn patch(&self, target: *mut u8, bytes: &[u8]) -> Result<PatchSite, Self::Error>;
}

/// A location that has been overwritten, and what it held before
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSite {
    /// First patched address
    address: usize,
    /// Bytes that were replaced
    original: Vec<u8>,
}
impl PatchSite {
    /// Records a patch at `address` that replaced `original`
    pub(crate) fn new(address: usize, original: Vec<u8>) -> Self {
        Self { address, original }
    }

    /// First patched address
    pub fn address(&self) -> usize {
        self.address
    }

    /// Number of bytes written
    pub fn len(&self) -> usize {
        self.original.len()
    }

    /// Whether the patch wrote nothing
    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    /// Bytes that were replaced
    pub fn original(&self) -> &[u8] {
        &self.original
    }
}

/// Errors from [`write`]
#[derive(Debug, Error)]
pub enum PatchError {
    /// Refused to patch address zero
    #[error("refusing to patch a null address")]
    NullAddress,
    /// Nothing to write
    #[error("empty patch for {address:#x}")]
    Empty {
        /// Target address
        address: usize,
    },
    /// Target range runs past the end of the address space
    #[error("{len} bytes at {address:#x} overflow the address space")]
    Overflow {
        /// Target address
        address: usize,
        /// Patch length
        len: usize,
    },
    /// Part of the target range is not mapped
    #[error("{address:#x} is not mapped")]
    Unmapped {
        /// First unmapped address found
        address: usize,
        /// Underlying query failure
        source: region::Error,
    },
    /// Memory protection could not be relaxed for the write
    #[error("failed to patch {address:#x}: {source}")]
    Protection {
        /// Target address
        address: usize,
        /// Underlying failure
        source: PermissionError<Infallible>,
    },
}
impl PatchError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PatchFailed
    }
}

/// Overwrites `bytes.len()` bytes at `address`, relaxing page protection for the duration of the write.
///
/// No check is made that the replaced bytes held any particular value.
/// The address must be non-null and the first and last target bytes mapped; memory is not touched otherwise.
pub fn write(address: usize, bytes: &[u8]) -> Result<PatchSite, PatchError> {
    if address == 0 {
        return Err(PatchError::NullAddress);
    }
    if bytes.is_empty() {
        return Err(PatchError::Empty { address });
    }
    let last = address
        .checked_add(bytes.len() - 1)
        .ok_or(PatchError::Overflow {
            address,
            len: bytes.len(),
        })?;
    for probe in [address, last] {
        region::query(probe as *const u8).map_err(|source| PatchError::Unmapped {
            address: probe,
            source,
        })?;
    }

    let patcher = PermissionWrapper::new(BytePatcher::new());
    // Safety: the range is mapped, and the wrapper makes it writable
    let site = unsafe { patcher.patch(address as *mut u8, bytes) }
        .map_err(|source| PatchError::Protection { address, source })?;

    tracing::debug!(
        "Patched {:#x}: '{}' -> '{}'",
        address,
        format_bytes(site.original()),
        format_bytes(bytes)
    );
    Ok(site)
}
