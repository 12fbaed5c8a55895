//! This module contains a patcher which adjusts memory permissions to patch read-only data

use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use region::Protection;
use thiserror::Error;

use super::{PatchSite, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when querying or setting memory protections
    #[error("error setting memory protections")]
    Protection(#[from] region::Error),
    /// Error from the underlying patcher
    #[error("{0}")]
    Inner(E),
}

lazy_static! {
    /// Serialises protection changes; two patches on one page would otherwise restore each other's protection mid-write
    static ref PROTECTION_LOCK: Mutex<()> = Mutex::new(());
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It adds write access to every page the patch touches, triggers the patch, and then reverts the permissions.
///
/// Existing access is kept, so code pages stay executable while they are being patched.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// Casting a `&T` to a `*mut u8` for use with `PermissionWrapper` can result in undefined behavior because rust assumes `&T` will never change.
/// The `*mut u8` **MUST** be memory not tracked by Rust, or read only through volatile reads afterwards.
#[derive(Debug)]
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

unsafe impl<P: Patcher> Patcher for PermissionWrapper<P> {
    type Error = PermissionError<P::Error>;

    unsafe fn patch(&self, target: *mut u8, bytes: &[u8]) -> Result<PatchSite, Self::Error> {
        let _lock = PROTECTION_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let mut protection = Protection::WRITE;
        for region in region::query_range(target as *const u8, bytes.len())? {
            protection |= region?.protection();
        }

        // the handle restores the previous protection when dropped
        let _handle = region::protect_with_handle(target as *const u8, bytes.len(), protection)?;
        self.patcher
            .patch(target, bytes)
            .map_err(PermissionError::Inner)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use region::Protection;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::mem::PermissionWrapper;
    use crate::patcher::Patcher;

    #[test]
    /// Tests to ensure permissions are actually set
    fn test_perms() {
        // Global immutables are stored in a read-only section in the binary.
        // Normally, writing to this global would result in a segfault, but PermissionWrapper changes the permissions to be writable so that no fault occurs
        static DATA: [u8; 4] = *b"wxyz";

        let ptr = DATA.as_ptr();
        let size = DATA.len();
        let read = || -> Vec<u8> {
            (0..size)
                .map(|i| unsafe { ptr::read_volatile(ptr.add(i)) })
                .collect()
        };

        // make sure the data is what we expect and that the data is definitely read-only
        assert_eq!(read(), *b"wxyz");
        for region in region::query_range(ptr, size).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert!(!region.protection().contains(Protection::WRITE));
        }

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        let site = unsafe { wrapper.patch(ptr as *mut u8, &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(read(), [4, 3, 2, 1]);
        assert_eq!(site.original(), *b"wxyz");

        // make sure permissions reverted correctly after the patch
        for region in region::query_range(ptr, size).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert!(!region.protection().contains(Protection::WRITE));
        }
    }
}
