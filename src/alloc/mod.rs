//! # Alloc
//!
//! Executable memory for hook trampolines, allocated close enough to the hooked code for a 5-byte relative `jmp`
//!
//! Derived from the allocator in detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;

pub mod proximity;
pub mod search;

pub use proximity::{Allocation, ProximityError};

/// The furthest distance between a hook site and its trampoline (2 GiB, the reach of a rel32 branch).
pub const DETOUR_RANGE: usize = 0x8000_0000;

lazy_static! {
    static ref POOL: Mutex<proximity::ProximityAllocator> =
        Mutex::new(proximity::ProximityAllocator::new(DETOUR_RANGE));
}

/// Allocates `size` bytes of executable memory within [`DETOUR_RANGE`] of `origin`.
///
/// Note: the contents of the returned buffer are unspecified.
/// Dropping the allocation returns it to its pool; trampolines that stay installed must be leaked instead.
pub fn allocate_executable(origin: usize, size: usize) -> Result<Allocation, ProximityError> {
    POOL.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .allocate(origin, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Allocations land within branch range and are executable
    fn test_allocate_near() {
        let code = region::alloc(64, region::Protection::READ_EXECUTE).unwrap();
        let origin = code.as_ptr::<u8>() as usize;

        let first = allocate_executable(origin, 256).unwrap();
        let second = allocate_executable(origin, 256).unwrap();

        for allocation in [&first, &second] {
            let address = allocation.as_ptr() as usize;
            assert!(address.abs_diff(origin) < DETOUR_RANGE);
            assert!(allocation.len() >= 256);
            let protection = region::query(allocation.as_ptr()).unwrap().protection();
            assert!(protection.contains(region::Protection::READ_WRITE_EXECUTE));
        }
        assert_ne!(first.as_ptr(), second.as_ptr());
    }
}
