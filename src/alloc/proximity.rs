//! Pools of executable memory placed within branch range of the code they serve
//!
//! Derived from the proximity allocator in detour-rs: https://github.com/darfink/detour-rs

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

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;
use tracing::debug;

use super::search;

/// A chunk of read-, write- & executable memory handed out by a pool
pub type Allocation = SliceBox<u8>;

/// Errors that occur while creating proximity allocations
#[derive(Debug, Error)]
pub enum ProximityError {
    /// No free memory within `max_distance` of the origin
    #[error("no free memory within branch range of {origin:#x}")]
    OutOfMemory {
        /// Address the allocation had to be close to
        origin: usize,
    },
    /// Mapping a new pool failed for a reason other than lack of space
    #[error("failed to map executable pool: {0}")]
    Map(mmap::MapError),
    /// Querying the address space failed
    #[error("failed to query memory region: {0}")]
    Region(#[from] region::Error),
}

/// Every pool mapped so far; pools are never unmapped
pub struct ProximityAllocator {
    /// Max distance between an origin and any byte of its allocation
    max_distance: usize,
    /// Mapped pools
    pools: Vec<SlicePool<u8>>,
}

impl ProximityAllocator {
    /// Creates an allocator that keeps allocations within `max_distance` of their origin
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Allocates `size` bytes close to `origin`, mapping a new pool if none of the existing ones fit
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, ProximityError> {
        let range =
            origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance);

        if let Some(allocation) = self.allocate_existing(&range, size) {
            return Ok(allocation);
        }

        let pool = self.map_pool(&range, origin, size)?;
        let allocation = pool
            .alloc(size)
            .ok_or(ProximityError::OutOfMemory { origin })?;
        self.pools.push(pool);
        Ok(allocation)
    }

    /// Tries every pool lying entirely within `range`
    fn allocate_existing(&mut self, range: &Range<usize>, size: usize) -> Option<Allocation> {
        let in_range = |pool: &SlicePool<u8>| {
            let lower = pool.as_ptr() as usize;
            let upper = lower + pool.len();
            range.contains(&lower) && range.contains(&(upper - 1))
        };

        self.pools
            .iter_mut()
            .filter(|pool| in_range(pool))
            .find_map(|pool| pool.alloc(size))
    }

    /// Maps a fresh pool at the nearest free page to `origin`
    fn map_pool(
        &self,
        range: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        let page = region::page::size();
        let pool_size = size.div_ceil(page) * page;

        // above first: some platforms refuse mappings below the image
        search::after(origin, range.clone())
            .chain(search::before(origin, range.clone()))
            .filter(|candidate| match candidate {
                // the whole pool must stay in range, not just its first page
                Ok(address) => range.contains(&(*address as usize + pool_size - 1)),
                Err(_) => true,
            })
            .find_map(|candidate| match candidate {
                Ok(address) => Self::map_fixed(address, pool_size).ok().map(Ok),
                Err(error) => Some(Err(ProximityError::Region(error))),
            })
            .unwrap_or(Err(ProximityError::OutOfMemory { origin }))
    }

    /// Maps `size` bytes of RWX memory exactly at `address`
    fn map_fixed(address: *const (), size: usize) -> Result<SlicePool<u8>, ProximityError> {
        let map = mmap::MemoryMap::new(
            size,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const _),
            ],
        )
        .map_err(ProximityError::Map)?;
        debug!("Mapped trampoline pool @ {:#x} ({:#x} bytes)", map.data() as usize, map.len());
        Ok(SlicePool::new(PoolMemory(map)))
    }
}

/// Adapts a memory map to the storage interface `SlicePool` expects
struct PoolMemory(mmap::MemoryMap);

impl AsRef<[u8]> for PoolMemory {
    fn as_ref(&self) -> &[u8] {
        // Safety: the map is valid for `len` bytes for as long as it lives
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for PoolMemory {
    fn as_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and we hold the only handle to the map
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// Safety: the map is plain memory; SlicePool serialises access to its chunks
unsafe impl Send for PoolMemory {}
unsafe impl Sync for PoolMemory {}
