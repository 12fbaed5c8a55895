//! Walks the address space outward from an origin looking for unmapped pages
//!
//! Derived from the free-region search in detour-rs: https://github.com/darfink/detour-rs

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

/// Unmapped page addresses above `origin`, nearest first
pub fn after(
    origin: usize,
    range: Range<usize>,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegionIter::new(origin, range, Direction::Up)
}

/// Unmapped page addresses below `origin`, nearest first
pub fn before(
    origin: usize,
    range: Range<usize>,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegionIter::new(origin, range, Direction::Down)
}

#[allow(clippy::missing_docs_in_private_items)]
/// Which way the walk moves
#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

/// Iterator over free pages, skipping whole mapped regions at a time
struct FreeRegionIter {
    /// Bounds of the walk
    range: Range<usize>,
    /// Walk direction
    direction: Direction,
    /// Next page to query
    cursor: usize,
}
impl FreeRegionIter {
    /// Starts a walk at the page containing `origin`
    fn new(origin: usize, range: Range<usize>, direction: Direction) -> Self {
        let page = region::page::size();
        Self {
            range,
            direction,
            cursor: origin - origin % page,
        }
    }

    /// Moves the cursor one page in the walk direction
    fn step(&self, from: usize, page: usize) -> usize {
        match self.direction {
            Direction::Up => from.saturating_add(page),
            Direction::Down => from.saturating_sub(page),
        }
    }
}

impl Iterator for FreeRegionIter {
    type Item = Result<*const (), region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = region::page::size();

        while self.cursor > 0 && self.range.contains(&self.cursor) {
            match region::query(self.cursor as *const ()) {
                Ok(mapped) => {
                    let mapped = mapped.as_range();
                    self.cursor = match self.direction {
                        Direction::Up => mapped.end,
                        Direction::Down => mapped.start.saturating_sub(page),
                    };
                }
                Err(region::Error::UnmappedRegion) => {
                    let free = self.cursor;
                    self.cursor = self.step(free, page);
                    return Some(Ok(free as *const ()));
                }
                Err(error) => {
                    self.cursor = self.step(self.cursor, page);
                    return Some(Err(error));
                }
            }
        }

        None
    }
}
