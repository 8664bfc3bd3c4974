// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block-granular heap for task stacks.
//!
//! The heap is a contiguous SRAM pool viewed as `MAX_BLOCKS` fixed 1-KiB
//! blocks, with a parallel metadata table. Allocations are contiguous runs
//! of blocks tagged with an owner; only the head block of a run records the
//! run length, which is what makes partial frees detectable. Blocks are
//! fixed-size, so coalescing is implicit and there is no defragmentation.
//!
//! The owner tag is caller-supplied; by convention the kernel uses
//! `task_index + 1`, and tag zero ("no owner") is rejected outright so the
//! two can never alias.

use static_assertions::const_assert_eq;

/// Granule size. Matches the MPU's 1-KiB sub-regions, which is the whole
/// point: block ownership maps one-to-one onto sub-region access bits.
pub const BLOCK_SIZE: u32 = 1024;

/// Number of blocks in the pool.
pub const MAX_BLOCKS: usize = 28;

/// Pool size in bytes.
pub const HEAP_SIZE: u32 = BLOCK_SIZE * MAX_BLOCKS as u32;

const_assert_eq!(HEAP_SIZE, 28 * 1024);

#[derive(Copy, Clone, Debug)]
struct BlockInfo {
    used: bool,
    owner: u16,
    /// Nonzero only in the head block of an allocation.
    run_length: u16,
}

impl BlockInfo {
    const FREE: Self = Self {
        used: false,
        owner: 0,
        run_length: 0,
    };
}

/// The block table plus the pool's base address.
///
/// The base is carried as data rather than baked in so the table logic runs
/// under the host test harness with fabricated addresses.
#[derive(Debug)]
pub struct BlockHeap {
    base: u32,
    blocks: [BlockInfo; MAX_BLOCKS],
}

impl BlockHeap {
    pub const fn new(base: u32) -> Self {
        Self {
            base,
            blocks: [BlockInfo::FREE; MAX_BLOCKS],
        }
    }

    /// Allocates a contiguous run of blocks covering `bytes`, tagged with
    /// `owner`, and returns the address of its first block. First fit,
    /// scanning left to right; worst case O(MAX_BLOCKS^2), which is fine at
    /// this table size.
    ///
    /// Fails on a zero size, a zero owner tag, or when no run of the
    /// required length exists.
    pub fn allocate(&mut self, bytes: u32, owner: u16) -> Option<u32> {
        if bytes == 0 || owner == 0 {
            return None;
        }
        let needed = bytes.div_ceil(BLOCK_SIZE) as usize;

        let mut i = 0;
        while i + needed <= MAX_BLOCKS {
            match (i..i + needed).find(|&j| self.blocks[j].used) {
                Some(occupied) => {
                    // Skip past the block that broke the run.
                    i = occupied + 1;
                }
                None => {
                    for j in i..i + needed {
                        self.blocks[j] = BlockInfo {
                            used: true,
                            owner,
                            run_length: 0,
                        };
                    }
                    self.blocks[i].run_length = needed as u16;
                    return Some(self.base + (i as u32) * BLOCK_SIZE);
                }
            }
        }
        None
    }

    /// Frees the allocation whose head block is at `addr`, provided the
    /// presented owner tag matches. Exactly the recorded run is released.
    ///
    /// Anything else -- an address outside the heap or not block-aligned, a
    /// non-head block (double free, or free of a run's interior), an owner
    /// mismatch -- returns `false` with no side effect.
    pub fn free(&mut self, addr: u32, owner: u16) -> bool {
        if owner == 0 || addr < self.base || addr >= self.base + HEAP_SIZE {
            return false;
        }
        if (addr - self.base) % BLOCK_SIZE != 0 {
            return false;
        }

        let index = ((addr - self.base) / BLOCK_SIZE) as usize;
        let head = self.blocks[index];
        if !head.used || head.owner != owner || head.run_length == 0 {
            return false;
        }

        let count = head.run_length as usize;
        if index + count > MAX_BLOCKS {
            return false;
        }
        for j in index..index + count {
            self.blocks[j] = BlockInfo::FREE;
        }
        true
    }

    /// Number of currently free blocks. Diagnostic only.
    pub fn free_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| !b.used).count()
    }
}
