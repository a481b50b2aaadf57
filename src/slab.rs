// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-size block allocator for vnode metadata.
//!
//! Capacity is only ever added through `grow()`, which accounts a region of
//! backing memory the way a C slab would carve it (one header plus as many
//! whole blocks as fit). Blocks are identified by index; the values
//! themselves are kept in an index arena owned by the slab, so a block index
//! doubles as a stable node ID.

use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;

/// Bytes consumed by the header of each region added with `grow()`
pub const SLAB_HEAD_SIZE: usize = 4 * size_of::<usize>();

/// Where the memory for a slab region came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabBacking {
    /// Buffer embedded in the pmap at creation
    Static,
    /// Pages mapped through the owning pmap at `vaddr`
    Mapped { vaddr: usize },
    /// One-off buffer from a `BufferProvider`
    Buffer { addr: usize },
}

/// A region of backing memory that has been added to a slab
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabRegion {
    pub backing: SlabBacking,
    pub bytes: usize,
    pub first_block: usize,
    pub blocks: usize,
}

/// Allocator of fixed-size blocks holding values of type `T`
pub struct Slab<T> {
    block_size: usize,
    blocks: Vec<Option<T>>,
    free_list: Vec<usize>,
    bump: usize,
    capacity: usize,
    regions: Vec<SlabRegion>,
    allocated: usize,
}

impl<T> Slab<T> {
    /// Creates an empty slab with no capacity.
    pub fn new() -> Slab<T> {
        let word = size_of::<usize>();
        let size = size_of::<T>().max(word);
        Slab {
            block_size: (size + word - 1) & !(word - 1),
            blocks: Vec::new(),
            free_list: Vec::new(),
            bump: 0,
            capacity: 0,
            regions: Vec::new(),
            allocated: 0,
        }
    }

    /// Size of each block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of bytes of backing memory needed for exactly `blocks`
    /// blocks in a single region.
    pub fn static_size(blocks: usize) -> usize {
        let word = size_of::<usize>();
        let size = size_of::<T>().max(word);
        blocks * ((size + word - 1) & !(word - 1)) + SLAB_HEAD_SIZE
    }

    /// Adds a region of backing memory, returning the number of blocks it
    /// contributed.
    pub fn grow(&mut self, backing: SlabBacking, bytes: usize) -> usize {
        let blocks = bytes.saturating_sub(SLAB_HEAD_SIZE) / self.block_size;
        if blocks == 0 {
            warn!("Slab::grow: region of {} bytes from {:?} too small for a block of {} bytes", bytes, backing, self.block_size);
            return 0;
        }
        self.regions.push(SlabRegion {
            backing,
            bytes,
            first_block: self.capacity,
            blocks,
        });
        self.capacity += blocks;
        blocks
    }

    /// Number of blocks that can still be allocated.
    pub fn free_count(&self) -> usize {
        self.free_list.len() + (self.capacity - self.bump)
    }

    /// Number of blocks currently in use.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Total number of blocks added by all grows.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Regions added so far, in order.
    pub fn regions(&self) -> &[SlabRegion] {
        &self.regions
    }

    /// Stores `value` in a free block and returns its index. The value is
    /// handed back if the slab is exhausted.
    pub fn alloc(&mut self, value: T) -> Result<usize, T> {
        let id = if let Some(id) = self.free_list.pop() {
            id
        } else if self.bump < self.capacity {
            let id = self.bump;
            self.bump += 1;
            self.blocks.push(None);
            id
        } else {
            return Err(value);
        };
        self.blocks[id] = Some(value);
        self.allocated += 1;
        Ok(id)
    }

    /// Releases a block, returning the value it held.
    pub fn free(&mut self, id: usize) -> Option<T> {
        let value = self.blocks.get_mut(id).and_then(|b| b.take());
        if value.is_some() {
            self.free_list.push(id);
            self.allocated -= 1;
        }
        value
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.blocks.get(id).and_then(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.blocks.get_mut(id).and_then(|b| b.as_mut())
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Slab<T> {
        Slab::new()
    }
}

impl<T> fmt::Debug for Slab<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Slab {{ block_size: {}, allocated: {}, free: {}, regions: {} }}",
               self.block_size,
               self.allocated,
               self.free_count(),
               self.regions.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn static_size_yields_exact_blocks() {
        let mut slab: Slab<[u64; 5]> = Slab::new();
        assert_eq!(slab.block_size(), 40);
        let bytes = Slab::<[u64; 5]>::static_size(32);
        assert_eq!(slab.grow(SlabBacking::Static, bytes), 32);
        assert_eq!(slab.free_count(), 32);
        assert_eq!(slab.grow(SlabBacking::Static, bytes - 1), 31);
    }

    #[test]
    fn small_blocks_are_word_sized() {
        let slab: Slab<u8> = Slab::new();
        assert_eq!(slab.block_size(), size_of::<usize>());
    }

    #[test]
    fn grow_too_small() {
        let mut slab: Slab<u64> = Slab::new();
        assert_eq!(slab.grow(SlabBacking::Buffer { addr: 0x1000 }, SLAB_HEAD_SIZE), 0);
        assert!(slab.regions().is_empty());
        assert_eq!(slab.alloc(1), Err(1));
    }

    #[test]
    fn alloc_reuses_freed_blocks() {
        let mut slab: Slab<u64> = Slab::new();
        slab.grow(SlabBacking::Static, Slab::<u64>::static_size(3));
        let a = slab.alloc(10).unwrap();
        let b = slab.alloc(20).unwrap();
        let c = slab.alloc(30).unwrap();
        assert_eq!(slab.alloc(40), Err(40));
        assert_eq!(slab.free(b), Some(20));
        assert_eq!(slab.free(b), None);
        assert_eq!(slab.free_count(), 1);
        let d = slab.alloc(50).unwrap();
        assert_eq!(d, b);
        assert_eq!(slab.get(a), Some(&10));
        assert_eq!(slab.get(c), Some(&30));
        assert_eq!(slab.get(d), Some(&50));
        assert_eq!(slab.allocated(), 3);
    }

    #[test]
    fn regions_record_backing() {
        let mut slab: Slab<u64> = Slab::new();
        slab.grow(SlabBacking::Static, Slab::<u64>::static_size(2));
        slab.grow(SlabBacking::Mapped { vaddr: 0x8000 }, 4096);
        let regions = slab.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].backing, SlabBacking::Mapped { vaddr: 0x8000 });
        assert_eq!(regions[1].first_block, 2);
        assert_eq!(regions[1].blocks, (4096 - SLAB_HEAD_SIZE) / 8);
        assert_eq!(slab.capacity(), 2 + regions[1].blocks);
    }
}
