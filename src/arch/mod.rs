// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The paging structures are hierarchical, with `HIER_LEVELS` levels of
//! `PTABLE_ENTRIES`-entry tables. Level 0 is the root table; only the last
//! level holds page mappings. For example, x86_64 is:
//!
//!  - Level 0: PML4
//!  - Level 1: PDPT
//!  - Level 2: page directory
//!  - Level 3: page table (4KiB pages)
//!
//! and AArch64 with a 4KiB granule is L0 through L3 in the same shape.
//! Everything that differs between targets (object types, the mappable
//! range and the flag encoding) is supplied by a `PagingArch`.

mod aarch64;
mod x86_64;

pub use self::aarch64::AArch64;
pub use self::x86_64::X86_64;

use crate::{
    authority::ObjType,
    flags::{KpiPagingFlags, VregionFlags},
};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("pmap only supports 64-bit address spaces");

/// log2 of the base page size
pub const BASE_PAGE_BITS: usize = 12;
pub const BASE_PAGE_SIZE: usize = 1 << BASE_PAGE_BITS;
/// Number of bits translated by each level
pub const PTABLE_ENTRY_BITS: usize = 9;
pub const PTABLE_ENTRIES: usize = 1 << PTABLE_ENTRY_BITS;
/// Depth of the paging hierarchy, including the root table
pub const HIER_LEVELS: usize = 4;
/// Number of slots in one mapping-storage CNode
pub const L2_CNODE_SLOTS: usize = 256;
/// Number of mapping-storage CNodes needed to cover one table
pub const MCN_COUNT: usize = (PTABLE_ENTRIES + L2_CNODE_SLOTS - 1) / L2_CNODE_SLOTS;

/// Returns the offset of `addr` within its base page.
#[inline]
pub fn base_page_offset(addr: usize) -> usize {
    addr & (BASE_PAGE_SIZE - 1)
}

/// A target's paging hierarchy.
pub trait PagingArch {
    /// Human-readable name, used in log messages
    const NAME: &'static str;
    /// Object types for the table at each depth; index 0 is the root
    const TABLE_TYPES: [ObjType; HIER_LEVELS];
    /// One past the highest address that user mappings may use
    const MAX_MAPPABLE_VA: usize;

    /// Converts region-manager flags into the kernel's paging flags.
    ///
    /// The message-passing-buffer and guard flags have no common encoding,
    /// so each target decides what happens to them.
    fn translate_flags(flags: VregionFlags) -> KpiPagingFlags;

    /// Number of address bits below the index field of `depth`.
    #[inline]
    fn level_shift(depth: usize) -> usize {
        debug_assert!(depth < HIER_LEVELS);
        BASE_PAGE_BITS + PTABLE_ENTRY_BITS * (HIER_LEVELS - 1 - depth)
    }

    /// Index into the table at `depth` used to translate `vaddr`.
    #[inline]
    fn level_index(vaddr: usize, depth: usize) -> u16 {
        ((vaddr >> Self::level_shift(depth)) & (PTABLE_ENTRIES - 1)) as u16
    }

    /// Index of `vaddr` within its leaf table.
    #[inline]
    fn leaf_index(vaddr: usize) -> u16 {
        Self::level_index(vaddr, HIER_LEVELS - 1)
    }

    /// Identifies the leaf table covering `vaddr` (all index bits above the
    /// leaf level).
    #[inline]
    fn leaf_table_base(vaddr: usize) -> usize {
        vaddr >> Self::level_shift(HIER_LEVELS - 2)
    }

    /// Bytes of address space covered by one entry of the table at `depth`.
    #[inline]
    fn entry_span(depth: usize) -> usize {
        1 << Self::level_shift(depth)
    }
}

#[cfg(target_arch = "aarch64")]
pub type DefaultArch = AArch64;
#[cfg(not(target_arch = "aarch64"))]
pub type DefaultArch = X86_64;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn level_indices() {
        let vaddr = (3 << 39) | (5 << 30) | (7 << 21) | (11 << 12) | 0x123;
        assert_eq!(X86_64::level_index(vaddr, 0), 3);
        assert_eq!(X86_64::level_index(vaddr, 1), 5);
        assert_eq!(X86_64::level_index(vaddr, 2), 7);
        assert_eq!(X86_64::leaf_index(vaddr), 11);
        assert_eq!(X86_64::leaf_table_base(vaddr), (3 << 18) | (5 << 9) | 7);
        assert_eq!(base_page_offset(vaddr), 0x123);
    }

    #[test]
    fn leaf_table_boundaries() {
        let span = X86_64::entry_span(2);
        assert_eq!(span, PTABLE_ENTRIES * BASE_PAGE_SIZE);
        assert_eq!(X86_64::leaf_table_base(span - 1), 0);
        assert_eq!(X86_64::leaf_table_base(span), 1);
        assert_eq!(AArch64::leaf_index(span - BASE_PAGE_SIZE), (PTABLE_ENTRIES - 1) as u16);
    }

    #[test]
    fn mapping_cnodes_cover_table() {
        assert!(MCN_COUNT * L2_CNODE_SLOTS >= PTABLE_ENTRIES);
        assert_eq!(MCN_COUNT, 2);
    }
}
