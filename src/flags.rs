// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mapping flags.
//!
//! `VregionFlags` are what the region manager asks for; `KpiPagingFlags` are
//! what gets passed to the kernel when a mapping is installed or changed.
//! The translation between the two is architecture-specific and lives in
//! `PagingArch::translate_flags`.

use bitflags::bitflags;

bitflags! {
    /// Flags requested for a mapping by the virtual memory region manager
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct VregionFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        const NOCACHE = 0x08;
        /// Message-passing buffer (bus performance hint)
        const MPB = 0x10;
        /// Guard page
        const GUARD = 0x20;
        const LARGE = 0x40;
        const HUGE = 0x80;
        const WRITE_COMBINING = 0x100;
        /// Request snooping of IOMMU accesses
        const VTD_SNOOP = 0x200;
    }
}

impl VregionFlags {
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    pub const READ_EXECUTE: Self = Self::READ.union(Self::EXECUTE);
    pub const READ_WRITE_NOCACHE: Self = Self::READ_WRITE.union(Self::NOCACHE);
}

bitflags! {
    /// Permission and cache flags understood by the kernel mapping
    /// invocations
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct KpiPagingFlags: usize {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        const NOCACHE = 0x08;
        const MPB = 0x10;
        const WRITE_COMBINING = 0x20;
        const VTD_SNOOP = 0x40;
    }
}

impl KpiPagingFlags {
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
}

/// Converts the access and cache bits shared by all architectures.
pub(crate) fn common_kpi_bits(flags: VregionFlags) -> KpiPagingFlags {
    let mut kpi = KpiPagingFlags::empty();
    if flags.contains(VregionFlags::READ) {
        kpi |= KpiPagingFlags::READ;
    }
    if flags.contains(VregionFlags::WRITE) {
        kpi |= KpiPagingFlags::WRITE;
    }
    if flags.contains(VregionFlags::EXECUTE) {
        kpi |= KpiPagingFlags::EXECUTE;
    }
    if flags.contains(VregionFlags::NOCACHE) {
        kpi |= KpiPagingFlags::NOCACHE;
    }
    kpi
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn common_bits() {
        assert_eq!(common_kpi_bits(VregionFlags::READ_WRITE), KpiPagingFlags::READ_WRITE);
        assert_eq!(common_kpi_bits(VregionFlags::READ_EXECUTE | VregionFlags::NOCACHE),
                   KpiPagingFlags::READ | KpiPagingFlags::EXECUTE | KpiPagingFlags::NOCACHE);
        assert_eq!(common_kpi_bits(VregionFlags::MPB | VregionFlags::LARGE), KpiPagingFlags::empty());
    }
}
