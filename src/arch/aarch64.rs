// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{PagingArch, HIER_LEVELS};
use crate::{
    authority::ObjType,
    flags::{common_kpi_bits, KpiPagingFlags, VregionFlags},
};

/// AArch64 (VMSAv8-64, 4KiB granule, four levels)
#[derive(Clone, Copy, Debug)]
pub struct AArch64;

impl PagingArch for AArch64 {
    const NAME: &'static str = "aarch64";
    const TABLE_TYPES: [ObjType; HIER_LEVELS] = [
        ObjType::VNodeAArch64L0,
        ObjType::VNodeAArch64L1,
        ObjType::VNodeAArch64L2,
        ObjType::VNodeAArch64L3,
    ];
    // Only the lower half of the L0 table is used for user mappings, so the
    // root needs a single mapping CNode.
    const MAX_MAPPABLE_VA: usize = 0x0000_8000_0000_0000;

    /// MPB and VT-d snoop have no meaning here and are dropped; a guard page
    /// gets no permissions at all. Only the read/write/execute/nocache bits
    /// reach the kernel.
    fn translate_flags(flags: VregionFlags) -> KpiPagingFlags {
        let flags = flags - (VregionFlags::MPB | VregionFlags::VTD_SNOOP);
        if flags.contains(VregionFlags::GUARD) {
            return KpiPagingFlags::empty();
        }
        common_kpi_bits(flags)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guard_is_inaccessible() {
        let flags = VregionFlags::READ_WRITE | VregionFlags::GUARD;
        assert_eq!(AArch64::translate_flags(flags), KpiPagingFlags::empty());
    }

    #[test]
    fn mpb_and_snoop_dropped() {
        let flags = VregionFlags::READ_WRITE | VregionFlags::MPB | VregionFlags::VTD_SNOOP;
        assert_eq!(AArch64::translate_flags(flags), KpiPagingFlags::READ_WRITE);
    }

    #[test]
    fn execute_nocache() {
        let flags = VregionFlags::READ_EXECUTE | VregionFlags::NOCACHE | VregionFlags::WRITE_COMBINING;
        assert_eq!(AArch64::translate_flags(flags),
                   KpiPagingFlags::READ | KpiPagingFlags::EXECUTE | KpiPagingFlags::NOCACHE);
    }
}
