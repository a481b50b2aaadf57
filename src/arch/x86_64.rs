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

/// x86_64 four-level paging
#[derive(Clone, Copy, Debug)]
pub struct X86_64;

impl PagingArch for X86_64 {
    const NAME: &'static str = "x86_64";
    const TABLE_TYPES: [ObjType; HIER_LEVELS] = [
        ObjType::VNodeX86_64Pml4,
        ObjType::VNodeX86_64Pdpt,
        ObjType::VNodeX86_64Pdir,
        ObjType::VNodeX86_64Ptable,
    ];
    // Top of the lower canonical half
    const MAX_MAPPABLE_VA: usize = 0x0000_8000_0000_0000;

    /// Guard pages stay present but read-only and non-executable, since a
    /// present x86 entry is always readable. MPB, write-combining and
    /// VT-d snoop are passed through to the kernel.
    fn translate_flags(flags: VregionFlags) -> KpiPagingFlags {
        if flags.contains(VregionFlags::GUARD) {
            return KpiPagingFlags::READ;
        }
        let mut kpi = common_kpi_bits(flags);
        if flags.contains(VregionFlags::MPB) {
            kpi |= KpiPagingFlags::MPB;
        }
        if flags.contains(VregionFlags::VTD_SNOOP) {
            kpi |= KpiPagingFlags::VTD_SNOOP;
        }
        if !flags.contains(VregionFlags::NOCACHE) && flags.contains(VregionFlags::WRITE_COMBINING) {
            kpi |= KpiPagingFlags::WRITE_COMBINING;
        }
        kpi
    }
}
