// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The set of occupied virtual regions of an address space, ordered by
//! base address. It is maintained by the region manager; the pmap only
//! reads it to find free space, except for reserving its own metadata
//! region at initialization.

use alloc::boxed::Box;
use core::fmt;

use intrusive_collections::{rbtree, Bound, KeyAdapter, RBTree};

use crate::flags::VregionFlags;

/// An occupied range of virtual addresses
pub struct Vregion {
    base: usize,
    size: usize,
    flags: VregionFlags,
    link: rbtree::Link,
}

impl Vregion {
    pub fn new(base: usize, size: usize, flags: VregionFlags) -> Vregion {
        Vregion {
            base,
            size,
            flags,
            link: Default::default(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> VregionFlags {
        self.flags
    }

    ///Returns the end address of this region
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

impl fmt::Debug for Vregion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Vregion {{ {:x}-{:x} {:?} }}", self.base, self.end(), self.flags)
    }
}

intrusive_adapter!(pub AddressOrder = Box<Vregion>: Vregion { link: rbtree::Link });

impl<'a> KeyAdapter<'a> for AddressOrder {
    type Key = usize;
    fn get_key(&self, container: &'a Vregion) -> usize {
        container.base
    }
}

/// Occupied regions of one address space, in address order
pub struct VregionList {
    regions: RBTree<AddressOrder>,
}

impl VregionList {
    pub fn new() -> VregionList {
        VregionList {
            regions: RBTree::new(AddressOrder::new()),
        }
    }

    /// Adds a region. The region is handed back if it is empty or overlaps
    /// one already present.
    pub fn insert(&mut self, region: Vregion) -> Result<(), Vregion> {
        if region.size == 0 {
            warn!("VregionList::insert: empty region at {:x}", region.base);
            return Err(region);
        }
        let overlap = {
            let prev = self.regions.upper_bound(Bound::Included(&region.base));
            let next = self.regions.lower_bound(Bound::Included(&region.base));
            prev.get().map_or(false, |r| r.end() > region.base) ||
                next.get().map_or(false, |r| r.base < region.end())
        };
        if overlap {
            warn!("VregionList::insert: region {:?} overlaps an existing region", region);
            return Err(region);
        }
        self.regions.insert(Box::new(region));
        Ok(())
    }

    /// Removes the region starting at `base`.
    pub fn remove(&mut self, base: usize) -> Option<Vregion> {
        self.regions.find_mut(&base).remove().map(|r| *r)
    }

    /// Finds the region containing `vaddr`.
    pub fn find(&self, vaddr: usize) -> Option<&Vregion> {
        self.regions.upper_bound(Bound::Included(&vaddr)).get().filter(|r| vaddr < r.end())
    }

    pub fn iter(&self) -> rbtree::Iter<AddressOrder> {
        self.regions.iter()
    }

    pub fn first(&self) -> Option<&Vregion> {
        self.regions.front().get()
    }

    pub fn last(&self) -> Option<&Vregion> {
        self.regions.back().get()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Default for VregionList {
    fn default() -> VregionList {
        VregionList::new()
    }
}

impl fmt::Debug for VregionList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.regions.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordered_by_base() {
        let mut list = VregionList::new();
        assert!(list.insert(Vregion::new(0x5000, 0x1000, VregionFlags::READ)).is_ok());
        assert!(list.insert(Vregion::new(0x1000, 0x2000, VregionFlags::READ_WRITE)).is_ok());
        assert!(list.insert(Vregion::new(0x3000, 0x1000, VregionFlags::READ)).is_ok());
        let bases: Vec<usize> = list.iter().map(|r| r.base()).collect();
        assert_eq!(bases, vec![0x1000, 0x3000, 0x5000]);
        assert_eq!(list.first().map(|r| r.base()), Some(0x1000));
        assert_eq!(list.last().map(|r| r.end()), Some(0x6000));
    }

    #[test]
    fn overlap_rejected() {
        let mut list = VregionList::new();
        list.insert(Vregion::new(0x2000, 0x2000, VregionFlags::READ)).unwrap();
        assert!(list.insert(Vregion::new(0x3000, 0x1000, VregionFlags::READ)).is_err());
        assert!(list.insert(Vregion::new(0x1000, 0x1001, VregionFlags::READ)).is_err());
        assert!(list.insert(Vregion::new(0x2000, 0x1000, VregionFlags::READ)).is_err());
        assert!(list.insert(Vregion::new(0x8000, 0, VregionFlags::READ)).is_err());
        assert!(list.insert(Vregion::new(0x1000, 0x1000, VregionFlags::READ)).is_ok());
        assert!(list.insert(Vregion::new(0x4000, 0x1000, VregionFlags::READ)).is_ok());
    }

    #[test]
    fn find_and_remove() {
        let mut list = VregionList::new();
        list.insert(Vregion::new(0x2000, 0x2000, VregionFlags::READ)).unwrap();
        assert_eq!(list.find(0x3fff).map(|r| r.base()), Some(0x2000));
        assert!(list.find(0x4000).is_none());
        assert!(list.find(0x1000).is_none());
        assert!(list.remove(0x3000).is_none());
        let region = list.remove(0x2000).unwrap();
        assert_eq!(region.size(), 0x2000);
        assert_eq!(region.flags(), VregionFlags::READ);
        assert!(list.is_empty());
    }
}
