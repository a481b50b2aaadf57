// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Installing, removing and changing leaf mappings.
//!
//! A leaf table can only reference entries within itself, so every range is
//! split into runs that each stay inside one leaf table: a partial run up to
//! the end of the first table, any number of full tables, and a partial run
//! at the end. Each run becomes (or must match) one leaf node.

use core::marker::PhantomData;

use super::{Pmap, PmapError, Residency, SLABS_RESERVE};
use crate::{
    arch::{base_page_offset, PagingArch, BASE_PAGE_SIZE, PTABLE_ENTRIES},
    authority::{AuthorityManager, AuthorityOp, BufferProvider, CapRef, PmapBundle},
    flags::VregionFlags,
    checked_round_up,
    slab::{Slab, SlabBacking},
    vnode::{LeafNode, Vnode, VnodeId, VnodeKind},
};

use super::refill::slabs_required;

/// A part of a range that lies within a single leaf table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct LeafRun {
    pub vaddr: usize,
    pub pages: usize,
    /// Bytes of the range preceding this run
    pub done: usize,
}

/// Splits a page-aligned range into runs at leaf table boundaries
pub(super) struct LeafRuns<P: PagingArch> {
    vaddr: usize,
    pages: usize,
    done: usize,
    _arch: PhantomData<P>,
}

impl<P: PagingArch> LeafRuns<P> {
    pub fn new(vaddr: usize, size: usize) -> LeafRuns<P> {
        LeafRuns {
            vaddr,
            pages: size / BASE_PAGE_SIZE,
            done: 0,
            _arch: PhantomData,
        }
    }
}

impl<P: PagingArch> Iterator for LeafRuns<P> {
    type Item = LeafRun;
    fn next(&mut self) -> Option<LeafRun> {
        if self.pages == 0 {
            return None;
        }
        let entry = P::leaf_index(self.vaddr) as usize;
        let pages = (PTABLE_ENTRIES - entry).min(self.pages);
        let run = LeafRun {
            vaddr: self.vaddr,
            pages,
            done: self.done,
        };
        self.vaddr = self.vaddr.wrapping_add(pages * BASE_PAGE_SIZE);
        self.done += pages * BASE_PAGE_SIZE;
        self.pages -= pages;
        Some(run)
    }
}

impl<P: PagingArch> Pmap<P> {
    /// Maps `size` bytes of `frame`, starting `offset` bytes into it, at
    /// `vaddr`.
    ///
    /// A sub-page `offset` is rounded down and the difference added to
    /// `size`, which is then rounded up to whole pages; the adjusted offset
    /// and size are returned. The node slab is topped up first so that the
    /// mapping cannot run out of vnodes.
    ///
    /// On failure, the number of bytes that were mapped before the failing
    /// run is returned along with the error. Those runs stay mapped.
    pub fn map<A: PmapBundle>(&mut self,
                              vaddr: usize,
                              frame: CapRef,
                              offset: usize,
                              size: usize,
                              flags: VregionFlags,
                              alloc: &A) -> Result<(usize, usize), (usize, PmapError)> {
        let size = match size.checked_add(base_page_offset(offset)).and_then(|s| checked_round_up(s, BASE_PAGE_SIZE)) {
            Some(s) => s,
            None => {
                warn!("Pmap::map: size {:x} at {:x} overflows", size, vaddr);
                return Err((0, PmapError::OutOfVirtualAddr));
            },
        };
        let offset = offset - base_page_offset(offset);

        if base_page_offset(vaddr) != 0 {
            warn!("Pmap::map: address {:x} not aligned", vaddr);
            return Err((0, PmapError::InvalidArgument { which: 0 }));
        }
        if size == 0 {
            warn!("Pmap::map: empty mapping at {:x}", vaddr);
            return Err((0, PmapError::InvalidArgument { which: 3 }));
        }
        self.check_bounds(vaddr, size).map_err(|err| (0, err))?;

        let slabs_free = self.tree.slab().free_count();
        let slabs_required = slabs_required::<P>(vaddr, size) + SLABS_RESERVE;
        if slabs_required > slabs_free {
            match self.residency {
                Residency::Current => {
                    self.refill_slabs(slabs_required, alloc).map_err(|err| (0, err))?;
                },
                Residency::Foreign => {
                    let bytes = Slab::<Vnode>::static_size(slabs_required - slabs_free);
                    let addr = alloc.buffers().allocate_buffer(bytes).map_err(|_| {
                        warn!("Pmap::map: allocating {} byte slab buffer failed", bytes);
                        (0, PmapError::BufferAllocFail)
                    })?;
                    self.tree.grow_slab(SlabBacking::Buffer { addr }, bytes);
                },
            }
        }

        self.do_map(vaddr, frame, offset, size, flags, alloc)?;
        Ok((offset, size))
    }

    /// Maps a page-aligned range without checking the slab first.
    pub(super) fn do_map<A: PmapBundle>(&mut self,
                                        vaddr: usize,
                                        frame: CapRef,
                                        offset: usize,
                                        size: usize,
                                        flags: VregionFlags,
                                        alloc: &A) -> Result<(), (usize, PmapError)> {
        pmap_debug_println!("Pmap::do_map: {:x}-{:x} from {:?}+{:x} {:?}", vaddr, vaddr + size, frame, offset, flags);
        for run in LeafRuns::<P>::new(vaddr, size) {
            if let Some(ptable) = self.find_ptable(run.vaddr) {
                if self.tree.has_vnode(ptable, P::leaf_index(run.vaddr), run.pages) {
                    warn!("Pmap::do_map: {:x}-{:x} overlaps an existing mapping", run.vaddr, run.vaddr + run.pages * BASE_PAGE_SIZE);
                    return Err((0, PmapError::ExistingMapping));
                }
            }
        }
        for run in LeafRuns::<P>::new(vaddr, size) {
            self.do_single_map(run.vaddr, frame, offset + run.done, run.pages, flags, alloc)
                .map_err(|err| (run.done, err))?;
        }
        Ok(())
    }

    fn do_single_map<A: PmapBundle>(&mut self,
                                    vaddr: usize,
                                    frame: CapRef,
                                    offset: usize,
                                    pte_count: usize,
                                    flags: VregionFlags,
                                    alloc: &A) -> Result<(), PmapError> {
        let ptable = self.get_ptable(vaddr, alloc)?;
        let entry = P::leaf_index(vaddr);
        if self.tree.has_vnode(ptable, entry, pte_count) {
            warn!("Pmap::do_single_map: entries {}-{} for {:x} already mapped", entry, entry as usize + pte_count, vaddr);
            return Err(PmapError::ExistingMapping);
        }
        if self.tree.slab().free_count() == 0 {
            warn!("Pmap::do_single_map: no free vnodes for mapping at {:x}", vaddr);
            return Err(PmapError::SlabAllocFail);
        }
        let (invokable, mapping) = match self.tree.table(ptable) {
            Some(table) => (table.invokable, table.mapping_slot(entry)?),
            None => panic!("Pmap::do_single_map: leaf table for {:x} missing (this shouldn't happen!)", vaddr),
        };

        let kpi_flags = P::translate_flags(flags);
        alloc.authority().install_leaf(invokable,
                                       frame,
                                       entry as usize,
                                       kpi_flags,
                                       offset,
                                       pte_count,
                                       mapping).map_err(|err| {
            warn!("Pmap::do_single_map: mapping {} pages of {:?}+{:x} at {:x} failed with {:?}", pte_count, frame, offset, vaddr, err);
            PmapError::Authority { op: AuthorityOp::InstallLeaf, err }
        })?;

        let node = Vnode {
            entry,
            mapping,
            kind: VnodeKind::Leaf(LeafNode {
                frame,
                offset,
                flags,
                pte_count,
            }),
        };
        if self.tree.insert_child(ptable, node).is_err() {
            panic!("Pmap::do_single_map: slab exhausted after free count check (this shouldn't happen!)");
        }
        Ok(())
    }

    /// Removes the mappings covering `size` bytes at `vaddr`. Each leaf
    /// table's part of the range must exactly match one existing mapping,
    /// or be entirely unmapped at the table level.
    ///
    /// Returns the number of bytes processed; on failure, the number of
    /// bytes processed before the failing run.
    pub fn unmap<A: PmapBundle>(&mut self,
                                vaddr: usize,
                                size: usize,
                                alloc: &A) -> Result<usize, (usize, PmapError)> {
        if base_page_offset(vaddr) != 0 {
            warn!("Pmap::unmap: address {:x} not aligned", vaddr);
            return Err((0, PmapError::InvalidArgument { which: 0 }));
        }
        let size = self.checked_range(vaddr, size).map_err(|err| (0, err))?;
        for run in LeafRuns::<P>::new(vaddr, size) {
            self.do_single_unmap(run.vaddr, run.pages, alloc)
                .map_err(|err| (run.done, err))?;
        }
        Ok(size)
    }

    fn do_single_unmap<A: PmapBundle>(&mut self,
                                      vaddr: usize,
                                      pte_count: usize,
                                      alloc: &A) -> Result<(), PmapError> {
        let ptable = match self.find_ptable(vaddr) {
            Some(p) => p,
            None => return Ok(()),
        };
        let entry = P::leaf_index(vaddr);
        let mapping = match self.tree.find_vnode(ptable, entry).and_then(|id| self.tree.node(id)) {
            Some(node) if node.entry == entry && node.as_leaf().map_or(false, |l| l.pte_count == pte_count) => node.mapping,
            _ => {
                warn!("Pmap::do_single_unmap: no mapping of exactly {} pages at {:x}", pte_count, vaddr);
                return Err(PmapError::FindVnode);
            },
        };
        let invokable = match self.tree.table(ptable) {
            Some(table) => table.invokable,
            None => panic!("Pmap::do_single_unmap: leaf table for {:x} missing (this shouldn't happen!)", vaddr),
        };

        let authority = alloc.authority();
        authority.remove_mapping(invokable, mapping).map_err(|err| {
            warn!("Pmap::do_single_unmap: unmapping {} pages at {:x} failed with {:?}", pte_count, vaddr, err);
            PmapError::Authority { op: AuthorityOp::RemoveMapping, err }
        })?;
        self.tree.remove_child(ptable, entry);
        authority.release_authority(mapping).map_err(|err| {
            warn!("Pmap::do_single_unmap: deleting mapping {:?} for {:x} failed with {:?}", mapping, vaddr, err);
            PmapError::Authority { op: AuthorityOp::ReleaseAuthority, err }
        })
    }

    /// Changes the flags of `size` bytes at `vaddr`. Each leaf table's part
    /// of the range must lie within a single existing mapping; parts where
    /// nothing is mapped are skipped. A range crossing a mapping boundary
    /// anywhere fails before any flags are changed.
    ///
    /// Returns the number of bytes processed; on failure, the number of
    /// bytes processed before the failing run.
    pub fn modify_flags<A: PmapBundle>(&mut self,
                                       vaddr: usize,
                                       size: usize,
                                       flags: VregionFlags,
                                       alloc: &A) -> Result<usize, (usize, PmapError)> {
        if base_page_offset(vaddr) != 0 {
            warn!("Pmap::modify_flags: address {:x} not aligned", vaddr);
            return Err((0, PmapError::InvalidArgument { which: 0 }));
        }
        let size = self.checked_range(vaddr, size).map_err(|err| (0, err))?;
        for run in LeafRuns::<P>::new(vaddr, size) {
            self.modify_target(run.vaddr, run.pages).map_err(|err| (0, err))?;
        }
        for run in LeafRuns::<P>::new(vaddr, size) {
            self.do_single_modify_flags(run.vaddr, run.pages, flags, alloc)
                .map_err(|err| (run.done, err))?;
        }
        Ok(size)
    }

    /// Finds the leaf that a flag change of `pages` pages at `vaddr` applies
    /// to. `None` means nothing is mapped there and the run is skipped.
    fn modify_target(&self, vaddr: usize, pages: usize) -> Result<Option<VnodeId>, PmapError> {
        let ptable = match self.find_ptable(vaddr) {
            Some(p) => p,
            None => return Ok(None),
        };
        let entry = P::leaf_index(vaddr);
        let id = match self.tree.find_vnode(ptable, entry) {
            Some(id) => id,
            None => {
                if self.tree.has_vnode(ptable, entry, pages) {
                    warn!("Pmap::modify_target: {} pages at {:x} run into an existing mapping", pages, vaddr);
                    return Err(PmapError::ExistingMappingConflict);
                }
                return Ok(None);
            },
        };
        if !self.tree.inside_region(ptable, entry, pages) {
            warn!("Pmap::modify_target: {} pages at {:x} cross a mapping boundary", pages, vaddr);
            return Err(PmapError::ExistingMappingConflict);
        }
        Ok(Some(id))
    }

    fn do_single_modify_flags<A: PmapBundle>(&mut self,
                                             vaddr: usize,
                                             pages: usize,
                                             flags: VregionFlags,
                                             alloc: &A) -> Result<(), PmapError> {
        let id = match self.modify_target(vaddr, pages)? {
            Some(id) => id,
            None => return Ok(()),
        };
        let entry = P::leaf_index(vaddr);

        let (mapping, first, pte_count) = match self.tree.node(id) {
            Some(node) => (node.mapping, node.entry, node.span()),
            None => panic!("Pmap::do_single_modify_flags: vnode {:?} vanished (this shouldn't happen!)", id),
        };
        let off = (entry - first) as usize;
        let kpi_flags = P::translate_flags(flags);
        alloc.authority().change_permissions(mapping, off, pages, kpi_flags).map_err(|err| {
            warn!("Pmap::do_single_modify_flags: changing flags of {} pages at {:x} failed with {:?}", pages, vaddr, err);
            PmapError::Authority { op: AuthorityOp::ChangePermissions, err }
        })?;

        if off == 0 && pages == pte_count {
            if let Some(node) = self.tree.node_mut(id) {
                if let VnodeKind::Leaf(ref mut leaf) = node.kind {
                    leaf.flags = flags;
                }
            }
        }
        Ok(())
    }

    /// Rounds `size` up to whole pages and checks the resulting range.
    fn checked_range(&self, vaddr: usize, size: usize) -> Result<usize, PmapError> {
        let size = match checked_round_up(size, BASE_PAGE_SIZE) {
            Some(s) => s,
            None => {
                warn!("Pmap::checked_range: size {:x} at {:x} overflows", size, vaddr);
                return Err(PmapError::OutOfVirtualAddr);
            },
        };
        self.check_bounds(vaddr, size)?;
        Ok(size)
    }

    /// Fails if `[vaddr, vaddr + size)` is outside the mappable range.
    fn check_bounds(&self, vaddr: usize, size: usize) -> Result<(), PmapError> {
        match vaddr.checked_add(size) {
            Some(end) if vaddr >= self.config.min_mappable_va && end <= self.config.max_mappable_va => Ok(()),
            _ => {
                warn!("Pmap::check_bounds: {:x} + {:x} outside {:x}-{:x}", vaddr, size, self.config.min_mappable_va, self.config.max_mappable_va);
                Err(PmapError::OutOfVirtualAddr)
            },
        }
    }
}

