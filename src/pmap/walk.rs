// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Walking the tree from the root down to the leaf table for an address,
//! and creating the tables that are missing on the way.

use super::{release_all, Pmap, PmapError};
use crate::{
    arch::{PagingArch, HIER_LEVELS, MCN_COUNT},
    authority::{AuthorityManager, AuthorityOp, CapRef, CnodeRef, ObjType, PmapBundle},
    flags::KpiPagingFlags,
    vnode::{TableNode, Vnode, VnodeId, VnodeKind},
};

impl<P: PagingArch> Pmap<P> {
    /// Creates a table of type `objtype`, installs it at `entry` of
    /// `parent` and links it into the tree. Nothing is linked unless every
    /// step succeeds.
    pub(super) fn alloc_vnode<A: PmapBundle>(&mut self,
                                             parent: VnodeId,
                                             objtype: ObjType,
                                             entry: u16,
                                             alloc: &A) -> Result<VnodeId, PmapError> {
        let authority = alloc.authority();
        let (parent_invokable, depth, mapping) = match self.tree.table(parent) {
            Some(table) => (table.invokable, table.depth + 1, table.mapping_slot(entry)?),
            None => panic!("Pmap::alloc_vnode: parent {:?} is not a table (this shouldn't happen!)", parent),
        };
        if self.tree.slab().free_count() == 0 {
            warn!("Pmap::alloc_vnode: no free vnodes for table at depth {}, entry {}", depth, entry);
            return Err(PmapError::SlabAllocFail);
        }

        let cap = authority.allocate_authority(objtype).map_err(|err| {
            warn!("Pmap::alloc_vnode: allocating {:?} failed with {:?}", objtype, err);
            PmapError::Authority { op: AuthorityOp::AllocateAuthority, err }
        })?;

        let invokable = if cap.croot() != authority.root_cnode() {
            match authority.copy_authority(cap) {
                Ok(copy) => copy,
                Err(err) => {
                    warn!("Pmap::alloc_vnode: copying {:?} failed with {:?}", cap, err);
                    release_all(authority, &[cap]);
                    return Err(PmapError::Authority { op: AuthorityOp::CopyAuthority, err });
                },
            }
        } else {
            cap
        };

        let mut mcn = [CapRef::NULL; MCN_COUNT];
        let mut mcnode = [CnodeRef::NULL; MCN_COUNT];
        for i in 0..MCN_COUNT {
            match authority.create_storage() {
                Ok((c, n)) => {
                    mcn[i] = c;
                    mcnode[i] = n;
                },
                Err(err) => {
                    warn!("Pmap::alloc_vnode: creating mapping CNode {} for {:?} failed with {:?}", i, cap, err);
                    release_all(authority, &mcn);
                    release_all(authority, &[invokable, cap]);
                    return Err(PmapError::Authority { op: AuthorityOp::CreateStorage, err });
                },
            }
        }

        pmap_debug_println!("Pmap::alloc_vnode: installing {:?} {:?} at entry {} of {:?}", objtype, cap, entry, parent_invokable);
        if let Err(err) = authority.install_table(parent_invokable,
                                                  cap,
                                                  entry as usize,
                                                  KpiPagingFlags::READ_WRITE,
                                                  mapping) {
            warn!("Pmap::alloc_vnode: installing {:?} at entry {} of {:?} failed with {:?}", cap, entry, parent_invokable, err);
            release_all(authority, &mcn);
            release_all(authority, &[invokable, cap]);
            return Err(PmapError::Authority { op: AuthorityOp::InstallTable, err });
        }

        let mut table = TableNode::new(cap, invokable, depth);
        table.mcn = mcn;
        table.mcnode = mcnode;
        let node = Vnode {
            entry,
            mapping,
            kind: VnodeKind::Table(table),
        };
        match self.tree.insert_child(parent, node) {
            Ok(id) => Ok(id),
            Err(_) => panic!("Pmap::alloc_vnode: slab exhausted after free count check (this shouldn't happen!)"),
        }
    }

    /// Gets the leaf table covering `vaddr`, creating any missing tables on
    /// the way down.
    pub(super) fn get_ptable<A: PmapBundle>(&mut self, vaddr: usize, alloc: &A) -> Result<VnodeId, PmapError> {
        let mut current = VnodeId::Root;
        for depth in 0..HIER_LEVELS - 1 {
            let entry = P::level_index(vaddr, depth);
            current = match self.tree.find_vnode(current, entry) {
                Some(id) => {
                    if self.tree.table(id).is_none() {
                        warn!("Pmap::get_ptable: mapping found instead of table at depth {} for {:x}", depth + 1, vaddr);
                        return Err(PmapError::ExistingMapping);
                    }
                    id
                },
                None => self.alloc_vnode(current, P::TABLE_TYPES[depth + 1], entry, alloc)?,
            };
        }
        Ok(current)
    }

    /// Gets the leaf table covering `vaddr` if all tables down to it exist.
    pub(super) fn find_ptable(&self, vaddr: usize) -> Option<VnodeId> {
        let mut current = VnodeId::Root;
        for depth in 0..HIER_LEVELS - 1 {
            let id = self.tree.find_vnode(current, P::level_index(vaddr, depth))?;
            self.tree.table(id)?;
            current = id;
        }
        Some(current)
    }
}

