// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Address space objects.
//!
//! A `Pmap` owns the vnode tree of one address space. It creates tables
//! lazily as mappings need them, splits mappings at leaf table boundaries,
//! and keeps its own node slab stocked, mapping fresh frames through itself
//! when it manages the caller's own address space.

mod mapping;
mod refill;
mod walk;


use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

use crate::{
    arch::{DefaultArch, PagingArch, BASE_PAGE_SIZE, PTABLE_ENTRIES},
    authority::{
        AuthorityError,
        AuthorityManager,
        AuthorityOp,
        CapRef,
        FrameError,
        PmapBundle,
    },
    flags::VregionFlags,
    round_up,
    slab::{Slab, SlabBacking},
    vnode::{TableNode, Vnode, VnodeKind, VnodeTree},
    vregion::{Vregion, VregionList},
};

pub use self::refill::{max_slabs_required, slabs_required};

/// Number of nodes in the slab buffer a pmap starts with
pub const INIT_SLAB_BUFFER_NODES: usize = 32;

/// Free nodes kept in reserve beyond the worst case of a mapping, so that a
/// later refill can always map at least one page
pub const SLABS_RESERVE: usize = max_slabs_required(BASE_PAGE_SIZE);

/// Pmap error codes
#[derive(Clone, Copy, Debug, Fail, PartialEq, Eq)]
pub enum PmapError {
    #[fail(display = "Capability operation ({}) failed: {}", op, err)]
    Authority { op: AuthorityOp, err: AuthorityError },
    #[fail(display = "Frame allocation failed: {}", err)]
    FrameAlloc { err: FrameError },
    #[fail(display = "Mapping already present in range")]
    ExistingMapping,
    #[fail(display = "No mapping exactly matching the range")]
    FindVnode,
    #[fail(display = "Range crosses the boundary of an existing mapping")]
    ExistingMappingConflict,
    #[fail(display = "Out of virtual address space")]
    OutOfVirtualAddr,
    #[fail(display = "Invalid argument {}", which)]
    InvalidArgument { which: usize },
    #[fail(display = "Table has no mapping CNode for entry")]
    MappingStorageMissing,
    #[fail(display = "Metadata region not reserved")]
    MetadataRegionMissing,
    #[fail(display = "Not implemented")]
    NotImplemented,
    #[fail(display = "Vnode slab exhausted")]
    SlabAllocFail,
    #[fail(display = "Buffer allocation failed")]
    BufferAllocFail,
}

/// Whose address space a pmap manages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// The caller's own, active address space. Its slab can be refilled by
    /// mapping frames through the pmap itself.
    Current,
    /// Another domain's address space. Its slab is grown from buffers.
    Foreign,
}

/// Address space layout parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmapConfig {
    /// Lowest address at which new regions are placed; the metadata region
    /// starts here
    pub vspace_begin: usize,
    /// Size of the region reserved for slab refills
    pub meta_reserved_bytes: usize,
    pub min_mappable_va: usize,
    pub max_mappable_va: usize,
}

impl PmapConfig {
    /// Default layout for a domain running on core `core_id`. Each core's
    /// domains start at a different L0 entry.
    pub fn for_core<P: PagingArch>(core_id: usize) -> PmapConfig {
        PmapConfig {
            vspace_begin: PTABLE_ENTRIES * PTABLE_ENTRIES * PTABLE_ENTRIES * BASE_PAGE_SIZE * (core_id + 1),
            meta_reserved_bytes: BASE_PAGE_SIZE * 256000,
            min_mappable_va: 64 * 1024,
            max_mappable_va: P::MAX_MAPPABLE_VA,
        }
    }
}

/// One installed run of pages, as reconstructed from the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingInfo {
    pub vaddr: usize,
    pub size: usize,
    pub frame: CapRef,
    pub offset: usize,
    pub flags: VregionFlags,
}

/// The virtual region backing slab refills
#[derive(Clone, Copy, Debug)]
struct MetaRegion {
    base: usize,
    size: usize,
    cursor: usize,
}

/// Page table manager for one address space
pub struct Pmap<P: PagingArch = DefaultArch> {
    tree: VnodeTree,
    meta: Option<MetaRegion>,
    residency: Residency,
    config: PmapConfig,
    _arch: PhantomData<P>,
}

impl<P: PagingArch> Pmap<P> {
    /// Creates a pmap for the address space rooted at `vnode`.
    pub fn new<A: PmapBundle>(vnode: CapRef,
                              config: PmapConfig,
                              residency: Residency,
                              alloc: &A) -> Result<Pmap<P>, PmapError> {
        let authority = alloc.authority();
        let invokable = if vnode.croot() != authority.root_cnode() {
            authority.copy_authority(vnode).map_err(|err| {
                warn!("Pmap::new: copying root vnode {:?} failed with {:?}", vnode, err);
                PmapError::Authority { op: AuthorityOp::CopyAuthority, err }
            })?
        } else {
            vnode
        };

        let mut root = TableNode::new(vnode, invokable, 0);
        let storage = match residency {
            Residency::Current => Ok(authority.root_mapping_storage()),
            Residency::Foreign => authority.create_storage(),
        };
        match storage {
            Ok((mcn, mcnode)) => {
                root.mcn[0] = mcn;
                root.mcnode[0] = mcnode;
            },
            Err(err) => {
                warn!("Pmap::new: creating root mapping CNode failed with {:?}", err);
                if invokable != vnode {
                    let _ = authority.release_authority(invokable);
                }
                return Err(PmapError::Authority { op: AuthorityOp::CreateStorage, err });
            },
        }

        let mut tree = VnodeTree::new(root);
        tree.grow_slab(SlabBacking::Static, Slab::<Vnode>::static_size(INIT_SLAB_BUFFER_NODES));
        pmap_debug_println!("Pmap::new: {} root {:?} ({:?}), {:?}", P::NAME, vnode, invokable, residency);

        Ok(Pmap {
            tree,
            meta: None,
            residency,
            config,
            _arch: PhantomData,
        })
    }

    /// Reserves the metadata region of the caller's own pmap at
    /// `vspace_begin`. `regions` must not yet contain anything there.
    pub fn current_init(&mut self, regions: &mut VregionList) -> Result<(), PmapError> {
        if self.residency != Residency::Current {
            warn!("Pmap::current_init: called on a foreign pmap");
            return Err(PmapError::InvalidArgument { which: 0 });
        }
        let base = self.config.vspace_begin;
        let size = self.config.meta_reserved_bytes;
        if regions.insert(Vregion::new(base, size, VregionFlags::empty())).is_err() {
            warn!("Pmap::current_init: metadata region {:x}-{:x} already occupied", base, base + size);
            return Err(PmapError::ExistingMapping);
        }
        self.meta = Some(MetaRegion { base, size, cursor: 0 });
        Ok(())
    }

    /// Finds a free range of at least `size` bytes in `regions`, aligned to
    /// `alignment` (a base page if 0).
    pub fn determine_addr(&self,
                          regions: &VregionList,
                          size: usize,
                          alignment: usize) -> Result<usize, PmapError> {
        let alignment = if alignment == 0 {
            BASE_PAGE_SIZE
        } else {
            round_up(alignment, BASE_PAGE_SIZE)
        };
        let rounded = round_up(size, alignment);

        let vaddr = match regions.last() {
            None => round_up(self.config.vspace_begin, alignment),
            Some(last) => {
                let mut found = None;
                let mut iter = regions.iter().peekable();
                while let (Some(walk), Some(next)) = (iter.next(), iter.peek()) {
                    let walk_end = round_up(walk.base() + round_up(walk.size(), BASE_PAGE_SIZE), alignment);
                    if next.base() > walk_end + rounded && walk_end > self.config.vspace_begin {
                        found = Some(walk_end);
                        break;
                    }
                }
                found.unwrap_or_else(|| {
                    round_up(last.base() + round_up(last.size(), BASE_PAGE_SIZE), alignment)
                })
            },
        };

        match vaddr.checked_add(size) {
            Some(end) if end <= self.config.max_mappable_va => Ok(vaddr),
            _ => {
                warn!("Pmap::determine_addr: no space for {} bytes (candidate {:x}, limit {:x})", size, vaddr, self.config.max_mappable_va);
                Err(PmapError::OutOfVirtualAddr)
            },
        }
    }

    /// Looks up the mapping containing `vaddr`.
    pub fn lookup(&self, vaddr: usize) -> Result<MappingInfo, PmapError> {
        warn!("Pmap::lookup: not implemented (vaddr {:x})", vaddr);
        Err(PmapError::NotImplemented)
    }

    /// Serialises the tree into `buf`. Nothing is written.
    pub fn serialise(&self, _buf: &mut [u8]) -> Result<(), PmapError> {
        Ok(())
    }

    /// Restores the tree from `buf`. Nothing is read.
    pub fn deserialise(&mut self, _buf: &[u8]) -> Result<(), PmapError> {
        Ok(())
    }

    pub fn config(&self) -> &PmapConfig {
        &self.config
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Capability to the root table, and the copy of it used for invocations.
    pub fn root_vnode(&self) -> (CapRef, CapRef) {
        let root = self.tree.root();
        (root.cap, root.invokable)
    }

    /// Number of page tables in the tree, including the root.
    pub fn table_count(&self) -> usize {
        self.tree.table_count()
    }

    /// Number of vnodes that can be allocated without refilling.
    pub fn slab_free_count(&self) -> usize {
        self.tree.slab().free_count()
    }

    pub(crate) fn tree(&self) -> &VnodeTree {
        &self.tree
    }

    /// Lists all installed runs in address order.
    pub fn mappings(&self) -> Vec<MappingInfo> {
        let mut ret = Vec::new();
        self.tree.walk::<P, _>(&mut |vaddr, _, node| {
            if let VnodeKind::Leaf(ref leaf) = node.kind {
                ret.push(MappingInfo {
                    vaddr,
                    size: leaf.pte_count * BASE_PAGE_SIZE,
                    frame: leaf.frame,
                    offset: leaf.offset,
                    flags: leaf.flags,
                });
            }
        });
        ret
    }
}

impl<P: PagingArch> fmt::Debug for Pmap<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (cap, invokable) = self.root_vnode();
        write!(f, "Pmap ({}, {:?}) root cap={:?} invokable={:?}\n", P::NAME, self.residency, cap, invokable)?;
        if let Some(meta) = self.meta {
            write!(f, "Metadata region {:12x} to {:12x}, used {:x}\n", meta.base, meta.base + meta.size, meta.cursor)?;
        }
        let mut ret = Ok(());
        self.tree.walk::<P, _>(&mut |vaddr, depth, node| {
            if ret.is_err() {
                return;
            }
            for _ in 1..depth {
                ret = ret.and_then(|_| f.write_str("      "));
            }
            ret = ret.and_then(|_| match node.kind {
                VnodeKind::Table(ref table) => {
                    write!(f,
                           "PageTable --------{:->12x}--to--{:->12x}-------- entry {} cap={:?}\n",
                           vaddr,
                           vaddr + P::entry_span(depth - 1) - 1,
                           node.entry,
                           table.cap)
                },
                VnodeKind::Leaf(ref leaf) => {
                    write!(f,
                           "{:12x} to {:12x}: {} pages from {:?}+{:x} flags={:?}\n",
                           vaddr,
                           vaddr + leaf.pte_count * BASE_PAGE_SIZE - 1,
                           leaf.pte_count,
                           leaf.frame,
                           leaf.offset,
                           leaf.flags)
                },
            });
        });
        ret?;
        write!(f, "{:?}\n", self.tree.slab())
    }
}

/// Releases capabilities that were obtained for an operation that failed
/// partway through.
fn release_all<C: AuthorityManager>(authority: &C, caps: &[CapRef]) {
    for (i, cap) in caps.iter().enumerate() {
        if cap.is_null() || caps[..i].contains(cap) {
            continue;
        }
        if let Err(err) = authority.release_authority(*cap) {
            warn!("release_all: deleting {:?} failed with {:?}", cap, err);
        }
    }
}
