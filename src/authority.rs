// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::flags::KpiPagingFlags;

/// Capability address
pub type CPtr = usize;

/// Reference to a CNode, addressed through a root CNode
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CnodeRef {
    pub croot: CPtr,
    pub cnode: CPtr,
}

impl CnodeRef {
    pub const NULL: CnodeRef = CnodeRef { croot: 0, cnode: 0 };

    pub fn is_null(&self) -> bool {
        self.croot == 0 && self.cnode == 0
    }
}

/// Reference to a capability slot
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapRef {
    pub cnode: CnodeRef,
    pub slot: usize,
}

impl CapRef {
    pub const NULL: CapRef = CapRef { cnode: CnodeRef::NULL, slot: 0 };

    pub fn new(cnode: CnodeRef, slot: usize) -> CapRef {
        CapRef { cnode, slot }
    }

    pub fn is_null(&self) -> bool {
        self.cnode.is_null() && self.slot == 0
    }

    /// Gets the root CNode through which this capability is addressed
    pub fn croot(&self) -> CPtr {
        self.cnode.croot
    }
}

impl fmt::Debug for CapRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}:{:x}:{:x}", self.cnode.croot, self.cnode.cnode, self.slot)
    }
}

/// Kernel object types the pmap creates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjType {
    VNodeX86_64Pml4,
    VNodeX86_64Pdpt,
    VNodeX86_64Pdir,
    VNodeX86_64Ptable,
    VNodeAArch64L0,
    VNodeAArch64L1,
    VNodeAArch64L2,
    VNodeAArch64L3,
}

/// Errors returned by the capability system
#[derive(Clone, Copy, Debug, Fail, PartialEq, Eq)]
pub enum AuthorityError {
    #[fail(display = "No free capability slots")]
    SlotsExhausted,
    #[fail(display = "Out of untyped memory")]
    OutOfMemory,
    #[fail(display = "Invalid capability")]
    InvalidCapability,
    #[fail(display = "Destination slot occupied")]
    SlotOccupied,
    #[fail(display = "Invocation failed")]
    InvocationFailed { code: usize },
}

/// The capability-system primitive that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorityOp {
    AllocateAuthority,
    CopyAuthority,
    CreateStorage,
    InstallTable,
    InstallLeaf,
    RemoveMapping,
    ChangePermissions,
    ReleaseAuthority,
}

impl fmt::Display for AuthorityOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            AuthorityOp::AllocateAuthority => "allocate",
            AuthorityOp::CopyAuthority => "copy",
            AuthorityOp::CreateStorage => "create mapping CNode",
            AuthorityOp::InstallTable => "install table",
            AuthorityOp::InstallLeaf => "install mapping",
            AuthorityOp::RemoveMapping => "remove mapping",
            AuthorityOp::ChangePermissions => "modify flags",
            AuthorityOp::ReleaseAuthority => "delete",
        };
        f.write_str(name)
    }
}

/// Errors returned by the frame allocator
#[derive(Clone, Copy, Debug, Fail, PartialEq, Eq)]
pub enum FrameError {
    #[fail(display = "Out of physical memory")]
    OutOfMemory,
    /// The allocator cannot hand out a frame of this size yet (for
    /// instance before a connection to the memory server exists); single
    /// base pages may still be available.
    #[fail(display = "Requested frame size not available")]
    WrongSize,
    #[fail(display = "Capability allocation error")]
    Authority { err: AuthorityError },
}

/// The capability system, as seen from one domain.
///
/// All methods are synchronous invocations; none of them is retried by the
/// pmap.
pub trait AuthorityManager {
    /// Address of the calling domain's root CNode. Capabilities addressed
    /// through any other root cannot be invoked directly.
    fn root_cnode(&self) -> CPtr;

    /// The pre-reserved CNode used for mappings in the first half of the
    /// calling domain's own root table (CNodes cannot be created before
    /// the domain can allocate memory).
    fn root_mapping_storage(&self) -> (CapRef, CnodeRef);

    /// Allocates a slot and creates a new paging object of type `objtype`
    /// in it.
    fn allocate_authority(&self, objtype: ObjType) -> Result<CapRef, AuthorityError>;

    /// Copies `src` into a newly allocated slot of the calling domain's
    /// CSpace.
    fn copy_authority(&self, src: CapRef) -> Result<CapRef, AuthorityError>;

    /// Creates a CNode for storing mapping capabilities, returning the
    /// capability to it and a reference for addressing its slots.
    fn create_storage(&self) -> Result<(CapRef, CnodeRef), AuthorityError>;

    /// Installs `child` at `entry` of `parent`, storing the resulting mapping
    /// capability in `mapping`.
    fn install_table(&self,
                     parent: CapRef,
                     child: CapRef,
                     entry: usize,
                     flags: KpiPagingFlags,
                     mapping: CapRef) -> Result<(), AuthorityError>;

    /// Maps `pte_count` pages of `frame` starting at byte `offset` into
    /// `table` starting at `entry`, storing the mapping capability in
    /// `mapping`.
    fn install_leaf(&self,
                    table: CapRef,
                    frame: CapRef,
                    entry: usize,
                    flags: KpiPagingFlags,
                    offset: usize,
                    pte_count: usize,
                    mapping: CapRef) -> Result<(), AuthorityError>;

    /// Removes the mapping identified by `mapping` from `table`.
    fn remove_mapping(&self, table: CapRef, mapping: CapRef) -> Result<(), AuthorityError>;

    /// Changes the flags of `pages` pages of a mapping, starting `offset`
    /// pages into it.
    fn change_permissions(&self,
                          mapping: CapRef,
                          offset: usize,
                          pages: usize,
                          flags: KpiPagingFlags) -> Result<(), AuthorityError>;

    /// Deletes a capability.
    fn release_authority(&self, cap: CapRef) -> Result<(), AuthorityError>;
}

/// Physical memory allocator
pub trait FrameAllocator {
    /// Allocates a frame of at least `bytes` bytes, returning its capability
    /// and actual size.
    fn allocate_frame(&self, bytes: usize) -> Result<(CapRef, usize), FrameError>;
}

/// Supplier of plain memory for growing the metadata slab of a pmap that
/// is not the calling domain's own.
pub trait BufferProvider {
    /// Allocates `bytes` bytes, returning the start address.
    fn allocate_buffer(&self, bytes: usize) -> Result<usize, ()>;
}

/// Bundle of the external services needed by pmap operations.
pub trait PmapBundle {
    type Authority: AuthorityManager;
    type Frames: FrameAllocator;
    type Buffers: BufferProvider;

    ///Get the capability system
    fn authority(&self) -> &Self::Authority;
    ///Get the frame allocator
    fn frames(&self) -> &Self::Frames;
    ///Get the buffer provider
    fn buffers(&self) -> &Self::Buffers;
}

impl<C, F, B> PmapBundle for (C, F, B)
where
    C: AuthorityManager,
    F: FrameAllocator,
    B: BufferProvider,
{
    type Authority = C;
    type Frames = F;
    type Buffers = B;

    fn authority(&self) -> &C {
        &self.0
    }

    fn frames(&self) -> &F {
        &self.1
    }

    fn buffers(&self) -> &B {
        &self.2
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_refs() {
        assert!(CapRef::NULL.is_null());
        assert!(CnodeRef::NULL.is_null());
        let cnode = CnodeRef { croot: 1, cnode: 0x20 };
        let cap = CapRef::new(cnode, 0);
        assert!(!cap.is_null());
        assert_eq!(cap.croot(), 1);
    }
}
