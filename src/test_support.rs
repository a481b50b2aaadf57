// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! In-memory stand-ins for the capability system and allocators, with call
//! recording and failure injection.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::sync::Once;

use log::{Level, LevelFilter, Metadata, Record};

use crate::{
    authority::{
        AuthorityError,
        AuthorityManager,
        AuthorityOp,
        BufferProvider,
        CPtr,
        CapRef,
        CnodeRef,
        FrameAllocator,
        FrameError,
        ObjType,
    },
    flags::KpiPagingFlags,
};

/// Root CNode of the domain running the tests
pub const ROOT_CNODE: CPtr = 1;
/// Root CNode of some other domain
pub const FOREIGN_CNODE: CPtr = 2;

const OBJ_CNODE: CPtr = 0x10;
const FRAME_CNODE: CPtr = 0x20;
const COPY_CNODE: CPtr = 0x30;
const STORAGE_CNODE: CPtr = 0x40;
const ROOT_MAPPING_CNODE: CPtr = 0x50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstalledTable {
    pub parent: CapRef,
    pub child: CapRef,
    pub entry: usize,
    pub mapping: CapRef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstalledLeaf {
    pub table: CapRef,
    pub frame: CapRef,
    pub entry: usize,
    pub flags: KpiPagingFlags,
    pub offset: usize,
    pub pte_count: usize,
    pub mapping: CapRef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PermissionChange {
    pub mapping: CapRef,
    pub offset: usize,
    pub pages: usize,
    pub flags: KpiPagingFlags,
}

/// Capability system that hands out sequential slots
pub struct MockAuthority {
    next_slot: Cell<usize>,
    /// Root CNode new objects are created in
    pub object_croot: Cell<CPtr>,
    fail: Cell<Option<(AuthorityOp, usize)>>,
    live_mappings: RefCell<BTreeSet<CapRef>>,
    pub allocated: RefCell<Vec<ObjType>>,
    pub copies: RefCell<Vec<CapRef>>,
    pub storage: RefCell<Vec<CapRef>>,
    pub tables: RefCell<Vec<InstalledTable>>,
    pub leaves: RefCell<Vec<InstalledLeaf>>,
    pub removed: RefCell<Vec<CapRef>>,
    pub permission_changes: RefCell<Vec<PermissionChange>>,
    pub released: RefCell<Vec<CapRef>>,
}

impl MockAuthority {
    pub fn new() -> MockAuthority {
        MockAuthority {
            next_slot: Cell::new(1),
            object_croot: Cell::new(ROOT_CNODE),
            fail: Cell::new(None),
            live_mappings: RefCell::new(BTreeSet::new()),
            allocated: RefCell::new(Vec::new()),
            copies: RefCell::new(Vec::new()),
            storage: RefCell::new(Vec::new()),
            tables: RefCell::new(Vec::new()),
            leaves: RefCell::new(Vec::new()),
            removed: RefCell::new(Vec::new()),
            permission_changes: RefCell::new(Vec::new()),
            released: RefCell::new(Vec::new()),
        }
    }

    /// Makes the call to `op` after `skip` successful ones fail.
    pub fn fail_after(&self, op: AuthorityOp, skip: usize) {
        self.fail.set(Some((op, skip)));
    }

    /// Number of mapping slots currently holding a mapping.
    pub fn live_mapping_count(&self) -> usize {
        self.live_mappings.borrow().len()
    }

    fn check(&self, op: AuthorityOp) -> Result<(), AuthorityError> {
        match self.fail.get() {
            Some((fail_op, 0)) if fail_op == op => {
                self.fail.set(None);
                Err(AuthorityError::InvocationFailed { code: 1 })
            },
            Some((fail_op, n)) if fail_op == op => {
                self.fail.set(Some((fail_op, n - 1)));
                Ok(())
            },
            _ => Ok(()),
        }
    }

    fn slot(&self, croot: CPtr, cnode: CPtr) -> CapRef {
        let slot = self.next_slot.get();
        self.next_slot.set(slot + 1);
        CapRef::new(CnodeRef { croot, cnode }, slot)
    }

    fn occupy(&self, mapping: CapRef) -> Result<(), AuthorityError> {
        if !self.live_mappings.borrow_mut().insert(mapping) {
            return Err(AuthorityError::SlotOccupied);
        }
        Ok(())
    }
}

impl AuthorityManager for MockAuthority {
    fn root_cnode(&self) -> CPtr {
        ROOT_CNODE
    }

    fn root_mapping_storage(&self) -> (CapRef, CnodeRef) {
        (CapRef::new(CnodeRef { croot: ROOT_CNODE, cnode: ROOT_CNODE }, 6),
         CnodeRef { croot: ROOT_CNODE, cnode: ROOT_MAPPING_CNODE })
    }

    fn allocate_authority(&self, objtype: ObjType) -> Result<CapRef, AuthorityError> {
        self.check(AuthorityOp::AllocateAuthority)?;
        self.allocated.borrow_mut().push(objtype);
        Ok(self.slot(self.object_croot.get(), OBJ_CNODE))
    }

    fn copy_authority(&self, src: CapRef) -> Result<CapRef, AuthorityError> {
        self.check(AuthorityOp::CopyAuthority)?;
        if src.is_null() {
            return Err(AuthorityError::InvalidCapability);
        }
        let copy = self.slot(ROOT_CNODE, COPY_CNODE);
        self.copies.borrow_mut().push(copy);
        Ok(copy)
    }

    fn create_storage(&self) -> Result<(CapRef, CnodeRef), AuthorityError> {
        self.check(AuthorityOp::CreateStorage)?;
        let cap = self.slot(ROOT_CNODE, STORAGE_CNODE);
        self.storage.borrow_mut().push(cap);
        Ok((cap, CnodeRef { croot: ROOT_CNODE, cnode: (STORAGE_CNODE << 16) | cap.slot }))
    }

    fn install_table(&self,
                     parent: CapRef,
                     child: CapRef,
                     entry: usize,
                     _flags: KpiPagingFlags,
                     mapping: CapRef) -> Result<(), AuthorityError> {
        self.check(AuthorityOp::InstallTable)?;
        if parent.croot() != ROOT_CNODE {
            return Err(AuthorityError::InvalidCapability);
        }
        self.occupy(mapping)?;
        self.tables.borrow_mut().push(InstalledTable { parent, child, entry, mapping });
        Ok(())
    }

    fn install_leaf(&self,
                    table: CapRef,
                    frame: CapRef,
                    entry: usize,
                    flags: KpiPagingFlags,
                    offset: usize,
                    pte_count: usize,
                    mapping: CapRef) -> Result<(), AuthorityError> {
        self.check(AuthorityOp::InstallLeaf)?;
        if table.croot() != ROOT_CNODE {
            return Err(AuthorityError::InvalidCapability);
        }
        self.occupy(mapping)?;
        self.leaves.borrow_mut().push(InstalledLeaf {
            table,
            frame,
            entry,
            flags,
            offset,
            pte_count,
            mapping,
        });
        Ok(())
    }

    fn remove_mapping(&self, _table: CapRef, mapping: CapRef) -> Result<(), AuthorityError> {
        self.check(AuthorityOp::RemoveMapping)?;
        if !self.live_mappings.borrow().contains(&mapping) {
            return Err(AuthorityError::InvalidCapability);
        }
        self.removed.borrow_mut().push(mapping);
        Ok(())
    }

    fn change_permissions(&self,
                          mapping: CapRef,
                          offset: usize,
                          pages: usize,
                          flags: KpiPagingFlags) -> Result<(), AuthorityError> {
        self.check(AuthorityOp::ChangePermissions)?;
        if !self.live_mappings.borrow().contains(&mapping) {
            return Err(AuthorityError::InvalidCapability);
        }
        self.permission_changes.borrow_mut().push(PermissionChange { mapping, offset, pages, flags });
        Ok(())
    }

    fn release_authority(&self, cap: CapRef) -> Result<(), AuthorityError> {
        self.check(AuthorityOp::ReleaseAuthority)?;
        self.live_mappings.borrow_mut().remove(&cap);
        self.released.borrow_mut().push(cap);
        Ok(())
    }
}

/// Frame allocator with configurable size limits
pub struct MockFrames {
    next_slot: Cell<usize>,
    /// Requests above this size fail with `WrongSize`
    pub max_bytes: Cell<Option<usize>>,
    /// Every frame is this size regardless of the request
    pub fixed_size: Cell<Option<usize>>,
    pub exhausted: Cell<bool>,
    pub requests: RefCell<Vec<usize>>,
}

impl MockFrames {
    pub fn new() -> MockFrames {
        MockFrames {
            next_slot: Cell::new(1),
            max_bytes: Cell::new(None),
            fixed_size: Cell::new(None),
            exhausted: Cell::new(false),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Gets a frame without going through the allocator interface.
    pub fn frame(&self) -> CapRef {
        let slot = self.next_slot.get();
        self.next_slot.set(slot + 1);
        CapRef::new(CnodeRef { croot: ROOT_CNODE, cnode: FRAME_CNODE }, slot)
    }
}

impl FrameAllocator for MockFrames {
    fn allocate_frame(&self, bytes: usize) -> Result<(CapRef, usize), FrameError> {
        self.requests.borrow_mut().push(bytes);
        if self.exhausted.get() {
            return Err(FrameError::OutOfMemory);
        }
        if self.max_bytes.get().map_or(false, |max| bytes > max) {
            return Err(FrameError::WrongSize);
        }
        Ok((self.frame(), self.fixed_size.get().unwrap_or(bytes)))
    }
}

/// Buffer provider that hands out fake addresses
pub struct MockBuffers {
    next_addr: Cell<usize>,
    pub fail: Cell<bool>,
    pub requests: RefCell<Vec<usize>>,
}

impl MockBuffers {
    pub fn new() -> MockBuffers {
        MockBuffers {
            next_addr: Cell::new(0x1000_0000),
            fail: Cell::new(false),
            requests: RefCell::new(Vec::new()),
        }
    }
}

impl BufferProvider for MockBuffers {
    fn allocate_buffer(&self, bytes: usize) -> Result<usize, ()> {
        self.requests.borrow_mut().push(bytes);
        if self.fail.get() {
            return Err(());
        }
        let addr = self.next_addr.get();
        self.next_addr.set(addr + bytes);
        Ok(addr)
    }
}

pub type MockBundle = (MockAuthority, MockFrames, MockBuffers);

pub fn bundle() -> MockBundle {
    init_logger();
    (MockAuthority::new(), MockFrames::new(), MockBuffers::new())
}

struct TestLogger;

impl log::Log for TestLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("pmap: {}: {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;
static LOGGER_INIT: Once = Once::new();

/// Sends log output to the test harness's captured stdout.
pub fn init_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Debug));
    });
}
