// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The vnode tree.
//!
//! This mirrors the hardware paging structures of an address space. Each
//! table node owns its children through an ordered map from entry index to
//! slab block index; the root table lives outside the slab and is never
//! freed. A leaf covers a run of `pte_count` consecutive entries of its
//! table, all backed by one frame.

use alloc::collections::BTreeMap;
use core::fmt;

use crate::{
    arch::{PagingArch, L2_CNODE_SLOTS, MCN_COUNT},
    authority::{CapRef, CnodeRef},
    flags::VregionFlags,
    pmap::PmapError,
    slab::{Slab, SlabBacking},
};

/// Identifies a node of the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VnodeId {
    Root,
    Slab(usize),
}

/// A page table at some level of the hierarchy
pub struct TableNode {
    /// Capability to the table object
    pub cap: CapRef,
    /// Copy of `cap` that can be invoked from this domain (the same as
    /// `cap` if the table was created here)
    pub invokable: CapRef,
    /// Depth in the hierarchy; 0 is the root
    pub depth: u8,
    /// Capabilities to the CNodes holding this table's mapping capabilities
    pub mcn: [CapRef; MCN_COUNT],
    /// Addresses of the same CNodes, for naming slots in them
    pub mcnode: [CnodeRef; MCN_COUNT],
    children: BTreeMap<u16, usize>,
}

impl TableNode {
    pub fn new(cap: CapRef, invokable: CapRef, depth: u8) -> TableNode {
        TableNode {
            cap,
            invokable,
            depth,
            mcn: [CapRef::NULL; MCN_COUNT],
            mcnode: [CnodeRef::NULL; MCN_COUNT],
            children: BTreeMap::new(),
        }
    }

    /// Gets the slot that holds the mapping capability for `entry`.
    pub fn mapping_slot(&self, entry: u16) -> Result<CapRef, PmapError> {
        let entry = entry as usize;
        let cnode = self.mcnode[entry / L2_CNODE_SLOTS];
        if cnode.is_null() {
            warn!("TableNode::mapping_slot: no mapping CNode for entry {} of table {:?}", entry, self.cap);
            return Err(PmapError::MappingStorageMissing);
        }
        Ok(CapRef::new(cnode, entry % L2_CNODE_SLOTS))
    }

    /// Number of children of this table.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// A run of consecutive pages mapped from one frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafNode {
    pub frame: CapRef,
    /// Byte offset of the first page within `frame`
    pub offset: usize,
    pub flags: VregionFlags,
    pub pte_count: usize,
}

pub enum VnodeKind {
    Table(TableNode),
    Leaf(LeafNode),
}

/// A node of the tree
pub struct Vnode {
    /// Index of the (first) entry of the parent table this node occupies
    pub entry: u16,
    /// Mapping capability recording this node's installation in its parent
    /// (null for the root)
    pub mapping: CapRef,
    pub kind: VnodeKind,
}

impl Vnode {
    /// Number of parent table entries this node occupies.
    pub fn span(&self) -> usize {
        match self.kind {
            VnodeKind::Table(_) => 1,
            VnodeKind::Leaf(ref leaf) => leaf.pte_count,
        }
    }

    pub fn as_table(&self) -> Option<&TableNode> {
        match self.kind {
            VnodeKind::Table(ref table) => Some(table),
            VnodeKind::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self.kind {
            VnodeKind::Leaf(ref leaf) => Some(leaf),
            VnodeKind::Table(_) => None,
        }
    }

    fn covers(&self, entry: u16) -> bool {
        let entry = entry as usize;
        entry >= self.entry as usize && entry < self.entry as usize + self.span()
    }
}

/// The tree of vnodes of one address space, with the slab its nodes are
/// allocated from
pub struct VnodeTree {
    root: Vnode,
    slab: Slab<Vnode>,
}

impl VnodeTree {
    pub fn new(root: TableNode) -> VnodeTree {
        VnodeTree {
            root: Vnode {
                entry: 0,
                mapping: CapRef::NULL,
                kind: VnodeKind::Table(root),
            },
            slab: Slab::new(),
        }
    }

    pub fn slab(&self) -> &Slab<Vnode> {
        &self.slab
    }

    /// Adds backing memory to the node slab, returning the number of nodes
    /// added.
    pub fn grow_slab(&mut self, backing: SlabBacking, bytes: usize) -> usize {
        self.slab.grow(backing, bytes)
    }

    pub fn root(&self) -> &TableNode {
        match self.root.kind {
            VnodeKind::Table(ref table) => table,
            VnodeKind::Leaf(_) => panic!("VnodeTree: root is a leaf (this shouldn't happen!)"),
        }
    }

    pub fn root_mut(&mut self) -> &mut TableNode {
        match self.root.kind {
            VnodeKind::Table(ref mut table) => table,
            VnodeKind::Leaf(_) => panic!("VnodeTree: root is a leaf (this shouldn't happen!)"),
        }
    }

    pub fn node(&self, id: VnodeId) -> Option<&Vnode> {
        match id {
            VnodeId::Root => Some(&self.root),
            VnodeId::Slab(index) => self.slab.get(index),
        }
    }

    pub fn node_mut(&mut self, id: VnodeId) -> Option<&mut Vnode> {
        match id {
            VnodeId::Root => Some(&mut self.root),
            VnodeId::Slab(index) => self.slab.get_mut(index),
        }
    }

    pub fn table(&self, id: VnodeId) -> Option<&TableNode> {
        self.node(id).and_then(|n| n.as_table())
    }

    pub fn table_mut(&mut self, id: VnodeId) -> Option<&mut TableNode> {
        self.node_mut(id).and_then(|n| match n.kind {
            VnodeKind::Table(ref mut table) => Some(table),
            VnodeKind::Leaf(_) => None,
        })
    }

    /// Finds the child of `table` at `entry`. A leaf is also found if
    /// `entry` lies anywhere within the run it covers.
    pub fn find_vnode(&self, table: VnodeId, entry: u16) -> Option<VnodeId> {
        let table = self.table(table)?;
        let (_, &index) = table.children.range(..=entry).next_back()?;
        let node = self.slab.get(index)?;
        if node.covers(entry) {
            Some(VnodeId::Slab(index))
        } else {
            None
        }
    }

    /// Checks whether any child of `table` occupies an entry in
    /// `[entry, entry + count)`.
    pub fn has_vnode(&self, table: VnodeId, entry: u16, count: usize) -> bool {
        if self.find_vnode(table, entry).is_some() {
            return true;
        }
        let table = match self.table(table) {
            Some(t) => t,
            None => return false,
        };
        let end = entry as usize + count;
        table.children.range(entry..).next().map_or(false, |(&e, _)| (e as usize) < end)
    }

    /// Checks whether `[entry, entry + count)` lies entirely within a single
    /// leaf of `table`.
    pub fn inside_region(&self, table: VnodeId, entry: u16, count: usize) -> bool {
        match self.find_vnode(table, entry).and_then(|id| self.node(id)) {
            Some(node) if node.as_leaf().is_some() => {
                entry as usize + count <= node.entry as usize + node.span()
            },
            _ => false,
        }
    }

    /// Allocates a slab block for `node` and links it into `parent`. The
    /// node is handed back if the slab is exhausted.
    pub fn insert_child(&mut self, parent: VnodeId, node: Vnode) -> Result<VnodeId, Vnode> {
        if self.table(parent).is_none() {
            panic!("VnodeTree::insert_child: parent {:?} is not a table (this shouldn't happen!)", parent);
        }
        let entry = node.entry;
        let index = self.slab.alloc(node)?;
        let occupied = match self.table_mut(parent) {
            Some(table) => table.children.insert(entry, index).is_some(),
            None => true,
        };
        if occupied {
            panic!("VnodeTree::insert_child: entry {} of {:?} already occupied", entry, parent);
        }
        Ok(VnodeId::Slab(index))
    }

    /// Unlinks the child of `parent` that starts at `entry` and frees its
    /// slab block, returning it.
    pub fn remove_child(&mut self, parent: VnodeId, entry: u16) -> Option<Vnode> {
        let index = self.table_mut(parent)?.children.remove(&entry)?;
        self.slab.free(index)
    }

    /// Iterates over the children of `table` in entry order.
    pub fn children<'a>(&'a self, table: &'a TableNode) -> impl Iterator<Item = (VnodeId, &'a Vnode)> + 'a {
        table.children.values().filter_map(move |&index| {
            self.slab.get(index).map(|n| (VnodeId::Slab(index), n))
        })
    }

    /// Calls `f` with the base address, depth and contents of every
    /// non-root node, in address order (tables before their contents).
    pub fn walk<P: PagingArch, F: FnMut(usize, usize, &Vnode)>(&self, f: &mut F) {
        self.walk_inner::<P, F>(self.root(), 0, f);
    }

    fn walk_inner<P: PagingArch, F: FnMut(usize, usize, &Vnode)>(&self, table: &TableNode, base: usize, f: &mut F) {
        let depth = table.depth as usize;
        for (_, node) in self.children(table) {
            let vaddr = base + ((node.entry as usize) << P::level_shift(depth));
            f(vaddr, depth + 1, node);
            if let VnodeKind::Table(ref child) = node.kind {
                self.walk_inner::<P, F>(child, vaddr, f);
            }
        }
    }

    /// Number of table nodes, including the root.
    pub fn table_count(&self) -> usize {
        1 + self.count_tables(self.root())
    }

    fn count_tables(&self, table: &TableNode) -> usize {
        self.children(table).map(|(_, node)| match node.kind {
            VnodeKind::Table(ref child) => 1 + self.count_tables(child),
            VnodeKind::Leaf(_) => 0,
        }).sum()
    }
}

impl fmt::Debug for VnodeTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VnodeTree {{ root: {:?}, {:?} }}", self.root().cap, self.slab)
    }
}
