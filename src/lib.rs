// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(test), no_std)]

//! Page-table metadata management.
//!
//! A `Pmap` keeps a tree of vnodes mirroring the hardware paging structures
//! of one address space. Every table and every mapping in the tree is
//! backed by a capability obtained from an external authority system; this
//! crate only tracks them and drives the install/remove invocations.
//!
//! The vnodes themselves live in a slab allocator that the pmap refills by
//! mapping fresh frames through its own mapping engine.

extern crate alloc;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
#[macro_use]
extern crate intrusive_collections;
extern crate bitflags;

#[macro_export]
macro_rules! pmap_debug_println {
    ($($toks:tt)*) => ({
        #[cfg(feature = "debug_pmap")]
        debug!($($toks)*);
    })
}

#[macro_export]
macro_rules! refill_debug_println {
    ($($toks:tt)*) => ({
        #[cfg(feature = "debug_refill")]
        debug!($($toks)*);
    })
}

/// Paging hierarchy descriptions
pub mod arch;
pub use arch::{AArch64, DefaultArch, PagingArch, X86_64};

pub mod flags;
pub use flags::{KpiPagingFlags, VregionFlags};

/// Interfaces to the capability system and memory allocators
pub mod authority;
pub use authority::{
    AuthorityError,
    AuthorityManager,
    AuthorityOp,
    BufferProvider,
    CapRef,
    CnodeRef,
    FrameAllocator,
    FrameError,
    ObjType,
    PmapBundle,
};

pub mod slab;

pub mod vnode;

pub mod vregion;
pub use vregion::{Vregion, VregionList};

/// Address space management
pub mod pmap;
pub use pmap::{MappingInfo, Pmap, PmapConfig, PmapError, Residency};

#[cfg(test)]
mod test_support;

/// Rounds `n` up to a multiple of `align`.
#[inline]
pub(crate) const fn round_up(n: usize, align: usize) -> usize {
    divide_round_up(n, align) * align
}

#[inline]
pub(crate) const fn divide_round_up(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

/// Rounds `n` up to a multiple of `align`, or `None` on overflow.
#[inline]
pub(crate) fn checked_round_up(n: usize, align: usize) -> Option<usize> {
    n.checked_add(align - 1).map(|n| n / align * align)
}
