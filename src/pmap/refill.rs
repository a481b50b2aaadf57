// Copyright 2019-2021 Andrew Warkentin
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Refilling the vnode slab of the caller's own pmap.
//!
//! New slab memory is obtained as frames and mapped into the metadata
//! region through the pmap itself, which may need vnodes of its own. If
//! there are not enough free vnodes to map the new frame, a smaller refill
//! is done first. Every nested request is strictly smaller than the one
//! that caused it and larger than what mapping a single page can need, so
//! the nesting always bottoms out at a single-page frame.
//!
//! Each frame is sized to cover the vnodes used to map it as well, so a
//! refill never leaves fewer free vnodes than it found. Together with
//! `map` keeping `SLABS_RESERVE` free, there is always enough to map one
//! more page.

use super::{Pmap, PmapError};
use crate::{
    arch::{PagingArch, BASE_PAGE_SIZE, HIER_LEVELS, PTABLE_ENTRIES},
    authority::{AuthorityManager, CapRef, FrameAllocator, FrameError, PmapBundle},
    divide_round_up,
    flags::VregionFlags,
    round_up,
    slab::{Slab, SlabBacking},
    vnode::Vnode,
};

/// Upper bound on the vnodes needed to map `bytes` bytes at any address:
/// one leaf per page, plus at each level the tables spanned by the entries
/// below it, which may straddle one more boundary than their count alone
/// would need.
pub const fn max_slabs_required(bytes: usize) -> usize {
    let mut entries = divide_round_up(bytes, BASE_PAGE_SIZE);
    if entries == 0 {
        return 0;
    }
    let mut total = entries;
    let mut level = 0;
    while level < HIER_LEVELS {
        entries = divide_round_up(entries - 1, PTABLE_ENTRIES) + 1;
        total += entries;
        level += 1;
    }
    total
}

/// Vnodes needed to map `[vaddr, vaddr + size)` into a tree that has no
/// tables below the root yet: every table spanned at each level, plus one
/// leaf per leaf table. `vaddr + size` must not overflow.
pub fn slabs_required<P: PagingArch>(vaddr: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let last = vaddr + (size - 1);
    let mut total = 0;
    let mut spanned = 0;
    for depth in 1..HIER_LEVELS {
        let shift = P::level_shift(depth - 1);
        spanned = (last >> shift) - (vaddr >> shift) + 1;
        total += spanned;
    }
    total + spanned
}

/// Frame size for a refill adding `slabs_req` vnodes, enlarged until it
/// also covers the vnodes used to map the frame itself.
fn refill_bytes(slabs_req: usize) -> usize {
    let mut bytes = round_up(Slab::<Vnode>::static_size(slabs_req), BASE_PAGE_SIZE);
    loop {
        let needed = round_up(Slab::<Vnode>::static_size(slabs_req + max_slabs_required(bytes)), BASE_PAGE_SIZE);
        if needed <= bytes {
            return bytes;
        }
        bytes = needed;
    }
}

impl<P: PagingArch> Pmap<P> {
    /// Ensures at least `request` vnodes are free.
    pub(crate) fn refill_slabs<A: PmapBundle>(&mut self, request: usize, alloc: &A) -> Result<(), PmapError> {
        if self.meta.is_none() {
            warn!("Pmap::refill_slabs: no metadata region reserved, cannot refill to {}", request);
            return Err(PmapError::MetadataRegionMissing);
        }

        while self.tree.slab().free_count() < request {
            let free = self.tree.slab().free_count();
            let slabs_req = request - free;
            let bytes = refill_bytes(slabs_req);
            refill_debug_println!("Pmap::refill_slabs: req={}, bytes={}, block size={}, free={}", slabs_req, bytes, self.tree.slab().block_size(), free);

            let (frame, bytes) = match alloc.frames().allocate_frame(bytes) {
                Ok(f) => f,
                Err(FrameError::WrongSize) => {
                    refill_debug_println!("Pmap::refill_slabs: {} bytes unavailable, falling back to single pages", bytes);
                    self.refill_slabs_fixed_allocator(bytes, alloc)?;
                    continue;
                },
                Err(err) => {
                    warn!("Pmap::refill_slabs: allocating {} byte frame failed with {:?}", bytes, err);
                    return Err(PmapError::FrameAlloc { err });
                },
            };

            let required_for_frame = max_slabs_required(bytes);
            if self.tree.slab().free_count() < required_for_frame {
                let per_page = max_slabs_required(BASE_PAGE_SIZE);
                if required_for_frame <= per_page {
                    panic!("Pmap::refill_slabs: {} free vnodes cannot map a single page ({} required)", self.tree.slab().free_count(), required_for_frame);
                }
                if required_for_frame >= request {
                    panic!("Pmap::refill_slabs: nested refill of {} for a {} byte frame would not be smaller than the current request of {}", required_for_frame, bytes, request);
                }
                refill_debug_println!("Pmap::refill_slabs: refilling to {} before mapping {} bytes", required_for_frame, bytes);
                if let Err(err) = self.refill_slabs(required_for_frame, alloc) {
                    release_frame(alloc.authority(), frame);
                    return Err(err);
                }
            }

            let vaddr = self.claim_metadata(bytes);
            self.map_metadata(vaddr, frame, bytes, alloc)?;
            self.tree.grow_slab(SlabBacking::Mapped { vaddr }, bytes);
        }
        Ok(())
    }

    /// Refills with single pages, for when the frame allocator cannot
    /// provide larger frames yet. The slab is grown after every page.
    pub(crate) fn refill_slabs_fixed_allocator<A: PmapBundle>(&mut self, bytes: usize, alloc: &A) -> Result<(), PmapError> {
        let pages = divide_round_up(bytes, BASE_PAGE_SIZE);
        for _ in 0..pages {
            let (frame, retbytes) = alloc.frames().allocate_frame(BASE_PAGE_SIZE).map_err(|err| {
                warn!("Pmap::refill_slabs_fixed_allocator: allocating page failed with {:?}", err);
                PmapError::FrameAlloc { err }
            })?;
            if retbytes != BASE_PAGE_SIZE {
                warn!("Pmap::refill_slabs_fixed_allocator: got {} bytes for a single page request", retbytes);
            }
            let vaddr = self.claim_metadata(retbytes);
            self.map_metadata(vaddr, frame, retbytes, alloc)?;
            self.tree.grow_slab(SlabBacking::Mapped { vaddr }, retbytes);
        }
        Ok(())
    }

    /// Takes the next `bytes` bytes of the metadata region.
    fn claim_metadata(&mut self, bytes: usize) -> usize {
        let meta = match self.meta.as_mut() {
            Some(m) => m,
            None => panic!("Pmap::claim_metadata: no metadata region (this shouldn't happen!)"),
        };
        if meta.cursor + bytes > meta.size {
            panic!("Pmap::claim_metadata: metadata region at {:x} exhausted ({:x} of {:x} used, {:x} requested)", meta.base, meta.cursor, meta.size, bytes);
        }
        let vaddr = meta.base + meta.cursor;
        meta.cursor += bytes;
        vaddr
    }

    fn map_metadata<A: PmapBundle>(&mut self, vaddr: usize, frame: CapRef, bytes: usize, alloc: &A) -> Result<(), PmapError> {
        match self.do_map(vaddr, frame, 0, bytes, VregionFlags::READ_WRITE, alloc) {
            Ok(()) => Ok(()),
            Err((_, PmapError::SlabAllocFail)) => {
                panic!("Pmap::map_metadata: ran out of vnodes mapping {} bytes at {:x} after checking", bytes, vaddr);
            },
            Err((done, err)) => {
                warn!("Pmap::map_metadata: mapping {} bytes at {:x} failed after {} bytes with {:?}", bytes, vaddr, done, err);
                if done == 0 {
                    release_frame(alloc.authority(), frame);
                }
                Err(err)
            },
        }
    }
}

fn release_frame<C: AuthorityManager>(authority: &C, frame: CapRef) {
    if let Err(err) = authority.release_authority(frame) {
        warn!("release_frame: deleting frame {:?} failed with {:?}", frame, err);
    }
}

