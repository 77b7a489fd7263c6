//! Arenas: page-aligned blocks of version slots with a lock-free free-stack.
//!
//! Each arena owns a page-aligned region of [`SLOTS_PER_ARENA`] slots. Slot 0
//! is the sentinel: it is never allocated, its handle is the permanent bottom
//! of the free-stack, and it terminates every chain. The shared free-stack
//! top packs `depth-tag:32 (high) | top-handle:32 (low)` in one word; the tag
//! increases on every successful top CAS, so a sleeping pusher can never
//! succeed against a recycled-but-identical top word.
//!
//! The stack is multi-producer, single-consumer: any thread may push a freed
//! slot, but only the owning thread detaches — and it always detaches the
//! whole chain at once (batch steal), which sidesteps the classical Treiber
//! pop race entirely.

use core::alloc::Layout;
use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;
use log::debug;
use portable_atomic::AtomicU64;

use crate::handle::{Handle, SLOT_BITS};
use crate::slot::VersionSlot;

/// Granularity of OS page advice.
pub(crate) const PAGE_SIZE: usize = 4096;
/// Slots per arena, sentinel included. Sized so the region is a whole number
/// of pages with zero waste at 64 bytes per slot.
pub(crate) const SLOTS_PER_ARENA: usize = 1024;
/// Slots that can actually be handed out (everything but the sentinel).
pub(crate) const USABLE_SLOTS: usize = SLOTS_PER_ARENA - 1;
/// Bytes in an arena's slot region.
pub(crate) const ARENA_BYTES: usize = SLOTS_PER_ARENA * core::mem::size_of::<VersionSlot>();

const _: () = assert!(ARENA_BYTES % PAGE_SIZE == 0);
const _: () = assert!(SLOTS_PER_ARENA - 1 <= (1 << SLOT_BITS) - 1);

const ARENA_LAYOUT: Layout = match Layout::from_size_align(ARENA_BYTES, PAGE_SIZE) {
    Ok(layout) => layout,
    Err(_) => panic!("arena layout"),
};

const TAG_SHIFT: u32 = 32;

#[inline]
const fn pack_top(tag: u32, handle: Handle) -> u64 {
    ((tag as u64) << TAG_SHIFT) | handle.raw() as u64
}

#[inline]
const fn top_tag(word: u64) -> u32 {
    (word >> TAG_SHIFT) as u32
}

#[inline]
const fn top_handle(word: u64) -> Handle {
    Handle::from_raw(word as u32)
}

/// One arena: identity, shared free-stack top, and the slot region.
///
/// The header lives out-of-line on the normal heap so the whole slot region
/// can be advised away without clobbering bookkeeping. Arenas are created
/// once and live for the rest of the process; only their physical pages are
/// ever given back.
pub(crate) struct Arena {
    /// Shared free-stack top: `tag | handle`.
    top: CachePadded<AtomicU64>,
    /// Completed pushes currently sitting in the shared stack. Incremented
    /// after a push lands, decremented by the owner after a steal, so it
    /// never runs ahead of the chain: `avail == USABLE_SLOTS` proves the
    /// arena is quiescent.
    avail: AtomicU32,
    tid: u16,
    aid: u16,
    region: *mut VersionSlot,
}

// SAFETY: the region is shared only through the atomics in each slot and the
// tagged top word; the raw pointer itself is never handed out.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Allocate the slot region and build the initial chain through all
    /// usable slots. Returns the arena and the chain head; the chain goes
    /// straight to the owner's local stack, so the shared top starts empty.
    /// `None` if the page allocator refuses.
    pub(crate) fn create(tid: u16, aid: u16) -> Option<(&'static Arena, Handle)> {
        // SAFETY: ARENA_LAYOUT has non-zero size.
        let region = unsafe { std::alloc::alloc_zeroed(ARENA_LAYOUT) } as *mut VersionSlot;
        if region.is_null() {
            debug!("arena allocation failed (tid={tid}, aid={aid})");
            return None;
        }
        let arena = Box::leak(Box::new(Arena {
            top: CachePadded::new(AtomicU64::new(pack_top(0, Handle::new(tid, aid, 0)))),
            avail: AtomicU32::new(0),
            tid,
            aid,
            region,
        }));
        let head = arena.link_all();
        debug!("arena created (tid={tid}, aid={aid})");
        Some((arena, head))
    }

    /// Handle of the sentinel slot, the bottom of this arena's stack.
    #[inline]
    pub(crate) fn sentinel(&self) -> Handle {
        Handle::new(self.tid, self.aid, 0)
    }

    /// Borrow a slot by index. The region has process lifetime.
    #[inline]
    pub(crate) fn slot(&self, sid: u16) -> &'static VersionSlot {
        debug_assert!((sid as usize) < SLOTS_PER_ARENA);
        // SAFETY: sid is in range and the region is never deallocated.
        unsafe { &*self.region.add(sid as usize) }
    }

    /// Range-checked lookup used by handle resolution. The sentinel is not a
    /// version, so it does not resolve.
    #[inline]
    pub(crate) fn slot_checked(&self, sid: u16) -> Option<&'static VersionSlot> {
        if sid == 0 || sid as usize >= SLOTS_PER_ARENA {
            return None;
        }
        Some(self.slot(sid))
    }

    /// Push a freed slot onto the shared stack. Callable from any thread.
    pub(crate) fn push(&self, slot: &VersionSlot) {
        let handle = slot.self_handle();
        debug_assert_eq!(handle.tid(), self.tid);
        debug_assert_eq!(handle.arena(), self.aid);
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            slot.set_next_free(top_handle(top));
            let next = pack_top(top_tag(top).wrapping_add(1), handle);
            match self
                .top
                .compare_exchange_weak(top, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(cur) => top = cur,
            }
        }
        self.avail.fetch_add(1, Ordering::Release);
    }

    /// Detach the entire shared chain (owner only). Returns the chain head,
    /// or `None` when the stack held only the sentinel. The caller walks the
    /// chain privately and settles `avail` with [`Arena::consume_avail`].
    pub(crate) fn steal_all(&self) -> Option<Handle> {
        let empty_handle = self.sentinel();
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            let head = top_handle(top);
            if head == empty_handle {
                return None;
            }
            let next = pack_top(top_tag(top).wrapping_add(1), empty_handle);
            match self
                .top
                .compare_exchange_weak(top, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(head),
                Err(cur) => top = cur,
            }
        }
    }

    /// Completed pushes still sitting in the shared stack.
    #[inline]
    pub(crate) fn avail(&self) -> u32 {
        self.avail.load(Ordering::Acquire)
    }

    /// Settle the population count after stealing `n` slots.
    #[inline]
    pub(crate) fn consume_avail(&self, n: u32) {
        self.avail.fetch_sub(n, Ordering::Relaxed);
    }

    /// Advise the OS that the slot region's physical pages may be dropped.
    /// Only called by the owner once the arena is provably quiescent; the
    /// region reads back zeroed when touched again.
    pub(crate) fn advise_free(&self) {
        #[cfg(unix)]
        // SAFETY: the region is a live page-aligned mapping of ARENA_BYTES
        // and no slot in it is referenced while drained.
        unsafe {
            libc::madvise(self.region as *mut libc::c_void, ARENA_BYTES, libc::MADV_DONTNEED);
        }
        debug!("arena pages advised free (tid={}, aid={})", self.tid, self.aid);
    }

    /// Bring a drained arena back into service: relink every usable slot
    /// from scratch (the region may have been dropped to zeros) and hand the
    /// full chain to the owner. The shared top keeps its tag sequence.
    pub(crate) fn reactivate(&self) -> Handle {
        debug_assert_eq!(top_handle(self.top.load(Ordering::Acquire)), self.sentinel());
        self.avail.store(0, Ordering::Relaxed);
        self.link_all()
    }

    /// Thread every usable slot into one chain ending at the sentinel.
    fn link_all(&self) -> Handle {
        for sid in 1..SLOTS_PER_ARENA as u16 {
            let next = if sid as usize == USABLE_SLOTS {
                self.sentinel()
            } else {
                Handle::new(self.tid, self.aid, sid + 1)
            };
            self.slot(sid).set_next_free(next);
        }
        Handle::new(self.tid, self.aid, 1)
    }
}
