//! Process-wide state: thread-index occupancy, persisted thread contexts,
//! and the arena table that backs handle resolution.
//!
//! All three tables are flat arrays of atomics. The occupancy array is
//! claimed by CAS; the context and arena slots are written once by the
//! claiming thread and published with release stores, so readers need only
//! acquire loads — no lock anywhere.

use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use log::debug;
use once_cell::race::OnceBox;

use crate::arena::Arena;
use crate::context::ThreadCtx;
use crate::handle::{ARENA_BITS, TID_BITS};

// Maximum concurrent threads. Must stay strictly below the thread-index
// field's saturation value so no legal handle collides with the NULL pattern.
pub(crate) const MAX_THREADS: usize = 128;
/// Arenas a single thread may own.
pub(crate) const MAX_ARENAS_PER_THREAD: usize = 64;

const _: () = assert!(MAX_THREADS < (1 << TID_BITS) - 1);
const _: () = assert!(MAX_ARENAS_PER_THREAD <= 1 << ARENA_BITS);

type ArenaRow = [AtomicPtr<Arena>; MAX_ARENAS_PER_THREAD];

/// The process-wide tables.
pub(crate) struct Registry {
    /// Thread-index occupancy. `true` means some live thread holds the index.
    claims: [AtomicBool; MAX_THREADS],
    /// Persisted allocator contexts, created once per index and adopted by
    /// whichever thread next claims that index.
    contexts: [AtomicPtr<ThreadCtx>; MAX_THREADS],
    /// Arena table indexed `[tid][aid]`; read-mostly, written only by the
    /// single CAS-free owner installing a new arena.
    arenas: [ArenaRow; MAX_THREADS],
}

impl Registry {
    fn new() -> Self {
        Registry {
            claims: core::array::from_fn(|_| AtomicBool::new(false)),
            contexts: core::array::from_fn(|_| AtomicPtr::new(core::ptr::null_mut())),
            arenas: core::array::from_fn(|_| {
                core::array::from_fn(|_| AtomicPtr::new(core::ptr::null_mut()))
            }),
        }
    }

    /// Claim a free thread index. `None` when every index is occupied.
    pub(crate) fn claim_tid(&self) -> Option<u16> {
        for tid in 0..MAX_THREADS {
            if self.claims[tid]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug!("thread index {tid} claimed");
                return Some(tid as u16);
            }
        }
        debug!("thread index pool exhausted");
        None
    }

    /// Release a thread index on thread exit. The context and its arenas
    /// stay behind for adoption.
    pub(crate) fn release_tid(&self, tid: u16) {
        debug!("thread index {tid} released");
        self.claims[tid as usize].store(false, Ordering::Release);
    }

    /// The persisted context for an index, if one was ever created.
    #[inline]
    pub(crate) fn context(&self, tid: u16) -> Option<&'static ThreadCtx> {
        let ptr = self.contexts[tid as usize].load(Ordering::Acquire);
        // SAFETY: contexts are leaked on creation and never freed.
        unsafe { ptr.as_ref() }
    }

    /// Install a freshly created context. Only the thread holding `tid` ever
    /// writes this slot, and only once.
    pub(crate) fn install_context(&self, tid: u16, ctx: &'static ThreadCtx) {
        self.contexts[tid as usize].store(ctx as *const ThreadCtx as *mut ThreadCtx, Ordering::Release);
    }

    /// Arena lookup for handle resolution and cross-thread frees.
    #[inline]
    pub(crate) fn arena(&self, tid: u16, aid: u16) -> Option<&'static Arena> {
        if tid as usize >= MAX_THREADS || aid as usize >= MAX_ARENAS_PER_THREAD {
            return None;
        }
        let ptr = self.arenas[tid as usize][aid as usize].load(Ordering::Acquire);
        // SAFETY: arenas are leaked on creation and never freed.
        unsafe { ptr.as_ref() }
    }

    /// Publish a new arena. Only the owner writes `[tid][aid]`, and only once.
    pub(crate) fn install_arena(&self, tid: u16, aid: u16, arena: &'static Arena) {
        self.arenas[tid as usize][aid as usize]
            .store(arena as *const Arena as *mut Arena, Ordering::Release);
    }
}

static GLOBAL: OnceBox<Registry> = OnceBox::new();

/// The process-wide registry singleton.
#[inline]
pub(crate) fn global() -> &'static Registry {
    GLOBAL.get_or_init(|| Box::new(Registry::new()))
}
