//! Per-thread slot allocation.
//!
//! Each thread lazily claims a thread index and either adopts the persisted
//! context left by a previous holder of that index or creates a new one. The
//! context (and its arenas) outlives the thread: on exit only the index is
//! released, so a later thread adopting the index inherits the arenas and the
//! local free-stack exactly where they were left.
//!
//! Allocation fast path: pop the local chain — no shared writes at all. When
//! the chain runs dry the owner batch-steals an entire shared free-stack from
//! its arenas in index order, and only then creates (or reactivates) an
//! arena. Every [`TRIM_INTERVAL`] allocations the highest active arena is
//! checked for full depth; a quiescent arena has its physical pages advised
//! away and drops out of the active range without ever leaving a hole below
//! it.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use log::debug;

use crate::arena::{Arena, USABLE_SLOTS};
use crate::handle::Handle;
use crate::registry::{self, MAX_ARENAS_PER_THREAD};
use crate::slot::VersionSlot;

/// Allocations between trim checks on the highest active arena.
const TRIM_INTERVAL: u32 = 1024;

/// Persisted per-thread allocator state. Owner-only fields use relaxed
/// atomics: exactly one live thread holds the index at a time, and the
/// index hand-off through the occupancy array orders adoption.
pub(crate) struct ThreadCtx {
    tid: u16,
    /// Arenas currently in service (contiguous from index 0).
    active_arenas: AtomicU32,
    /// Head of the owner's private free chain (a raw handle; NULL before the
    /// first refill, a sentinel handle once a chain has drained).
    local_top: AtomicU32,
    /// Allocation tick driving the periodic trim check.
    allocs: AtomicU32,
}

impl ThreadCtx {
    fn create(tid: u16) -> &'static ThreadCtx {
        Box::leak(Box::new(ThreadCtx {
            tid,
            active_arenas: AtomicU32::new(0),
            local_top: AtomicU32::new(Handle::NULL.raw()),
            allocs: AtomicU32::new(0),
        }))
    }

    #[cfg(test)]
    pub(crate) fn active_arenas(&self) -> u32 {
        self.active_arenas.load(Ordering::Relaxed)
    }

    /// Pop one slot off the private chain. Wait-free: two relaxed loads and
    /// a store.
    fn pop_local(&self) -> Option<&'static VersionSlot> {
        let head = Handle::from_raw(self.local_top.load(Ordering::Relaxed));
        if head.is_null() || head.is_sentinel() {
            return None;
        }
        let arena = registry::global().arena(head.tid(), head.arena())?;
        let slot = arena.slot(head.slot());
        self.local_top.store(slot.next_free().raw(), Ordering::Relaxed);
        // Leaving the free state: the link now carries the slot's identity.
        slot.set_self_handle(head);
        Some(slot)
    }

    /// Refill the private chain: batch-steal from owned arenas in index
    /// order, then create or reactivate an arena if capacity permits.
    fn refill(&self) -> bool {
        let reg = registry::global();
        let active = self.active_arenas.load(Ordering::Relaxed);

        for aid in 0..active as u16 {
            let Some(arena) = reg.arena(self.tid, aid) else { continue };
            if let Some(head) = arena.steal_all() {
                arena.consume_avail(chain_len(arena, head));
                self.local_top.store(head.raw(), Ordering::Relaxed);
                return true;
            }
        }

        if (active as usize) < MAX_ARENAS_PER_THREAD {
            let aid = active as u16;
            let head = match reg.arena(self.tid, aid) {
                // A previously drained arena adopted along with this context:
                // bring it back instead of allocating fresh pages.
                Some(existing) => existing.reactivate(),
                None => {
                    let Some((arena, head)) = Arena::create(self.tid, aid) else {
                        return false;
                    };
                    reg.install_arena(self.tid, aid, arena);
                    head
                }
            };
            self.local_top.store(head.raw(), Ordering::Relaxed);
            self.active_arenas.store(active + 1, Ordering::Relaxed);
            return true;
        }

        debug!("arena capacity exhausted (tid={})", self.tid);
        false
    }

    /// Drop the highest active arena's physical pages if it is provably
    /// quiescent. `avail` counts completed pushes only, so `avail ==
    /// USABLE_SLOTS` means every usable slot sits in the shared stack: none
    /// allocated, none in the private chain, no push in flight.
    fn trim(&self) {
        let active = self.active_arenas.load(Ordering::Relaxed);
        if active == 0 {
            return;
        }
        let aid = (active - 1) as u16;
        let Some(arena) = registry::global().arena(self.tid, aid) else {
            return;
        };
        if arena.avail() as usize != USABLE_SLOTS {
            return;
        }
        let Some(head) = arena.steal_all() else { return };
        let stolen = chain_len(arena, head);
        debug_assert_eq!(stolen as usize, USABLE_SLOTS);
        arena.consume_avail(stolen);
        arena.advise_free();
        self.active_arenas.store(active - 1, Ordering::Relaxed);
        debug!("arena drained (tid={}, aid={aid})", self.tid);
    }

    fn allocate(&self) -> Option<&'static VersionSlot> {
        let tick = self.allocs.load(Ordering::Relaxed).wrapping_add(1);
        self.allocs.store(tick, Ordering::Relaxed);
        if tick.is_multiple_of(TRIM_INTERVAL) {
            self.trim();
        }

        if let Some(slot) = self.pop_local() {
            return Some(slot);
        }
        if !self.refill() {
            return None;
        }
        self.pop_local()
    }
}

/// Length of a private chain (stolen chains never cross arenas).
fn chain_len(arena: &Arena, head: Handle) -> u32 {
    let mut n = 0;
    let mut h = head;
    while !h.is_sentinel() {
        n += 1;
        h = arena.slot(h.slot()).next_free();
    }
    n
}

/// Thread-local binding to a claimed context. Dropping it at thread exit
/// gives the highest arena a last chance to shed its pages, then releases
/// the index for adoption.
struct LocalState {
    ctx: Cell<Option<&'static ThreadCtx>>,
}

impl LocalState {
    fn ctx(&self) -> Option<&'static ThreadCtx> {
        if let Some(ctx) = self.ctx.get() {
            return Some(ctx);
        }
        let reg = registry::global();
        let tid = reg.claim_tid()?;
        let ctx = match reg.context(tid) {
            Some(existing) => existing,
            None => {
                let fresh = ThreadCtx::create(tid);
                reg.install_context(tid, fresh);
                fresh
            }
        };
        self.ctx.set(Some(ctx));
        Some(ctx)
    }
}

impl Drop for LocalState {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.get() {
            ctx.trim();
            registry::global().release_tid(ctx.tid);
        }
    }
}

thread_local! {
    static LOCAL: LocalState = const {
        LocalState {
            ctx: Cell::new(None),
        }
    };
}

/// Allocate one slot for the calling thread. `None` when the thread-index
/// pool, the per-thread arena budget, or the page allocator is exhausted
/// (or during TLS teardown).
pub(crate) fn allocate() -> Option<&'static VersionSlot> {
    LOCAL
        .try_with(|local| local.ctx().and_then(ThreadCtx::allocate))
        .ok()
        .flatten()
}

/// Return a slot to its arena's shared free-stack. Callable from any thread;
/// this is the cross-thread half of the allocator.
pub(crate) fn free_slot(slot: &VersionSlot) {
    let handle = slot.self_handle();
    match registry::global().arena(handle.tid(), handle.arena()) {
        Some(arena) => arena.push(slot),
        // Unreachable for any slot this allocator handed out.
        None => debug_assert!(false, "freed slot has no arena"),
    }
}

#[cfg(test)]
pub(crate) fn with_current_ctx<R>(f: impl FnOnce(&'static ThreadCtx) -> R) -> Option<R> {
    LOCAL.try_with(|local| local.ctx().map(f)).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_distinct_slots() {
        let a = allocate().expect("slot");
        let b = allocate().expect("slot");
        assert!(!core::ptr::eq(a, b));
        assert_ne!(a.self_handle(), b.self_handle());
        free_slot(a);
        free_slot(b);
    }

    #[test]
    fn alloc_free_cycles_do_not_grow_the_arena_set() {
        let first = allocate().expect("slot");
        free_slot(first);
        let start = with_current_ctx(|ctx| ctx.active_arenas()).expect("ctx");

        // Far more cycles than one arena holds: the local chain drains and is
        // refilled by batch steal rather than by new arenas.
        for i in 0..(USABLE_SLOTS * 5) {
            let slot = allocate().unwrap_or_else(|| panic!("allocation {i} failed"));
            free_slot(slot);
        }

        let end = with_current_ctx(|ctx| ctx.active_arenas()).expect("ctx");
        assert!(end <= start, "arena set grew from {start} to {end}");
    }

    #[test]
    fn adoption_reuses_the_persisted_context() {
        let first = std::thread::spawn(|| {
            let slot = allocate().expect("slot");
            free_slot(slot);
            with_current_ctx(|ctx| (ctx.tid, ctx as *const ThreadCtx as usize)).expect("ctx")
        })
        .join()
        .expect("join");

        let second = std::thread::spawn(|| {
            let slot = allocate().expect("slot");
            free_slot(slot);
            with_current_ctx(|ctx| (ctx.tid, ctx as *const ThreadCtx as usize)).expect("ctx")
        })
        .join()
        .expect("join");

        // Under a parallel test harness another thread may grab the index
        // first; adoption is only observable when the indexes match.
        if first.0 == second.0 {
            assert_eq!(first.1, second.1, "same index must adopt the same context");
        }
    }
}
