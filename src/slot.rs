//! Version slot records and the inner-state word.
//!
//! Inner-state layout (one 64-bit word, all RMWs single instructions):
//! - bits 63..32: release counter, modulo 2^32, same width as the gate's
//!   outer counter. Living in the high half means `fetch_add(1 << 32)` wraps
//!   with the carry falling off the top of the word, so the flag bits are
//!   never disturbed by counter wraparound.
//! - bit 1: `FINALIZED` — claimed by the one thread that runs the cleanup.
//! - bit 0: `DETACHED` — set when a publication dislodged this version.
//!
//! Both flags are monotone: they are set at most once per slot lifetime and
//! never cleared before the slot is reinitialized for its next build.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use portable_atomic::AtomicU64;

use crate::gate::GateShared;
use crate::handle::Handle;

/// Shift of the release counter within the inner-state word. The counter
/// width equals the gate's outer-counter width.
pub(crate) const INNER_CNT_SHIFT: u32 = 32;
/// One counter increment.
pub(crate) const INNER_CNT_UNIT: u64 = 1 << INNER_CNT_SHIFT;
/// Version has been removed from its gate; no new acquires can reach it.
pub(crate) const DETACHED: u64 = 1;
/// Cleanup has been claimed; only the claiming thread frees the slot.
pub(crate) const FINALIZED: u64 = 1 << 1;

/// Counter field of an inner-state word.
#[inline]
pub(crate) const fn inner_count(state: u64) -> u32 {
    (state >> INNER_CNT_SHIFT) as u32
}

/// Fixed-size record holding one published snapshot and its bookkeeping.
///
/// A slot is always in exactly one state: Free (threaded on an arena
/// free-stack), Building (writer-exclusive), Published (reachable through a
/// gate control block), Detached (dislodged but possibly still observed), or
/// Reclaimable (balanced and detached). `link` is a union in spirit: the
/// next-handle of the free-stack while Free, and a copy of the slot's own
/// handle in every other state so a bare slot reference can find its arena.
#[repr(C, align(64))]
pub(crate) struct VersionSlot {
    /// Split-refcount state word; see the module docs for the layout.
    inner: AtomicU64,
    /// Free: next handle in the free-stack. Otherwise: `self_handle`.
    link: AtomicU32,
    /// Snapshot payload. Stored by the writer before publication; the
    /// control-block RMW orders it for readers.
    object: AtomicPtr<()>,
    /// Opaque second argument handed to the cleanup callback.
    free_context: AtomicPtr<()>,
    /// Owning gate, used on finalization. Borrow, not ownership: the gate
    /// must outlive every version it ever published.
    gate: AtomicPtr<GateShared>,
}

// 64 bytes keeps a whole number of slots per page and one slot per cache line.
const _: () = assert!(core::mem::size_of::<VersionSlot>() == 64);

// SAFETY: every field is an atomic; cross-thread access is mediated by the
// gate control block and the arena free-stack CASes.
unsafe impl Send for VersionSlot {}
unsafe impl Sync for VersionSlot {}

impl VersionSlot {
    /// Prepare a freshly allocated slot for building: clear the state word
    /// and payload fields and record the owning gate. The slot is still
    /// writer-exclusive, so plain (relaxed) stores suffice; publication
    /// orders them for everyone else.
    pub(crate) fn init_for_build(&self, gate: *const GateShared) {
        self.inner.store(0, Ordering::Relaxed);
        self.object.store(core::ptr::null_mut(), Ordering::Relaxed);
        self.free_context.store(core::ptr::null_mut(), Ordering::Relaxed);
        self.gate.store(gate as *mut GateShared, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_object(&self, object: *mut (), free_context: *mut ()) {
        self.object.store(object, Ordering::Relaxed);
        self.free_context.store(free_context, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn object(&self) -> *mut () {
        self.object.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn free_context(&self) -> *mut () {
        self.free_context.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn gate(&self) -> *const GateShared {
        self.gate.load(Ordering::Relaxed)
    }

    /// The slot's own handle. Valid in every state but Free.
    #[inline]
    pub(crate) fn self_handle(&self) -> Handle {
        Handle::from_raw(self.link.load(Ordering::Relaxed))
    }

    /// Record the slot's own handle. Done once when the slot leaves a
    /// free-stack.
    #[inline]
    pub(crate) fn set_self_handle(&self, handle: Handle) {
        self.link.store(handle.raw(), Ordering::Relaxed);
    }

    /// Free-stack next pointer (only meaningful while Free).
    #[inline]
    pub(crate) fn next_free(&self) -> Handle {
        Handle::from_raw(self.link.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_next_free(&self, next: Handle) {
        self.link.store(next.raw(), Ordering::Relaxed);
    }

    /// One reader release: bump the counter and return the resulting state.
    /// Release-side of the RMW publishes the reader's last loads to whoever
    /// finalizes; acquire-side lets a winning finalizer see them.
    #[inline]
    pub(crate) fn add_release(&self) -> u64 {
        self.inner
            .fetch_add(INNER_CNT_UNIT, Ordering::AcqRel)
            .wrapping_add(INNER_CNT_UNIT)
    }

    /// Writer-side detach: subtract the outer snapshot from the counter and
    /// set `DETACHED`, in one atomic update. Subtraction is addition of the
    /// two's complement in the high half; the low bits of that addend are
    /// zero, so OR-ing the flag in keeps this a plain add. `DETACHED` is set
    /// exactly once per lifetime, which is what keeps the bit-0 add from
    /// carrying into `FINALIZED`.
    #[inline]
    pub(crate) fn merge_outer(&self, outer_snapshot: u32) -> u64 {
        let delta = ((outer_snapshot as u64) << INNER_CNT_SHIFT).wrapping_neg() | DETACHED;
        self.inner.fetch_add(delta, Ordering::AcqRel).wrapping_add(delta)
    }

    /// Claim the right to run cleanup. `observed` must be the state that
    /// satisfied the reclamation condition. At most one claimant can win;
    /// a lost race means another thread observed the same balanced state.
    #[inline]
    pub(crate) fn try_claim_finalize(&self, observed: u64) -> bool {
        self.inner
            .compare_exchange(observed, observed | FINALIZED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn force_inner_state(&self, state: u64) {
        self.inner.store(state, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn inner_state(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}
