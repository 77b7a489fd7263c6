//! Gate: publication point and reclamation protocol.
//!
//! Each control block is one 64-bit word packing `outer:32 (high) |
//! handle:32 (low)`. The outer counter is the number of acquires performed
//! against the currently published handle since it was installed; every
//! publication resets it to zero. Retiring the displaced version merges that
//! outer snapshot into the version's inner counter while setting `DETACHED`,
//! all in a single RMW, and whoever balances the counter to zero under
//! `DETACHED` claims `FINALIZED`, runs the cleanup callback, and returns the
//! slot to its arena.
//!
//! Progress: acquire is one `fetch_add` (wait-free), release is one
//! `fetch_add` plus at most one finalization CAS, exchange is one `swap`
//! plus one RMW, and compare-exchange retries only while concurrent acquires
//! move the outer counter under an unchanged handle — each failed round
//! means some other thread made progress.

use core::fmt;
use core::marker::PhantomData;

use crossbeam_utils::CachePadded;
use portable_atomic::{AtomicU64, Ordering};

use crate::context;
use crate::handle::{HANDLE_BITS, Handle};
use crate::slot::{DETACHED, VersionSlot, inner_count};

/// One acquire, as seen by a control block.
const OUTER_UNIT: u64 = 1 << HANDLE_BITS;
/// Control-block value of an empty gate slot.
const EMPTY_BLOCK: u64 = Handle::NULL.raw() as u64;

/// Cleanup callback: invoked exactly once per retired non-null object, with
/// the object pointer and the context stored alongside it.
pub type FreeFn = fn(object: *mut (), context: *mut ());

/// Immutable gate configuration.
///
/// `extra_control_blocks` adds independent publication slots beyond the
/// default slot 0; each behaves identically and shares nothing but the
/// cleanup callback.
#[derive(Clone, Copy)]
pub struct GateConfig {
    /// Cleanup callback, required.
    pub free: FreeFn,
    /// Publication slots beyond the default one.
    pub extra_control_blocks: usize,
}

/// State shared between a gate and every version it publishes. Boxed inside
/// [`Gate`] so version back-pointers survive moves of the owning handle.
pub(crate) struct GateShared {
    blocks: Box<[CachePadded<AtomicU64>]>,
    free_fn: FreeFn,
}

/// Publication gate for one logical versioned object.
///
/// Readers [`acquire`](Gate::acquire) the current version wait-free and drop
/// it (or call [`Version::release`]) when done; writers build a version with
/// [`make_version`](Gate::make_version) and install it with
/// [`exchange`](Gate::exchange) or [`compare_exchange`](Gate::compare_exchange).
/// The gate must outlive every version it publishes, which the borrow on
/// [`Version`] and [`VersionBuilder`] enforces at compile time.
///
/// # Examples
///
/// ```
/// use snapgate::{Gate, GateConfig};
///
/// fn free_box(object: *mut (), _context: *mut ()) {
///     if !object.is_null() {
///         // SAFETY: objects in this gate are Box<u64> leaked at set_object.
///         unsafe { drop(Box::from_raw(object as *mut u64)) };
///     }
/// }
///
/// let gate = Gate::new(GateConfig { free: free_box, extra_control_blocks: 0 });
///
/// let builder = gate.make_version().expect("slot");
/// builder.set_object(Box::into_raw(Box::new(7u64)) as *mut (), core::ptr::null_mut());
/// gate.exchange(0, builder);
///
/// let current = gate.acquire(0).expect("published");
/// // SAFETY: the object is live until the version is released.
/// assert_eq!(unsafe { *(current.object() as *const u64) }, 7);
/// drop(current);
/// ```
pub struct Gate {
    shared: Box<GateShared>,
}

impl Gate {
    /// Create a gate whose control blocks all start empty.
    pub fn new(config: GateConfig) -> Gate {
        let blocks = (0..=config.extra_control_blocks)
            .map(|_| CachePadded::new(AtomicU64::new(EMPTY_BLOCK)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Gate {
            shared: Box::new(GateShared {
                blocks,
                free_fn: config.free,
            }),
        }
    }

    /// Number of control blocks (always at least one).
    #[inline]
    pub fn control_blocks(&self) -> usize {
        self.shared.blocks.len()
    }

    /// Start building a new version. The slot is exclusive to the caller
    /// until published or discarded.
    ///
    /// Returns `None` when the calling thread cannot get a slot: the
    /// thread-index pool, the per-thread arena budget, or the page allocator
    /// is exhausted.
    pub fn make_version(&self) -> Option<VersionBuilder<'_>> {
        let slot = context::allocate()?;
        slot.init_for_build(&*self.shared);
        Some(VersionBuilder {
            slot,
            _gate: PhantomData,
        })
    }

    /// Acquire the currently published version, bumping the outer counter.
    /// Wait-free: one `fetch_add` and a table lookup. `None` when the block
    /// is empty.
    ///
    /// # Panics
    ///
    /// Panics if `block` is out of range.
    #[inline]
    pub fn acquire(&self, block: usize) -> Option<Version<'_>> {
        let word = self.shared.blocks[block].fetch_add(OUTER_UNIT, Ordering::Acquire);
        let slot = Handle::from_raw(word as u32).resolve()?;
        Some(Version {
            slot,
            _gate: PhantomData,
        })
    }

    /// Unconditionally publish `new`, detaching whatever was current.
    ///
    /// The displaced version is retired: once every reader that acquired it
    /// has released, its cleanup runs exactly once — possibly right here on
    /// the writer, if no reader is outstanding.
    ///
    /// # Panics
    ///
    /// Panics if `block` is out of range.
    pub fn exchange(&self, block: usize, new: VersionBuilder<'_>) {
        let handle = new.slot.self_handle();
        core::mem::forget(new);
        let old = self.shared.blocks[block].swap(handle.raw() as u64, Ordering::AcqRel);
        retire(old);
    }

    /// Publish "nothing": detach the current version and leave the block
    /// empty. Subsequent acquires return `None` until the next publication.
    ///
    /// # Panics
    ///
    /// Panics if `block` is out of range.
    pub fn clear(&self, block: usize) {
        let old = self.shared.blocks[block].swap(EMPTY_BLOCK, Ordering::AcqRel);
        retire(old);
    }

    /// Conditionally publish `new` if `expected` is still current.
    ///
    /// Returns the untouched builder on failure so the caller can retry or
    /// discard. A failure means another publication won; a retry happens
    /// only when the handle matched but concurrent acquires moved the outer
    /// counter, so some thread always makes progress.
    ///
    /// As long as the caller still holds `expected` (unreleased), its slot
    /// cannot be recycled, so a matching handle really is the same version —
    /// publication resets the counter and installs a fresh handle, and
    /// handles recycle only after finalization.
    ///
    /// # Panics
    ///
    /// Panics if `block` is out of range.
    pub fn compare_exchange<'g>(
        &'g self,
        block: usize,
        expected: &Version<'_>,
        new: VersionBuilder<'g>,
    ) -> Result<(), VersionBuilder<'g>> {
        let expected_raw = expected.slot.self_handle().raw();
        let new_word = new.slot.self_handle().raw() as u64;
        let cb = &self.shared.blocks[block];
        let mut cur = cb.load(Ordering::Acquire);
        loop {
            if cur as u32 != expected_raw {
                return Err(new);
            }
            match cb.compare_exchange_weak(cur, new_word, Ordering::AcqRel, Ordering::Acquire) {
                Ok(old) => {
                    core::mem::forget(new);
                    retire(old);
                    return Ok(());
                }
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Drop for Gate {
    /// Detach every still-published version. With no outstanding acquires
    /// (the caller's contract, enforced by the borrows on [`Version`]),
    /// each one balances immediately and its cleanup runs here.
    fn drop(&mut self) {
        for block in self.shared.blocks.iter() {
            let old = block.swap(EMPTY_BLOCK, Ordering::AcqRel);
            retire(old);
        }
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("control_blocks", &self.control_blocks())
            .finish()
    }
}

/// Retire a displaced control-block value: merge the outer snapshot into the
/// old version's inner counter while setting `DETACHED`, and finalize if the
/// counter balanced. Empty blocks retire to nothing — the dead acquire count
/// they may carry is discarded with them.
fn retire(old_word: u64) {
    let Some(slot) = Handle::from_raw(old_word as u32).resolve() else {
        return;
    };
    let outer_snapshot = (old_word >> HANDLE_BITS) as u32;
    let state = slot.merge_outer(outer_snapshot);
    if inner_count(state) == 0 {
        finalize(slot, state);
    }
}

/// One reader release.
fn release_slot(slot: &'static VersionSlot) {
    let state = slot.add_release();
    if state & DETACHED != 0 && inner_count(state) == 0 {
        finalize(slot, state);
    }
}

/// Claim `FINALIZED`; the winner runs the cleanup callback and frees the
/// slot. Exactly one thread ever observes the balanced-and-detached state,
/// so the claim is a backstop, not a contended path.
fn finalize(slot: &'static VersionSlot, observed: u64) {
    if !slot.try_claim_finalize(observed) {
        return;
    }
    let object = slot.object();
    if !object.is_null() {
        // SAFETY: the gate outlives every version it published; the pointer
        // was stored at init_for_build and the slot has not been freed.
        let shared = unsafe { &*slot.gate() };
        (shared.free_fn)(object, slot.free_context());
    }
    context::free_slot(slot);
}

/// A version under construction, exclusive to the building thread.
///
/// Publishing ([`Gate::exchange`] / [`Gate::compare_exchange`]) consumes the
/// builder. Dropping it instead runs the cleanup for any attached object and
/// returns the slot, so an abandoned build leaks nothing.
#[must_use]
pub struct VersionBuilder<'g> {
    slot: &'static VersionSlot,
    _gate: PhantomData<&'g GateShared>,
}

impl VersionBuilder<'_> {
    /// Attach the payload and its cleanup context. Anything stored here is
    /// visible to every observer of the version once it is published.
    #[inline]
    pub fn set_object(&self, object: *mut (), context: *mut ()) {
        self.slot.set_object(object, context);
    }

    /// The payload attached so far (null until [`set_object`](Self::set_object)).
    #[inline]
    pub fn object(&self) -> *mut () {
        self.slot.object()
    }

    /// Explicitly abandon the build. Equivalent to dropping the builder.
    pub fn discard(self) {}
}

impl Drop for VersionBuilder<'_> {
    fn drop(&mut self) {
        let object = self.slot.object();
        if !object.is_null() {
            // SAFETY: the borrow on 'g keeps the gate alive.
            let shared = unsafe { &*self.slot.gate() };
            (shared.free_fn)(object, self.slot.free_context());
        }
        context::free_slot(self.slot);
    }
}

impl fmt::Debug for VersionBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionBuilder")
            .field("handle", &self.slot.self_handle())
            .finish()
    }
}

/// An acquired reference to a published version.
///
/// The payload stays live until this token is dropped (or explicitly
/// [`release`](Version::release)d); after that the version may be reclaimed
/// at any moment, so the token is move-only and releasing is final. Equality
/// compares version identity, which is well defined while both sides are
/// held.
#[must_use]
pub struct Version<'g> {
    slot: &'static VersionSlot,
    _gate: PhantomData<&'g GateShared>,
}

impl Version<'_> {
    /// The snapshot payload. Valid until this token is released.
    #[inline]
    pub fn object(&self) -> *mut () {
        self.slot.object()
    }

    /// The cleanup context stored with the payload.
    #[inline]
    pub fn free_context(&self) -> *mut () {
        self.slot.free_context()
    }

    /// Release the version, equivalent to dropping it. May run the cleanup
    /// callback on this thread if this was the last observer of a detached
    /// version.
    pub fn release(self) {}

    #[cfg(test)]
    pub(crate) fn slot(&self) -> &'static VersionSlot {
        self.slot
    }
}

impl PartialEq for Version<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.slot, other.slot)
    }
}

impl Eq for Version<'_> {}

impl Drop for Version<'_> {
    fn drop(&mut self) {
        release_slot(self.slot);
    }
}

impl fmt::Debug for Version<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Version")
            .field("handle", &self.slot.self_handle())
            .finish()
    }
}
