//! Snapgate: wait-free snapshot publication with split reference-count
//! reclamation. Bounded memory usage, predictable latency.
//!
//! A [`Gate`] publishes immutable versions of a logical object. Readers
//! acquire the current version with a single atomic `fetch_add`; writers
//! install new versions unconditionally or by compare-exchange. Every
//! retired version's cleanup callback runs exactly once, after its last
//! observer departs — without locks, hazard pointers, or epochs.
//!
//! # Key Features
//!
//! - **Wait-free reads**: acquire is one atomic RMW and a table lookup
//! - **Lock-free writes**: publication never blocks; CAS retries are bounded
//!   by other threads' progress
//! - **Exactly-once cleanup**: a split outer/inner refcount decides the last
//!   observer, reader or writer, and that thread runs the callback
//! - **Recycled slots**: versions live in page-aligned per-thread arenas
//!   with lock-free free-stacks; drained arenas return their pages to the OS
//!
//! # How it works
//!
//! Each gate control block packs `(outer refcount, version handle)` into one
//! 64-bit word. Acquiring bumps the outer half and reads the handle in the
//! same instruction. Publishing swaps the whole word, then folds the
//! displaced outer count into the old version's inner counter while marking
//! it detached; the observer that balances the counter to zero claims
//! finalization. Counter arithmetic is modulo 2^32 on both sides, so
//! wraparound cancels out.
//!
//! # Limits
//!
//! Compile-time constants, not runtime-tunable: at most 128 threads may use
//! the slot allocator concurrently (thread indexes recycle on exit), each
//! thread owns up to 64 arenas of 1023 usable version slots, and both
//! refcount halves are 32 bits wide — one published version tolerates up to
//! 2^32 - 1 unreleased acquires at a time. Handles pack
//! `{thread:8, arena:8, slot:16}` with all-ones reserved as NULL.
//!
//! # Example
//!
//! ```
//! use snapgate::{Gate, GateConfig};
//!
//! fn free_config(object: *mut (), _context: *mut ()) {
//!     if !object.is_null() {
//!         // SAFETY: this gate only ever publishes Box<Vec<u32>>.
//!         unsafe { drop(Box::from_raw(object as *mut Vec<u32>)) };
//!     }
//! }
//!
//! let gate = Gate::new(GateConfig { free: free_config, extra_control_blocks: 0 });
//!
//! // Writer: build and publish a snapshot.
//! let builder = gate.make_version().expect("slot available");
//! let payload = Box::into_raw(Box::new(vec![1, 2, 3])) as *mut ();
//! builder.set_object(payload, core::ptr::null_mut());
//! gate.exchange(0, builder);
//!
//! // Reader: observe a consistent snapshot.
//! let snapshot = gate.acquire(0).expect("published");
//! // SAFETY: the object is live for as long as the version is held.
//! let data = unsafe { &*(snapshot.object() as *const Vec<u32>) };
//! assert_eq!(data.len(), 3);
//! snapshot.release();
//! ```

#![warn(missing_docs)]

mod arena;
mod context;
mod gate;
mod handle;
mod registry;
mod slot;

pub use gate::{FreeFn, Gate, GateConfig, Version, VersionBuilder};
