//! Lifecycle tests for the publication gate.
//!
//! These cover the core contract:
//! 1. Every retired non-null object is cleaned up exactly once
//! 2. Acquires between two publications always see the fresh version
//! 3. Control blocks are independent of each other

use std::sync::atomic::{AtomicUsize, Ordering};

use snapgate::{Gate, GateConfig};

fn counting_free(object: *mut (), context: *mut ()) {
    if !object.is_null() {
        // SAFETY: every payload in these tests is a leaked Box<u64>.
        unsafe { drop(Box::from_raw(object as *mut u64)) };
    }
    if !context.is_null() {
        // SAFETY: the context is a pointer to an AtomicUsize that outlives
        // the gate.
        unsafe { &*(context as *const AtomicUsize) }.fetch_add(1, Ordering::Relaxed);
    }
}

fn publish(gate: &Gate, block: usize, value: u64, frees: &AtomicUsize) {
    let builder = gate.make_version().expect("slot available");
    builder.set_object(
        Box::into_raw(Box::new(value)) as *mut (),
        frees as *const AtomicUsize as *mut (),
    );
    gate.exchange(block, builder);
}

fn read_u64(object: *mut ()) -> u64 {
    assert!(!object.is_null());
    // SAFETY: published objects are live while the version is held.
    unsafe { *(object as *const u64) }
}

#[test]
fn publish_acquire_release_then_replace() {
    let frees_a = AtomicUsize::new(0);
    let frees_b = AtomicUsize::new(0);
    {
        let gate = Gate::new(GateConfig {
            free: counting_free,
            extra_control_blocks: 0,
        });

        publish(&gate, 0, 11, &frees_a);
        let reader = gate.acquire(0).expect("published");
        assert_eq!(read_u64(reader.object()), 11);
        reader.release();

        // Replacing detaches the first version; with no reader outstanding
        // its cleanup runs during the exchange.
        publish(&gate, 0, 22, &frees_b);
        assert_eq!(frees_a.load(Ordering::Relaxed), 1);
        assert_eq!(frees_b.load(Ordering::Relaxed), 0);
    }
    // Dropping the gate detaches and reclaims the final version.
    assert_eq!(frees_a.load(Ordering::Relaxed), 1);
    assert_eq!(frees_b.load(Ordering::Relaxed), 1);
}

#[test]
fn acquire_on_an_empty_gate_is_none() {
    let gate = Gate::new(GateConfig {
        free: counting_free,
        extra_control_blocks: 0,
    });
    assert!(gate.acquire(0).is_none());
}

#[test]
fn every_acquire_between_publications_sees_the_fresh_version() {
    let frees = AtomicUsize::new(0);
    let gate = Gate::new(GateConfig {
        free: counting_free,
        extra_control_blocks: 0,
    });

    for value in 0..32u64 {
        publish(&gate, 0, value, &frees);
        let first = gate.acquire(0).expect("published");
        for _ in 0..8 {
            let again = gate.acquire(0).expect("published");
            assert!(again == first);
            assert_eq!(read_u64(again.object()), value);
            again.release();
        }
        first.release();
    }

    drop(gate);
    assert_eq!(frees.load(Ordering::Relaxed), 32);
}

#[test]
fn discarding_an_unpublished_version_runs_cleanup_once() {
    let frees = AtomicUsize::new(0);
    let gate = Gate::new(GateConfig {
        free: counting_free,
        extra_control_blocks: 0,
    });

    let builder = gate.make_version().expect("slot available");
    builder.set_object(
        Box::into_raw(Box::new(5u64)) as *mut (),
        &frees as *const AtomicUsize as *mut (),
    );
    builder.discard();
    assert_eq!(frees.load(Ordering::Relaxed), 1);

    // A builder with no object attached cleans up nothing.
    let empty = gate.make_version().expect("slot available");
    assert!(empty.object().is_null());
    drop(empty);
    assert_eq!(frees.load(Ordering::Relaxed), 1);
}

#[test]
fn control_blocks_are_independent() {
    let frees = AtomicUsize::new(0);
    let gate = Gate::new(GateConfig {
        free: counting_free,
        extra_control_blocks: 2,
    });
    assert_eq!(gate.control_blocks(), 3);

    for block in 0..3 {
        publish(&gate, block, 100 + block as u64, &frees);
    }

    gate.clear(1);
    assert!(gate.acquire(1).is_none());
    assert_eq!(frees.load(Ordering::Relaxed), 1);

    for block in [0usize, 2] {
        let v = gate.acquire(block).expect("still published");
        assert_eq!(read_u64(v.object()), 100 + block as u64);
        v.release();
    }

    drop(gate);
    assert_eq!(frees.load(Ordering::Relaxed), 3);
}

#[test]
fn reclamation_waits_for_the_last_reader() {
    let frees = AtomicUsize::new(0);
    let gate = Gate::new(GateConfig {
        free: counting_free,
        extra_control_blocks: 0,
    });

    publish(&gate, 0, 1, &frees);
    let a = gate.acquire(0).expect("published");
    let b = gate.acquire(0).expect("published");
    publish(&gate, 0, 2, &frees);

    // Two readers still hold the detached version.
    assert_eq!(frees.load(Ordering::Relaxed), 0);
    a.release();
    assert_eq!(frees.load(Ordering::Relaxed), 0);
    b.release();
    assert_eq!(frees.load(Ordering::Relaxed), 1);

    drop(gate);
    assert_eq!(frees.load(Ordering::Relaxed), 2);
}
