//! Property-based tests for the ownership protocol of `IntrusivePtr`.
//!
//! Whatever sequence of copies, moves, assignments and drops is applied to
//! handles aliasing one allocation, the count equals the number of live
//! handles and the value is destroyed exactly once, when that number reaches
//! zero.
#![cfg(not(loom))]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use proptest::prelude::*;
use tracked_ptr::{IntrusivePtr, Registry, RegistryConfig, TrackedPtr};

struct Probe(Arc<AtomicUsize>);

impl Drop for Probe {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Clone(usize),
    Take(usize),
    Drop(usize),
    Reset(usize),
    Assign(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<usize>().prop_map(Op::Clone),
        1 => any::<usize>().prop_map(Op::Take),
        2 => any::<usize>().prop_map(Op::Drop),
        1 => any::<usize>().prop_map(Op::Reset),
        1 => (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Assign(a, b)),
    ]
}

/// Applies `op` to `slots`, picking indices modulo the current length.
fn apply<P: Clone>(
    slots: &mut Vec<P>,
    op: &Op,
    take: impl Fn(&mut P) -> P,
    reset: impl Fn(&mut P),
) {
    if slots.is_empty() {
        return;
    }
    let len = slots.len();
    match *op {
        Op::Clone(i) => {
            let copy = slots[i % len].clone();
            slots.push(copy);
        }
        Op::Take(i) => {
            let moved = take(&mut slots[i % len]);
            slots.push(moved);
        }
        Op::Drop(i) => {
            slots.swap_remove(i % len);
        }
        Op::Reset(i) => reset(&mut slots[i % len]),
        Op::Assign(i, j) => {
            let source = slots[j % len].clone();
            slots[i % len].clone_from(&source);
        }
    }
}

proptest! {
    #[test]
    fn count_matches_live_handles(ops in prop::collection::vec(op(), 0..64)) {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut slots = vec![IntrusivePtr::new(Probe(drops.clone()))];

        for op in &ops {
            apply(&mut slots, op, IntrusivePtr::take, IntrusivePtr::reset);

            let live = slots.iter().filter(|p| !IntrusivePtr::is_null(p)).count();
            if live > 0 {
                prop_assert_eq!(drops.load(Ordering::SeqCst), 0);
                for ptr in slots.iter().filter(|p| !IntrusivePtr::is_null(p)) {
                    prop_assert_eq!(IntrusivePtr::count(ptr), live);
                }
            } else {
                prop_assert_eq!(drops.load(Ordering::SeqCst), 1);
            }
        }

        drop(slots);
        prop_assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_lives_as_long_as_the_allocation(ops in prop::collection::vec(op(), 0..64)) {
        let registry = Registry::new(RegistryConfig::default());
        let drops = Arc::new(AtomicUsize::new(0));
        let mut slots = vec![TrackedPtr::new_in(Probe(drops.clone()), &registry).unwrap()];

        for op in &ops {
            apply(&mut slots, op, TrackedPtr::take, TrackedPtr::reset);

            let live = slots.iter().filter(|p| !TrackedPtr::is_null(p)).count();
            let registered = usize::from(live > 0);
            prop_assert_eq!(registry.live_count(), registered);
            prop_assert_eq!(drops.load(Ordering::SeqCst), 1 - registered);
        }

        drop(slots);
        prop_assert_eq!(registry.live_count(), 0);
        prop_assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
