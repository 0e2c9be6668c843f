//! Integration tests for the `ref_ledger` package.
//!
//! These exercise the ledger through its public API the way a manual memory manager would:
//! building small reference graphs, moving ledgers across threads and plugging in custom
//! allocators.

use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::thread;

use ref_ledger::{DropPolicy, Error, Ledger, LedgerAllocator, SystemAllocator};

/// A node in a singly linked list whose nodes are ledger-managed blocks.
#[repr(C)]
struct Node {
    value: u64,
    next: *mut Node,
}

fn push_node(ledger: &mut Ledger, value: u64, next: *mut Node) -> *mut Node {
    let node = ledger
        .allocate_and_track(size_of::<Node>(), 1, 1)
        .unwrap()
        .cast::<Node>();

    // SAFETY: The block is fresh and large enough for a Node.
    unsafe {
        node.write(Node { value, next });
    }

    node.as_ptr()
}

/// Releases one reference to `node` and, if that was the last one, releases the reference it
/// held to its successor, and so on down the list.
fn release_chain(ledger: &mut Ledger, mut node: *mut Node) {
    while !node.is_null() {
        ledger.decrement(node).unwrap();

        if ledger.count(node) != 0 {
            break;
        }

        // SAFETY: The node is still tracked, so it has not been swept yet.
        node = unsafe { (*node).next };
    }
}

#[test]
fn shared_tail_survives_until_last_owner_releases() {
    let mut ledger = Ledger::builder()
        .drop_policy(DropPolicy::MustNotDropTracked)
        .build();

    // tail <- middle <- head_a
    //      ^
    //      +-- head_b
    let tail = push_node(&mut ledger, 3, ptr::null_mut());
    let middle = push_node(&mut ledger, 2, tail);
    let head_a = push_node(&mut ledger, 1, middle);

    ledger.increment(tail).unwrap();
    let head_b = push_node(&mut ledger, 10, tail);

    assert_eq!(ledger.count(tail), 2);

    release_chain(&mut ledger, head_a);
    assert_eq!(ledger.sweep(), 2);

    assert!(!ledger.contains(head_a));
    assert!(!ledger.contains(middle));
    assert_eq!(ledger.count(tail), 1);

    // SAFETY: The tail is still tracked with a live reference.
    assert_eq!(unsafe { (*tail).value }, 3);

    release_chain(&mut ledger, head_b);
    assert_eq!(ledger.sweep(), 2);
    assert!(ledger.is_empty());
}

#[test]
fn sweep_only_reclaims_when_asked() {
    let mut ledger = Ledger::new();

    let nodes = (0..100_u64)
        .map(|value| push_node(&mut ledger, value, ptr::null_mut()))
        .collect::<Vec<_>>();

    for node in &nodes {
        ledger.decrement(*node).unwrap();
    }

    // Every count is zero but nothing has been freed: the memory is still readable.
    for (expected, node) in (0_u64..).zip(&nodes) {
        assert_eq!(ledger.count(*node), 0);

        // SAFETY: Zero-count blocks stay allocated until the sweep.
        assert_eq!(unsafe { (**node).value }, expected);
    }

    assert_eq!(ledger.sweep(), 100);
    assert!(ledger.is_empty());
}

#[test]
fn duplicated_node_is_independent() {
    let mut ledger = Ledger::new();

    let original = push_node(&mut ledger, 5, ptr::null_mut());

    // SAFETY: The node is initialized and its tracked shape matches.
    let copy = unsafe { ledger.duplicate(original, 1) }.unwrap();

    // SAFETY: Both nodes are live.
    unsafe {
        (*original).value = 6;
        assert_eq!(copy.as_ref().value, 5);
    }

    release_chain(&mut ledger, original);
    assert_eq!(ledger.sweep(), 1);
    assert_eq!(ledger.count(copy.as_ptr()), 1);

    // SAFETY: The copy survived the sweep because it still has a reference.
    assert_eq!(unsafe { copy.as_ref().value }, 5);

    release_chain(&mut ledger, copy.as_ptr());
    assert_eq!(ledger.sweep(), 1);
}

#[test]
fn ledgers_are_isolated() {
    let mut first = Ledger::new();
    let mut second = Ledger::new();

    let ptr = first.allocate_and_track(8, 1, 1).unwrap();

    assert_eq!(second.count(ptr.as_ptr()), 0);
    assert!(second.increment(ptr.as_ptr()).is_none());
    assert_eq!(second.sweep(), 0);

    assert_eq!(first.count(ptr.as_ptr()), 1);

    first.decrement(ptr.as_ptr()).unwrap();
    assert_eq!(first.sweep(), 1);
}

#[test]
fn ledger_can_move_between_threads() {
    let mut ledger = Ledger::new();
    let ptr = ledger.allocate_and_track(8, 1, 0).unwrap();
    let address = ptr.as_ptr().addr();

    let (ledger, freed) = thread::spawn(move || {
        let mut ledger = ledger;
        let freed = ledger.sweep();
        (ledger, freed)
    })
    .join()
    .unwrap();

    assert_eq!(freed, 1);
    assert!(ledger.is_empty());
    assert!(!ledger.contains(ptr::without_provenance::<u8>(address)));
}

#[test]
fn shared_ledger_behind_mutex() {
    let ledger = Arc::new(Mutex::new(Ledger::new()));

    let address = {
        let mut ledger = ledger.lock().unwrap();
        ledger.allocate_and_track(8, 1, 0).unwrap().as_ptr().addr()
    };

    let handles = (0..4)
        .map(|_| {
            let ledger = Arc::clone(&ledger);

            thread::spawn(move || {
                let mut ledger = ledger.lock().unwrap();

                // Only used as a lookup key, never dereferenced.
                let key = ptr::without_provenance_mut::<u8>(address);

                for _ in 0..250 {
                    ledger.increment(key).unwrap();
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    let mut ledger = ledger.lock().unwrap();
    let key = ptr::without_provenance_mut::<u8>(address);

    assert_eq!(ledger.count(key), 1000);

    ledger.recount(key, 0).unwrap();
    assert_eq!(ledger.sweep(), 1);
}

/// Hands out memory from the system allocator and counts live blocks.
#[derive(Debug, Default)]
struct LiveCounter {
    live: Arc<AtomicUsize>,
}

// SAFETY: Delegates to SystemAllocator, which upholds the contract.
unsafe impl LedgerAllocator for LiveCounter {
    fn allocate(&self, element_size: usize, element_count: usize) -> Option<NonNull<u8>> {
        let ptr = SystemAllocator.allocate(element_size, element_count)?;
        self.live.fetch_add(1, atomic::Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.live.fetch_sub(1, atomic::Ordering::Relaxed);

        // SAFETY: Forwarding the caller's guarantee.
        unsafe { SystemAllocator.deallocate(ptr) }
    }
}

#[test]
fn custom_allocator_sees_every_block() {
    let allocator = LiveCounter::default();
    let live = Arc::clone(&allocator.live);

    let mut ledger = Ledger::builder()
        .allocator(allocator)
        .drop_policy(DropPolicy::FreeTracked)
        .build();

    let a = ledger.allocate_and_track(16, 2, 1).unwrap();
    let b = ledger.allocate_bytes_and_track(3, 0).unwrap();

    // SAFETY: The block is initialized with 32 bytes.
    unsafe { a.as_ptr().write_bytes(0, 32) };

    // SAFETY: The block is initialized.
    let c = unsafe { ledger.duplicate(a.as_ptr(), 2) }.unwrap();

    assert_eq!(live.load(atomic::Ordering::Relaxed), 3);

    assert_eq!(ledger.sweep(), 1);
    assert!(!ledger.contains(b.as_ptr()));
    assert_eq!(live.load(atomic::Ordering::Relaxed), 2);

    // SAFETY: Nobody uses `c` afterwards.
    let record = unsafe { ledger.force_free_if_below(c.as_ptr(), 2) }.unwrap();
    assert_eq!(record.refcount(), 2);
    assert_eq!(live.load(atomic::Ordering::Relaxed), 1);

    // The remaining block is released by the drop policy.
    drop(ledger);
    assert_eq!(live.load(atomic::Ordering::Relaxed), 0);
}

#[test]
fn errors_describe_the_pointer() {
    let mut ledger = Ledger::new();
    let ptr = ledger.allocate_and_track(8, 1, 4).unwrap();

    // SAFETY: The free is refused, so nothing is released.
    let error = unsafe { ledger.force_free_if_below(ptr.as_ptr(), 1) }.unwrap_err();

    assert!(matches!(
        error,
        Error::TooManyReferences {
            refcount: 4,
            max_refs: 1,
            ..
        }
    ));
    assert!(error.to_string().contains(&format!("{:#x}", ptr.as_ptr().addr())));

    ledger.recount(ptr.as_ptr(), 0).unwrap();
    ledger.sweep();
}

#[test]
fn provenance_survives_metadata_updates() {
    let mut ledger = Ledger::builder().capture_provenance(true).build();

    let ptr = ledger.allocate_and_track(4, 4, 1).unwrap();
    let before = ledger.record(ptr.as_ptr()).unwrap().provenance().unwrap();

    ledger.resize(ptr.as_ptr(), 64).unwrap();
    ledger.increment(ptr.as_ptr()).unwrap();

    let record = ledger.record(ptr.as_ptr()).unwrap();
    assert_eq!(record.provenance(), Some(before));
    assert_eq!(record.byte_len(), 64);
    assert_eq!(before.file(), file!());

    ledger.recount(ptr.as_ptr(), 0).unwrap();
    ledger.sweep();
}
