//! Example demonstrating basic usage of `Ledger` for manual reference counting.
//!
//! Two owners share a buffer, release it in turn and the sweep reclaims it once nobody
//! holds a reference anymore.

use ref_ledger::{DropPolicy, Ledger};

fn main() {
    println!("=== Ledger: explicit reference counting ===");

    let mut ledger = Ledger::builder()
        .capture_provenance(true)
        .drop_policy(DropPolicy::MustNotDropTracked)
        .build();

    // A buffer of four u32 values, owned by one party.
    let buffer = ledger
        .allocate_and_track(size_of::<u32>(), 4, 1)
        .expect("out of memory")
        .cast::<u32>();

    for i in 0..4 {
        // SAFETY: The buffer has room for four u32 values.
        unsafe { buffer.add(i).write(u32::try_from(i).unwrap() * 100) };
    }

    // A second owner takes a reference.
    ledger.increment(buffer.as_ptr());
    println!("Owners after sharing: {}", ledger.count(buffer.as_ptr()));

    if let Some(record) = ledger.record(buffer.as_ptr()) {
        println!(
            "Tracked {} bytes ({} x {}) registered at {:?}",
            record.byte_len(),
            record.element_count(),
            record.element_size(),
            record.provenance()
        );
    }

    // The first owner is done.
    ledger.decrement(buffer.as_ptr());
    println!("Swept while shared: {}", ledger.sweep());

    // SAFETY: The buffer is still tracked with one owner.
    println!("Last value: {}", unsafe { buffer.add(3).read() });

    // The second owner is done too. Reaching zero frees nothing by itself.
    ledger.decrement(buffer.as_ptr());
    println!("Owners now: {}", ledger.count(buffer.as_ptr()));
    println!("Still tracked: {}", ledger.contains(buffer.as_ptr()));

    println!("Swept after release: {}", ledger.sweep());
    println!("Ledger empty: {}", ledger.is_empty());
}
