use std::ptr::NonNull;

use foldhash::{HashMap, HashMapExt};

use crate::RefRecord;

/// Whether [`PtrMap::insert()`] stored a new entry or found the key already present.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum InsertOutcome {
    Inserted,
    AlreadyExisted,
}

/// Address-keyed storage for the records of a [`Ledger`][crate::Ledger].
///
/// Keys and records live in two parallel dense vectors so that a full traversal touches only
/// contiguous memory. An index from address to position makes lookups O(1). We hash addresses
/// with `foldhash`, which mixes the bits of the key; an identity hash would cluster badly because
/// allocator-returned addresses share their low (alignment) bits.
///
/// The keys are kept as pointers rather than bare addresses so that the ledger can hand a
/// pointer with intact provenance back to its allocator when it frees a block. The map itself
/// never dereferences them.
///
/// Removal compacts the vectors by moving the last entry into the vacated position. This means
/// removal reorders entries, so a caller that removes while walking positions must snapshot the
/// keys it intends to remove before touching the map.
#[derive(Debug)]
pub(crate) struct PtrMap {
    /// Position of each key in `keys` and `records`, by address.
    index: HashMap<usize, usize>,

    keys: Vec<NonNull<u8>>,
    records: Vec<RefRecord>,
}

impl PtrMap {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            index: HashMap::new(),
            keys: Vec::new(),
            records: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.keys.len(), self.records.len());
        debug_assert_eq!(self.keys.len(), self.index.len());

        self.keys.len()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Stores `record` under `address` unless the address is already present, in which case the
    /// existing record is left untouched.
    pub(crate) fn insert(&mut self, key: NonNull<u8>, record: RefRecord) -> InsertOutcome {
        let address = key.as_ptr().addr();

        if self.index.contains_key(&address) {
            return InsertOutcome::AlreadyExisted;
        }

        self.index.insert(address, self.keys.len());
        self.keys.push(key);
        self.records.push(record);

        InsertOutcome::Inserted
    }

    #[must_use]
    pub(crate) fn contains(&self, address: usize) -> bool {
        self.index.contains_key(&address)
    }

    #[must_use]
    pub(crate) fn get(&self, address: usize) -> Option<&RefRecord> {
        let position = *self.index.get(&address)?;
        self.records.get(position)
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, address: usize) -> Option<&mut RefRecord> {
        let position = *self.index.get(&address)?;
        self.records.get_mut(position)
    }

    /// Removes the entry for `address`, moving the last entry into its position.
    pub(crate) fn remove(&mut self, address: usize) -> Option<(NonNull<u8>, RefRecord)> {
        let position = self.index.remove(&address)?;

        let key = self.keys.swap_remove(position);
        let record = self.records.swap_remove(position);

        // If we did not remove the last entry, the former last entry now sits at `position`.
        if let Some(moved) = self.keys.get(position) {
            self.index.insert(moved.as_ptr().addr(), position);
        }

        Some((key, record))
    }

    /// Removes every entry, returning the keys in storage order.
    pub(crate) fn drain_keys(&mut self) -> Vec<NonNull<u8>> {
        self.index.clear();
        self.records.clear();
        std::mem::take(&mut self.keys)
    }

    /// Iterates over all entries in storage order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (NonNull<u8>, &RefRecord)> {
        self.keys.iter().copied().zip(self.records.iter())
    }

    /// The addresses of every entry, in storage order.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn addresses(&self) -> Vec<usize> {
        self.keys.iter().map(|key| key.as_ptr().addr()).collect()
    }
}

// SAFETY: The map holds pointers only as opaque keys and never dereferences them, so moving it
// to another thread cannot cause a data race through them.
unsafe impl Send for PtrMap {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ptr;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(PtrMap: Send);
    assert_not_impl_any!(PtrMap: Sync);

    fn record(refcount: usize) -> RefRecord {
        RefRecord::new(refcount, 1, 1, None)
    }

    /// A key that is never dereferenced, so it does not need to point anywhere.
    fn key(address: usize) -> NonNull<u8> {
        NonNull::new(ptr::without_provenance_mut(address)).unwrap()
    }

    #[test]
    fn insert_reports_new_and_existing() {
        let mut map = PtrMap::new();

        assert_eq!(map.insert(key(0x1000), record(1)), InsertOutcome::Inserted);
        assert_eq!(map.insert(key(0x1000), record(5)), InsertOutcome::AlreadyExisted);

        // The existing record was not overwritten.
        assert_eq!(map.get(0x1000).unwrap().refcount(), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn get_missing_is_none() {
        let mut map = PtrMap::new();

        assert!(map.get(0x1000).is_none());
        assert!(map.get_mut(0x1000).is_none());
        assert!(!map.contains(0x1000));
        assert!(map.is_empty());
    }

    #[test]
    fn get_mut_modifies_in_place() {
        let mut map = PtrMap::new();
        map.insert(key(0x1000), record(1));

        map.get_mut(0x1000).unwrap().set_refcount(9);

        assert_eq!(map.get(0x1000).unwrap().refcount(), 9);
    }

    #[test]
    fn remove_moves_last_entry_into_gap() {
        let mut map = PtrMap::new();
        map.insert(key(0x10), record(1));
        map.insert(key(0x20), record(2));
        map.insert(key(0x30), record(3));

        let (removed_key, removed) = map.remove(0x10).unwrap();
        assert_eq!(removed_key, key(0x10));
        assert_eq!(removed.refcount(), 1);

        // 0x30 was the last entry and now occupies the first position.
        assert_eq!(map.addresses(), vec![0x30, 0x20]);

        // Lookups still resolve through the updated index.
        assert_eq!(map.get(0x30).unwrap().refcount(), 3);
        assert_eq!(map.get(0x20).unwrap().refcount(), 2);
        assert!(map.get(0x10).is_none());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn remove_last_entry() {
        let mut map = PtrMap::new();
        map.insert(key(0x10), record(1));
        map.insert(key(0x20), record(2));

        map.remove(0x20).unwrap();

        assert_eq!(map.addresses(), vec![0x10]);
        assert_eq!(map.get(0x10).unwrap().refcount(), 1);
    }

    #[test]
    fn remove_missing_is_none() {
        let mut map = PtrMap::new();
        map.insert(key(0x10), record(1));

        assert!(map.remove(0x20).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_everything_in_insertion_order() {
        let mut map = PtrMap::new();

        for address in (1..=100_usize).map(|i| i * 16) {
            map.insert(key(address), record(address));
        }

        for address in (1..=100_usize).map(|i| i * 16) {
            let (_, removed) = map.remove(address).unwrap();
            assert_eq!(removed.refcount(), address);

            for (key, record) in map.iter() {
                assert_eq!(record.refcount(), key.as_ptr().addr());
            }
        }

        assert!(map.is_empty());
    }

    #[test]
    fn drain_keys_empties_map() {
        let mut map = PtrMap::new();
        map.insert(key(0x10), record(1));
        map.insert(key(0x20), record(2));

        let keys = map.drain_keys();

        assert_eq!(keys, vec![key(0x10), key(0x20)]);
        assert!(map.is_empty());
        assert!(!map.contains(0x10));
    }

    #[test]
    fn iter_yields_all_entries() {
        let mut map = PtrMap::new();
        map.insert(key(0x10), record(1));
        map.insert(key(0x20), record(2));

        let entries = map
            .iter()
            .map(|(key, record)| (key.as_ptr().addr(), record.refcount()))
            .collect::<Vec<_>>();

        assert_eq!(entries, vec![(0x10, 1), (0x20, 2)]);
    }
}
