//! Handle table.
//!
//! Maps tunnel handles to the records that own live tunnels. Every operation
//! takes the table's single lock, so insertion publishes a complete record
//! and removal hands exclusive ownership of it to exactly one caller.
//!
//! Handles are allocated monotonically starting at 0. After `i32::MAX` the
//! counter wraps to 0, and values still in use are skipped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::tunnel::types::TunnelHandle;

struct Slots<R> {
    entries: HashMap<TunnelHandle, R>,
    next: i32,
}

impl<R> Slots<R> {
    fn allocate(&mut self) -> TunnelHandle {
        loop {
            let candidate = TunnelHandle::new_unchecked(self.next);
            self.next = if self.next == i32::MAX { 0 } else { self.next + 1 };
            if !self.entries.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Table of live tunnel records keyed by handle.
pub struct HandleTable<R> {
    slots: Mutex<Slots<R>>,
}

impl<R> HandleTable<R> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    fn starting_at(first: i32) -> Self {
        HandleTable {
            slots: Mutex::new(Slots {
                entries: HashMap::new(),
                next: first,
            }),
        }
    }

    // A panic while holding the lock cannot leave a half-written entry, so a
    // poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, Slots<R>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `record` under a fresh handle that does not alias any live one.
    pub fn insert(&self, record: R) -> TunnelHandle {
        let mut slots = self.lock();
        let handle = slots.allocate();
        slots.entries.insert(handle, record);
        handle
    }

    /// Take the record for `handle` out of the table.
    ///
    /// Concurrent calls for the same handle see exactly one `Some`.
    pub fn remove(&self, handle: TunnelHandle) -> Option<R> {
        self.lock().entries.remove(&handle)
    }

    /// Run `f` against the record for `handle` while the table is locked.
    pub fn with<T>(&self, handle: TunnelHandle, f: impl FnOnce(&R) -> T) -> Option<T> {
        self.lock().entries.get(&handle).map(f)
    }

    /// Remove every record.
    pub fn drain(&self) -> Vec<(TunnelHandle, R)> {
        self.lock().entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Handles currently live, in ascending order.
    pub fn handles(&self) -> Vec<TunnelHandle> {
        let mut handles: Vec<_> = self.lock().entries.keys().copied().collect();
        handles.sort();
        handles
    }
}

impl<R> Default for HandleTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn handles_are_distinct_and_start_at_zero() {
        let table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_eq!(a.as_raw(), 0);
        assert_eq!(b.as_raw(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_handles_are_not_reissued_immediately() {
        let table = HandleTable::new();
        let a = table.insert(1);
        assert_eq!(table.remove(a), Some(1));
        let b = table.insert(2);
        assert_ne!(a, b);
    }

    #[test]
    fn remove_succeeds_once() {
        let table = HandleTable::new();
        let handle = table.insert("record");
        assert_eq!(table.remove(handle), Some("record"));
        assert_eq!(table.remove(handle), None);
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_handle_is_not_found() {
        let table: HandleTable<()> = HandleTable::new();
        assert!(table.remove(TunnelHandle::new_unchecked(42)).is_none());
        assert!(table.with(TunnelHandle::new_unchecked(42), |_| ()).is_none());
    }

    #[test]
    fn wraparound_skips_live_handles() {
        let table = HandleTable::starting_at(i32::MAX - 1);
        let first = table.insert("first");
        let second = table.insert("second");
        assert_eq!(first.as_raw(), i32::MAX - 1);
        assert_eq!(second.as_raw(), i32::MAX);

        // Occupy 0 under a wrapped counter, then wrap again onto it
        let zero = table.insert("zero");
        assert_eq!(zero.as_raw(), 0);

        let table = HandleTable::starting_at(i32::MAX);
        let max = table.insert("max");
        let zero = table.insert("zero");
        {
            let mut slots = table.lock();
            slots.next = i32::MAX;
        }
        let next = table.insert("after wrap");
        assert_eq!(max.as_raw(), i32::MAX);
        assert_eq!(zero.as_raw(), 0);
        assert_eq!(next.as_raw(), 1);
    }

    #[test]
    fn concurrent_inserts_never_collide() {
        let table = Arc::new(HandleTable::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || (0..100).map(|i| table.insert(t * 1000 + i)).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for handle in thread.join().unwrap() {
                assert!(seen.insert(handle), "handle {} issued twice", handle);
            }
        }
        assert_eq!(table.len(), 800);
    }

    #[test]
    fn concurrent_removal_has_one_winner() {
        for _ in 0..50 {
            let table = Arc::new(HandleTable::new());
            let handle = table.insert(());
            let winners = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..4)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let winners = Arc::clone(&winners);
                    thread::spawn(move || {
                        if table.remove(handle).is_some() {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(winners.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn drain_empties_the_table() {
        let table = HandleTable::new();
        table.insert('a');
        table.insert('b');
        let mut drained: Vec<_> = table.drain().into_iter().map(|(_, r)| r).collect();
        drained.sort();
        assert_eq!(drained, vec!['a', 'b']);
        assert!(table.is_empty());
        assert!(table.handles().is_empty());
    }
}
