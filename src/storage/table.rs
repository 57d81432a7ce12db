//! `FixTable` is an insert-only, fixed-capacity, open-addressed hash table.
//!
//! Every slot carries an atomic state that only moves forward:
//! `EMPTY -> CLAIMED -> OCCUPIED`. A writer claims an empty slot with a CAS,
//! writes the entry and publishes it with a release store. Readers that find a
//! claimed slot wait for it to be published before comparing keys. If building
//! the value unwinds, the slot becomes `POISONED` and every probe skips it. Entries are
//! never removed or moved, so references handed out live as long as the table,
//! in the same spirit as `elsa`'s frozen collections.
//!
//! There is no resizing: when the probe sequence wraps around, the insertion
//! fails with `FixError::TableFull`.

use std::cell::UnsafeCell;
use std::hash::Hash;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::error::{FixError, Result};

const EMPTY: u8 = 0;
const CLAIMED: u8 = 1;
const OCCUPIED: u8 = 2;
const POISONED: u8 = 3;

struct Slot<K, V> {
    state: AtomicU8,
    entry: UnsafeCell<MaybeUninit<(K, V)>>,
}

impl<K, V> Slot<K, V> {
    fn empty() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            entry: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Waits until a claimed slot is published and returns its entry, or
    /// `None` if its writer unwound
    #[inline]
    fn published(&self) -> Option<&(K, V)> {
        loop {
            match self.state.load(Ordering::Acquire) {
                OCCUPIED => break,
                POISONED => return None,
                _ => std::hint::spin_loop(),
            }
        }
        // SAFETY: the state is `OCCUPIED`, so the entry was fully written
        // before the release store that we just synchronized with, and it is
        // never written again.
        Some(unsafe { (*self.entry.get()).assume_init_ref() })
    }
}

/// Poisons a claimed slot if dropped before the entry is published
struct Claim<'a>(&'a AtomicU8);

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        // only the claiming thread moves a slot out of `CLAIMED`
        if self.0.load(Ordering::Relaxed) == CLAIMED {
            self.0.store(POISONED, Ordering::Release);
        }
    }
}

pub struct FixTable<K, V> {
    name: &'static str,
    slots: Box<[Slot<K, V>]>,
    len: AtomicUsize,
}

// SAFETY: entries are written once by the thread that won the claim and are
// immutable afterwards; all cross-thread access goes through the acquire /
// release protocol on `state`.
unsafe impl<K: Send, V: Send> Send for FixTable<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for FixTable<K, V> {}

impl<K, V> std::fmt::Debug for FixTable<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixTable")
            .field("name", &self.name)
            .field("capacity", &self.slots.len())
            .field("len", &self.len.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K: Eq + Hash, V> FixTable<K, V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| Slot::empty()).collect();
        Self {
            name,
            slots,
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn start(&self, key: &K) -> usize {
        (fxhash::hash64(key) % self.slots.len() as u64) as usize
    }

    fn full(&self) -> FixError {
        FixError::TableFull {
            table: self.name,
            capacity: self.capacity(),
        }
    }

    /// Inserts `(key, make())` unless `key` is already present. Returns the
    /// value stored under `key` and whether this call was the one storing it.
    /// `make` is only called by the winning writer.
    pub fn insert_with(&self, key: K, make: impl FnOnce() -> V) -> Result<(&V, bool)> {
        let cap = self.slots.len();
        let start = self.start(&key);
        let mut make = Some(make);
        for i in 0..cap {
            let slot = &self.slots[(start + i) % cap];
            match slot.state.compare_exchange(
                EMPTY,
                CLAIMED,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let make = make.take().expect("a slot is only claimed once per insert");
                    let claim = Claim(&slot.state);
                    // SAFETY: we own the claim, nobody reads the entry until
                    // `OCCUPIED` is published below.
                    let entry = unsafe { (*slot.entry.get()).write((key, make())) };
                    slot.state.store(OCCUPIED, Ordering::Release);
                    drop(claim);
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return Ok((&entry.1, true));
                }
                Err(_) => {
                    if let Some((k, v)) = slot.published() {
                        if k == &key {
                            return Ok((v, false));
                        }
                    }
                }
            }
        }
        Err(self.full())
    }

    #[inline]
    pub fn insert(&self, key: K, value: V) -> Result<(&V, bool)> {
        self.insert_with(key, || value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let cap = self.slots.len();
        let start = self.start(key);
        for i in 0..cap {
            let slot = &self.slots[(start + i) % cap];
            if slot.state.load(Ordering::Acquire) == EMPTY {
                return None;
            }
            match slot.published() {
                Some((k, v)) if k == key => return Some(v),
                _ => (),
            }
        }
        None
    }

    #[inline]
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Iterates over published entries. Entries inserted concurrently may or
    /// may not be visited.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|slot| {
            if slot.state.load(Ordering::Acquire) != OCCUPIED {
                return None;
            }
            slot.published().map(|(k, v)| (k, v))
        })
    }
}

impl<K, V> Drop for FixTable<K, V> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.state.get_mut() == OCCUPIED {
                // SAFETY: occupied entries were initialized exactly once and
                // we have exclusive access.
                unsafe { slot.entry.get_mut().assume_init_drop() }
            }
        }
    }
}
