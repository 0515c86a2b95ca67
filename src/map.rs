// MIT License
//
// Copyright (c) 2020 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! A lockfree, read-optimized concurrent hash map.
//!
//! Entries live in a lock-free linked list sorted by key hash; a
//! power-of-two array of slots maps hash prefixes to positions in that list
//! so a lookup starts its walk close to its target. The list is
//! authoritative and the slot array is an accelerator: growth allocates a
//! replacement array and swaps it in while readers and writers continue.

mod list;
mod store;


use std::{
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam_utils::atomic::AtomicCell;

use crate::hash::Key;

use self::list::{AddResult, Entry, List};
use self::store::Store;

/// Slot count of a map created with [`HashMap::new`].
pub const DEFAULT_SIZE: usize = 8;

/// Fill rate, in percent, past which an insert schedules a background grow.
pub const MAX_FILL_RATE: usize = 50;

/// A lockfree hash map optimized for point lookups under contention.
///
/// Reads never lock and never block other readers or writers: a `get` is a
/// hash, one atomic slot load, and a short forward walk of the entry list.
/// Writes are deliberately more expensive: they link a new entry into the
/// sorted list and publish it into the slot array, retrying on contention.
///
/// Keys are hashed by a per-width specialized function bound through the
/// [`Key`] trait; see [`set_hasher`](HashMap::set_hasher) for replacing it.
/// Values are stored behind atomically swapped pointers and returned by
/// clone, so `V: Clone`. Values that are cheap to clone, such as small
/// copyable types or `Arc`s, work best.
///
/// When the slot array's fill rate exceeds the configured maximum, a resize
/// runs on a background thread while all operations proceed; an entry
/// inserted during the swap is re-published until it lands in the current
/// array.
pub struct HashMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

struct Inner<K, V> {
    store: Atomic<Store<K, V>>,
    list: List<K, V>,
    // single-slot mutex claimed by the resizer
    resizing: AtomicUsize,
    hasher: AtomicCell<fn(&K) -> u64>,
    max_fill_rate: usize,
}

enum PutOutcome<'g, K, V> {
    Inserted,
    Updated,
    Existed(Shared<'g, Entry<K, V>>),
}

impl<K: Key, V: Clone + Send + Sync + 'static> HashMap<K, V> {
    /// Creates a map with [`DEFAULT_SIZE`] slots.
    pub fn new() -> HashMap<K, V> {
        HashMap::with_fill_rate(DEFAULT_SIZE, MAX_FILL_RATE)
    }

    /// Creates a map with at least `initial_slots` slots.
    ///
    /// The count is rounded up to a power of two, minimum 2.
    pub fn new_sized(initial_slots: usize) -> HashMap<K, V> {
        HashMap::with_fill_rate(initial_slots, MAX_FILL_RATE)
    }

    /// Creates a map with at least `initial_slots` slots that grows once
    /// its fill rate exceeds `max_fill_rate` percent.
    ///
    /// The slot count is rounded up to a power of two, minimum 2.
    ///
    /// # Panics
    ///
    /// Panics if `max_fill_rate` is outside `1..=100`.
    pub fn with_fill_rate(initial_slots: usize, max_fill_rate: usize) -> HashMap<K, V> {
        assert!(
            max_fill_rate >= 1 && max_fill_rate <= 100,
            "max fill rate must be between 1 and 100 percent"
        );

        HashMap {
            inner: Arc::new(Inner {
                store: Atomic::new(Store::with_slots(round_up_slots(initial_slots))),
                list: List::new(),
                resizing: AtomicUsize::new(0),
                hasher: AtomicCell::new(<K as Key>::hash as fn(&K) -> u64),
                max_fill_rate,
            }),
        }
    }

    /// Replaces the hash function.
    ///
    /// The replacement applies to every subsequent operation, so it must be
    /// installed before the map is populated; repartitioning a live map is
    /// not supported.
    ///
    /// # Panics
    ///
    /// Panics if the map already contains entries.
    pub fn set_hasher(&self, hasher: fn(&K) -> u64) {
        assert!(
            self.inner.list.len() == 0,
            "the hasher must be installed before the map is populated"
        );

        self.inner.hasher.store(hasher);
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.inner.list.len()
    }

    /// Returns whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current slot count, or 0 before the first allocation.
    pub fn capacity(&self) -> usize {
        let guard = &crossbeam_epoch::pin();

        match unsafe { self.inner.store.load(Ordering::SeqCst, guard).as_ref() } {
            Some(store) => store.slot_count(),
            None => 0,
        }
    }

    /// Returns the occupied share of the slot array as an integer percent.
    pub fn fill_rate(&self) -> usize {
        let guard = &crossbeam_epoch::pin();

        match unsafe { self.inner.store.load(Ordering::SeqCst, guard).as_ref() } {
            Some(store) => store.fill_rate(),
            None => 0,
        }
    }

    /// Returns a clone of the value bound to `key`, if present.
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash_key(key);

        let store = unsafe { self.inner.store.load(Ordering::SeqCst, guard).as_ref() }?;
        let hint = store.item(hash, guard);

        if hint.is_null() {
            return None;
        }

        let found = self.inner.list.find(hash, key, hint, guard);
        let entry = unsafe { found.as_ref() }?;
        let value = entry.value(guard);

        Some(unsafe { value.deref() }.clone())
    }

    /// Binds `value` to `key`, overwriting any existing binding.
    pub fn set(&self, key: K, value: V) {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash_key(&key);

        self.put_entry(Entry::new(hash, key, value), true, guard);
    }

    /// Binds `value` to `key` only if the key is absent.
    ///
    /// Returns `true` if the entry was inserted and `false` if the key was
    /// already present (the existing value is untouched).
    pub fn insert(&self, key: K, value: V) -> bool {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash_key(&key);

        match self.put_entry(Entry::new(hash, key, value), false, guard) {
            PutOutcome::Existed(_) => false,
            _ => true,
        }
    }

    /// Returns the value bound to `key`, inserting `value` if the key is
    /// absent.
    ///
    /// The boolean is `true` if an existing value was loaded and `false` if
    /// the given value was stored.
    pub fn get_or_insert(&self, key: K, value: V) -> (V, bool) {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash_key(&key);

        // in a read-mostly workload the key is usually already present
        if let Some(store) = unsafe { self.inner.store.load(Ordering::SeqCst, guard).as_ref() } {
            let hint = store.item(hash, guard);

            if !hint.is_null() {
                let found = self.inner.list.find(hash, &key, hint, guard);

                if let Some(entry) = unsafe { found.as_ref() } {
                    return (unsafe { entry.value(guard).deref() }.clone(), true);
                }
            }
        }

        let returned = value.clone();

        match self.put_entry(Entry::new(hash, key, value), false, guard) {
            PutOutcome::Existed(found) => {
                let entry = unsafe { found.deref() };

                (unsafe { entry.value(guard).deref() }.clone(), true)
            }
            _ => (returned, false),
        }
    }

    /// Replaces the value bound to `key` with `new` if the current value
    /// equals `current`.
    ///
    /// Returns whether the swap happened. No entry is created if the key is
    /// absent. The comparison is by value; the replacement is a single
    /// atomic pointer swap.
    pub fn compare_and_swap(&self, key: &K, current: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash_key(key);

        let store = match unsafe { self.inner.store.load(Ordering::SeqCst, guard).as_ref() } {
            Some(store) => store,
            None => return false,
        };
        let hint = store.item(hash, guard);

        if hint.is_null() {
            return false;
        }

        let found = self.inner.list.find(hash, key, hint, guard);

        match unsafe { found.as_ref() } {
            Some(entry) => entry.compare_and_swap_value(current, new, guard),
            None => false,
        }
    }

    /// Removes the binding for `key`.
    ///
    /// Returns `true` if a live entry was removed. The entry is tombstoned
    /// and its slot repaired immediately; its memory is reclaimed once no
    /// concurrent reader can still observe it.
    pub fn remove(&self, key: &K) -> bool {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash_key(key);

        let store = match unsafe { self.inner.store.load(Ordering::SeqCst, guard).as_ref() } {
            Some(store) => store,
            None => return false,
        };
        let hint = store.item(hash, guard);

        if hint.is_null() {
            return false;
        }

        let found = self.inner.list.find(hash, key, hint, guard);
        let entry = match unsafe { found.as_ref() } {
            Some(entry) => entry,
            None => return false,
        };

        if !self.inner.list.mark_deleted(entry, guard) {
            return false; // lost the claim to a concurrent remove
        }

        self.inner.heal_store(found, hash, guard);

        // unlink the tombstone while its predecessor is at hand; when the
        // slot itself referenced the entry the predecessor is unknown and
        // the next traversal cleans up instead
        if hint != found {
            self.inner.list.sweep(hash, key, hint, guard);
        }

        true
    }

    /// Schedules a resize to at least `hint` slots, rounded up to a power
    /// of two and never less than double the current count; 0 means
    /// "double".
    ///
    /// Returns immediately. The resize runs on a background thread; if one
    /// is already in progress this call does nothing.
    pub fn grow(&self, hint: usize) {
        self.try_grow(hint);
    }

    /// Calls `f` on each binding in hash order, stopping early if `f`
    /// returns `false`.
    ///
    /// The traversal is weakly consistent: it observes every binding
    /// present throughout the call and never observes a binding twice, but
    /// concurrent inserts and removes may or may not be visited.
    pub fn range<F: FnMut(&K, &V) -> bool>(&self, mut f: F) {
        let guard = &crossbeam_epoch::pin();
        let mut current = self.inner.list.first(guard);

        while let Some(entry) = unsafe { current.as_ref() } {
            let next = entry.next(guard);

            if next.tag() == 0 {
                let value = entry.value(guard);

                if !f(&entry.key, unsafe { value.deref() }) {
                    return;
                }
            }

            current = next.with_tag(0);
        }
    }

    /// Returns a lazy iterator over clones of the bindings, in hash order.
    ///
    /// Each call starts a fresh weakly consistent traversal; see
    /// [`range`](HashMap::range). The iterator pins the memory it walks, so
    /// it should not be held longer than necessary.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let guard = crossbeam_epoch::pin();
        let current = self.inner.list.first(&guard).as_raw();

        Iter {
            guard,
            current,
            _map: PhantomData,
        }
    }

    fn hash_key(&self, key: &K) -> u64 {
        (self.inner.hasher.load())(key)
    }

    fn put_entry<'g>(
        &'g self,
        entry: Owned<Entry<K, V>>,
        update: bool,
        guard: &'g Guard,
    ) -> PutOutcome<'g, K, V> {
        let hash = entry.hash;
        let mut entry = entry;

        // link into the list, allocating the store on first use
        let inserted = loop {
            let store_ptr = self.inner.store.load(Ordering::SeqCst, guard);

            let store = match unsafe { store_ptr.as_ref() } {
                Some(store) => store,
                None => {
                    self.inner.allocate(DEFAULT_SIZE, guard);

                    continue;
                }
            };

            let hint = store.item(hash, guard);

            match self.inner.list.add(entry, update, hint, guard) {
                AddResult::Existed(found, template) => {
                    drop(template);

                    return PutOutcome::Existed(found);
                }
                AddResult::Updated => return PutOutcome::Updated,
                AddResult::Inserted(inserted) => break inserted,
                AddResult::Contended(template) => entry = template,
            }
        };

        // publish into the slot array, retrying until the store observed
        // before and after the publication is the same one
        loop {
            let store_ptr = self.inner.store.load(Ordering::SeqCst, guard);
            let store = unsafe { store_ptr.deref() };
            let count = store.add_item(inserted, guard);

            if self.inner.store.load(Ordering::SeqCst, guard) != store_ptr {
                continue; // a grow swapped the store; reach the new one
            }

            if count != 0 && (count * 100) / store.slot_count() > self.inner.max_fill_rate {
                self.try_grow(0);
            }

            return PutOutcome::Inserted;
        }
    }

    fn try_grow(&self, hint: usize) {
        if self
            .inner
            .resizing
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);

            thread::spawn(move || inner.grow(hint, true));
        }
    }
}

impl<K, V> Inner<K, V> {
    // Installs the initial store; the loser of a concurrent race discards
    // its allocation.
    fn allocate(&self, slots: usize, guard: &Guard) {
        let store = Owned::new(Store::with_slots(round_up_slots(slots)));

        if let Err(e) = self.store.compare_exchange(
            Shared::null(),
            store,
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            drop(e.new);
        }
    }

    // Grows until the fill rate is acceptable, then releases the resizing
    // claim. The new store is filled from the list, published, and filled
    // again: inserters that raced the first pass retry their publication
    // against the published store, and the second pass plugs any slot they
    // populated in the retired one.
    fn grow(&self, hint: usize, recheck: bool) {
        let mut hint = hint;

        loop {
            let guard = &crossbeam_epoch::pin();
            let store_ptr = self.store.load(Ordering::SeqCst, guard);

            let old = match unsafe { store_ptr.as_ref() } {
                Some(store) => store,
                None => {
                    self.allocate(hint.max(DEFAULT_SIZE), guard);

                    break;
                }
            };

            let new_slots = round_up_slots(hint.max(old.slot_count() * 2));
            let new_ptr = Owned::new(Store::with_slots(new_slots)).into_shared(guard);
            let new_store = unsafe { new_ptr.deref() };

            self.fill_index(new_store, guard);
            let old_ptr = self.store.swap(new_ptr, Ordering::SeqCst, guard);
            self.fill_index(new_store, guard);

            unsafe { guard.defer_destroy(old_ptr) };

            if !recheck {
                break;
            }

            if (self.list.len() * 100) / new_slots <= self.max_fill_rate {
                break;
            }

            hint = 0;
        }

        self.resizing.store(0, Ordering::SeqCst);
    }

    // Installs the first live entry of every hash prefix into `store`.
    fn fill_index(&self, store: &Store<K, V>, guard: &Guard) {
        let mut current = self.list.first(guard);
        let mut last_index = None;

        while let Some(entry) = unsafe { current.as_ref() } {
            let next = entry.next(guard);

            if next.tag() == 0 {
                let index = store.slot_index(entry.hash);

                if last_index != Some(index) {
                    store.add_item(current, guard);
                    last_index = Some(index);
                }
            }

            current = next.with_tag(0);
        }
    }

    // Repoints the slot referencing a tombstoned entry, retrying while a
    // grow replaces the store underneath.
    fn heal_store(&self, entry: Shared<'_, Entry<K, V>>, hash: u64, guard: &Guard) {
        loop {
            let store_ptr = self.store.load(Ordering::SeqCst, guard);

            let store = match unsafe { store_ptr.as_ref() } {
                Some(store) => store,
                None => return,
            };

            if store.item(hash, guard) == entry {
                store.heal_slot(entry, guard);
            }

            if self.store.load(Ordering::SeqCst, guard) == store_ptr {
                return;
            }
        }
    }
}

impl<K, V> Drop for Inner<K, V> {
    fn drop(&mut self) {
        unsafe {
            let store = self
                .store
                .load(Ordering::Relaxed, crossbeam_epoch::unprotected());

            if !store.is_null() {
                drop(store.into_owned());
            }
        }
    }
}

impl<K: Key, V: Clone + Send + Sync + 'static> Default for HashMap<K, V> {
    /// Creates an empty map that defers its slot allocation to the first
    /// insert.
    fn default() -> HashMap<K, V> {
        HashMap {
            inner: Arc::new(Inner {
                store: Atomic::null(),
                list: List::new(),
                resizing: AtomicUsize::new(0),
                hasher: AtomicCell::new(<K as Key>::hash as fn(&K) -> u64),
                max_fill_rate: MAX_FILL_RATE,
            }),
        }
    }
}

impl<K, V> fmt::Display for HashMap<K, V> {
    /// Formats the map as its bracketed, comma-separated hash values in
    /// traversal order, a debug aid that prints neither keys nor values.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = &crossbeam_epoch::pin();

        write!(f, "[")?;

        let mut current = self.inner.list.first(guard);
        let mut first = true;

        while let Some(entry) = unsafe { current.as_ref() } {
            let next = entry.next(guard);

            if next.tag() == 0 {
                if !first {
                    write!(f, ",")?;
                }

                write!(f, "{}", entry.hash)?;
                first = false;
            }

            current = next.with_tag(0);
        }

        write!(f, "]")
    }
}

/// A lazy, weakly consistent traversal of a [`HashMap`].
///
/// Yields clones of the bindings in hash order. Holds an epoch guard for
/// the duration of the traversal.
pub struct Iter<'a, K, V> {
    guard: Guard,
    current: *const Entry<K, V>,
    _map: PhantomData<&'a HashMap<K, V>>,
}

impl<'a, K: Clone, V: Clone> Iterator for Iter<'a, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let current: Shared<'_, Entry<K, V>> = self.current.into();
            let entry = unsafe { current.as_ref() }?;
            let next = entry.next(&self.guard);

            self.current = next.with_tag(0).as_raw();

            if next.tag() == 0 {
                let value = entry.value(&self.guard);

                return Some((entry.key.clone(), unsafe { value.deref() }.clone()));
            }
        }
    }
}

impl<'a, K: Key, V: Clone + Send + Sync + 'static> IntoIterator for &'a HashMap<K, V> {
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

fn round_up_slots(slots: usize) -> usize {
    slots.next_power_of_two().max(2)
}
