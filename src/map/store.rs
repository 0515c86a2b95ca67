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

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Shared};

use super::list::Entry;

// The bucket index. Slot `i` holds a reference to the list entry with the
// smallest hash whose top bits equal `i`, or null if no live entry maps
// there. The index never resizes in place; growth allocates a replacement.
// The list is authoritative: a stale slot costs an earlier walk start, never
// a wrong answer.
pub(crate) struct Store<K, V> {
    key_shifts: u32,
    count: AtomicUsize,
    index: Box<[Atomic<Entry<K, V>>]>,
}

impl<K, V> Store<K, V> {
    // `slots` must be a power of two, at least 2.
    pub(crate) fn with_slots(slots: usize) -> Store<K, V> {
        assert!(slots.is_power_of_two());
        assert!(slots >= 2);

        let index = (0..slots).map(|_| Atomic::null()).collect();

        Store {
            key_shifts: 64 - slots.trailing_zeros(),
            count: AtomicUsize::new(0),
            index,
        }
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn fill_rate(&self) -> usize {
        (self.count.load(Ordering::SeqCst) * 100) / self.index.len()
    }

    pub(crate) fn slot_index(&self, hash: u64) -> usize {
        (hash >> self.key_shifts) as usize
    }

    pub(crate) fn item<'g>(&self, hash: u64, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        self.index[self.slot_index(hash)].load(Ordering::SeqCst, guard)
    }

    // Publishes `entry` into its slot if it is the new minimum for that
    // slot. Returns the new occupancy count when a null slot was filled and
    // 0 whenever the count did not change. A slot found referencing a
    // tombstoned entry is healed first, so a finished publication is always
    // reachable from this store.
    pub(crate) fn add_item<'g>(&self, entry: Shared<'g, Entry<K, V>>, guard: &'g Guard) -> usize {
        let entry_ref = unsafe { entry.deref() };
        let index = self.slot_index(entry_ref.hash);
        let slot = &self.index[index];
        let mut current = slot.load(Ordering::SeqCst, guard);

        loop {
            let current_ref = match unsafe { current.as_ref() } {
                Some(r) => r,
                None => {
                    match slot.compare_exchange(
                        current,
                        entry,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    ) {
                        Ok(_) => return self.count.fetch_add(1, Ordering::SeqCst) + 1,
                        Err(e) => {
                            current = e.current;
                            continue;
                        }
                    }
                }
            };

            if current_ref.is_deleted(guard) {
                self.heal_slot(current, guard);
                current = slot.load(Ordering::SeqCst, guard);

                continue;
            }

            if entry_ref.hash < current_ref.hash {
                match slot.compare_exchange(
                    current,
                    entry,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(_) => return 0,
                    Err(e) => {
                        current = e.current;
                        continue;
                    }
                }
            }

            return 0;
        }
    }

    // Replaces a slot referencing the tombstoned `current` with its first
    // live same-slot successor, or clears it. Clearing an occupied slot
    // gives back its occupancy count.
    pub(crate) fn heal_slot<'g>(&self, current: Shared<'g, Entry<K, V>>, guard: &'g Guard) {
        let current_ref = unsafe { current.deref() };
        let index = self.slot_index(current_ref.hash);
        let replacement = self.live_successor(current_ref, index, guard);

        if self.index[index]
            .compare_exchange(
                current,
                replacement,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            )
            .is_ok()
            && replacement.is_null()
        {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    // First entry after `entry` that still maps to `index` and is not
    // tombstoned. The forward chain of a tombstoned entry is frozen, so this
    // walk sees every entry that was linked behind it.
    fn live_successor<'g>(
        &self,
        entry: &Entry<K, V>,
        index: usize,
        guard: &'g Guard,
    ) -> Shared<'g, Entry<K, V>> {
        let mut next = entry.next(guard).with_tag(0);

        while let Some(next_ref) = unsafe { next.as_ref() } {
            if self.slot_index(next_ref.hash) != index {
                break;
            }

            if !next_ref.is_deleted(guard) {
                return next;
            }

            next = next_ref.next(guard).with_tag(0);
        }

        Shared::null()
    }
}
