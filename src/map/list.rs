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

use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

// An entry is logically removed once its forward link carries this tag. The
// tag freezes the link: compare-and-swaps that expect an untagged pointer
// fail, so nothing can be inserted behind a dying entry.
pub(crate) const DELETED_TAG: usize = 1;

pub(crate) struct Entry<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    value: Atomic<V>,
    next: Atomic<Entry<K, V>>,
    deleted: AtomicUsize,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(hash: u64, key: K, value: V) -> Owned<Entry<K, V>> {
        Owned::new(Entry {
            hash,
            key,
            value: Atomic::new(value),
            next: Atomic::null(),
            deleted: AtomicUsize::new(0),
        })
    }

    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> Shared<'g, V> {
        self.value.load(Ordering::SeqCst, guard)
    }

    // Raw forward link; the tag is part of the value.
    pub(crate) fn next<'g>(&self, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        self.next.load(Ordering::SeqCst, guard)
    }

    pub(crate) fn is_deleted(&self, guard: &Guard) -> bool {
        self.next.load(Ordering::SeqCst, guard).tag() == DELETED_TAG
    }

    pub(crate) fn store_value(&self, new: Shared<'_, V>, guard: &Guard) {
        let old = self.value.swap(new, Ordering::SeqCst, guard);

        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }

    pub(crate) fn compare_and_swap_value(&self, expected: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut new = Owned::new(new);
        let mut current = self.value.load(Ordering::SeqCst, guard);

        loop {
            match unsafe { current.as_ref() } {
                Some(value) if value == expected => (),
                _ => return false,
            }

            match self
                .value
                .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst, guard)
            {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };

                    return true;
                }
                Err(e) => {
                    new = e.new;
                    current = e.current;
                }
            }
        }
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        let value = mem::replace(&mut self.value, Atomic::null());

        unsafe {
            let ptr = value.load(Ordering::Relaxed, crossbeam_epoch::unprotected());

            if !ptr.is_null() {
                drop(ptr.into_owned());
            }
        }
    }
}

// A lock-free singly linked list of entries in ascending hash order. Entries
// that share a hash sit consecutively and are told apart by key equality.
// The head pointer is the sentinel link; it never carries a tag.
pub(crate) struct List<K, V> {
    head: Atomic<Entry<K, V>>,
    count: AtomicUsize,
}

pub(crate) enum AddResult<'g, K, V> {
    // An entry with this hash and key already exists; the caller gets its
    // template back.
    Existed(Shared<'g, Entry<K, V>>, Owned<Entry<K, V>>),
    // The template's value was stored into an existing entry; nothing was
    // linked.
    Updated,
    Inserted(Shared<'g, Entry<K, V>>),
    // Lost a compare-and-swap to a concurrent writer; retry with a fresh
    // search.
    Contended(Owned<Entry<K, V>>),
}

enum SearchOutcome<'g, K, V> {
    Found(Shared<'g, Entry<K, V>>),
    // The insertion window: `prev` currently links to `next`, and `next` is
    // the first entry whose hash exceeds the target (or null).
    Window {
        prev: &'g Atomic<Entry<K, V>>,
        next: Shared<'g, Entry<K, V>>,
    },
}

impl<K, V> List<K, V> {
    pub(crate) fn new() -> List<K, V> {
        List {
            head: Atomic::null(),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn first<'g>(&self, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        self.head.load(Ordering::SeqCst, guard)
    }

    // Claims the entry for removal. The claiming thread freezes the forward
    // link and decrements the count; the physical unlink happens in whatever
    // search next walks past the entry.
    pub(crate) fn mark_deleted(&self, entry: &Entry<K, V>, guard: &Guard) -> bool {
        if entry
            .deleted
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false; // another thread is removing this entry
        }

        loop {
            let next = entry.next.load(Ordering::SeqCst, guard);

            if entry
                .next
                .compare_exchange(
                    next.with_tag(0),
                    next.with_tag(DELETED_TAG),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                )
                .is_ok()
            {
                break;
            }
        }

        self.count.fetch_sub(1, Ordering::SeqCst);

        true
    }
}

impl<K: PartialEq, V> List<K, V> {
    pub(crate) fn add<'g>(
        &'g self,
        mut entry: Owned<Entry<K, V>>,
        update: bool,
        start: Shared<'g, Entry<K, V>>,
        guard: &'g Guard,
    ) -> AddResult<'g, K, V> {
        match self.search(entry.hash, &entry.key, start, guard) {
            SearchOutcome::Found(found) => {
                if update {
                    let value = mem::replace(&mut entry.value, Atomic::null())
                        .load(Ordering::Relaxed, guard);
                    unsafe { found.deref() }.store_value(value, guard);

                    AddResult::Updated
                } else {
                    AddResult::Existed(found, entry)
                }
            }
            SearchOutcome::Window { prev, next } => {
                entry.next.store(next, Ordering::Relaxed);

                match prev.compare_exchange(
                    next,
                    entry,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(inserted) => {
                        self.count.fetch_add(1, Ordering::SeqCst);

                        AddResult::Inserted(inserted)
                    }
                    Err(e) => AddResult::Contended(e.new),
                }
            }
        }
    }

    // Read-only walk from `start` (or the head when `start` is null).
    // Tombstoned entries are skipped but not unlinked.
    pub(crate) fn find<'g>(
        &self,
        hash: u64,
        key: &K,
        start: Shared<'g, Entry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, Entry<K, V>> {
        let mut current = match unsafe { start.as_ref() } {
            Some(start_ref) if start_ref.hash == hash => {
                if start_ref.key == *key && !start_ref.is_deleted(guard) {
                    return start;
                }

                // an equal-hash hint cannot see earlier entries of its own
                // group, so the walk restarts at the head
                self.head.load(Ordering::SeqCst, guard)
            }
            Some(_) => start,
            None => self.head.load(Ordering::SeqCst, guard),
        };

        while let Some(current_ref) = unsafe { current.as_ref() } {
            if current_ref.hash > hash {
                break;
            }

            let next = current_ref.next.load(Ordering::SeqCst, guard);

            if next.tag() == 0 && current_ref.hash == hash && current_ref.key == *key {
                return current;
            }

            current = next.with_tag(0);
        }

        Shared::null()
    }

    // Walks the range of `hash`, unlinking any tombstoned entries it passes.
    pub(crate) fn sweep<'g>(
        &'g self,
        hash: u64,
        key: &K,
        start: Shared<'g, Entry<K, V>>,
        guard: &'g Guard,
    ) {
        let _ = self.search(hash, key, start, guard);
    }

    fn search<'g>(
        &'g self,
        hash: u64,
        key: &K,
        start: Shared<'g, Entry<K, V>>,
        guard: &'g Guard,
    ) -> SearchOutcome<'g, K, V> {
        'from_start: loop {
            // A hint is usable only while it sorts strictly before the
            // target and is not tombstoned: a later hint would start past
            // the insertion window, an equal-hash hint cannot see earlier
            // entries of its own group, and a tombstoned hint has no known
            // predecessor. Everything else falls back to the head.
            let hint = match unsafe { start.as_ref() } {
                Some(start_ref) if start_ref.hash < hash => {
                    let next = start_ref.next.load(Ordering::SeqCst, guard);

                    if next.tag() == 0 {
                        Some((&start_ref.next, next))
                    } else {
                        None
                    }
                }
                Some(start_ref) if start_ref.hash == hash => {
                    let next = start_ref.next.load(Ordering::SeqCst, guard);

                    if next.tag() == 0 && start_ref.key == *key {
                        return SearchOutcome::Found(start);
                    }

                    None
                }
                _ => None,
            };

            let (mut prev, mut current) = match hint {
                Some(hint) => hint,
                None => (&self.head, self.head.load(Ordering::SeqCst, guard)),
            };

            loop {
                let current_ref = match unsafe { current.as_ref() } {
                    Some(r) => r,
                    None => return SearchOutcome::Window {
                        prev,
                        next: current,
                    },
                };

                let next = current_ref.next.load(Ordering::SeqCst, guard);

                if next.tag() == DELETED_TAG {
                    match prev.compare_exchange(
                        current,
                        next.with_tag(0),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    ) {
                        Ok(_) => {
                            unsafe { guard.defer_destroy(current) };
                            current = next.with_tag(0);

                            continue;
                        }
                        Err(_) => continue 'from_start,
                    }
                }

                if current_ref.hash > hash {
                    return SearchOutcome::Window {
                        prev,
                        next: current,
                    };
                }

                if current_ref.hash == hash && current_ref.key == *key {
                    return SearchOutcome::Found(current);
                }

                prev = &current_ref.next;
                current = next;
            }
        }
    }
}

impl<K, V> Drop for List<K, V> {
    fn drop(&mut self) {
        // No other thread can hold a reference here, so entries still linked
        // (live or tombstoned) are freed directly. Unlinked entries were
        // already retired to the collector.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);

            while !current.is_null() {
                let next = current
                    .deref()
                    .next
                    .load(Ordering::Relaxed, guard)
                    .with_tag(0);
                drop(current.into_owned());
                current = next;
            }
        }
    }
}
