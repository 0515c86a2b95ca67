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

//! Lockfree, read-optimized concurrent hash map.
//!
//! The map keeps its entries in a lock-free linked list sorted by key hash
//! and accelerates lookups with a power-of-two index of hash prefixes. A
//! steady-state lookup acquires no lock and blocks nobody: it loads one
//! index slot and walks forward a handful of entries. Writes pay for that
//! with compare-and-swap retry loops, and the index is replaced wholesale
//! by a background thread when it fills up.
//!
//! Memory reclamation uses epoch-based garbage collection from
//! [`crossbeam-epoch`], so removed entries are freed only once no thread
//! can still observe them.
//!
//! [`crossbeam-epoch`]: https://crates.io/crates/crossbeam-epoch

pub mod hash;
pub mod map;

pub use crate::hash::Key;
pub use crate::map::HashMap;

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Barrier,
        },
        thread::{self, JoinHandle},
    };

    #[test]
    fn concurrent_insertion() {
        const MAX_VALUE: u64 = 512;
        const NUM_THREADS: usize = 16;
        const MAX_INSERTED_VALUE: u64 = (NUM_THREADS as u64) * MAX_VALUE;

        let map = Arc::new(HashMap::new_sized(MAX_INSERTED_VALUE as usize));
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in (0..MAX_VALUE).map(|j| j + (i as u64 * MAX_VALUE)) {
                        assert!(map.insert(j, j));
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(JoinHandle::join) {
            assert!(result.is_ok());
        }

        assert_eq!(map.len(), MAX_INSERTED_VALUE as usize);

        for i in 0..MAX_INSERTED_VALUE {
            assert_eq!(map.get(&i), Some(i));
        }
    }

    #[test]
    fn concurrent_growth() {
        const MAX_VALUE: u64 = 512;
        const NUM_THREADS: usize = 16;
        const MAX_INSERTED_VALUE: u64 = (NUM_THREADS as u64) * MAX_VALUE;

        let map = Arc::new(HashMap::new_sized(2));
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in (0..MAX_VALUE).map(|j| j + (i as u64 * MAX_VALUE)) {
                        assert!(map.insert(j, j));
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(JoinHandle::join) {
            assert!(result.is_ok());
        }

        assert_eq!(map.len(), MAX_INSERTED_VALUE as usize);

        for i in 0..MAX_INSERTED_VALUE {
            assert_eq!(map.get(&i), Some(i));
        }
    }

    #[test]
    fn concurrent_removal() {
        const MAX_VALUE: u64 = 512;
        const NUM_THREADS: usize = 16;
        const MAX_INSERTED_VALUE: u64 = (NUM_THREADS as u64) * MAX_VALUE;

        let map = Arc::new(HashMap::new());

        for i in 0..MAX_INSERTED_VALUE {
            map.set(i, i);
        }

        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in (0..MAX_VALUE).map(|j| j + (i as u64 * MAX_VALUE)) {
                        assert!(map.remove(&j));
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(JoinHandle::join) {
            assert!(result.is_ok());
        }

        assert_eq!(map.len(), 0);

        for i in 0..MAX_INSERTED_VALUE {
            assert_eq!(map.get(&i), None);
        }
    }

    #[test]
    fn concurrent_insertion_and_removal() {
        const MAX_VALUE: u64 = 512;
        const NUM_THREADS: usize = 8;
        const MAX_INSERTED_VALUE: u64 = (NUM_THREADS as u64) * MAX_VALUE * 2;
        const INSERTED_MIDPOINT: u64 = MAX_INSERTED_VALUE / 2;

        let map = Arc::new(HashMap::new_sized(MAX_INSERTED_VALUE as usize));

        for i in INSERTED_MIDPOINT..MAX_INSERTED_VALUE {
            map.set(i, i);
        }

        let barrier = Arc::new(Barrier::new(NUM_THREADS * 2));

        let insert_threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in (0..MAX_VALUE).map(|j| j + (i as u64 * MAX_VALUE)) {
                        assert!(map.insert(j, j));
                    }
                })
            })
            .collect();

        let remove_threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in
                        (0..MAX_VALUE).map(|j| INSERTED_MIDPOINT + j + (i as u64 * MAX_VALUE))
                    {
                        assert!(map.remove(&j));
                    }
                })
            })
            .collect();

        for result in insert_threads
            .into_iter()
            .chain(remove_threads.into_iter())
            .map(JoinHandle::join)
        {
            assert!(result.is_ok());
        }

        assert_eq!(map.len(), INSERTED_MIDPOINT as usize);

        for i in 0..INSERTED_MIDPOINT {
            assert_eq!(map.get(&i), Some(i));
        }

        for i in INSERTED_MIDPOINT..MAX_INSERTED_VALUE {
            assert_eq!(map.get(&i), None);
        }
    }

    #[test]
    fn concurrent_growth_and_removal() {
        const MAX_VALUE: u64 = 512;
        const NUM_THREADS: usize = 8;
        const MAX_INSERTED_VALUE: u64 = (NUM_THREADS as u64) * MAX_VALUE * 2;
        const INSERTED_MIDPOINT: u64 = MAX_INSERTED_VALUE / 2;

        let map = Arc::new(HashMap::new_sized(2));

        for i in INSERTED_MIDPOINT..MAX_INSERTED_VALUE {
            map.set(i, i);
        }

        let barrier = Arc::new(Barrier::new(NUM_THREADS * 2));

        let insert_threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in (0..MAX_VALUE).map(|j| j + (i as u64 * MAX_VALUE)) {
                        assert!(map.insert(j, j));
                    }
                })
            })
            .collect();

        let remove_threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in
                        (0..MAX_VALUE).map(|j| INSERTED_MIDPOINT + j + (i as u64 * MAX_VALUE))
                    {
                        assert!(map.remove(&j));
                    }
                })
            })
            .collect();

        for result in insert_threads
            .into_iter()
            .chain(remove_threads.into_iter())
            .map(JoinHandle::join)
        {
            assert!(result.is_ok());
        }

        assert_eq!(map.len(), INSERTED_MIDPOINT as usize);

        for i in 0..INSERTED_MIDPOINT {
            assert_eq!(map.get(&i), Some(i));
        }

        for i in INSERTED_MIDPOINT..MAX_INSERTED_VALUE {
            assert_eq!(map.get(&i), None);
        }
    }

    #[test]
    fn concurrent_overwrite() {
        const MAX_VALUE: u64 = 512;
        const NUM_THREADS: usize = 16;

        let map = Arc::new(HashMap::new());
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in 0..MAX_VALUE {
                        map.set(j, j);
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(JoinHandle::join) {
            assert!(result.is_ok());
        }

        assert_eq!(map.len(), MAX_VALUE as usize);

        for i in 0..MAX_VALUE {
            assert_eq!(map.get(&i), Some(i));
        }
    }

    #[test]
    fn concurrent_get_or_insert() {
        const MAX_VALUE: u64 = 512;
        const NUM_THREADS: usize = 16;

        let map = Arc::new(HashMap::new());
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let map = map.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in 0..MAX_VALUE {
                        let (value, _) = map.get_or_insert(j, j);
                        assert_eq!(value, j);
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(JoinHandle::join) {
            assert!(result.is_ok());
        }

        assert_eq!(map.len(), MAX_VALUE as usize);

        for i in 0..MAX_VALUE {
            assert_eq!(map.get(&i), Some(i));
        }
    }

    #[test]
    fn readers_never_observe_stale_values() {
        const NUM_KEYS: u64 = 128;
        const NUM_READERS: usize = 4;
        const NUM_PASSES: usize = 64;

        let map = Arc::new(HashMap::new_sized(2));

        for i in 0..NUM_KEYS {
            map.set(i, i);
        }

        let keep_writing = Arc::new(AtomicBool::new(true));

        let writer = {
            let map = map.clone();
            let keep_writing = keep_writing.clone();

            thread::spawn(move || {
                while keep_writing.load(Ordering::SeqCst) {
                    for i in 0..NUM_KEYS {
                        map.set(i, i);
                    }
                }
            })
        };

        let readers: Vec<_> = (0..NUM_READERS)
            .map(|_| {
                let map = map.clone();

                thread::spawn(move || {
                    for _ in 0..NUM_PASSES {
                        for i in 0..NUM_KEYS {
                            assert_eq!(map.get(&i), Some(i));
                        }
                    }
                })
            })
            .collect();

        for result in readers.into_iter().map(JoinHandle::join) {
            assert!(result.is_ok());
        }

        keep_writing.store(false, Ordering::SeqCst);
        assert!(writer.join().is_ok());

        assert_eq!(map.len(), NUM_KEYS as usize);
    }
}
