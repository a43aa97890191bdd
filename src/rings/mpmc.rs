/*******************************************************************************
 * Copyright (c) 2024 Cénotélie Opérations SAS (cenotelie.fr)
 ******************************************************************************/

//! Multi-producer, multi-consumer rings, unicast and broadcast

use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use super::slots::Slots;
use crate::errors::Full;

/// A ring buffer where both sides are contended
///
/// Any number of producers and consumers operate through a shared
/// reference; there are no handles. Producers claim cells by a
/// compare-and-swap on the `reserve` counter and publish them through the
/// `commit` counter in claim order, exactly like the multi-producer
/// single-consumer ring. Consumers claim published cells by a
/// compare-and-swap on the read index and the winner moves the item out.
///
/// No global order across producers is promised beyond the claim order of
/// the compare-and-swaps, and which consumer takes which item is equally
/// unspecified; each consumer on its own still observes a subsequence of
/// the publication order.
#[derive(Debug)]
pub struct MpmcUnicast<T, const N: usize> {
    /// Count of cells claimed by producers
    reserve: CachePadded<AtomicUsize>,
    /// Count of cells written and published, trails `reserve`
    commit: CachePadded<AtomicUsize>,
    /// Index of the next cell to be read, contended by all consumers
    read: CachePadded<AtomicUsize>,
    /// The element cells
    slots: Slots<T, N>,
}

/// SAFETY: cells are claimed by CAS on both sides and published through `commit`
unsafe impl<T: Send, const N: usize> Sync for MpmcUnicast<T, N> {}

impl<T, const N: usize> Default for MpmcUnicast<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for MpmcUnicast<T, N> {
    fn drop(&mut self) {
        if core::mem::needs_drop::<T>() {
            let read = *self.read.get_mut();
            let commit = *self.commit.get_mut();
            for index in read..commit {
                unsafe { self.slots.drop_at(index) };
            }
        }
    }
}

impl<T, const N: usize> MpmcUnicast<T, N> {
    /// Creates an empty ring
    #[must_use]
    pub const fn new() -> Self {
        const {
            assert!(N >= 2, "capacity must be at least 2");
            assert!(N.is_power_of_two(), "capacity must be a power of two");
        }
        Self {
            reserve: CachePadded::new(AtomicUsize::new(0)),
            commit: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
            slots: Slots::new(),
        }
    }

    /// Gets the capacity of the ring
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Gets the number of published, unconsumed items at the point of observation
    #[must_use]
    pub fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let commit = self.commit.load(Ordering::Acquire);
        commit - read
    }

    /// Gets whether the ring was empty at the point of observation
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to push a single item onto the ring
    ///
    /// The full check runs against a freshly loaded read index on every
    /// claim attempt; this is what keeps producers making progress under
    /// contention.
    ///
    /// # Errors
    ///
    /// Returns the item back when the ring is full.
    pub fn push(&self, item: T) -> Result<(), Full<T>> {
        let backoff = Backoff::new();
        loop {
            let claimed = self.reserve.load(Ordering::Relaxed);
            let read = self.read.load(Ordering::Acquire);
            if read > claimed {
                // the claim snapshot is stale, consumers are already past it
                continue;
            }
            if claimed - read >= N {
                return Err(Full(item));
            }
            if self
                .reserve
                .compare_exchange_weak(claimed, claimed + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
                continue;
            }
            unsafe { self.slots.write(claimed, item) };
            // publish in claim order; earlier claims publish first
            while self
                .commit
                .compare_exchange_weak(claimed, claimed + 1, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
            }
            return Ok(());
        }
    }

    /// Attempts to pop the next item from the ring
    ///
    /// Returns `None` when no published item is left. The empty check runs
    /// against a freshly loaded commit index on every claim attempt.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let read = self.read.load(Ordering::Relaxed);
            let commit = self.commit.load(Ordering::Acquire);
            if read >= commit {
                return None;
            }
            if self
                .read
                .compare_exchange_weak(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(unsafe { self.slots.take(read) });
            }
            backoff.spin();
        }
    }

    /// Attempts to pop the next item into caller-provided storage
    ///
    /// Returns `false` when nothing is available, leaving `out` untouched.
    pub fn pop_into(&self, out: &mut T) -> bool {
        match self.pop() {
            Some(item) => {
                *out = item;
                true
            }
            None => false,
        }
    }

    /// Constructs an empty ring in caller-supplied memory
    ///
    /// See [`crate::rings::spsc::Spsc::init_at`]; the same layout contract
    /// and `Copy` bound apply.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes, aligned for `Self`, and no other
    /// party may access the memory until this call returns.
    pub unsafe fn init_at<'a>(ptr: *mut Self) -> &'a Self
    where
        T: Copy,
    {
        unsafe {
            ptr.write(Self::new());
            &*ptr
        }
    }
}

/// A ring buffer with contended producers where every reader receives the
/// full stream
///
/// The producer side is the [`MpmcUnicast`] claim-and-commit protocol; the
/// consumer side is the per-reader cursor model of
/// [`SpmcBroadcast`](crate::rings::spmc::SpmcBroadcast), with the same
/// `Copy` element requirement and the same bounds-checked reader indices.
/// Because the producer side is contended, the minimum cursor cannot be
/// cached anywhere and is re-scanned on every push attempt.
///
/// Readers may observe different interleavings of a contended producer
/// set; each reader on its own still walks the committed sequence in
/// order.
#[derive(Debug)]
pub struct MpmcBroadcast<T: Copy, const N: usize, const K: usize> {
    /// Count of cells claimed by producers
    reserve: CachePadded<AtomicUsize>,
    /// Count of cells written and published, trails `reserve`
    commit: CachePadded<AtomicUsize>,
    /// One cursor per reader
    readers: [AtomicUsize; K],
    /// The element cells
    slots: Slots<T, N>,
}

/// SAFETY: cells are claimed by CAS, published through `commit`, and only copied by readers
unsafe impl<T: Copy + Send, const N: usize, const K: usize> Sync for MpmcBroadcast<T, N, K> {}

impl<T: Copy, const N: usize, const K: usize> Default for MpmcBroadcast<T, N, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize, const K: usize> MpmcBroadcast<T, N, K> {
    /// Creates an empty ring
    #[must_use]
    pub const fn new() -> Self {
        const {
            assert!(N >= 2, "capacity must be at least 2");
            assert!(N.is_power_of_two(), "capacity must be a power of two");
            assert!(K >= 1, "at least one reader slot is required");
        }
        Self {
            reserve: CachePadded::new(AtomicUsize::new(0)),
            commit: CachePadded::new(AtomicUsize::new(0)),
            readers: [const { AtomicUsize::new(0) }; K],
            slots: Slots::new(),
        }
    }

    /// Gets the capacity of the ring
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Gets the producer-visible occupancy, relative to the slowest reader
    #[must_use]
    pub fn len(&self) -> usize {
        let min_read = self.min_reader_pos();
        let commit = self.commit.load(Ordering::Acquire);
        commit - min_read
    }

    /// Gets whether the ring was empty for every reader at the point of observation
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn min_reader_pos(&self) -> usize {
        self.readers
            .iter()
            .map(|reader| reader.load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }

    /// Attempts to push a single item, visible to every reader
    ///
    /// The minimum reader cursor is re-scanned on every claim attempt; a
    /// reader that never pops will eventually make this fail.
    ///
    /// # Errors
    ///
    /// Returns the item back when the ring is full.
    pub fn push(&self, item: T) -> Result<(), Full<T>> {
        let backoff = Backoff::new();
        loop {
            let claimed = self.reserve.load(Ordering::Relaxed);
            let min_read = self.min_reader_pos();
            if min_read > claimed {
                // the claim snapshot is stale, every reader is already past it
                continue;
            }
            if claimed - min_read >= N {
                return Err(Full(item));
            }
            if self
                .reserve
                .compare_exchange_weak(claimed, claimed + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
                continue;
            }
            unsafe { self.slots.write(claimed, item) };
            while self
                .commit
                .compare_exchange_weak(claimed, claimed + 1, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
            }
            return Ok(());
        }
    }

    /// Attempts to pop the next item for the given reader
    ///
    /// Returns `None` when this reader has seen every committed item.
    ///
    /// # Panics
    ///
    /// Panics when `reader >= K`.
    #[must_use]
    pub fn pop(&self, reader: usize) -> Option<T> {
        let read = self.readers[reader].load(Ordering::Relaxed);
        let commit = self.commit.load(Ordering::Acquire);
        if read >= commit {
            return None;
        }
        let item = unsafe { self.slots.read_copy(read) };
        self.readers[reader].store(read + 1, Ordering::Release);
        Some(item)
    }

    /// Attempts to pop the next item for the given reader into
    /// caller-provided storage
    ///
    /// Returns `false` when nothing is available, leaving `out` untouched.
    ///
    /// # Panics
    ///
    /// Panics when `reader >= K`.
    pub fn pop_into(&self, reader: usize, out: &mut T) -> bool {
        match self.pop(reader) {
            Some(item) => {
                *out = item;
                true
            }
            None => false,
        }
    }

    /// Constructs an empty ring in caller-supplied memory
    ///
    /// See [`crate::rings::spsc::Spsc::init_at`]; element types are already
    /// `Copy` here, which is the cross-process layout contract.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes, aligned for `Self`, and no other
    /// party may access the memory until this call returns.
    pub unsafe fn init_at<'a>(ptr: *mut Self) -> &'a Self {
        unsafe {
            ptr.write(Self::new());
            &*ptr
        }
    }
}



#[cfg(test)]
mod tests_broadcast {
    use super::MpmcBroadcast;
    use crate::errors::Full;

    #[test]
    fn every_reader_sees_the_full_stream() {
        let ring = MpmcBroadcast::<usize, 16, 2>::new();
        for i in 0..10 {
            ring.push(i).unwrap();
        }
        for reader in 0..2 {
            for i in 0..10 {
                assert_eq!(ring.pop(reader), Some(i));
            }
            assert_eq!(ring.pop(reader), None);
        }
    }

    #[test]
    fn slowest_reader_throttles_push() {
        let ring = MpmcBroadcast::<usize, 4, 2>::new();
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(ring.pop(0), Some(i));
        }
        assert_eq!(ring.push(4), Err(Full(4)));
        assert_eq!(ring.pop(1), Some(0));
        assert_eq!(ring.push(4), Ok(()));
    }

    #[test]
    fn pop_into_uses_caller_storage() {
        let ring = MpmcBroadcast::<usize, 4, 1>::new();
        let mut out = 0_usize;
        assert!(!ring.pop_into(0, &mut out));
        ring.push(2).unwrap();
        assert!(ring.pop_into(0, &mut out));
        assert_eq!(out, 2);
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn out_of_range_reader_panics() {
        let ring = MpmcBroadcast::<usize, 4, 1>::new();
        let _ = ring.pop(1);
    }
}
