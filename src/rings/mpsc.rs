/*******************************************************************************
 * Copyright (c) 2024 Cénotélie Opérations SAS (cenotelie.fr)
 ******************************************************************************/

//! Multi-producer, single-consumer ring

use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use super::slots::Slots;
use crate::errors::Full;

/// A ring buffer for any number of producers and exactly one consumer
///
/// Producers push directly through a shared reference, so any number of
/// threads may hold the ring behind an `Arc` and push concurrently. The
/// single consumer is driven through the exclusive [`Consumer`] handle.
///
/// The write side is split in two counters. A producer claims a cell by a
/// compare-and-swap on `reserve`, writes the cell, and only then publishes
/// it by advancing `commit`, in claim order, with release ordering. The
/// consumer never observes an index whose cell has not been written, since
/// it gates on `commit` alone.
#[derive(Debug)]
pub struct Mpsc<T, const N: usize> {
    /// Count of cells claimed by producers
    reserve: CachePadded<AtomicUsize>,
    /// Count of cells written and published, trails `reserve`
    commit: CachePadded<AtomicUsize>,
    /// Index of the next cell to be read
    read: CachePadded<AtomicUsize>,
    /// The element cells
    slots: Slots<T, N>,
}

/// SAFETY: cells are claimed through `reserve` before being written and
/// published through `commit` before being read
unsafe impl<T: Send, const N: usize> Sync for Mpsc<T, N> {}

impl<T, const N: usize> Default for Mpsc<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for Mpsc<T, N> {
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

impl<T, const N: usize> Mpsc<T, N> {
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
    /// Safe to call from any number of threads concurrently. The full check
    /// runs against a freshly loaded read index on every claim attempt.
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
                // the claim snapshot is stale, the consumer is already past it
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
                // another producer claimed this cell
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

    /// Creates the consumer handle for a ring that was not built by [`channel`]
    ///
    /// # Safety
    ///
    /// The caller must guarantee that this is the only consumer handle in
    /// existence for this ring, across all threads and processes.
    #[must_use]
    pub unsafe fn attach_consumer(&self) -> Consumer<T, N, &Self> {
        Consumer {
            read: self.read.load(Ordering::Relaxed),
            cached_commit: self.commit.load(Ordering::Relaxed),
            ring: self,
        }
    }
}

/// Creates a ring of capacity `N` along with its consumer handle
///
/// Producers are just clones of the returned `Arc`.
#[must_use]
pub fn channel<T, const N: usize>() -> (Arc<Mpsc<T, N>>, Consumer<T, N>) {
    let ring = Arc::new(Mpsc::new());
    let consumer = Consumer {
        ring: ring.clone(),
        read: 0,
        cached_commit: 0,
    };
    (ring, consumer)
}

/// The single consumer for a ring
#[derive(Debug)]
pub struct Consumer<T, const N: usize, R = Arc<Mpsc<T, N>>>
where
    R: Deref<Target = Mpsc<T, N>>,
{
    /// The ring itself
    ring: R,
    /// Mirror of the read index, always equal to the published value
    read: usize,
    /// Last observed value of the producers' commit index
    cached_commit: usize,
}

impl<T, const N: usize, R> Consumer<T, N, R>
where
    R: Deref<Target = Mpsc<T, N>>,
{
    /// Gets the underlying ring
    #[must_use]
    pub fn ring(&self) -> &Mpsc<T, N> {
        &self.ring
    }

    /// Attempts to pop the next item from the ring
    ///
    /// Returns `None` when the ring is empty.
    #[must_use]
    pub fn pop(&mut self) -> Option<T> {
        if self.read >= self.cached_commit {
            self.cached_commit = self.ring.commit.load(Ordering::Acquire);
            if self.read >= self.cached_commit {
                return None;
            }
        }
        let item = unsafe { self.ring.slots.take(self.read) };
        self.read += 1;
        self.ring.read.store(self.read, Ordering::Release);
        Some(item)
    }

    /// Attempts to pop the next item into caller-provided storage
    ///
    /// Returns `false` when the ring is empty, leaving `out` untouched.
    pub fn pop_into(&mut self, out: &mut T) -> bool {
        match self.pop() {
            Some(item) => {
                *out = item;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests_protocol {
    use super::channel;
    use crate::errors::Full;

    #[test]
    fn pop_on_empty() {
        let (_ring, mut consumer) = channel::<usize, 4>();
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn push_until_full_gives_item_back() {
        let (ring, _consumer) = channel::<usize, 4>();
        for i in 0..4 {
            assert_eq!(ring.push(i), Ok(()));
        }
        assert_eq!(ring.push(4), Err(Full(4)));
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn fifo_order() {
        let (ring, mut consumer) = channel::<usize, 8>();
        for i in 0..6 {
            ring.push(i).unwrap();
        }
        for i in 0..6 {
            assert_eq!(consumer.pop(), Some(i));
        }
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn interleaved_across_laps() {
        let (ring, mut consumer) = channel::<usize, 4>();
        for i in 0..20 {
            ring.push(i).unwrap();
            assert_eq!(consumer.pop(), Some(i));
        }
    }

    #[test]
    fn pop_into_uses_caller_storage() {
        let (ring, mut consumer) = channel::<usize, 4>();
        let mut out = 0_usize;
        assert!(!consumer.pop_into(&mut out));
        ring.push(3).unwrap();
        assert!(consumer.pop_into(&mut out));
        assert_eq!(out, 3);
    }
}
