/*******************************************************************************
 * Copyright (c) 2024 Cénotélie Opérations SAS (cenotelie.fr)
 ******************************************************************************/

//! Single-producer, single-consumer ring

use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::slots::Slots;
use crate::errors::Full;

/// A ring buffer for exactly one producer and exactly one consumer
///
/// The ring itself only holds the shared state: the cell array and the two
/// indices, each on its own cache line. The two roles are driven through
/// the exclusive [`Producer`] and [`Consumer`] handles; [`channel`] builds
/// the ring and both handles in one step.
///
/// The occupancy invariant is `write - read <= N` whenever both indices are
/// observed; the difference is the number of queued items.
#[derive(Debug)]
pub struct Spsc<T, const N: usize> {
    /// Index of the next cell to be written, published after the cell write
    write: CachePadded<AtomicUsize>,
    /// Index of the next cell to be read, published after the cell is moved out
    read: CachePadded<AtomicUsize>,
    /// The element cells
    slots: Slots<T, N>,
}

/// SAFETY: the index protocol guards all cell accesses, one exclusive role per side
unsafe impl<T: Send, const N: usize> Sync for Spsc<T, N> {}

impl<T, const N: usize> Default for Spsc<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for Spsc<T, N> {
    fn drop(&mut self) {
        if core::mem::needs_drop::<T>() {
            let read = *self.read.get_mut();
            let write = *self.write.get_mut();
            for index in read..write {
                unsafe { self.slots.drop_at(index) };
            }
        }
    }
}

impl<T, const N: usize> Spsc<T, N> {
    /// Creates an empty ring
    #[must_use]
    pub const fn new() -> Self {
        const {
            assert!(N >= 2, "capacity must be at least 2");
            assert!(N.is_power_of_two(), "capacity must be a power of two");
        }
        Self {
            write: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
            slots: Slots::new(),
        }
    }

    /// Gets the capacity of the ring
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Gets the number of queued items at the point of observation
    #[must_use]
    pub fn len(&self) -> usize {
        // read first so that the later write load can only be ahead
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write - read
    }

    /// Gets whether the ring was empty at the point of observation
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constructs an empty ring in caller-supplied memory
    ///
    /// This is the entry point for placing a ring inside a shared-memory
    /// region. The layout contract across processes is only defined for
    /// bitwise-copyable element types, hence the `Copy` bound.
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

    /// Creates the producer handle for a ring that was not built by [`channel`]
    ///
    /// # Safety
    ///
    /// The caller must guarantee that this is the only producer handle in
    /// existence for this ring, across all threads and processes.
    #[must_use]
    pub unsafe fn attach_producer(&self) -> Producer<T, N, &Self> {
        Producer {
            write: self.write.load(Ordering::Relaxed),
            cached_read: self.read.load(Ordering::Relaxed),
            ring: self,
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
            cached_write: self.write.load(Ordering::Relaxed),
            ring: self,
        }
    }
}

/// Creates a ring of capacity `N` along with its two handles
#[must_use]
pub fn channel<T, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let ring = Arc::new(Spsc::new());
    (
        Producer {
            ring: ring.clone(),
            write: 0,
            cached_read: 0,
        },
        Consumer {
            ring,
            read: 0,
            cached_write: 0,
        },
    )
}

/// The single producer for a ring
///
/// Owns a plain mirror of the write index and a cached copy of the
/// consumer's read index; the peer index is only reloaded when the cached
/// value would mean the ring is full.
#[derive(Debug)]
pub struct Producer<T, const N: usize, R = Arc<Spsc<T, N>>>
where
    R: Deref<Target = Spsc<T, N>>,
{
    /// The ring itself
    ring: R,
    /// Mirror of the write index, always equal to the published value
    write: usize,
    /// Last observed value of the consumer's read index
    cached_read: usize,
}

impl<T, const N: usize, R> Producer<T, N, R>
where
    R: Deref<Target = Spsc<T, N>>,
{
    /// Gets the underlying ring
    #[must_use]
    pub fn ring(&self) -> &Spsc<T, N> {
        &self.ring
    }

    /// Attempts to push a single item onto the ring
    ///
    /// # Errors
    ///
    /// Returns the item back when the ring is full.
    pub fn push(&mut self, item: T) -> Result<(), Full<T>> {
        if self.write - self.cached_read >= N {
            self.cached_read = self.ring.read.load(Ordering::Acquire);
            if self.write - self.cached_read >= N {
                return Err(Full(item));
            }
        }
        unsafe { self.ring.slots.write(self.write, item) };
        self.write += 1;
        // the release store makes the cell write visible to the consumer
        self.ring.write.store(self.write, Ordering::Release);
        Ok(())
    }
}

/// The single consumer for a ring
#[derive(Debug)]
pub struct Consumer<T, const N: usize, R = Arc<Spsc<T, N>>>
where
    R: Deref<Target = Spsc<T, N>>,
{
    /// The ring itself
    ring: R,
    /// Mirror of the read index, always equal to the published value
    read: usize,
    /// Last observed value of the producer's write index
    cached_write: usize,
}

impl<T, const N: usize, R> Consumer<T, N, R>
where
    R: Deref<Target = Spsc<T, N>>,
{
    /// Gets the underlying ring
    #[must_use]
    pub fn ring(&self) -> &Spsc<T, N> {
        &self.ring
    }

    /// Attempts to pop the next item from the ring
    ///
    /// Returns `None` when the ring is empty.
    #[must_use]
    pub fn pop(&mut self) -> Option<T> {
        if self.read >= self.cached_write {
            self.cached_write = self.ring.write.load(Ordering::Acquire);
            if self.read >= self.cached_write {
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
        let (_producer, mut consumer) = channel::<usize, 4>();
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn push_until_full() {
        let (mut producer, _consumer) = channel::<usize, 4>();
        assert_eq!(producer.push(0), Ok(()));
        assert_eq!(producer.push(1), Ok(()));
        assert_eq!(producer.push(2), Ok(()));
        assert_eq!(producer.push(3), Ok(()));
        assert_eq!(producer.push(4), Err(Full(4)));
    }

    #[test]
    fn push_then_pop_yields_value() {
        let (mut producer, mut consumer) = channel::<usize, 4>();
        producer.push(7).unwrap();
        assert_eq!(consumer.pop(), Some(7));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn fifo_across_laps() {
        let (mut producer, mut consumer) = channel::<usize, 4>();
        for i in 0..12 {
            producer.push(i).unwrap();
            assert_eq!(consumer.pop(), Some(i));
        }
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn full_clears_after_pop() {
        let (mut producer, mut consumer) = channel::<usize, 2>();
        producer.push(0).unwrap();
        producer.push(1).unwrap();
        assert_eq!(producer.push(2), Err(Full(2)));
        assert_eq!(consumer.pop(), Some(0));
        assert_eq!(producer.push(2), Ok(()));
        assert_eq!(consumer.pop(), Some(1));
        assert_eq!(consumer.pop(), Some(2));
    }

    #[test]
    fn pop_into_uses_caller_storage() {
        let (mut producer, mut consumer) = channel::<usize, 4>();
        let mut out = 0_usize;
        assert!(!consumer.pop_into(&mut out));
        producer.push(9).unwrap();
        assert!(consumer.pop_into(&mut out));
        assert_eq!(out, 9);
    }

    #[test]
    fn len_tracks_occupancy() {
        let (mut producer, mut consumer) = channel::<usize, 4>();
        assert!(producer.ring().is_empty());
        producer.push(0).unwrap();
        producer.push(1).unwrap();
        assert_eq!(producer.ring().len(), 2);
        let _ = consumer.pop();
        assert_eq!(consumer.ring().len(), 1);
    }
}
