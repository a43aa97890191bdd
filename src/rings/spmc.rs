/*******************************************************************************
 * Copyright (c) 2024 Cénotélie Opérations SAS (cenotelie.fr)
 ******************************************************************************/

//! Single-producer, multi-consumer rings, unicast and broadcast

use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use super::slots::Slots;
use super::REFRESH_INTERVAL;
use crate::errors::Full;

/// A ring buffer for one producer and any number of consumers sharing the stream
///
/// Each pushed item is popped by exactly one consumer; which one is decided
/// by the compare-and-swap on the shared read index. Consumers pop directly
/// through a shared reference, the single producer is driven through the
/// exclusive [`UnicastProducer`] handle.
#[derive(Debug)]
pub struct SpmcUnicast<T, const N: usize> {
    /// Index of the next cell to be written, published after the cell write
    write: CachePadded<AtomicUsize>,
    /// Index of the next cell to be read, contended by all consumers
    read: CachePadded<AtomicUsize>,
    /// The element cells
    slots: Slots<T, N>,
}

/// SAFETY: the producer is exclusive and consumers claim cells by CAS
unsafe impl<T: Send, const N: usize> Sync for SpmcUnicast<T, N> {}

impl<T, const N: usize> Default for SpmcUnicast<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for SpmcUnicast<T, N> {
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

impl<T, const N: usize> SpmcUnicast<T, N> {
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
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write - read
    }

    /// Gets whether the ring was empty at the point of observation
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to pop the next item from the ring
    ///
    /// Safe to call from any number of threads concurrently; the winner of
    /// the claim takes the item. Returns `None` when the ring is empty. The
    /// empty check runs against a freshly loaded write index on every claim
    /// attempt.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let read = self.read.load(Ordering::Relaxed);
            let write = self.write.load(Ordering::Acquire);
            if read >= write {
                return None;
            }
            if self
                .read
                .compare_exchange_weak(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(unsafe { self.slots.take(read) });
            }
            // another consumer claimed this cell
            backoff.spin();
        }
    }

    /// Attempts to pop the next item into caller-provided storage
    ///
    /// Returns `false` when the ring is empty, leaving `out` untouched.
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

    /// Creates the producer handle for a ring that was not built by
    /// [`unicast_channel`]
    ///
    /// # Safety
    ///
    /// The caller must guarantee that this is the only producer handle in
    /// existence for this ring, across all threads and processes.
    #[must_use]
    pub unsafe fn attach_producer(&self) -> UnicastProducer<T, N, &Self> {
        UnicastProducer {
            write: self.write.load(Ordering::Relaxed),
            cached_read: self.read.load(Ordering::Relaxed),
            ring: self,
        }
    }
}

/// Creates a unicast ring of capacity `N` along with its producer handle
///
/// Consumers are just clones of the returned `Arc`.
#[must_use]
pub fn unicast_channel<T, const N: usize>() -> (UnicastProducer<T, N>, Arc<SpmcUnicast<T, N>>) {
    let ring = Arc::new(SpmcUnicast::new());
    let producer = UnicastProducer {
        ring: ring.clone(),
        write: 0,
        cached_read: 0,
    };
    (producer, ring)
}

/// The single producer for a unicast ring
///
/// Same shape as the single-producer single-consumer handle: a plain mirror
/// of the write index plus a cached copy of the shared read index, reloaded
/// only when the cached value would mean the ring is full.
#[derive(Debug)]
pub struct UnicastProducer<T, const N: usize, R = Arc<SpmcUnicast<T, N>>>
where
    R: Deref<Target = SpmcUnicast<T, N>>,
{
    /// The ring itself
    ring: R,
    /// Mirror of the write index, always equal to the published value
    write: usize,
    /// Last observed value of the consumers' read index
    cached_read: usize,
}

impl<T, const N: usize, R> UnicastProducer<T, N, R>
where
    R: Deref<Target = SpmcUnicast<T, N>>,
{
    /// Gets the underlying ring
    #[must_use]
    pub fn ring(&self) -> &SpmcUnicast<T, N> {
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
        self.ring.write.store(self.write, Ordering::Release);
        Ok(())
    }
}

/// A ring buffer for one producer where every consumer receives the full stream
///
/// Each of the `K` readers owns one cursor in the ring, addressed by a
/// reader index in `0..K`, and independently walks the whole sequence of
/// pushed items. Cells are read by copy, never moved out, because other
/// readers will visit the same cell; element types are therefore required
/// to be `Copy`, which is also what makes the ring usable across processes.
///
/// A reader that never pops holds the ring back: the producer's occupancy
/// is computed against the minimum cursor, so [`BroadcastProducer::push`]
/// throttles on the slowest reader. [`BroadcastProducer::push_overwrite`]
/// ignores readers entirely and trades back-pressure for freshness; a
/// reader that was overtaken finds out through
/// [`pop_overwrite`](Self::pop_overwrite).
///
/// Reader indices are bounds-checked; passing `reader >= K` panics.
/// Using one reader index from two threads at the same time is not
/// supported: it stays memory-safe, but items may be observed twice or
/// skipped.
#[derive(Debug)]
pub struct SpmcBroadcast<T: Copy, const N: usize, const K: usize> {
    /// Index of the next cell to be written, published after the cell write
    write: CachePadded<AtomicUsize>,
    /// One cursor per reader; isolation from the write index is what
    /// matters, the cursors may share cache lines among themselves
    readers: [AtomicUsize; K],
    /// The element cells
    slots: Slots<T, N>,
}

/// SAFETY: the producer is exclusive, readers only copy cells
unsafe impl<T: Copy + Send, const N: usize, const K: usize> Sync for SpmcBroadcast<T, N, K> {}

impl<T: Copy, const N: usize, const K: usize> Default for SpmcBroadcast<T, N, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize, const K: usize> SpmcBroadcast<T, N, K> {
    /// Creates an empty ring
    #[must_use]
    pub const fn new() -> Self {
        const {
            assert!(
                N > REFRESH_INTERVAL,
                "capacity must exceed the cursor refresh interval"
            );
            assert!(N.is_power_of_two(), "capacity must be a power of two");
            assert!(K >= 1, "at least one reader slot is required");
        }
        Self {
            write: CachePadded::new(AtomicUsize::new(0)),
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
        let write = self.write.load(Ordering::Acquire);
        write - min_read
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

    /// Attempts to pop the next item for the given reader
    ///
    /// Returns `None` when this reader has seen every published item.
    ///
    /// # Panics
    ///
    /// Panics when `reader >= K`.
    #[must_use]
    pub fn pop(&self, reader: usize) -> Option<T> {
        let read = self.readers[reader].load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if read >= write {
            return None;
        }
        // copy, not move: other readers will visit the same cell
        let item = unsafe { self.slots.read_copy(read) };
        self.readers[reader].store(read + 1, Ordering::Release);
        Some(item)
    }

    /// Attempts to pop the next item for the given reader, resynchronizing
    /// after data loss
    ///
    /// When the producer has overtaken this reader through
    /// [`BroadcastProducer::push_overwrite`], the cursor jumps forward to
    /// the oldest still-retained position and this call returns `None`
    /// once; the next call continues from the new position. An ordinary
    /// empty ring also returns `None`; the two cases are indistinguishable
    /// here, a caller that needs to tell them apart watches
    /// [`get_read_pos`](Self::get_read_pos) for the discontinuity.
    ///
    /// # Panics
    ///
    /// Panics when `reader >= K`.
    #[must_use]
    pub fn pop_overwrite(&self, reader: usize) -> Option<T> {
        let read = self.readers[reader].load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if write > read + N {
            // overtaken; jump to the oldest position still in the ring
            self.readers[reader].store(write - N, Ordering::Release);
            return None;
        }
        if read >= write {
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

    /// Gets the cursor of the given reader
    ///
    /// # Panics
    ///
    /// Panics when `reader >= K`.
    #[must_use]
    pub fn get_read_pos(&self, reader: usize) -> usize {
        self.readers[reader].load(Ordering::Acquire)
    }

    /// Sets the cursor of the given reader
    ///
    /// # Panics
    ///
    /// Panics when `reader >= K`.
    pub fn set_read_pos(&self, reader: usize, pos: usize) {
        self.readers[reader].store(pos, Ordering::Release);
    }

    /// Advances the cursor of the given reader, returning the previous value
    ///
    /// # Panics
    ///
    /// Panics when `reader >= K`.
    pub fn fetch_add_read_pos(&self, reader: usize, delta: usize) -> usize {
        self.readers[reader].fetch_add(delta, Ordering::AcqRel)
    }

    /// Rewinds the cursor of the given reader, returning the previous value
    ///
    /// This is the reclaim path: a caller whose downstream side effect
    /// failed rewinds by one and the next pop yields the same item again.
    ///
    /// # Panics
    ///
    /// Panics when `reader >= K`.
    pub fn fetch_sub_read_pos(&self, reader: usize, delta: usize) -> usize {
        self.readers[reader].fetch_sub(delta, Ordering::AcqRel)
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

    /// Creates the producer handle for a ring that was not built by
    /// [`broadcast_channel`]
    ///
    /// # Safety
    ///
    /// The caller must guarantee that this is the only producer handle in
    /// existence for this ring, across all threads and processes.
    #[must_use]
    pub unsafe fn attach_producer(&self) -> BroadcastProducer<T, N, K, &Self> {
        BroadcastProducer {
            write: self.write.load(Ordering::Relaxed),
            min_read_cache: self.min_reader_pos(),
            ring: self,
        }
    }
}

/// Creates a broadcast ring of capacity `N` with `K` reader slots, along
/// with its producer handle
///
/// Readers are just clones of the returned `Arc`, each calling the reader
/// operations with its own reader index.
#[must_use]
pub fn broadcast_channel<T: Copy, const N: usize, const K: usize>(
) -> (BroadcastProducer<T, N, K>, Arc<SpmcBroadcast<T, N, K>>) {
    let ring = Arc::new(SpmcBroadcast::new());
    let producer = BroadcastProducer {
        ring: ring.clone(),
        write: 0,
        min_read_cache: 0,
    };
    (producer, ring)
}

/// The single producer for a broadcast ring
///
/// Scanning all `K` cursors on every push would be wasted work, so the
/// handle keeps a cached minimum. The cache is refreshed every
/// [`REFRESH_INTERVAL`] pushes and re-scanned once more when the cached
/// value alone would report the ring full; after that re-scan the verdict
/// for the current push is final. The cache needs no atomicity since the
/// producer is single.
#[derive(Debug)]
pub struct BroadcastProducer<T: Copy, const N: usize, const K: usize, R = Arc<SpmcBroadcast<T, N, K>>>
where
    R: Deref<Target = SpmcBroadcast<T, N, K>>,
{
    /// The ring itself
    ring: R,
    /// Mirror of the write index, always equal to the published value
    write: usize,
    /// Last computed minimum over the reader cursors
    min_read_cache: usize,
}

impl<T: Copy, const N: usize, const K: usize, R> BroadcastProducer<T, N, K, R>
where
    R: Deref<Target = SpmcBroadcast<T, N, K>>,
{
    /// Gets the underlying ring
    #[must_use]
    pub fn ring(&self) -> &SpmcBroadcast<T, N, K> {
        &self.ring
    }

    /// Attempts to push a single item, visible to every reader
    ///
    /// A reader that never pops will eventually make this fail: occupancy
    /// is measured against the slowest cursor.
    ///
    /// # Errors
    ///
    /// Returns the item back when the ring is full.
    pub fn push(&mut self, item: T) -> Result<(), Full<T>> {
        if self.write & (REFRESH_INTERVAL - 1) == 0 {
            self.min_read_cache = self.ring.min_reader_pos();
        }
        if self.write - self.min_read_cache >= N {
            // the cache may be stale; re-scan once, then the verdict stands
            self.min_read_cache = self.ring.min_reader_pos();
            if self.write - self.min_read_cache >= N {
                return Err(Full(item));
            }
        }
        unsafe { self.ring.slots.write(self.write, item) };
        self.write += 1;
        self.ring.write.store(self.write, Ordering::Release);
        Ok(())
    }

    /// Pushes a single item unconditionally, overtaking slow readers
    ///
    /// Never fails and never stalls. A reader that falls more than the
    /// capacity behind loses the overwritten items and learns about it on
    /// its next [`SpmcBroadcast::pop_overwrite`].
    pub fn push_overwrite(&mut self, item: T) {
        unsafe { self.ring.slots.write(self.write, item) };
        self.write += 1;
        self.ring.write.store(self.write, Ordering::Release);
    }
}

#[cfg(test)]
mod tests_unicast {
    use super::unicast_channel;
    use crate::errors::Full;

    #[test]
    fn pop_on_empty() {
        let (_producer, ring) = unicast_channel::<usize, 4>();
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn push_until_full() {
        let (mut producer, _ring) = unicast_channel::<usize, 4>();
        for i in 0..4 {
            assert_eq!(producer.push(i), Ok(()));
        }
        assert_eq!(producer.push(4), Err(Full(4)));
    }

    #[test]
    fn fifo_order_single_consumer() {
        let (mut producer, ring) = unicast_channel::<usize, 8>();
        for i in 0..6 {
            producer.push(i).unwrap();
        }
        for i in 0..6 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn pop_into_uses_caller_storage() {
        let (mut producer, ring) = unicast_channel::<usize, 4>();
        let mut out = 0_usize;
        assert!(!ring.pop_into(&mut out));
        producer.push(5).unwrap();
        assert!(ring.pop_into(&mut out));
        assert_eq!(out, 5);
    }
}

#[cfg(test)]
mod tests_broadcast {
    use super::broadcast_channel;
    use crate::errors::Full;

    #[test]
    fn every_reader_sees_the_full_stream() {
        let (mut producer, ring) = broadcast_channel::<usize, 128, 3>();
        for i in 0..10 {
            producer.push(i).unwrap();
        }
        for reader in 0..3 {
            for i in 0..10 {
                assert_eq!(ring.pop(reader), Some(i));
            }
            assert_eq!(ring.pop(reader), None);
        }
    }

    #[test]
    fn slowest_reader_throttles_push() {
        let (mut producer, ring) = broadcast_channel::<usize, 128, 2>();
        for i in 0..128 {
            producer.push(i).unwrap();
        }
        // reader 1 never pops, so the ring stays full for the producer
        for i in 0..128 {
            assert_eq!(ring.pop(0), Some(i));
        }
        assert_eq!(producer.push(128), Err(Full(128)));
        assert_eq!(ring.pop(1), Some(0));
        assert_eq!(producer.push(128), Ok(()));
    }

    #[test]
    fn push_overwrite_never_stalls() {
        let (mut producer, ring) = broadcast_channel::<usize, 128, 1>();
        for i in 0..1000 {
            producer.push_overwrite(i);
        }
        assert_eq!(ring.get_read_pos(0), 0);
    }

    #[test]
    fn pop_overwrite_clamps_then_resumes() {
        let (mut producer, ring) = broadcast_channel::<usize, 128, 1>();
        for i in 0..300 {
            producer.push_overwrite(i);
        }
        // first call signals the loss and jumps to the oldest retained item
        assert_eq!(ring.pop_overwrite(0), None);
        assert_eq!(ring.get_read_pos(0), 300 - 128);
        for i in (300 - 128)..300 {
            assert_eq!(ring.pop_overwrite(0), Some(i));
        }
        assert_eq!(ring.pop_overwrite(0), None);
        assert_eq!(ring.get_read_pos(0), 300);
    }

    #[test]
    fn pop_overwrite_at_exact_capacity_is_not_loss() {
        let (mut producer, ring) = broadcast_channel::<usize, 128, 1>();
        for i in 0..128 {
            producer.push_overwrite(i);
        }
        // the oldest item is still retained at exactly capacity distance
        assert_eq!(ring.pop_overwrite(0), Some(0));
    }

    #[test]
    fn pop_overwrite_on_plain_empty() {
        let (_producer, ring) = broadcast_channel::<usize, 128, 1>();
        assert_eq!(ring.pop_overwrite(0), None);
        assert_eq!(ring.get_read_pos(0), 0);
    }

    #[test]
    fn rewind_replays_the_last_item() {
        let (mut producer, ring) = broadcast_channel::<usize, 128, 1>();
        for i in 0..3 {
            producer.push(i).unwrap();
        }
        assert_eq!(ring.pop(0), Some(0));
        assert_eq!(ring.pop(0), Some(1));
        // the delivery of item 1 failed downstream; take it again
        ring.fetch_sub_read_pos(0, 1);
        assert_eq!(ring.pop(0), Some(1));
        assert_eq!(ring.pop(0), Some(2));
    }

    #[test]
    fn cursor_accessors() {
        let (mut producer, ring) = broadcast_channel::<usize, 128, 2>();
        for i in 0..5 {
            producer.push(i).unwrap();
        }
        assert_eq!(ring.get_read_pos(0), 0);
        assert_eq!(ring.fetch_add_read_pos(0, 3), 0);
        assert_eq!(ring.get_read_pos(0), 3);
        assert_eq!(ring.pop(0), Some(3));
        ring.set_read_pos(0, 1);
        assert_eq!(ring.pop(0), Some(1));
        // reader 1 is untouched throughout
        assert_eq!(ring.get_read_pos(1), 0);
    }

    #[test]
    fn pop_into_uses_caller_storage() {
        let (mut producer, ring) = broadcast_channel::<usize, 128, 1>();
        let mut out = 0_usize;
        assert!(!ring.pop_into(0, &mut out));
        producer.push(11).unwrap();
        assert!(ring.pop_into(0, &mut out));
        assert_eq!(out, 11);
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn out_of_range_reader_panics() {
        let (_producer, ring) = broadcast_channel::<usize, 128, 2>();
        let _ = ring.pop(2);
    }
}
