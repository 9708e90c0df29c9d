//! Fixed-capacity ring queue over a shared array.
//!
//! The queue stores its records in a [`SharedArray`] and its cursor state
//! in the array's control block:
//!
//! ```text
//! slot 0  head    index of the oldest record
//! slot 1  tail    index the next record will be written to
//! slot 2  count   number of live records
//! slot 3+         free for the queue's caller (the segmented queue keeps
//!                 its segment-id stamp and aggregate counters here)
//! ```
//!
//! Records wrap around the end of the array, so `head` and `tail` chase
//! each other modulo the capacity:
//!
//! ```text
//!        tail --v                v-- head
//! [ e5 ][ e6 ][    ][    ][ e3 ][ e4 ]      count = 4, capacity = 6
//! ```
//!
//! Every public operation takes the region's spin lock around a `_no_lock`
//! body; the no-lock variants are what the segmented queue composes while
//! holding its own lock. A mutating operation moves the shared version by
//! exactly one, whether it touched one record or all of them.

use std::path::Path;

use eyre::{bail, ensure, Result};

use crate::array::SharedArray;
use crate::region::header::CONTROL_BLOCK_SLOTS;
use crate::serialize::Serializer;

const SLOT_HEAD: usize = 0;
const SLOT_TAIL: usize = 1;
const SLOT_COUNT: usize = 2;

/// First control-block slot a bounded queue does not use itself.
const CUSTOM_SLOT_OFFSET: usize = 3;

/// Control-block slots left over for the queue's caller.
pub const CUSTOM_CONTROL_BLOCK_SLOTS: usize = CONTROL_BLOCK_SLOTS - CUSTOM_SLOT_OFFSET;

/// What [`BoundedQueue::enqueue`] does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullBehavior {
    /// Fail the enqueue with an error.
    Reject,
    /// Silently drop the oldest record to make room.
    OverwriteOldest,
    /// Grow the backing file. Not supported by bounded queues; rejected at
    /// open so the choice fails loudly instead of surprising later.
    AutoGrow,
}

/// Fixed-capacity, persisted, inter-process FIFO queue.
#[derive(Debug)]
pub struct BoundedQueue<T, S> {
    array: SharedArray<T, S>,
    full_behavior: FullBehavior,
}

impl<T, S: Serializer<T>> BoundedQueue<T, S> {
    /// Opens (creating if absent) the queue `name` under `dir` with room
    /// for `capacity` records.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        name: &str,
        capacity: u64,
        full_behavior: FullBehavior,
        serializer: S,
    ) -> Result<Self> {
        ensure!(capacity > 0, "cannot open queue '{name}' with zero capacity");
        ensure!(
            full_behavior != FullBehavior::AutoGrow,
            "bounded queues are fixed in size and cannot grow automatically"
        );
        let array = SharedArray::open(dir, name, capacity, serializer)?;
        Ok(Self {
            array,
            full_behavior,
        })
    }

    /// Maximum number of records the queue can hold.
    pub fn capacity(&self) -> u64 {
        self.array.len()
    }

    /// Number of records currently queued.
    pub fn count(&self) -> u64 {
        self.array.control_slot(SLOT_COUNT)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn full_behavior(&self) -> FullBehavior {
        self.full_behavior
    }

    /// Modification counter shared by every handle on this queue.
    pub fn version(&self) -> u64 {
        self.array.version()
    }

    pub fn initialization_count(&self) -> u64 {
        self.array.initialization_count()
    }

    pub fn is_server(&self) -> bool {
        self.array.is_server()
    }

    pub fn name(&self) -> &str {
        self.array.name()
    }

    /// Path of the backing data file.
    pub fn path(&self) -> &Path {
        self.array.path()
    }

    /// Appends a record at the tail.
    pub fn enqueue(&mut self, item: &T) -> Result<()> {
        self.array.acquire_spin_lock();
        let result = self.enqueue_no_lock(item);
        self.array.release_spin_lock();
        result
    }

    /// Removes and returns the record at the head. Fails when empty.
    pub fn dequeue(&mut self) -> Result<T> {
        self.array.acquire_spin_lock();
        let result = self.dequeue_no_lock();
        self.array.release_spin_lock();
        result
    }

    /// Returns the head record without removing it. Fails when empty.
    pub fn peek(&self) -> Result<T> {
        self.array.acquire_spin_lock();
        let result = self.peek_no_lock();
        self.array.release_spin_lock();
        result
    }

    /// Returns the most recently enqueued record. Fails when empty.
    pub fn peek_tail(&self) -> Result<T> {
        self.array.acquire_spin_lock();
        let result = self.peek_tail_no_lock();
        self.array.release_spin_lock();
        result
    }

    /// Whether `item` is currently queued.
    pub fn contains(&self, item: &T) -> Result<bool>
    where
        T: PartialEq,
    {
        self.array.acquire_spin_lock();
        let result = self.contains_no_lock(item);
        self.array.release_spin_lock();
        result
    }

    /// Snapshot of the queue in FIFO order, leaving it untouched.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.array.acquire_spin_lock();
        let result = self.to_vec_no_lock();
        self.array.release_spin_lock();
        result
    }

    /// Drains the whole queue in FIFO order.
    pub fn dequeue_all(&mut self) -> Result<Vec<T>> {
        self.array.acquire_spin_lock();
        let result = self.dequeue_all_no_lock();
        self.array.release_spin_lock();
        result
    }

    /// Empties the queue, optionally zeroing the slots records occupied.
    pub fn clear(&mut self, zero: bool) -> Result<()> {
        self.array.acquire_spin_lock();
        let result = self.clear_no_lock(zero);
        self.array.release_spin_lock();
        result
    }

    /// Reads the record `position` places behind the head without removing
    /// it. A point-in-time read: callers that need a consistent view across
    /// several reads hold the spin lock or use [`BoundedQueue::iter`].
    pub fn get_element(&self, position: u64) -> Result<T> {
        let count = self.count();
        ensure!(
            position < count,
            "position {position} out of bounds (count={count})"
        );
        self.array.get((self.head() + position) % self.capacity())
    }

    /// Reads one of the control-block slots this queue leaves to its
    /// caller.
    pub fn custom_control_block_entry(&self, index: usize) -> Result<u64> {
        self.check_custom_slot(index)?;
        Ok(self.array.control_slot(CUSTOM_SLOT_OFFSET + index))
    }

    /// Writes a caller-owned control-block slot. Does not move the
    /// version.
    pub fn set_custom_control_block_entry(&mut self, index: usize, value: u64) -> Result<()> {
        self.check_custom_slot(index)?;
        self.array.set_control_slot(CUSTOM_SLOT_OFFSET + index, value);
        Ok(())
    }

    /// Flushes the backing region to disk.
    pub fn flush(&self) -> Result<()> {
        self.array.flush()
    }

    /// Iterates head to tail without dequeueing. Fails fast with an error
    /// item if the queue's version moves while iterating.
    pub fn iter(&self) -> BoundedQueueIter<'_, T, S> {
        BoundedQueueIter {
            queue: self,
            position: 0,
            version: self.version(),
            failed: false,
        }
    }

    pub(crate) fn enqueue_no_lock(&mut self, item: &T) -> Result<()> {
        let capacity = self.capacity();
        let mut count = self.count();
        if count == capacity {
            match self.full_behavior {
                FullBehavior::Reject | FullBehavior::AutoGrow => {
                    bail!("queue '{}' is full (capacity={capacity})", self.name())
                }
                FullBehavior::OverwriteOldest => {
                    // Drop the head in place; the whole overwrite counts as
                    // one mutation, so no separate version bump here.
                    let head = self.head();
                    self.set_head((head + 1) % capacity);
                    count -= 1;
                }
            }
        }
        let tail = self.tail();
        self.array.write_record(tail, item)?;
        self.set_tail((tail + 1) % capacity);
        self.set_count(count + 1);
        self.array.bump_version();
        Ok(())
    }

    pub(crate) fn dequeue_no_lock(&mut self) -> Result<T> {
        let count = self.count();
        ensure!(count > 0, "queue '{}' is empty", self.name());
        let head = self.head();
        let item = self.array.get(head)?;
        self.set_head((head + 1) % self.capacity());
        self.set_count(count - 1);
        self.array.bump_version();
        Ok(item)
    }

    pub(crate) fn peek_no_lock(&self) -> Result<T> {
        ensure!(self.count() > 0, "queue '{}' is empty", self.name());
        self.array.get(self.head())
    }

    pub(crate) fn peek_tail_no_lock(&self) -> Result<T> {
        ensure!(self.count() > 0, "queue '{}' is empty", self.name());
        let capacity = self.capacity();
        // Most recent record is one before the tail cursor, which may have
        // wrapped to zero.
        let last = (self.tail() + capacity - 1) % capacity;
        self.array.get(last)
    }

    pub(crate) fn to_vec_no_lock(&self) -> Result<Vec<T>> {
        let count = self.count();
        if count == 0 {
            return Ok(Vec::new());
        }
        let item_size = self.array.item_size();
        let capacity = self.capacity();
        let head = self.head();
        let tail = self.tail();
        let mut bytes = vec![0u8; count as usize * item_size];
        if head < tail {
            self.array.copy_to(head, count, &mut bytes)?;
        } else {
            // Wrapped: head run to the end of the array, then the rest from
            // the start.
            let first = capacity - head;
            let split = first as usize * item_size;
            self.array.copy_to(head, first, &mut bytes[..split])?;
            self.array.copy_to(0, tail, &mut bytes[split..])?;
        }
        Ok(bytes
            .chunks_exact(item_size)
            .map(|record| self.array.decode_record(record))
            .collect())
    }

    pub(crate) fn dequeue_all_no_lock(&mut self) -> Result<Vec<T>> {
        let items = self.to_vec_no_lock()?;
        self.set_head(0);
        self.set_tail(0);
        self.set_count(0);
        self.array.bump_version();
        Ok(items)
    }

    pub(crate) fn clear_no_lock(&mut self, zero: bool) -> Result<()> {
        if zero {
            let count = self.count();
            let head = self.head();
            let tail = self.tail();
            if head < tail {
                self.array.zero_records(head, count)?;
            } else if count > 0 {
                self.array.zero_records(head, self.capacity() - head)?;
                self.array.zero_records(0, tail)?;
            }
        }
        self.set_head(0);
        self.set_tail(0);
        self.set_count(0);
        self.array.bump_version();
        Ok(())
    }

    /// Caller-slot access for crate-internal constants; skips the bounds
    /// error path.
    pub(crate) fn custom_slot(&self, index: usize) -> u64 {
        self.array.control_slot(CUSTOM_SLOT_OFFSET + index)
    }

    pub(crate) fn set_custom_slot(&mut self, index: usize, value: u64) {
        self.array.set_control_slot(CUSTOM_SLOT_OFFSET + index, value);
    }

    pub(crate) fn acquire_spin_lock(&self) {
        self.array.acquire_spin_lock();
    }

    pub(crate) fn release_spin_lock(&self) {
        self.array.release_spin_lock();
    }

    fn contains_no_lock(&self, item: &T) -> Result<bool>
    where
        T: PartialEq,
    {
        for position in 0..self.count() {
            if self.get_element(position)? == *item {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn check_custom_slot(&self, index: usize) -> Result<()> {
        ensure!(
            index < CUSTOM_CONTROL_BLOCK_SLOTS,
            "custom control block slot {index} out of bounds ({CUSTOM_CONTROL_BLOCK_SLOTS} slots)"
        );
        Ok(())
    }

    fn head(&self) -> u64 {
        self.array.control_slot(SLOT_HEAD)
    }

    fn tail(&self) -> u64 {
        self.array.control_slot(SLOT_TAIL)
    }

    fn set_head(&mut self, head: u64) {
        self.array.set_control_slot(SLOT_HEAD, head);
    }

    fn set_tail(&mut self, tail: u64) {
        self.array.set_control_slot(SLOT_TAIL, tail);
    }

    fn set_count(&mut self, count: u64) {
        self.array.set_control_slot(SLOT_COUNT, count);
    }
}

/// Head-to-tail iterator over a [`BoundedQueue`].
pub struct BoundedQueueIter<'a, T, S> {
    queue: &'a BoundedQueue<T, S>,
    position: u64,
    version: u64,
    failed: bool,
}

impl<T, S: Serializer<T>> Iterator for BoundedQueueIter<'_, T, S> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.queue.count() {
            return None;
        }
        if self.queue.version() != self.version {
            self.failed = true;
            return Some(Err(eyre::eyre!(
                "queue '{}' was modified during iteration",
                self.queue.name()
            )));
        }
        let item = self.queue.get_element(self.position);
        self.position += 1;
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

impl<'a, T, S: Serializer<T>> IntoIterator for &'a BoundedQueue<T, S> {
    type Item = Result<T>;
    type IntoIter = BoundedQueueIter<'a, T, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
