//! Unbounded FIFO queue built from chained bounded segments.
//!
//! A segmented queue is a directory plus a family of segments, all of them
//! [`BoundedQueue`]s in the same directory on disk:
//!
//! ```text
//! events.mma       directory: bounded queue of segment ids (u32),
//!                  head entry = oldest segment, tail entry = newest
//! events.0.mma     segment 0
//! events.1.mma     segment 1
//! events.2.mma     ...
//! ```
//!
//! Records are enqueued into the segment named by the directory's tail
//! entry. When that segment fills, the next id is pushed onto the
//! directory and a fresh segment file appears. Dequeues come from the
//! segment named by the directory's head entry; once it drains, its id is
//! popped, the segment is reset for reuse, and the next one becomes the
//! head.
//!
//! ## Shared state
//!
//! The aggregate record count and the queue's own modification counter
//! live in the directory's spare control-block slots, so every process
//! sees them. Each segment stores the id it was opened under in its own
//! spare slot; a handle compares that stamp against the directory before
//! trusting a cached segment, which is how handles notice that another
//! process rolled the queue forward underneath them.
//!
//! One spin lock — the directory's — serializes every operation on the
//! queue. Segment-level locks are never taken while it is held, so there
//! is exactly one lock in play per logical queue and no ordering to get
//! wrong.
//!
//! A handle keeps at most three segments open: the head, the tail, and one
//! cached segment for position reads in between.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result};

use crate::queue::bounded::{BoundedQueue, FullBehavior};
use crate::serialize::{PodSerializer, Serializer};

/// Records per segment unless [`SegmentedQueue::with_segment_size`] says
/// otherwise.
pub const DEFAULT_SEGMENT_SIZE: u64 = 16_384;

/// Capacity of the directory, and therefore the most segments a queue can
/// have listed at once.
const MAX_SEGMENT_COUNT: u64 = 1_048_576;

/// Directory custom slot holding the aggregate record count.
const DIR_SLOT_TOTAL_COUNT: usize = 0;

/// Directory custom slot holding the queue's modification counter.
const DIR_SLOT_VERSION: usize = 1;

/// Segment custom slot holding the id the segment was opened under.
const SEG_SLOT_ID: usize = 0;

/// The modification counter wraps to zero just shy of the integer limit.
const VERSION_WRAP_LIMIT: u64 = u64::MAX - 10;

/// Unbounded, persisted, inter-process FIFO queue.
#[derive(Debug)]
pub struct SegmentedQueue<T, S> {
    directory: BoundedQueue<u32, PodSerializer<u32>>,
    head_segment: Option<BoundedQueue<T, S>>,
    tail_segment: Option<BoundedQueue<T, S>>,
    cached_segment: Option<BoundedQueue<T, S>>,
    serializer: S,
    dir: PathBuf,
    name: String,
    segment_size: u64,
}

impl<T, S: Serializer<T> + Clone> SegmentedQueue<T, S> {
    /// Opens (creating if absent) the queue `name` under `dir` with the
    /// default segment size.
    pub fn open<P: AsRef<Path>>(dir: P, name: &str, serializer: S) -> Result<Self> {
        Self::with_segment_size(dir, name, serializer, DEFAULT_SEGMENT_SIZE)
    }

    /// Opens the queue with `segment_size` records per segment. Every
    /// handle on the same queue must use the same segment size; segments
    /// are validated against it when they are opened.
    pub fn with_segment_size<P: AsRef<Path>>(
        dir: P,
        name: &str,
        serializer: S,
        segment_size: u64,
    ) -> Result<Self> {
        ensure!(
            segment_size > 0,
            "cannot open queue '{name}' with zero segment size"
        );
        let dir = dir.as_ref().to_path_buf();
        let directory = BoundedQueue::open(
            &dir,
            name,
            MAX_SEGMENT_COUNT,
            FullBehavior::Reject,
            PodSerializer::new(),
        )?;
        let name = directory.name().to_owned();
        tracing::debug!(queue = %name, segment_size, "opened segmented queue");
        Ok(Self {
            directory,
            head_segment: None,
            tail_segment: None,
            cached_segment: None,
            serializer,
            dir,
            name,
            segment_size,
        })
    }

    /// Number of records across all segments.
    pub fn count(&self) -> u64 {
        self.total_count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Modification counter shared by every handle on this queue. Wraps
    /// to zero near the integer limit.
    pub fn version(&self) -> u64 {
        self.directory.custom_slot(DIR_SLOT_VERSION)
    }

    /// Number of segments currently listed in the directory.
    pub fn segment_count(&self) -> u64 {
        self.directory.count()
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_server(&self) -> bool {
        self.directory.is_server()
    }

    /// Appends a record at the tail, rolling over to a new segment when
    /// the current one is full.
    pub fn enqueue(&mut self, item: &T) -> Result<()> {
        self.directory.acquire_spin_lock();
        let result = self.enqueue_no_lock(item);
        self.directory.release_spin_lock();
        result
    }

    /// Removes and returns the oldest record. Fails when empty.
    pub fn dequeue(&mut self) -> Result<T> {
        self.directory.acquire_spin_lock();
        let result = self.dequeue_no_lock();
        self.directory.release_spin_lock();
        match result? {
            Some(item) => Ok(item),
            None => bail!("queue '{}' is empty", self.name),
        }
    }

    /// Removes and returns the oldest record, or `None` when empty.
    pub fn try_dequeue(&mut self) -> Result<Option<T>> {
        self.directory.acquire_spin_lock();
        let result = self.dequeue_no_lock();
        self.directory.release_spin_lock();
        result
    }

    /// Returns the oldest record without removing it. Fails when empty.
    pub fn peek(&mut self) -> Result<T> {
        self.directory.acquire_spin_lock();
        let result = self.peek_no_lock();
        self.directory.release_spin_lock();
        result
    }

    /// Returns the newest record without removing it. Fails when empty.
    pub fn peek_tail(&mut self) -> Result<T> {
        self.directory.acquire_spin_lock();
        let result = self.peek_tail_no_lock();
        self.directory.release_spin_lock();
        result
    }

    /// Reads the record `index` places behind the head without removing
    /// it.
    pub fn get_element(&mut self, index: u64) -> Result<T> {
        self.directory.acquire_spin_lock();
        let result = self.get_element_no_lock(index);
        self.directory.release_spin_lock();
        result
    }

    /// Whether `item` is anywhere in the queue.
    pub fn contains(&mut self, item: &T) -> Result<bool>
    where
        T: PartialEq,
    {
        self.directory.acquire_spin_lock();
        let result = self.contains_no_lock(item);
        self.directory.release_spin_lock();
        result
    }

    /// Drains the whole current head segment in one operation, returning
    /// its records in FIFO order. Empty when the queue is. Cheaper than
    /// item-by-item dequeueing for batch consumers.
    pub fn dequeue_segment(&mut self) -> Result<Vec<T>> {
        self.directory.acquire_spin_lock();
        let result = self.dequeue_segment_no_lock();
        self.directory.release_spin_lock();
        result
    }

    /// Drains the entire queue in FIFO order.
    pub fn dequeue_all(&mut self) -> Result<Vec<T>> {
        self.directory.acquire_spin_lock();
        let result = self.dequeue_all_no_lock();
        self.directory.release_spin_lock();
        result
    }

    /// Snapshot of the whole queue in FIFO order, leaving it untouched.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.directory.acquire_spin_lock();
        let result = self.to_vec_no_lock();
        self.directory.release_spin_lock();
        result
    }

    /// Empties the queue: resets every listed segment, then the directory.
    pub fn clear(&mut self) -> Result<()> {
        self.directory.acquire_spin_lock();
        let result = self.clear_no_lock();
        self.directory.release_spin_lock();
        result
    }

    /// Iterates head to tail without dequeueing. Fails fast with an error
    /// item if the queue's version moves while iterating.
    pub fn iter(&mut self) -> SegmentedQueueIter<'_, T, S> {
        let version = self.version();
        SegmentedQueueIter {
            queue: self,
            index: 0,
            version,
            failed: false,
        }
    }

    fn enqueue_no_lock(&mut self, item: &T) -> Result<()> {
        let tail = self.tail_segment_no_lock()?;
        tail.enqueue_no_lock(item)?;
        let total = self.total_count();
        self.set_total_count(total + 1);
        self.bump_version_no_lock();
        Ok(())
    }

    fn dequeue_no_lock(&mut self) -> Result<Option<T>> {
        let item = match self.head_segment_no_lock()? {
            Some(segment) => segment.dequeue_no_lock()?,
            None => return Ok(None),
        };
        let total = self.total_count();
        self.set_total_count(total.saturating_sub(1));
        self.bump_version_no_lock();
        Ok(Some(item))
    }

    fn peek_no_lock(&mut self) -> Result<T> {
        match self.head_segment_no_lock()? {
            Some(segment) => segment.peek_no_lock(),
            None => bail!("queue '{}' is empty", self.name),
        }
    }

    fn peek_tail_no_lock(&mut self) -> Result<T> {
        let name = self.name.clone();
        // Resolving the tail allocates the first segment when the queue
        // has never held a record; that matches enqueue's view of the
        // world and is harmless.
        let segment = self.tail_segment_no_lock()?;
        ensure!(segment.count() > 0, "queue '{name}' is empty");
        segment.peek_tail_no_lock()
    }

    fn get_element_no_lock(&mut self, index: u64) -> Result<T> {
        let total = self.total_count();
        ensure!(index < total, "index {index} out of bounds (count={total})");
        let head_count = match self.head_segment_no_lock()? {
            Some(segment) => {
                let count = segment.count();
                if index < count {
                    return segment.get_element(index);
                }
                count
            }
            None => bail!("queue '{}' is empty", self.name),
        };
        // Past the head segment the directory is laid out regularly:
        // every segment between head and tail is full, so the position
        // maps straight to a directory entry and an offset.
        let rest = index - head_count;
        let directory_position = 1 + rest / self.segment_size;
        let offset = rest % self.segment_size;
        let segment_id = self.directory.get_element(directory_position)?;
        let segment = self.segment_by_id_no_lock(segment_id)?;
        segment.get_element(offset)
    }

    fn contains_no_lock(&mut self, item: &T) -> Result<bool>
    where
        T: PartialEq,
    {
        for index in 0..self.total_count() {
            if self.get_element_no_lock(index)? == *item {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn dequeue_segment_no_lock(&mut self) -> Result<Vec<T>> {
        let items = match self.head_segment_no_lock()? {
            Some(segment) => {
                let items = segment.to_vec_no_lock()?;
                segment.clear_no_lock(false)?;
                items
            }
            None => return Ok(Vec::new()),
        };
        let total = self.total_count();
        self.set_total_count(total.saturating_sub(items.len() as u64));
        self.bump_version_no_lock();
        Ok(items)
    }

    fn dequeue_all_no_lock(&mut self) -> Result<Vec<T>> {
        let ids = self.listed_segments()?;
        let mut items = Vec::with_capacity(self.total_count() as usize);
        for id in ids {
            let mut segment = self.open_segment(id)?;
            items.extend(segment.to_vec_no_lock()?);
            segment.clear_no_lock(false)?;
        }
        self.directory.clear_no_lock(false)?;
        self.set_total_count(0);
        self.bump_version_no_lock();
        Ok(items)
    }

    fn to_vec_no_lock(&self) -> Result<Vec<T>> {
        let ids = self.listed_segments()?;
        let mut items = Vec::with_capacity(self.total_count() as usize);
        for id in ids {
            // Transient handle; head/tail/cache stay as they are.
            let segment = self.open_segment(id)?;
            items.extend(segment.to_vec_no_lock()?);
        }
        Ok(items)
    }

    fn clear_no_lock(&mut self) -> Result<()> {
        let ids = self.listed_segments()?;
        for id in ids {
            let mut segment = self.open_segment(id)?;
            segment.clear_no_lock(false)?;
        }
        self.directory.clear_no_lock(false)?;
        self.set_total_count(0);
        self.bump_version_no_lock();
        tracing::debug!(queue = %self.name, "cleared segmented queue");
        Ok(())
    }

    /// Segment ids currently listed in the directory, head first.
    fn listed_segments(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(self.directory.count() as usize);
        for id in self.directory.iter() {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Resolves the tail segment, allocating the first segment for an
    /// empty queue and rolling over to a new one when the current tail is
    /// full. The returned segment always has room for one more record.
    fn tail_segment_no_lock(&mut self) -> Result<&mut BoundedQueue<T, S>> {
        let id = if self.directory.count() == 0 {
            self.directory.enqueue_no_lock(&0)?;
            0
        } else {
            self.directory.peek_tail_no_lock()?
        };

        let mut segment = match self.tail_segment.take() {
            Some(segment) => {
                if segment_stamp(&segment) == id {
                    segment
                } else {
                    // Another handle rolled the queue forward; follow the
                    // directory.
                    self.open_segment(id)?
                }
            }
            None => self.open_segment(id)?,
        };

        if segment.count() >= segment.capacity() {
            let next_id = id.wrapping_add(1);
            self.directory.enqueue_no_lock(&next_id)?;
            segment = self.open_segment(next_id)?;
            tracing::debug!(
                queue = %self.name,
                segment = next_id,
                "rolled over to a new tail segment"
            );
        }

        Ok(self.tail_segment.insert(segment))
    }

    /// Resolves the head segment, retiring it if it has drained: the
    /// drained segment's id is popped from the directory and its cursors
    /// are reset so a future roll-over can reuse the file. Returns `None`
    /// when the queue is empty. A returned segment always has at least one
    /// record.
    fn head_segment_no_lock(&mut self) -> Result<Option<&mut BoundedQueue<T, S>>> {
        if self.directory.count() == 0 {
            return Ok(None);
        }
        let id = self.directory.peek_no_lock()?;
        let mut segment = match self.head_segment.take() {
            Some(segment) => {
                if segment_stamp(&segment) == id {
                    segment
                } else {
                    self.open_segment(id)?
                }
            }
            None => self.open_segment(id)?,
        };

        if segment.count() == 0 {
            self.directory.dequeue_no_lock()?;
            segment.clear_no_lock(false)?;
            drop(segment);
            tracing::debug!(queue = %self.name, segment = id, "retired drained head segment");
            if self.directory.count() == 0 {
                return Ok(None);
            }
            let next = self.directory.peek_no_lock()?;
            let segment = self.open_segment(next)?;
            return Ok(Some(self.head_segment.insert(segment)));
        }
        Ok(Some(self.head_segment.insert(segment)))
    }

    /// Resolves an arbitrary segment by id, preferring the already-open
    /// head, tail, or cached handle and falling back to replacing the
    /// cache.
    fn segment_by_id_no_lock(&mut self, id: u32) -> Result<&mut BoundedQueue<T, S>> {
        // Each stamp check runs before its slot is borrowed: a borrow that
        // is only conditionally returned would be held past the early
        // return and conflict with the fallback below. A matching stamp
        // guarantees the slot is occupied.
        if matches_stamp(&self.head_segment, id) {
            return Ok(self.head_segment.as_mut().expect("stamp matched"));
        }
        if matches_stamp(&self.tail_segment, id) {
            return Ok(self.tail_segment.as_mut().expect("stamp matched"));
        }
        if matches_stamp(&self.cached_segment, id) {
            return Ok(self.cached_segment.as_mut().expect("stamp matched"));
        }
        let segment = self.open_segment(id)?;
        Ok(self.cached_segment.insert(segment))
    }

    /// Opens segment `id` and stamps it with its own id so later stamp
    /// checks can tell whether a cached handle still matches the
    /// directory.
    fn open_segment(&self, id: u32) -> Result<BoundedQueue<T, S>> {
        let segment_name = format!("{}.{id}", self.name);
        let mut segment = BoundedQueue::open(
            &self.dir,
            &segment_name,
            self.segment_size,
            FullBehavior::Reject,
            self.serializer.clone(),
        )?;
        segment.set_custom_slot(SEG_SLOT_ID, u64::from(id));
        tracing::trace!(queue = %self.name, segment = id, "opened queue segment");
        Ok(segment)
    }

    fn total_count(&self) -> u64 {
        self.directory.custom_slot(DIR_SLOT_TOTAL_COUNT)
    }

    fn set_total_count(&mut self, count: u64) {
        self.directory.set_custom_slot(DIR_SLOT_TOTAL_COUNT, count);
    }

    fn bump_version_no_lock(&mut self) {
        let next = self.version().wrapping_add(1);
        let next = if next > VERSION_WRAP_LIMIT { 0 } else { next };
        self.directory.set_custom_slot(DIR_SLOT_VERSION, next);
    }
}

fn segment_stamp<T, S: Serializer<T>>(segment: &BoundedQueue<T, S>) -> u32 {
    segment.custom_slot(SEG_SLOT_ID) as u32
}

fn matches_stamp<T, S: Serializer<T>>(slot: &Option<BoundedQueue<T, S>>, id: u32) -> bool {
    slot.as_ref()
        .is_some_and(|segment| segment_stamp(segment) == id)
}

/// Head-to-tail iterator over a [`SegmentedQueue`].
pub struct SegmentedQueueIter<'a, T, S> {
    queue: &'a mut SegmentedQueue<T, S>,
    index: u64,
    version: u64,
    failed: bool,
}

impl<T, S: Serializer<T> + Clone> Iterator for SegmentedQueueIter<'_, T, S> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.queue.count() {
            return None;
        }
        if self.queue.version() != self.version {
            self.failed = true;
            return Some(Err(eyre::eyre!(
                "queue '{}' was modified during iteration",
                self.queue.name()
            )));
        }
        let item = self.queue.get_element(self.index);
        self.index += 1;
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

impl<'a, T, S: Serializer<T> + Clone> IntoIterator for &'a mut SegmentedQueue<T, S> {
    type Item = Result<T>;
    type IntoIter = SegmentedQueueIter<'a, T, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_small(dir: &Path, name: &str, segment_size: u64) -> SegmentedQueue<u64, PodSerializer<u64>> {
        SegmentedQueue::with_segment_size(dir, name, PodSerializer::new(), segment_size).unwrap()
    }

    #[test]
    fn rejects_zero_segment_size() {
        let dir = tempdir().unwrap();
        let err = SegmentedQueue::<u64, _>::with_segment_size(
            dir.path(),
            "tiny",
            PodSerializer::<u64>::new(),
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("zero segment size"));
    }

    #[test]
    fn fifo_within_one_segment() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "single", 16);
        for value in 1..=5u64 {
            queue.enqueue(&value).unwrap();
        }
        assert_eq!(queue.count(), 5);
        assert_eq!(queue.segment_count(), 1);
        for expected in 1..=5u64 {
            assert_eq!(queue.dequeue().unwrap(), expected);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn rollover_creates_and_names_segments() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "rolling", 4);
        for value in 0..9u64 {
            queue.enqueue(&value).unwrap();
        }
        assert_eq!(queue.segment_count(), 3);
        assert!(dir.path().join("rolling.mma").exists());
        assert!(dir.path().join("rolling.0.mma").exists());
        assert!(dir.path().join("rolling.1.mma").exists());
        assert!(dir.path().join("rolling.2.mma").exists());
    }

    #[test]
    fn drain_retires_head_segments() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "retiring", 4);
        for value in 0..9u64 {
            queue.enqueue(&value).unwrap();
        }
        for expected in 0..9u64 {
            assert_eq!(queue.dequeue().unwrap(), expected);
        }
        assert!(queue.is_empty());
        // The drained tail segment stays listed until the next head
        // resolution retires it.
        assert_eq!(queue.segment_count(), 1);
        assert!(queue.try_dequeue().unwrap().is_none());
        assert_eq!(queue.segment_count(), 0);
    }

    #[test]
    fn empty_queue_behavior() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "bare", 8);
        assert!(queue.try_dequeue().unwrap().is_none());
        assert!(queue.dequeue().unwrap_err().to_string().contains("is empty"));
        assert!(queue.peek().unwrap_err().to_string().contains("is empty"));
        assert!(queue
            .peek_tail()
            .unwrap_err()
            .to_string()
            .contains("is empty"));
        assert_eq!(queue.dequeue_segment().unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn peeks_span_segments() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "peeking", 3);
        for value in 1..=7u64 {
            queue.enqueue(&value).unwrap();
        }
        assert_eq!(queue.peek().unwrap(), 1);
        assert_eq!(queue.peek_tail().unwrap(), 7);
        assert_eq!(queue.count(), 7);
    }

    #[test]
    fn get_element_crosses_segment_boundaries() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "addressed", 3);
        for value in 0..8u64 {
            queue.enqueue(&value).unwrap();
        }
        // Partially drain the head segment so it is offset from the rest.
        queue.dequeue().unwrap();
        for index in 0..queue.count() {
            assert_eq!(queue.get_element(index).unwrap(), index + 1);
        }
        let err = queue.get_element(queue.count()).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn get_element_handles_wrapped_head_segment() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "bent", 3);
        for value in 1..=3u64 {
            queue.enqueue(&value).unwrap();
        }
        queue.dequeue().unwrap();
        queue.enqueue(&4).unwrap();
        // Still one segment, physically [4, 2, 3] with its head in slot 1.
        assert_eq!(queue.segment_count(), 1);
        assert_eq!(queue.get_element(0).unwrap(), 2);
        assert_eq!(queue.get_element(1).unwrap(), 3);
        assert_eq!(queue.get_element(2).unwrap(), 4);
    }

    #[test]
    fn dequeue_segment_returns_head_batch() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "batched", 4);
        for value in 0..10u64 {
            queue.enqueue(&value).unwrap();
        }
        assert_eq!(queue.dequeue_segment().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(queue.count(), 6);
        assert_eq!(queue.dequeue_segment().unwrap(), vec![4, 5, 6, 7]);
        assert_eq!(queue.dequeue_segment().unwrap(), vec![8, 9]);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue_segment().unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn dequeue_all_and_to_vec_span_all_segments() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "drainable", 3);
        let values: Vec<u64> = (0..8).collect();
        for value in &values {
            queue.enqueue(value).unwrap();
        }
        assert_eq!(queue.to_vec().unwrap(), values);
        assert_eq!(queue.count(), 8);

        let drained = queue.dequeue_all().unwrap();
        assert_eq!(drained, values);
        assert!(queue.is_empty());
        assert_eq!(queue.segment_count(), 0);
    }

    #[test]
    fn clear_resets_everything() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "cleared", 3);
        for value in 0..7u64 {
            queue.enqueue(&value).unwrap();
        }
        queue.clear().unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.segment_count(), 0);
        queue.enqueue(&42).unwrap();
        assert_eq!(queue.dequeue().unwrap(), 42);
    }

    #[test]
    fn version_moves_once_per_mutation_and_wraps() {
        let dir = tempdir().unwrap();
        let mut queue = open_small(dir.path(), "versioned", 4);
        let start = queue.version();
        queue.enqueue(&1).unwrap();
        assert_eq!(queue.version(), start + 1);
        queue.dequeue().unwrap();
        assert_eq!(queue.version(), start + 2);

        queue.directory.set_custom_slot(DIR_SLOT_VERSION, VERSION_WRAP_LIMIT);
        queue.enqueue(&2).unwrap();
        assert_eq!(queue.version(), 0);
    }

    #[test]
    fn state_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut queue = open_small(dir.path(), "lasting", 3);
            for value in 0..7u64 {
                queue.enqueue(&value).unwrap();
            }
            queue.dequeue().unwrap();
        }
        let mut queue = open_small(dir.path(), "lasting", 3);
        assert_eq!(queue.count(), 6);
        assert_eq!(queue.segment_count(), 3);
        let remaining: Vec<u64> = (1..7).collect();
        assert_eq!(queue.dequeue_all().unwrap(), remaining);
    }
}
