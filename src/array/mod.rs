//! Fixed-length array of records in a shared region.
//!
//! [`SharedArray`] is the base collection: `length` records of
//! `item_size` bytes each, stored right after the region header and
//! addressed by index. Every process that opens the same name under the
//! same directory sees the same records.
//!
//! Element accessors do not synchronize. Callers that share an array
//! across processes bracket their operations with
//! [`SharedArray::acquire_spin_lock`] and
//! [`SharedArray::release_spin_lock`]; the queues in this crate do exactly
//! that. The header's version counter moves by exactly one for every
//! mutating call (`set`, `copy_from`, `clear`), which lets iterators detect
//! concurrent modification. Control-block writes deliberately leave the
//! version alone: the queue layer updates its head and tail on every
//! operation and bumps the version itself.

use std::marker::PhantomData;
use std::path::Path;

use eyre::{ensure, Result};

use crate::region::header::CONTROL_BLOCK_SLOTS;
use crate::region::SharedRegion;
use crate::serialize::Serializer;

/// Fixed-length, persisted, inter-process array of records.
#[derive(Debug)]
pub struct SharedArray<T, S> {
    region: SharedRegion,
    serializer: S,
    item_size: usize,
    length: u64,
    _marker: PhantomData<T>,
}

impl<T, S: Serializer<T>> SharedArray<T, S> {
    /// Opens (creating if absent) the array `name` under `dir` with room
    /// for `length` records.
    ///
    /// The first live opener becomes the server and initializes the file;
    /// later openers attach as clients and fail if the persisted record
    /// size or length disagrees with theirs.
    pub fn open<P: AsRef<Path>>(dir: P, name: &str, length: u64, serializer: S) -> Result<Self> {
        let name = validate_name(name)?;
        ensure!(length > 0, "cannot open array '{name}' with zero length");
        let item_size = serializer.byte_size();
        ensure!(
            item_size > 0,
            "cannot open array '{name}' with a zero record size"
        );
        let region = SharedRegion::open(dir.as_ref(), name, length, item_size as u64)?;
        Ok(Self {
            region,
            serializer,
            item_size,
            length,
            _marker: PhantomData,
        })
    }

    /// Number of records the array holds. Fixed at open time.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Size in bytes of one serialized record.
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Modification counter; moves by one on every mutating operation.
    pub fn version(&self) -> u64 {
        self.region.version()
    }

    /// How many times a server has opened this array since its file was
    /// created.
    pub fn initialization_count(&self) -> u64 {
        self.region.initialization_count()
    }

    /// Whether this handle was first to open the region (and initialized
    /// or re-validated it).
    pub fn is_server(&self) -> bool {
        self.region.is_server()
    }

    /// Raw spin-lock word, for diagnostics: zero when free, otherwise the
    /// owner's tag.
    pub fn lock_state(&self) -> u64 {
        self.region.lock_state()
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Path of the backing data file.
    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Reads the record at `index`.
    pub fn get(&self, index: u64) -> Result<T> {
        self.check_index(index)?;
        Ok(self.serializer.deserialize(self.record(index)))
    }

    /// Writes the record at `index` and bumps the version.
    pub fn set(&mut self, index: u64, value: &T) -> Result<()> {
        self.write_record(index, value)?;
        self.region.bump_version();
        Ok(())
    }

    /// Copies `count` serialized records starting at `index` into `dst`.
    pub fn copy_to(&self, index: u64, count: u64, dst: &mut [u8]) -> Result<()> {
        self.check_range(index, count)?;
        let bytes = count as usize * self.item_size;
        ensure!(
            dst.len() >= bytes,
            "destination of {} bytes cannot hold {count} records ({bytes} bytes)",
            dst.len()
        );
        let start = index as usize * self.item_size;
        dst[..bytes].copy_from_slice(&self.region.data()[start..start + bytes]);
        Ok(())
    }

    /// Overwrites `count` records starting at `index` with the serialized
    /// records in `src`, bumping the version once for the whole batch.
    pub fn copy_from(&mut self, src: &[u8], index: u64, count: u64) -> Result<()> {
        self.check_range(index, count)?;
        let bytes = count as usize * self.item_size;
        ensure!(
            src.len() >= bytes,
            "source of {} bytes does not hold {count} records ({bytes} bytes)",
            src.len()
        );
        let start = index as usize * self.item_size;
        self.region.data_mut()[start..start + bytes].copy_from_slice(&src[..bytes]);
        self.region.bump_version();
        Ok(())
    }

    /// Zeroes `count` records starting at `index`, bumping the version
    /// once.
    pub fn clear(&mut self, index: u64, count: u64) -> Result<()> {
        self.zero_records(index, count)?;
        self.region.bump_version();
        Ok(())
    }

    /// Reads one of the five general-purpose control-block slots.
    pub fn control_block_entry(&self, slot: usize) -> Result<u64> {
        self.check_slot(slot)?;
        Ok(self.region.control_slot(slot))
    }

    /// Writes a control-block slot. Does not move the version; layered
    /// collections account for their own mutations.
    pub fn set_control_block_entry(&mut self, slot: usize, value: u64) -> Result<()> {
        self.check_slot(slot)?;
        self.region.set_control_slot(slot, value);
        Ok(())
    }

    /// Takes the region's cross-process spin lock. Not reentrant; the
    /// owning thread must call [`SharedArray::release_spin_lock`]
    /// afterwards.
    pub fn acquire_spin_lock(&self) {
        self.region.acquire_lock();
    }

    /// Releases the spin lock taken by
    /// [`SharedArray::acquire_spin_lock`].
    pub fn release_spin_lock(&self) {
        self.region.release_lock();
    }

    /// Flushes the mapped region to its backing file.
    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    /// Iterates the records in index order. Fails fast with an error item
    /// if the array's version moves while iterating.
    pub fn iter(&self) -> ArrayIter<'_, T, S> {
        ArrayIter {
            array: self,
            index: 0,
            version: self.version(),
            failed: false,
        }
    }

    /// Writes a record without moving the version. Layered collections
    /// use this and bump once per logical operation.
    pub(crate) fn write_record(&mut self, index: u64, value: &T) -> Result<()> {
        self.check_index(index)?;
        let start = index as usize * self.item_size;
        let item_size = self.item_size;
        self.serializer
            .serialize_into(value, &mut self.region.data_mut()[start..start + item_size]);
        Ok(())
    }

    /// Zeroes records without moving the version.
    pub(crate) fn zero_records(&mut self, index: u64, count: u64) -> Result<()> {
        self.check_range(index, count)?;
        let start = index as usize * self.item_size;
        let bytes = count as usize * self.item_size;
        self.region.data_mut()[start..start + bytes].fill(0);
        Ok(())
    }

    pub(crate) fn bump_version(&mut self) {
        self.region.bump_version();
    }

    /// Unchecked control-slot read for crate-internal slot constants.
    pub(crate) fn control_slot(&self, slot: usize) -> u64 {
        self.region.control_slot(slot)
    }

    pub(crate) fn set_control_slot(&mut self, slot: usize, value: u64) {
        self.region.set_control_slot(slot, value);
    }

    /// Decodes a serialized record with this array's serializer.
    pub(crate) fn decode_record(&self, bytes: &[u8]) -> T {
        self.serializer.deserialize(bytes)
    }

    fn record(&self, index: u64) -> &[u8] {
        let start = index as usize * self.item_size;
        &self.region.data()[start..start + self.item_size]
    }

    fn check_index(&self, index: u64) -> Result<()> {
        ensure!(
            index < self.length,
            "index {index} out of bounds (length={})",
            self.length
        );
        Ok(())
    }

    fn check_range(&self, index: u64, count: u64) -> Result<()> {
        ensure!(
            index
                .checked_add(count)
                .is_some_and(|end| end <= self.length),
            "range {index}..{} out of bounds (length={})",
            index.saturating_add(count),
            self.length
        );
        Ok(())
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        ensure!(
            slot < CONTROL_BLOCK_SLOTS,
            "control block slot {slot} out of bounds ({CONTROL_BLOCK_SLOTS} slots)"
        );
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    ensure!(!name.is_empty(), "collection name must not be empty");
    ensure!(
        !name.contains(std::path::is_separator),
        "collection name '{name}' must not contain path separators"
    );
    Ok(name)
}

/// Index-order iterator over a [`SharedArray`].
pub struct ArrayIter<'a, T, S> {
    array: &'a SharedArray<T, S>,
    index: u64,
    version: u64,
    failed: bool,
}

impl<T, S: Serializer<T>> Iterator for ArrayIter<'_, T, S> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.array.len() {
            return None;
        }
        if self.array.version() != self.version {
            self.failed = true;
            return Some(Err(eyre::eyre!(
                "array '{}' was modified during iteration",
                self.array.name()
            )));
        }
        let item = self.array.get(self.index);
        self.index += 1;
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

impl<'a, T, S: Serializer<T>> IntoIterator for &'a SharedArray<T, S> {
    type Item = Result<T>;
    type IntoIter = ArrayIter<'a, T, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::PodSerializer;
    use tempfile::tempdir;

    fn open_u64(dir: &Path, name: &str, length: u64) -> SharedArray<u64, PodSerializer<u64>> {
        SharedArray::open(dir, name, length, PodSerializer::new()).unwrap()
    }

    #[test]
    fn rejects_zero_length() {
        let dir = tempdir().unwrap();
        let err = SharedArray::<u64, _>::open(dir.path(), "empty", 0, PodSerializer::<u64>::new())
            .unwrap_err();
        assert!(err.to_string().contains("zero length"));
    }

    #[test]
    fn rejects_bad_names() {
        let dir = tempdir().unwrap();
        let err = SharedArray::<u64, _>::open(dir.path(), "  ", 4, PodSerializer::<u64>::new())
            .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));

        let err = SharedArray::<u64, _>::open(dir.path(), "a/b", 4, PodSerializer::<u64>::new())
            .unwrap_err();
        assert!(err.to_string().contains("path separators"));
    }

    #[test]
    fn get_set_round_trip_bumps_version_once() {
        let dir = tempdir().unwrap();
        let mut array = open_u64(dir.path(), "basic", 8);
        assert_eq!(array.version(), 0);
        array.set(3, &42).unwrap();
        assert_eq!(array.version(), 1);
        assert_eq!(array.get(3).unwrap(), 42);
        assert_eq!(array.get(0).unwrap(), 0);
    }

    #[test]
    fn index_out_of_bounds_is_an_error() {
        let dir = tempdir().unwrap();
        let mut array = open_u64(dir.path(), "bounds", 4);
        let err = array.get(4).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
        let err = array.set(9, &1).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn bulk_copies_move_version_once() {
        let dir = tempdir().unwrap();
        let mut array = open_u64(dir.path(), "bulk", 8);

        let values: Vec<u8> = (1u64..=4).flat_map(|v| v.to_ne_bytes()).collect();
        array.copy_from(&values, 2, 4).unwrap();
        assert_eq!(array.version(), 1);
        for (offset, expected) in (1u64..=4).enumerate() {
            assert_eq!(array.get(2 + offset as u64).unwrap(), expected);
        }

        let mut out = vec![0u8; 4 * 8];
        array.copy_to(2, 4, &mut out).unwrap();
        assert_eq!(out, values);
        assert_eq!(array.version(), 1);
    }

    #[test]
    fn clear_zeroes_a_range() {
        let dir = tempdir().unwrap();
        let mut array = open_u64(dir.path(), "cleared", 8);
        for i in 0..8 {
            array.set(i, &(i + 1)).unwrap();
        }
        array.clear(2, 3).unwrap();
        assert_eq!(array.get(1).unwrap(), 2);
        assert_eq!(array.get(2).unwrap(), 0);
        assert_eq!(array.get(4).unwrap(), 0);
        assert_eq!(array.get(5).unwrap(), 6);
    }

    #[test]
    fn range_checks_cover_overflow() {
        let dir = tempdir().unwrap();
        let mut array = open_u64(dir.path(), "ranges", 8);
        let err = array.clear(4, u64::MAX).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn control_block_is_independent_of_version() {
        let dir = tempdir().unwrap();
        let mut array = open_u64(dir.path(), "cb", 4);
        array.set_control_block_entry(0, 11).unwrap();
        array.set_control_block_entry(4, 55).unwrap();
        assert_eq!(array.control_block_entry(0).unwrap(), 11);
        assert_eq!(array.control_block_entry(4).unwrap(), 55);
        assert_eq!(array.version(), 0);

        let err = array.control_block_entry(5).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn iterator_sees_all_records_in_order() {
        let dir = tempdir().unwrap();
        let mut array = open_u64(dir.path(), "iterated", 6);
        for i in 0..6 {
            array.set(i, &(i * 10)).unwrap();
        }
        let values: Vec<u64> = array.iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50]);
    }

    #[test]
    fn iterator_fails_fast_after_modification() {
        let dir = tempdir().unwrap();
        let mut array = open_u64(dir.path(), "racy", 4);
        for i in 0..4 {
            array.set(i, &i).unwrap();
        }
        // A second handle on the same region stands in for another process.
        let mut writer = open_u64(dir.path(), "racy", 4);

        let mut iter = array.iter();
        assert_eq!(iter.next().unwrap().unwrap(), 0);
        writer.set(2, &99).unwrap();
        let err = iter.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("modified during iteration"));
        assert!(iter.next().is_none());
    }

    #[test]
    fn records_persist_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut array = open_u64(dir.path(), "durable", 4);
            array.set(0, &7).unwrap();
            array.set(3, &11).unwrap();
            array.flush().unwrap();
        }
        let array = open_u64(dir.path(), "durable", 4);
        assert_eq!(array.initialization_count(), 2);
        assert_eq!(array.get(0).unwrap(), 7);
        assert_eq!(array.get(3).unwrap(), 11);
    }

    #[test]
    fn reopen_with_other_geometry_fails() {
        let dir = tempdir().unwrap();
        {
            let _array = open_u64(dir.path(), "strict", 4);
        }
        let err = SharedArray::<u32, _>::open(dir.path(), "strict", 4, PodSerializer::<u32>::new())
            .unwrap_err();
        assert!(err.to_string().contains("record size mismatch"));
    }
}
