//! Fixed-layout header embedded at the start of every shared region file.
//!
//! The header occupies the first 272 bytes of the mapping. Every field is a
//! little-endian `u64`, and the three pad blocks keep the lock word and the
//! bookkeeping fields on separate cache lines so that spinning on the lock
//! does not thrash the line holding the counters.
//!
//! ## Layout
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------------------
//!      0    64  pad0                 (reserved)
//!     64     8  lock_state           (cross-process spin lock word)
//!     72    64  pad1                 (isolates the lock word)
//!    136     8  initialization_count (0 = never initialized)
//!    144     8  item_size            (record size in bytes)
//!    152     8  length               (capacity in records)
//!    160     8  version              (modification counter)
//!    168    40  control_block        (5 general-purpose u64 slots)
//!    208    64  pad2                 (reserved)
//! ------  ----  -----------------------------------------------
//!    272        total
//! ```
//!
//! The five control-block slots carry no meaning at this layer. The queue
//! built on top assigns head, tail and count to the first three and leaves
//! the remaining two for its own callers.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Total header size in bytes. Record data starts at this offset.
pub const HEADER_SIZE: usize = 272;

/// Number of general-purpose control-block slots in the header.
pub const CONTROL_BLOCK_SLOTS: usize = 5;

/// Byte offset of the spin-lock word within the region file.
pub const LOCK_STATE_OFFSET: usize = 64;

pub const INITIALIZATION_COUNT_OFFSET: usize = 136;
pub const ITEM_SIZE_OFFSET: usize = 144;
pub const LENGTH_OFFSET: usize = 152;
pub const VERSION_OFFSET: usize = 160;
pub const CONTROL_BLOCK_OFFSET: usize = 168;

/// Byte offset of one control-block slot. `slot` must be below
/// [`CONTROL_BLOCK_SLOTS`].
pub const fn control_slot_offset(slot: usize) -> usize {
    CONTROL_BLOCK_OFFSET + slot * 8
}

/// Typed view over the first [`HEADER_SIZE`] bytes of a region file.
///
/// Used for one-shot initialization and validation while the region's
/// file lock is held. Steady-state field access goes through raw offset
/// reads so the borrow of the mapping stays narrow.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RegionHeader {
    pad0: [u8; 64],
    lock_state: U64,
    pad1: [u8; 64],
    initialization_count: U64,
    item_size: U64,
    length: U64,
    version: U64,
    control_block: [U64; CONTROL_BLOCK_SLOTS],
    pad2: [u8; 64],
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() == HEADER_SIZE);
const _: () = assert!(core::mem::offset_of!(RegionHeader, lock_state) == LOCK_STATE_OFFSET);
const _: () = assert!(
    core::mem::offset_of!(RegionHeader, initialization_count) == INITIALIZATION_COUNT_OFFSET
);
const _: () = assert!(core::mem::offset_of!(RegionHeader, item_size) == ITEM_SIZE_OFFSET);
const _: () = assert!(core::mem::offset_of!(RegionHeader, length) == LENGTH_OFFSET);
const _: () = assert!(core::mem::offset_of!(RegionHeader, version) == VERSION_OFFSET);
const _: () = assert!(core::mem::offset_of!(RegionHeader, control_block) == CONTROL_BLOCK_OFFSET);

impl RegionHeader {
    /// Reinterprets the start of `bytes` as a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= HEADER_SIZE,
            "buffer of {} bytes is too small for a region header ({} bytes)",
            bytes.len(),
            HEADER_SIZE
        );
        Self::ref_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read region header: {e:?}"))
    }

    /// Mutable variant of [`RegionHeader::from_bytes`].
    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= HEADER_SIZE,
            "buffer of {} bytes is too small for a region header ({} bytes)",
            bytes.len(),
            HEADER_SIZE
        );
        Self::mut_from_bytes(&mut bytes[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read region header: {e:?}"))
    }

    pub fn initialization_count(&self) -> u64 {
        self.initialization_count.get()
    }

    pub fn set_initialization_count(&mut self, count: u64) {
        self.initialization_count = U64::new(count);
    }

    pub fn item_size(&self) -> u64 {
        self.item_size.get()
    }

    pub fn set_item_size(&mut self, item_size: u64) {
        self.item_size = U64::new(item_size);
    }

    pub fn length(&self) -> u64 {
        self.length.get()
    }

    pub fn set_length(&mut self, length: u64) {
        self.length = U64::new(length);
    }

    pub fn version(&self) -> u64 {
        self.version.get()
    }

    pub fn control_block_entry(&self, slot: usize) -> u64 {
        debug_assert!(slot < CONTROL_BLOCK_SLOTS);
        self.control_block[slot].get()
    }
}
