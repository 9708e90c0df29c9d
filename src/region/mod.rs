//! Memory-mapped region shared between processes.
//!
//! A region is a plain file mapped read-write into every participating
//! process. The first [`HEADER_SIZE`](header::HEADER_SIZE) bytes hold the
//! header described in [`header`]; the rest is record storage. A region
//! named `ticks` in directory `/var/data` lives in two files:
//!
//! ```text
//! /var/data/ticks.mma    data file (header + records, page-rounded)
//! /var/data/ticks.lock   initialization lock file (always empty)
//! ```
//!
//! ## Locking protocol
//!
//! Three locks with distinct jobs:
//!
//! ```text
//! initialization lock    flock(LOCK_EX) on <name>.lock; serializes region
//!                        creation, validation, and teardown across
//!                        processes. Held only inside open() and drop().
//!
//! role probe             flock(LOCK_EX | LOCK_NB) on <name>.mma; succeeds
//!                        only when no other live handle exists, making
//!                        this handle the server. Every handle then holds
//!                        flock(LOCK_SH) until it closes, so liveness is
//!                        tracked by the kernel even across crashes.
//!
//! spin lock              word inside the header; guards record data and
//!                        control-block state at steady state. See
//!                        [`lock`].
//! ```
//!
//! The server initializes the header on first creation and always
//! increments the initialization count; clients validate the persisted
//! geometry against their own and fail fast on mismatch. Either way the
//! handle that came first is the server, so exactly one exists per region
//! at any time.
//!
//! Teardown re-takes the initialization lock, unmaps, then closes the file.
//! If the lock cannot be had within the timeout the handle is released
//! anyway; a warning is logged and the kernel still drops the advisory lock
//! with the descriptor.

pub mod header;
pub(crate) mod lock;

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::ManuallyDrop;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use eyre::{ensure, Context, Result};
use memmap2::MmapMut;

use self::header::{
    control_slot_offset, RegionHeader, CONTROL_BLOCK_SLOTS, HEADER_SIZE,
    INITIALIZATION_COUNT_OFFSET, ITEM_SIZE_OFFSET, LENGTH_OFFSET, VERSION_OFFSET,
};

const DATA_EXTENSION: &str = "mma";
const LOCK_EXTENSION: &str = "lock";

/// How long open and teardown wait for the initialization lock before
/// giving up.
const INIT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const INIT_LOCK_POLL: Duration = Duration::from_millis(10);

/// Exclusive advisory lock on a region's `.lock` file. Dropping it releases
/// the lock (closing a descriptor drops its flock).
#[derive(Debug)]
struct InitLock {
    _file: File,
}

impl InitLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open lock file '{}'", path.display()))?;
        let started = Instant::now();
        loop {
            // SAFETY: flock on a descriptor we own; no memory is touched.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(Self { _file: file });
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) => {
                    let elapsed = started.elapsed();
                    ensure!(
                        elapsed < timeout,
                        "timed out after {}ms waiting for initialization lock '{}'",
                        elapsed.as_millis(),
                        path.display()
                    );
                    std::thread::sleep(INIT_LOCK_POLL);
                }
                _ => {
                    return Err(err)
                        .wrap_err_with(|| format!("failed to lock '{}'", path.display()));
                }
            }
        }
    }
}

/// A shared, persisted, memory-mapped region: one mapped file plus the
/// bookkeeping to open, arbitrate, and tear it down safely.
#[derive(Debug)]
pub(crate) struct SharedRegion {
    // Dropped by hand in Drop so the teardown lock covers both: the mapping
    // is unmapped first, then the file is closed (which also releases the
    // shared flock).
    mmap: ManuallyDrop<MmapMut>,
    file: ManuallyDrop<File>,
    path: PathBuf,
    lock_path: PathBuf,
    name: String,
    server: bool,
}

impl SharedRegion {
    /// Opens (creating if absent) the region `name` under `dir`, sized for
    /// `length` records of `item_size` bytes each.
    pub(crate) fn open(dir: &Path, name: &str, length: u64, item_size: u64) -> Result<Self> {
        debug_assert!(length > 0 && item_size > 0);
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create directory '{}'", dir.display()))?;
        let path = dir.join(format!("{name}.{DATA_EXTENSION}"));
        let lock_path = dir.join(format!("{name}.{LOCK_EXTENSION}"));

        let _init_lock = InitLock::acquire(&lock_path, INIT_LOCK_TIMEOUT)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open region file '{}'", path.display()))?;
        let server = probe_server(&file)?;
        hold_shared(&file, &path)?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat region file '{}'", path.display()))?
            .len();
        if server {
            let expected = region_file_size(length, item_size)?;
            if file_size < expected {
                file.set_len(expected).wrap_err_with(|| {
                    format!("failed to size region file '{}' to {expected} bytes", path.display())
                })?;
            }
        } else {
            ensure!(
                file_size >= HEADER_SIZE as u64,
                "region file '{}' is too small ({file_size} bytes) to hold a header",
                path.display()
            );
        }

        // SAFETY:
        // 1. `file` is open read-write and lives as long as the mapping;
        //    both are owned by the returned region and released together,
        //    mapping first.
        // 2. The file is at least HEADER_SIZE bytes (sized above for the
        //    server, checked above for clients), so header access is in
        //    bounds.
        // 3. Other processes map the same file concurrently. The lock word
        //    is only ever accessed atomically, and everything else is
        //    guarded by the spin lock or the initialization lock.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .wrap_err_with(|| format!("failed to map region file '{}'", path.display()))?;

        initialize_or_validate(&mut mmap, name, length, item_size, server)?;

        tracing::debug!(region = name, server, length, item_size, "opened shared region");
        Ok(Self {
            mmap: ManuallyDrop::new(mmap),
            file: ManuallyDrop::new(file),
            path,
            lock_path,
            name: name.to_owned(),
            server,
        })
    }

    pub(crate) fn is_server(&self) -> bool {
        self.server
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn initialization_count(&self) -> u64 {
        self.read_u64(INITIALIZATION_COUNT_OFFSET)
    }

    pub(crate) fn item_size(&self) -> u64 {
        self.read_u64(ITEM_SIZE_OFFSET)
    }

    pub(crate) fn length(&self) -> u64 {
        self.read_u64(LENGTH_OFFSET)
    }

    pub(crate) fn version(&self) -> u64 {
        self.read_u64(VERSION_OFFSET)
    }

    pub(crate) fn bump_version(&mut self) {
        let version = self.version().wrapping_add(1);
        self.write_u64(VERSION_OFFSET, version);
    }

    pub(crate) fn control_slot(&self, slot: usize) -> u64 {
        debug_assert!(slot < CONTROL_BLOCK_SLOTS);
        self.read_u64(control_slot_offset(slot))
    }

    pub(crate) fn set_control_slot(&mut self, slot: usize, value: u64) {
        debug_assert!(slot < CONTROL_BLOCK_SLOTS);
        self.write_u64(control_slot_offset(slot), value);
    }

    /// Current raw value of the spin-lock word, for diagnostics.
    pub(crate) fn lock_state(&self) -> u64 {
        lock::lock_word(&self.mmap).load(Ordering::Acquire)
    }

    /// Blocks until this thread owns the region's spin lock.
    pub(crate) fn acquire_lock(&self) {
        lock::acquire(lock::lock_word(&self.mmap), lock::owner_tag());
    }

    /// Releases the spin lock taken by [`SharedRegion::acquire_lock`].
    pub(crate) fn release_lock(&self) {
        lock::release(lock::lock_word(&self.mmap), lock::owner_tag());
    }

    /// Record storage: everything past the header.
    pub(crate) fn data(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..]
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[HEADER_SIZE..]
    }

    /// Flushes the mapping to its backing file.
    pub(crate) fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to flush region '{}'", self.name))
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.mmap[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.mmap[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Serialize teardown against concurrent opens of the same region.
        let guard = InitLock::acquire(&self.lock_path, INIT_LOCK_TIMEOUT);
        if let Err(err) = &guard {
            tracing::warn!(
                region = %self.name,
                error = %err,
                "tearing down region without the initialization lock"
            );
        }
        // SAFETY: both fields are dropped exactly once, right here, and the
        // struct is never used again. The mapping must go before the file:
        // unmap, then close (closing also releases the shared flock).
        unsafe {
            ManuallyDrop::drop(&mut self.mmap);
            ManuallyDrop::drop(&mut self.file);
        }
    }
}

/// Probes whether any other live handle has this region file open. Takes
/// the exclusive flock when none does, making the caller the server.
fn probe_server(file: &File) -> Result<bool> {
    // SAFETY: flock on a descriptor we own; no memory is touched.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    ensure!(
        err.raw_os_error() == Some(libc::EWOULDBLOCK),
        "failed to probe region file lock: {err}"
    );
    Ok(false)
}

/// Converts (or takes) the handle's flock to shared mode, marking this
/// handle live for later probes.
fn hold_shared(file: &File, path: &Path) -> Result<()> {
    // SAFETY: flock on a descriptor we own; no memory is touched.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) };
    ensure!(
        rc == 0,
        "failed to acquire shared lock on '{}': {}",
        path.display(),
        io::Error::last_os_error()
    );
    Ok(())
}

/// Full on-disk size for a region of `length` records: header plus data,
/// rounded up to a whole number of pages.
fn region_file_size(length: u64, item_size: u64) -> Result<u64> {
    let total = length
        .checked_mul(item_size)
        .and_then(|data| data.checked_add(HEADER_SIZE as u64))
        .ok_or_else(|| {
            eyre::eyre!("region of {length} records of {item_size} bytes overflows a file size")
        })?;
    let page = page_size();
    Ok(total.div_ceil(page) * page)
}

fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name; no memory is touched.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}

/// First-open initialization or attach-time validation of the header,
/// performed under the initialization lock before the region handle is
/// constructed. Failing here unmaps and closes everything by dropping the
/// locals in `open`.
fn initialize_or_validate(
    mmap: &mut MmapMut,
    name: &str,
    length: u64,
    item_size: u64,
    server: bool,
) -> Result<()> {
    ensure!(
        mmap.len() as u64 >= length.saturating_mul(item_size).saturating_add(HEADER_SIZE as u64),
        "region file for '{name}' is smaller than its declared geometry"
    );
    let header = RegionHeader::from_bytes_mut(&mut mmap[..])?;
    if server && header.initialization_count() == 0 {
        header.set_item_size(item_size);
        header.set_length(length);
        tracing::debug!(region = name, length, item_size, "initialized region header");
    } else {
        ensure!(
            header.initialization_count() > 0,
            "region '{name}' was never initialized"
        );
        ensure!(
            header.item_size() == item_size,
            "record size mismatch for region '{name}': expected {item_size} bytes, file says {}",
            header.item_size()
        );
        ensure!(
            header.length() == length,
            "length mismatch for region '{name}': expected {length} records, file says {}",
            header.length()
        );
    }
    if server {
        let count = header.initialization_count();
        header.set_initialization_count(count.checked_add(1).unwrap_or(1));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_new_region() {
        let dir = tempdir().unwrap();
        let region = SharedRegion::open(dir.path(), "fresh", 64, 8).unwrap();
        assert!(region.is_server());
        assert_eq!(region.initialization_count(), 1);
        assert_eq!(region.item_size(), 8);
        assert_eq!(region.length(), 64);
        assert_eq!(region.version(), 0);
        assert!(region.data().len() >= 64 * 8);

        let meta = std::fs::metadata(dir.path().join("fresh.mma")).unwrap();
        assert!(meta.len() >= (HEADER_SIZE + 64 * 8) as u64);
        assert_eq!(meta.len() % page_size(), 0);
        assert!(dir.path().join("fresh.lock").exists());
    }

    #[test]
    fn reopen_increments_initialization_count() {
        let dir = tempdir().unwrap();
        {
            let region = SharedRegion::open(dir.path(), "counted", 16, 4).unwrap();
            assert_eq!(region.initialization_count(), 1);
        }
        {
            let region = SharedRegion::open(dir.path(), "counted", 16, 4).unwrap();
            assert!(region.is_server());
            assert_eq!(region.initialization_count(), 2);
        }
    }

    #[test]
    fn second_live_handle_attaches_as_client() {
        let dir = tempdir().unwrap();
        let server = SharedRegion::open(dir.path(), "pair", 16, 4).unwrap();
        let client = SharedRegion::open(dir.path(), "pair", 16, 4).unwrap();
        assert!(server.is_server());
        assert!(!client.is_server());
        // Clients never touch the initialization count.
        assert_eq!(client.initialization_count(), 1);
    }

    #[test]
    fn client_rejects_record_size_mismatch() {
        let dir = tempdir().unwrap();
        let _server = SharedRegion::open(dir.path(), "sized", 16, 8).unwrap();
        let err = SharedRegion::open(dir.path(), "sized", 16, 4).unwrap_err();
        assert!(err.to_string().contains("record size mismatch"));
    }

    #[test]
    fn client_rejects_length_mismatch() {
        let dir = tempdir().unwrap();
        let _server = SharedRegion::open(dir.path(), "long", 16, 8).unwrap();
        let err = SharedRegion::open(dir.path(), "long", 32, 8).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn data_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut region = SharedRegion::open(dir.path(), "durable", 4, 4).unwrap();
            region.data_mut()[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
            region.flush().unwrap();
        }
        let region = SharedRegion::open(dir.path(), "durable", 4, 4).unwrap();
        assert_eq!(&region.data()[..4], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn control_slots_round_trip() {
        let dir = tempdir().unwrap();
        let mut region = SharedRegion::open(dir.path(), "slots", 4, 4).unwrap();
        for slot in 0..CONTROL_BLOCK_SLOTS {
            region.set_control_slot(slot, slot as u64 * 7);
        }
        for slot in 0..CONTROL_BLOCK_SLOTS {
            assert_eq!(region.control_slot(slot), slot as u64 * 7);
        }
        // Slot writes never move the version.
        assert_eq!(region.version(), 0);
    }

    #[test]
    fn version_wraps_around() {
        let dir = tempdir().unwrap();
        let mut region = SharedRegion::open(dir.path(), "wrap", 4, 4).unwrap();
        region.write_u64(VERSION_OFFSET, u64::MAX);
        region.bump_version();
        assert_eq!(region.version(), 0);
    }

    #[test]
    fn init_lock_times_out_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("held.lock");
        let _held = InitLock::acquire(&path, Duration::from_millis(100)).unwrap();
        let err = InitLock::acquire(&path, Duration::from_millis(50)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn spin_lock_state_visible_through_region() {
        let dir = tempdir().unwrap();
        let region = SharedRegion::open(dir.path(), "spin", 4, 4).unwrap();
        assert_eq!(region.lock_state(), 0);
        region.acquire_lock();
        assert_ne!(region.lock_state(), 0);
        region.release_lock();
        assert_eq!(region.lock_state(), 0);
    }
}
