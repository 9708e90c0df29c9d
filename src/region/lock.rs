//! Cross-process spin lock over the region header's lock word.
//!
//! The lock is a single `u64` at a fixed offset inside the mapped file,
//! shared by every process that has the region open. Zero means unlocked;
//! any other value is the tag of the current owner. Acquisition is a
//! compare-and-swap loop with a staged backoff: short bursts of pause
//! instructions first, then thread yields, then millisecond sleeps once the
//! wait has dragged on.
//!
//! All access to the word goes through [`lock_word`], which derives an
//! atomic reference from the raw mapping pointer. The word is never read or
//! written through the mapping's byte slice.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use memmap2::MmapMut;

use super::header::LOCK_STATE_OFFSET;

/// Lock-word value meaning "not held".
pub(crate) const UNLOCKED: u64 = 0;

/// Attempts spent busy-spinning before falling back to yielding.
const SPIN_ATTEMPTS: u32 = 10;

/// Attempts (spins included) before falling back to sleeping.
const YIELD_ATTEMPTS: u32 = 15;

/// Returns the lock word of a mapped region as an atomic.
pub(crate) fn lock_word(mmap: &MmapMut) -> &AtomicU64 {
    debug_assert!(mmap.len() >= LOCK_STATE_OFFSET + 8);
    // SAFETY:
    // 1. The mapping is at least HEADER_SIZE bytes (checked when the region
    //    is opened), so the word at LOCK_STATE_OFFSET lies inside it.
    // 2. mmap(2) returns page-aligned memory and LOCK_STATE_OFFSET is a
    //    multiple of 8, so the pointer is properly aligned for AtomicU64.
    // 3. The returned reference borrows the mapping and cannot outlive it.
    // 4. Other processes mutate the word concurrently; every access goes
    //    through atomic operations, so there are no data races on it.
    unsafe { &*(mmap.as_ptr().add(LOCK_STATE_OFFSET) as *const AtomicU64) }
}

/// Spins until the word transitions from [`UNLOCKED`] to `owner`.
pub(crate) fn acquire(word: &AtomicU64, owner: u64) {
    debug_assert_ne!(owner, UNLOCKED);
    let mut attempt = 0u32;
    while word
        .compare_exchange(UNLOCKED, owner, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        backoff(attempt);
        attempt = attempt.wrapping_add(1);
    }
}

/// Releases a lock previously taken with [`acquire`].
pub(crate) fn release(word: &AtomicU64, owner: u64) {
    let previous = word.swap(UNLOCKED, Ordering::AcqRel);
    debug_assert_eq!(
        previous, owner,
        "lock released by a thread that does not hold it"
    );
}

/// Waits in a manner appropriate for how long the caller has been waiting:
/// pause instructions while the wait is short (and a second CPU could be
/// about to release the lock), then yields, then millisecond sleeps.
pub(crate) fn backoff(attempt: u32) {
    if attempt < SPIN_ATTEMPTS && multiprocessor() {
        for _ in 0..20 * (attempt + 1) {
            std::hint::spin_loop();
        }
    } else if attempt < YIELD_ATTEMPTS {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Tag stored in the lock word while held: the process id in the upper
/// 32 bits, a hash of the current thread id in the lower 32. Derived on
/// demand so it is always correct for the calling thread. Never zero,
/// since process ids start at 1.
pub(crate) fn owner_tag() -> u64 {
    let pid = u64::from(std::process::id());
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (pid << 32) | u64::from(hasher.finish() as u32)
}

fn multiprocessor() -> bool {
    static MULTIPROCESSOR: OnceLock<bool> = OnceLock::new();
    *MULTIPROCESSOR
        .get_or_init(|| std::thread::available_parallelism().map_or(false, |n| n.get() > 1))
}
