//! Persisted inter-process FIFO queues.
//!
//! Two flavors over the same shared-region machinery:
//!
//! - [`BoundedQueue`]: a fixed-capacity ring buffer over one shared array,
//!   with head, tail and count kept in the array's control block.
//! - [`SegmentedQueue`]: an unbounded queue that chains bounded segments
//!   together through a directory of segment ids, growing at the tail and
//!   retiring drained segments at the head.

pub mod bounded;
pub mod segmented;

pub use bounded::{BoundedQueue, FullBehavior, CUSTOM_CONTROL_BLOCK_SLOTS};
pub use segmented::{SegmentedQueue, DEFAULT_SEGMENT_SIZE};
