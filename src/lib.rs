//! # shmq - Persisted Inter-Process Collections
//!
//! shmq stores collections in memory-mapped files so that any number of
//! processes can share them by directory and name. This implementation
//! prioritizes:
//!
//! - **Zero-copy record storage**: Records live in the mapping, bulk moves
//!   are straight byte copies
//! - **Crash-aware arbitration**: Kernel advisory locks decide who
//!   initializes and who attaches, even after a holder dies
//! - **Persistence for free**: All state is in the file; reopening a queue
//!   resumes exactly where it stopped
//!
//! Three collections build on one storage primitive:
//!
//! - [`SharedArray`]: fixed-length array of records with a cross-process
//!   spin lock and a modification counter
//! - [`BoundedQueue`]: fixed-capacity FIFO ring over a shared array
//! - [`SegmentedQueue`]: unbounded FIFO chaining bounded segments through
//!   a directory of segment ids
//!
//! ## Quick Start
//!
//! ```ignore
//! use shmq::{PodSerializer, SegmentedQueue};
//!
//! let mut queue = SegmentedQueue::open("/var/lib/myapp", "events", PodSerializer::<u64>::new())?;
//! queue.enqueue(&42)?;
//! while let Some(event) = queue.try_dequeue()? {
//!     println!("{event}");
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │           SegmentedQueue            │  directory of segment ids,
//! ├─────────────────────────────────────┤  each segment a bounded queue
//! │            BoundedQueue             │  ring cursors in the control
//! ├─────────────────────────────────────┤  block, records in the array
//! │            SharedArray              │  indexed records, spin lock,
//! ├─────────────────────────────────────┤  version counter
//! │            SharedRegion             │  mapped file: header + records,
//! │                                     │  open/attach/teardown protocol
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! Every collection is one region file plus its lock file; a segmented
//! queue adds one region per segment:
//!
//! ```text
//! data_dir/
//! ├── events.mma       # directory: header + segment ids, page-rounded
//! ├── events.lock      # initialization/teardown lock target
//! ├── events.0.mma     # segment 0
//! ├── events.0.lock
//! ├── events.1.mma     # segment 1
//! └── events.1.lock
//! ```
//!
//! ## Module Overview
//!
//! - [`array`]: the shared array collection
//! - [`queue`]: bounded and segmented queues
//! - [`region`]: mapped-file primitive and its on-disk header layout
//! - [`serialize`]: fixed-size record codec and its POD impl

pub mod region;

pub mod array;
pub mod queue;
pub mod serialize;

pub use array::SharedArray;
pub use queue::{BoundedQueue, FullBehavior, SegmentedQueue, DEFAULT_SEGMENT_SIZE};
pub use region::header::{CONTROL_BLOCK_SLOTS, HEADER_SIZE};
pub use serialize::{PodSerializer, Serializer};
