//! A durable, high-throughput append-only log over a paged, epoch-protected
//! in-memory ring and a pluggable block device.
//!
//! The log is organized the way the teacher's storage stack is: a paged
//! allocator hands out byte ranges under CAS (`allocator`), an epoch
//! protector (`epoch_guard`) makes it safe to reclaim a page's memory once
//! every reader that might still be looking at it has moved on, and a commit
//! coordinator (`commit`) serializes recovery metadata to a pluggable store
//! (`log_device`). [`DurableLog`] ties the three together behind one handle.

mod address;
mod allocator;
mod commit;
mod durable_log;
mod iter;
mod page;
mod record;
mod settings;

mod error;

pub use address::{Address, FIRST_VALID_ADDRESS};
pub use allocator::{AllocationResult, PendingAllocation};
pub use commit::RecoveryInfo;
pub use durable_log::{AppendOutcome, DurableLog};
pub use error::{Error, Result};
pub use iter::{BufferingMode, LogIterator};
pub use settings::LogSettings;

pub use log_device::{local_file, BlockDevice, CommitManager};
