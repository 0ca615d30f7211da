//! Traits for the two collaborators a durable log consumes but does not
//! implement itself: a block device that supplies segment-addressable
//! reads/writes, and a commit-metadata store that persists a small byte blob
//! atomically and retrieves the latest one.
//!
//! This mirrors the teacher's split between `storage_device` (trait
//! definitions) and a concrete driver crate: the traits here describe the
//! contract, and [`local_file`] ships one straightforward implementation of
//! each, suitable as the default for a single-machine deployment.

use std::io;

pub mod local_file;

/// A block-addressable device that a log's flush pipeline writes completed
/// pages to, and that its scan iterator reads from for addresses below
/// `HeadAddress`.
///
/// Implementations must support concurrent `read_at`/`write_at` calls from
/// multiple threads without external synchronization (i.e., they must not
/// share a single seek cursor across calls).
pub trait BlockDevice: Send + Sync {
    /// Reads bytes starting at the given absolute byte `offset` into `buf`,
    /// returning the number of bytes actually read (may be less than
    /// `buf.len()` at the end of a segment).
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `buf` starting at the given absolute byte `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Ensures all previously issued writes are durable.
    fn sync(&self) -> io::Result<()>;

    /// The size in bytes of one on-disk segment. The device is responsible
    /// for mapping an absolute byte offset to a `(segment, segment_offset)`
    /// pair internally; callers only ever see a flat address space.
    fn segment_size(&self) -> u64;
}

impl<D: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<D> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, buf)
    }
    fn sync(&self) -> io::Result<()> {
        (**self).sync()
    }
    fn segment_size(&self) -> u64 {
        (**self).segment_size()
    }
}

/// A store for the small `RecoveryInfo` blob a log persists on every commit.
///
/// Each commit is identified by a monotonically increasing `id`; the store
/// need only ever hand back the blob with the highest `id` it has durably
/// recorded, which lets implementations use a simple append/replace scheme
/// instead of in-place mutation.
pub trait CommitManager: Send + Sync {
    /// Atomically persists `bytes` as commit number `id`. Must not be
    /// observable by [`get_latest`](CommitManager::get_latest) as a torn
    /// write: either the whole blob is there, or it isn't.
    fn commit(&self, id: u64, bytes: &[u8]) -> io::Result<()>;

    /// Returns the highest-numbered commit durably recorded so far, along
    /// with its bytes, or `None` if nothing has ever been committed.
    fn get_latest(&self) -> io::Result<Option<(u64, Vec<u8>)>>;
}

impl<C: CommitManager + ?Sized> CommitManager for std::sync::Arc<C> {
    fn commit(&self, id: u64, bytes: &[u8]) -> io::Result<()> {
        (**self).commit(id, bytes)
    }
    fn get_latest(&self) -> io::Result<Option<(u64, Vec<u8>)>> {
        (**self).get_latest()
    }
}
