//! The top-level handle tying the allocator, commit coordinator, and epoch
//! protector into one durable, appendable log.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use epoch_guard::EpochProtector;
use log_device::{BlockDevice, CommitManager};

use crate::address::Address;
use crate::allocator::{AllocationResult, PagedAllocator, PendingAllocation};
use crate::commit::{CommitCoordinator, RecoveryInfo};
use crate::error::{Error, Result};
use crate::iter::{BufferingMode, LogIterator};
use crate::record;
use crate::settings::LogSettings;

/// The result of one attempt to append a record.
#[derive(Debug)]
pub enum AppendOutcome {
    /// The record was written at this address.
    Done(Address),
    /// Could not complete yet; call `try_append` again with the same
    /// `pending` slot once backpressure clears.
    Pending,
    /// The pending allocation expired; discard it and call `try_append`
    /// again from scratch (it will allocate a fresh reservation).
    Restart,
}

pub struct DurableLog {
    allocator: Arc<PagedAllocator>,
    epoch: Arc<EpochProtector>,
    commit: Arc<CommitCoordinator>,
    device: Arc<dyn BlockDevice>,
    settings: LogSettings,
    named_iterators: Arc<Mutex<HashMap<String, Address>>>,
}

/// Builds and persists `RecoveryInfo` for the given `flushed_until`, the
/// sole path into the commit coordinator: every durable commit starts here,
/// whether it was triggered by `maybe_auto_shift`'s background flush or by
/// an explicit `flush_and_commit`.
fn commit_flushed(
    allocator: &Arc<PagedAllocator>,
    commit: &Arc<CommitCoordinator>,
    named_iterators: &Mutex<HashMap<String, Address>>,
    flushed_until: Address,
) -> Result<()> {
    let info = RecoveryInfo {
        begin_address: allocator.begin_address(),
        flushed_until_address: flushed_until,
        iterators: named_iterators.lock().clone(),
    };
    commit.commit(&info)?;
    Ok(())
}

impl DurableLog {
    /// Opens a log over `device`/`commit_manager`, restoring from the
    /// latest persisted commit if one exists.
    pub fn open(
        settings: LogSettings,
        device: Arc<dyn BlockDevice>,
        commit_manager: Arc<dyn CommitManager>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        let epoch = Arc::new(EpochProtector::new());

        let latest = commit_manager.get_latest().map_err(Error::CommitFailed)?;
        let (starting_version, recovery) = match latest {
            Some((id, bytes)) => (id, Some(RecoveryInfo::deserialize(&bytes)?)),
            None => (0, None),
        };

        let allocator = Arc::new(match &recovery {
            Some(info) => {
                info!(
                    "restoring log from commit {starting_version}: begin={}, flushed_until={}",
                    info.begin_address, info.flushed_until_address
                );
                PagedAllocator::restore(
                    settings.clone(),
                    device.clone(),
                    epoch.clone(),
                    info.flushed_until_address,
                    info.begin_address,
                )
            }
            None => PagedAllocator::new(settings.clone(), device.clone(), epoch.clone()),
        });

        let committed_until = recovery
            .as_ref()
            .map(|r| r.flushed_until_address)
            .unwrap_or(crate::address::FIRST_VALID_ADDRESS);
        let named_iterators = Arc::new(Mutex::new(recovery.map(|r| r.iterators).unwrap_or_default()));

        let commit = Arc::new(CommitCoordinator::new(commit_manager, starting_version, committed_until));

        // Wire the allocator's background flush pipeline straight into the
        // commit coordinator, so `maybe_auto_shift`'s unattended flushes
        // become durable commits on their own, not just the ones triggered
        // by an explicit `flush_and_commit`.
        let allocator_for_cb = allocator.clone();
        let commit_for_cb = commit.clone();
        let named_iterators_for_cb = named_iterators.clone();
        allocator.set_on_flushed(Box::new(move |flushed_until| {
            if let Err(e) = commit_flushed(&allocator_for_cb, &commit_for_cb, &named_iterators_for_cb, flushed_until) {
                warn!("auto-commit after flush to {flushed_until} failed: {e}");
            }
        }));

        Ok(Arc::new(DurableLog {
            allocator,
            epoch,
            commit,
            device,
            settings,
            named_iterators,
        }))
    }

    pub fn settings(&self) -> &LogSettings {
        &self.settings
    }

    pub fn begin_address(&self) -> Address {
        self.allocator.begin_address()
    }
    pub fn head_address(&self) -> Address {
        self.allocator.head_address()
    }
    pub fn read_only_address(&self) -> Address {
        self.allocator.read_only_address()
    }
    pub fn flushed_until_address(&self) -> Address {
        self.allocator.flushed_until_address()
    }
    pub fn tail_address(&self) -> Address {
        self.allocator.tail_address()
    }
    pub fn committed_until_address(&self) -> Address {
        self.commit.committed_until_address()
    }

    fn write_record(&self, addr: Address, payload: &[u8]) {
        let total = record::record_size(payload.len());
        let mut framed = vec![0u8; total];
        record::encode(payload, &mut framed);
        // Every read or write of a page's bytes happens between enter()/exit():
        // this keeps the page from being evicted out from under the write.
        let _guard = self.epoch.enter();
        // SAFETY: `addr` was just handed back by a `Ready` allocation sized
        // for exactly `total` bytes.
        unsafe { self.allocator.write(addr, &framed) };
    }

    /// A single, non-blocking attempt to append `payload`. On the first call
    /// for a given record pass `&mut None`; if it returns `Pending`, retry
    /// with the same slot (now populated) once backpressure clears. A
    /// `Restart` means the slot is stale; pass `&mut None` again.
    pub fn try_append(&self, payload: &[u8], pending: &mut Option<PendingAllocation>) -> Result<AppendOutcome> {
        let size = record::record_size(payload.len());
        let result = match pending.take() {
            Some(p) => self.allocator.check_allocate_complete(p)?,
            None => self.allocator.try_allocate(size)?,
        };
        match result {
            AllocationResult::Ready(addr) => {
                self.write_record(addr, payload);
                self.allocator.maybe_auto_shift();
                Ok(AppendOutcome::Done(addr))
            }
            AllocationResult::Pending(p) => {
                *pending = Some(p);
                Ok(AppendOutcome::Pending)
            }
            AllocationResult::Restart => Ok(AppendOutcome::Restart),
        }
    }

    /// Appends `payload`, spinning/yielding through backpressure until it
    /// lands. Returns the address it was written at.
    pub fn append(&self, payload: &[u8]) -> Result<Address> {
        let mut pending = None;
        loop {
            match self.try_append(payload, &mut pending)? {
                AppendOutcome::Done(addr) => return Ok(addr),
                AppendOutcome::Pending => {
                    std::thread::yield_now();
                }
                AppendOutcome::Restart => {
                    pending = None;
                }
            }
        }
    }

    /// Async counterpart of [`append`](DurableLog::append): cooperatively
    /// yields to the executor instead of blocking the thread while waiting
    /// out backpressure. Returns as soon as the record is resident, without
    /// waiting for it to commit — see [`append_async`](DurableLog::append_async)
    /// for the variant that also waits out the commit.
    pub async fn append_to_memory_async(&self, payload: &[u8]) -> Result<Address> {
        let mut pending = None;
        loop {
            match self.try_append(payload, &mut pending)? {
                AppendOutcome::Done(addr) => return Ok(addr),
                AppendOutcome::Pending => {
                    yield_now().await;
                }
                AppendOutcome::Restart => {
                    pending = None;
                }
            }
        }
    }

    /// Appends `payload` and, on success, also awaits until
    /// `CommittedUntilAddress` has advanced past the whole written record.
    pub async fn append_async(&self, payload: &[u8]) -> Result<Address> {
        let addr = self.append_to_memory_async(payload).await?;
        let total = record::record_size(payload.len());
        self.wait_for_commit_async(addr + total as Address).await;
        Ok(addr)
    }

    /// Rolls every page up to the current tail to read-only, waits for
    /// their flushes to the device to land, and persists a new commit.
    /// Returns the address now durably committed.
    pub fn flush_and_commit(&self) -> Result<Address> {
        self.allocator.shift_read_only_to_tail();
        let target = self.allocator.tail_address();
        while self.allocator.flushed_until_address() < target {
            std::thread::yield_now();
        }
        commit_flushed(&self.allocator, &self.commit, &self.named_iterators, self.allocator.flushed_until_address())?;
        Ok(self.commit.committed_until_address())
    }

    /// Async counterpart of [`flush_and_commit`](DurableLog::flush_and_commit).
    pub async fn flush_and_commit_async(&self) -> Result<Address> {
        self.allocator.shift_read_only_to_tail();
        let target = self.allocator.tail_address();
        while self.allocator.flushed_until_address() < target {
            yield_now().await;
        }
        commit_flushed(&self.allocator, &self.commit, &self.named_iterators, self.allocator.flushed_until_address())?;
        Ok(self.commit.committed_until_address())
    }

    /// Blocks until the commit that produced `address` (or a later one) has
    /// landed. `address` is typically one returned by `append`.
    pub fn wait_for_commit(&self, address: Address) {
        self.commit.wait_for_commit(address);
    }

    pub async fn wait_for_commit_async(&self, address: Address) {
        while !self.commit.is_committed(address) {
            yield_now().await;
        }
    }

    /// Advances `BeginAddress`. The log retains no promise about bytes
    /// below `new_begin`; a scan starting before it will simply begin at
    /// `new_begin` instead.
    pub fn truncate_until(&self, new_begin: Address) -> Result<()> {
        if new_begin < self.allocator.begin_address() {
            return Err(Error::InvalidRange {
                begin: new_begin,
                end: self.allocator.begin_address(),
            });
        }
        if new_begin > self.allocator.flushed_until_address() {
            return Err(Error::InvalidRange {
                begin: new_begin,
                end: self.allocator.flushed_until_address(),
            });
        }
        {
            let _guard = self.epoch.enter();
            self.allocator.shift_begin_address(new_begin);
        }
        self.epoch.drain();
        Ok(())
    }

    /// Opens an unnamed iterator over `[start, end)`. `end == None` means
    /// "keep tailing the log as it grows". By default the scan's ceiling is
    /// `CommittedUntilAddress`; pass `scan_uncommitted = true` to extend it
    /// to `TailAddress` instead, observing records that haven't committed yet.
    pub fn scan(
        self: &Arc<Self>,
        start: Address,
        end: Option<Address>,
        scan_uncommitted: bool,
    ) -> Result<LogIterator> {
        if let Some(end) = end {
            if start > end {
                return Err(Error::InvalidRange { begin: start, end });
            }
        }
        let start = start.max(self.allocator.begin_address());
        Ok(LogIterator::new(self.clone(), start, end, None, BufferingMode::SinglePage, scan_uncommitted))
    }

    /// Opens a named iterator, resuming from its last checkpointed position
    /// (or `BeginAddress` if this name has never been checkpointed). See
    /// [`scan`](DurableLog::scan) for `scan_uncommitted`'s meaning.
    pub fn scan_named(self: &Arc<Self>, name: &str, buffering: BufferingMode, scan_uncommitted: bool) -> LogIterator {
        let start = self
            .named_iterators
            .lock()
            .get(name)
            .copied()
            .unwrap_or_else(|| self.allocator.begin_address());
        LogIterator::new(self.clone(), start, None, Some(name.to_string()), buffering, scan_uncommitted)
    }

    pub(crate) fn checkpoint_iterator(&self, name: &str, address: Address) {
        self.named_iterators.lock().insert(name.to_string(), address);
    }

    /// Reads `len` bytes starting at `addr`, transparently crossing the
    /// in-memory/on-device boundary at `HeadAddress`.
    pub(crate) fn read_at(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut cursor = addr;
        let mut written = 0usize;
        while written < len {
            let remaining = len - written;
            if cursor >= self.allocator.head_address() {
                let _guard = self.epoch.enter();
                if cursor < self.allocator.head_address() {
                    continue; // evicted between the check and the guard; retry via device path
                }
                let avail = self.allocator.resident_bytes_left_in_page(cursor).min(remaining);
                self.allocator.read_resident(cursor, &mut out[written..written + avail]);
                written += avail;
                cursor += avail as Address;
            } else {
                let n = self
                    .device
                    .read_at(cursor as u64, &mut out[written..written + remaining])
                    .map_err(Error::Io)?;
                if n < remaining {
                    return Err(Error::InvalidRange {
                        begin: cursor,
                        end: cursor + remaining as Address,
                    });
                }
                written += remaining;
                cursor += remaining as Address;
            }
        }
        Ok(out)
    }
}

/// A future that is `Pending` exactly once, waking itself immediately. Lets
/// `async` append/commit paths cooperatively yield while spinning through
/// backpressure instead of blocking the executor's thread, without pulling
/// in a runtime crate to provide a real timer or I/O-driven wakeup.
fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

struct YieldNow {
    yielded: bool,
}

impl std::future::Future for YieldNow {
    type Output = ();
    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        if self.yielded {
            std::task::Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            std::task::Poll::Pending
        }
    }
}
