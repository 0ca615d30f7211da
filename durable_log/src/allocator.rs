//! The paged ring allocator: the CAS-based tail advance, the page-turn
//! stall/resume protocol, and the background flush pipeline that drains
//! pages to the device and ratchets `FlushedUntilAddress` forward.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use epoch_guard::EpochProtector;
use log_device::BlockDevice;

use crate::address::{page_number, page_start, Address, FIRST_VALID_ADDRESS};
use crate::error::{Error, Result};
use crate::page::{Page, PageState};
use crate::settings::LogSettings;

/// A reservation that could not complete immediately because its target
/// page was still flushing or read-only. Opaque to callers; fed back into
/// [`PagedAllocator::check_allocate_complete`] to retry.
#[derive(Debug, Clone, Copy)]
pub struct PendingAllocation {
    pub(crate) page_start: Address,
    pub(crate) size: usize,
}

/// The outcome of a single allocation attempt.
#[derive(Debug)]
pub enum AllocationResult {
    /// `size` bytes were reserved starting at this address.
    Ready(Address),
    /// Could not complete yet; retry with [`PagedAllocator::check_allocate_complete`].
    Pending(PendingAllocation),
    /// The reservation expired before it could complete (its target page
    /// cycled all the way through to eviction and reuse). The caller must
    /// discard it and call [`PagedAllocator::try_allocate`] again from
    /// scratch.
    Restart,
}

/// Invoked with the new `FlushedUntilAddress` every time a contiguous run
/// of pages finishes flushing.
pub type CommitCallback = Box<dyn Fn(Address) + Send + Sync>;

pub struct PagedAllocator {
    settings: LogSettings,
    pages: Vec<Page>,
    device: Arc<dyn BlockDevice>,
    epoch: Arc<EpochProtector>,

    begin: AtomicI64,
    head: AtomicI64,
    read_only: AtomicI64,
    flushed_until: AtomicI64,
    tail: AtomicI64,

    on_flushed: Mutex<Option<CommitCallback>>,
}

impl PagedAllocator {
    pub fn new(settings: LogSettings, device: Arc<dyn BlockDevice>, epoch: Arc<EpochProtector>) -> Self {
        let ring_pages = settings.ring_pages();
        let page_size = settings.page_size();
        let pages = (0..ring_pages).map(|_| Page::new(page_size)).collect();
        // `head`/`read_only`/`flushed_until` track residency and are always
        // page-aligned; the very first page (covering address 0 up to
        // `FIRST_VALID_ADDRESS` and beyond) is resident from the start, so
        // they start at that page's base rather than at the first valid
        // record address itself.
        let first_page_base = page_start(FIRST_VALID_ADDRESS, settings.page_size_bits);
        let allocator = PagedAllocator {
            settings,
            pages,
            device,
            epoch,
            begin: AtomicI64::new(FIRST_VALID_ADDRESS),
            head: AtomicI64::new(first_page_base),
            read_only: AtomicI64::new(first_page_base),
            flushed_until: AtomicI64::new(first_page_base),
            tail: AtomicI64::new(FIRST_VALID_ADDRESS),
            on_flushed: Mutex::new(None),
        };
        allocator.activate_page_for(FIRST_VALID_ADDRESS);
        allocator
    }

    /// Rebuilds the allocator's boundaries after a restart, given the
    /// address that was durably committed last time.
    pub fn restore(
        settings: LogSettings,
        device: Arc<dyn BlockDevice>,
        epoch: Arc<EpochProtector>,
        committed_until: Address,
        begin_address: Address,
    ) -> Self {
        let ring_pages = settings.ring_pages();
        let page_size = settings.page_size();
        let pages = (0..ring_pages).map(|_| Page::new(page_size)).collect();
        let allocator = PagedAllocator {
            settings,
            pages,
            device,
            epoch,
            begin: AtomicI64::new(begin_address),
            head: AtomicI64::new(committed_until),
            read_only: AtomicI64::new(committed_until),
            flushed_until: AtomicI64::new(committed_until),
            tail: AtomicI64::new(committed_until),
            on_flushed: Mutex::new(None),
        };
        allocator.activate_page_for(committed_until);
        allocator
    }

    pub fn set_on_flushed(&self, callback: CommitCallback) {
        *self.on_flushed.lock() = Some(callback);
    }

    pub fn begin_address(&self) -> Address {
        self.begin.load(Ordering::Acquire)
    }
    pub fn head_address(&self) -> Address {
        self.head.load(Ordering::Acquire)
    }
    pub fn read_only_address(&self) -> Address {
        self.read_only.load(Ordering::Acquire)
    }
    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until.load(Ordering::Acquire)
    }
    pub fn tail_address(&self) -> Address {
        self.tail.load(Ordering::Acquire)
    }

    fn page_size_bits(&self) -> u8 {
        self.settings.page_size_bits
    }

    fn page_index(&self, addr: Address) -> usize {
        (page_number(addr, self.page_size_bits()) as usize) % self.pages.len()
    }

    /// Activates whichever page currently contains `addr`, at that page's
    /// own aligned start address (not necessarily `addr` itself — on first
    /// open `addr` is [`FIRST_VALID_ADDRESS`], which sits inside page 0
    /// rather than at its start).
    fn activate_page_for(&self, addr: Address) {
        let base = page_start(addr, self.page_size_bits());
        let idx = self.page_index(base);
        self.pages[idx].activate(base);
    }

    /// Attempts to reserve `size` bytes for a single record. Never returns
    /// `Ready` for a `size` that can't fit in one page.
    pub fn try_allocate(&self, size: usize) -> Result<AllocationResult> {
        let page_size = self.settings.page_size();
        if size > page_size {
            return Err(Error::Config(format!(
                "record of {size} bytes exceeds page size {page_size}"
            )));
        }

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let bits = self.page_size_bits();
            let start_of_tail_page = page_start(tail, bits);
            let offset = (tail - start_of_tail_page) as usize;
            let tail_page = &self.pages[self.page_index(start_of_tail_page)];
            let tail_page_is_mutable =
                tail_page.base_address() == start_of_tail_page && tail_page.state() == PageState::Mutable;

            if tail_page_is_mutable && offset + size <= page_size {
                let new_tail = tail + size as Address;
                if self
                    .tail
                    .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(AllocationResult::Ready(tail));
                }
                continue;
            }

            // The record doesn't fit in the remainder of the current page;
            // the remainder is wasted and we move to the next page boundary.
            let next_page_start = start_of_tail_page + page_size as Address;
            let idx = self.page_index(next_page_start);

            match self.pages[idx].state() {
                PageState::Mutable if self.pages[idx].base_address() == next_page_start => {
                    // Someone already turned this page; just move the tail
                    // onto it and retry the fitting branch above.
                    let _ = self.tail.compare_exchange(
                        tail,
                        next_page_start,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    continue;
                }
                PageState::Uninitialized | PageState::Evictable => {
                    if self
                        .tail
                        .compare_exchange(tail, next_page_start, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.pages[idx].activate(next_page_start);
                        trace!("activated page at {next_page_start} (ring slot {idx})");
                    }
                    continue;
                }
                PageState::Flushing | PageState::ReadOnly | PageState::Flushed | PageState::Mutable => {
                    // `Flushed` still needs the epoch protector to confirm no
                    // reader is mid-flight against this slot's current
                    // contents before it's safe to zero and reuse; try an
                    // opportunistic drain so a quiescent slot doesn't force a
                    // needless round trip through `Pending`.
                    self.epoch.drain();
                    if self.pages[idx].state() == PageState::Evictable {
                        continue;
                    }
                    return Ok(AllocationResult::Pending(PendingAllocation {
                        page_start: next_page_start,
                        size,
                    }));
                }
            }
        }
    }

    /// Retries a [`PendingAllocation`] previously returned by `try_allocate`.
    pub fn check_allocate_complete(&self, pending: PendingAllocation) -> Result<AllocationResult> {
        let idx = self.page_index(pending.page_start);
        if self.pages[idx].base_address() != pending.page_start {
            // The ring slot moved on to a later generation while we waited.
            return Ok(AllocationResult::Restart);
        }
        match self.pages[idx].state() {
            PageState::Flushing | PageState::ReadOnly => Ok(AllocationResult::Pending(pending)),
            PageState::Flushed => {
                self.epoch.drain();
                if self.pages[idx].state() == PageState::Evictable {
                    self.try_allocate(pending.size)
                } else {
                    Ok(AllocationResult::Pending(pending))
                }
            }
            PageState::Uninitialized | PageState::Evictable | PageState::Mutable => {
                self.try_allocate(pending.size)
            }
        }
    }

    /// Writes `payload` (already framed by [`crate::record`]) at `addr`.
    ///
    /// # Safety
    /// `addr` must have been returned by a `Ready` allocation for exactly
    /// this many bytes.
    pub unsafe fn write(&self, addr: Address, framed: &[u8]) {
        let idx = self.page_index(addr);
        let page = &self.pages[idx];
        let offset = (addr - page.base_address()) as usize;
        page.write_at(offset, framed);
    }

    /// Reads `len` resident bytes starting at `addr` into `out`. The caller
    /// must hold an epoch guard and must have already checked
    /// `addr >= head_address()`.
    pub fn read_resident(&self, addr: Address, out: &mut [u8]) {
        let idx = self.page_index(addr);
        let page = &self.pages[idx];
        let offset = (addr - page.base_address()) as usize;
        page.read_at(offset, out);
    }

    pub fn resident_bytes_left_in_page(&self, addr: Address) -> usize {
        let bits = self.page_size_bits();
        let start = page_start(addr, bits);
        (start + self.settings.page_size() as Address - addr) as usize
    }

    /// Rolls every `Mutable` page below the current tail to `ReadOnly` and
    /// spawns a flush for each. Called either when the mutable region grows
    /// past `mutable_fraction` of the ring, or on an explicit commit.
    pub fn shift_read_only_to_tail(self: &Arc<Self>) {
        let tail = self.tail.load(Ordering::Acquire);
        let read_only = self.read_only.load(Ordering::Acquire);
        if tail == read_only {
            return;
        }
        let bits = self.page_size_bits();
        let mut page_addr = page_start(read_only, bits);
        while page_addr < tail {
            let idx = self.page_index(page_addr);
            let page = &self.pages[idx];
            if page.base_address() == page_addr && page.compare_and_set_state(PageState::Mutable, PageState::ReadOnly) {
                self.spawn_flush(page_addr);
            }
            page_addr += self.settings.page_size() as Address;
        }
        self.read_only.store(tail, Ordering::Release);
        debug!("read-only boundary advanced to {tail}");
    }

    pub fn maybe_auto_shift(self: &Arc<Self>) {
        let tail = self.tail.load(Ordering::Acquire);
        let read_only = self.read_only.load(Ordering::Acquire);
        let mutable_bytes = (tail - read_only) as f64;
        let capacity = (self.pages.len() * self.settings.page_size()) as f64;
        if mutable_bytes > capacity * self.settings.mutable_fraction {
            self.shift_read_only_to_tail();
        }
    }

    fn spawn_flush(self: &Arc<Self>, page_addr: Address) {
        let idx = self.page_index(page_addr);
        self.pages[idx].set_state(PageState::Flushing);
        let allocator = Arc::clone(self);
        std::thread::spawn(move || {
            let snapshot = allocator.pages[idx].snapshot();
            match allocator.device.write_at(page_addr as u64, &snapshot) {
                Ok(()) => {
                    allocator.pages[idx].set_state(PageState::Flushed);
                    allocator.advance_flushed_until();
                }
                Err(e) => {
                    warn!("flush of page at {page_addr} failed: {e}");
                    // Leave the page ReadOnly; a later retry path (not
                    // modeled here) would re-attempt the write. The log
                    // simply stops making commit progress past this point
                    // until the device recovers.
                    allocator.pages[idx].set_state(PageState::ReadOnly);
                }
            }
        });
    }

    /// Advances `FlushedUntilAddress` over any contiguous run of `Flushed`
    /// pages starting at the current boundary, then evicts them (via the
    /// epoch protector, so no in-flight reader is holding a reference) and
    /// notifies the commit callback.
    fn advance_flushed_until(self: &Arc<Self>) {
        let bits = self.page_size_bits();
        loop {
            let current = self.flushed_until.load(Ordering::Acquire);
            let page_addr = page_start(current, bits);
            let idx = self.page_index(page_addr);
            let page = &self.pages[idx];
            if page.base_address() != page_addr || page.state() != PageState::Flushed {
                break;
            }
            let next = page_addr + self.settings.page_size() as Address;
            if self
                .flushed_until
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            self.evict_page(idx, page_addr, next);
        }
        let flushed = self.flushed_until.load(Ordering::Acquire);
        if let Some(cb) = self.on_flushed.lock().as_ref() {
            cb(flushed);
        }
    }

    fn evict_page(self: &Arc<Self>, idx: usize, page_addr: Address, new_head: Address) {
        let allocator = Arc::clone(self);
        allocator.epoch.defer(move || {
            allocator.pages[idx].set_state(PageState::Evictable);
        });
        self.head.store(new_head, Ordering::Release);
        self.epoch.drain(); // opportunistic: runs the above immediately if nobody is protecting
        trace!("page at {page_addr} evicted, head now {new_head}");
    }

    /// Advances `BeginAddress`, the point before which the log promises
    /// nothing is retained (neither in memory nor, logically, on device).
    /// Does not physically erase device bytes; a compacting device
    /// implementation is free to reclaim segments entirely below this
    /// address.
    ///
    /// Staged as a deferred action, like a page's reclaim, rather than
    /// applied inline: the caller is expected to hold its own epoch guard
    /// around this call (see `DurableLog::truncate_until`) so a reader that
    /// is mid-scan below `new_begin` isn't cut off by the same call that's
    /// still protecting it.
    pub fn shift_begin_address(self: &Arc<Self>, new_begin: Address) {
        let allocator = Arc::clone(self);
        self.epoch.defer(move || {
            let mut current = allocator.begin.load(Ordering::Acquire);
            while new_begin > current {
                match allocator.begin.compare_exchange_weak(current, new_begin, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        });
    }
}
