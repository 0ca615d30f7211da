//! The in-memory ring of pages backing the allocator.
//!
//! Each physical slot cycles through the same state machine the source's
//! page descriptors follow, renamed to read as ordinary English rather than
//! the source's `Closed`/`ReadOnly`/`Flushed` bit-flags-on-an-int. Writers
//! within a `Mutable` page reach into it through an `unsafe` raw write,
//! exactly the pattern `other_examples`' `photondb` write-buffer uses: the
//! allocator hands out disjoint, CAS-reserved byte ranges, so concurrent
//! writers to the same page never race, and the `unsafe` block is just
//! documenting that invariant to the compiler.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use crate::address::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Never assigned a logical address; free for immediate reuse.
    Uninitialized,
    /// Assigned to `base_address`; appenders may write into it.
    Mutable,
    /// No longer accepting new writes; still resident, readable by scans.
    ReadOnly,
    /// A flush to the device is in flight.
    Flushing,
    /// Durably persisted; still resident until the epoch-protected
    /// boundary shift reclaims it.
    Flushed,
    /// Reclaimed; free for reuse by a later, larger-address page.
    Evictable,
}

impl From<u8> for PageState {
    fn from(v: u8) -> Self {
        match v {
            0 => PageState::Uninitialized,
            1 => PageState::Mutable,
            2 => PageState::ReadOnly,
            3 => PageState::Flushing,
            4 => PageState::Flushed,
            5 => PageState::Evictable,
            _ => unreachable!("invalid page state tag {v}"),
        }
    }
}

impl From<PageState> for u8 {
    fn from(s: PageState) -> u8 {
        match s {
            PageState::Uninitialized => 0,
            PageState::Mutable => 1,
            PageState::ReadOnly => 2,
            PageState::Flushing => 3,
            PageState::Flushed => 4,
            PageState::Evictable => 5,
        }
    }
}

/// One physical ring slot.
pub struct Page {
    buffer: UnsafeCell<Box<[u8]>>,
    state: AtomicU8,
    /// Logical address of byte 0 of this slot's current tenant, or `-1` if
    /// the slot has never been assigned.
    base_address: AtomicI64,
}

// SAFETY: all writes through `buffer` go through disjoint, CAS-reserved
// ranges established by the allocator before any pointer is formed; reads
// through `buffer` only ever touch ranges a writer has already finished and
// that `state`/`base_address` (both synchronized atomics) show as settled.
unsafe impl Sync for Page {}

impl Page {
    pub fn new(page_size: usize) -> Self {
        Page {
            buffer: UnsafeCell::new(vec![0u8; page_size].into_boxed_slice()),
            state: AtomicU8::new(PageState::Uninitialized.into()),
            base_address: AtomicI64::new(-1),
        }
    }

    pub fn state(&self) -> PageState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn set_state(&self, state: PageState) {
        self.state.store(state.into(), Ordering::Release);
    }

    pub fn compare_and_set_state(&self, current: PageState, new: PageState) -> bool {
        self.state
            .compare_exchange(current.into(), new.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn base_address(&self) -> Address {
        self.base_address.load(Ordering::Acquire)
    }

    /// Reinitializes this slot as the `Mutable` page starting at
    /// `base_address`, zeroing its contents so stale bytes from a previous
    /// tenant never get misread as a record.
    pub fn activate(&self, base_address: Address) {
        // SAFETY: only called once the allocator has observed this slot as
        // `Uninitialized` or `Evictable`, meaning no reader or writer holds
        // a reference into its old contents.
        unsafe {
            (*self.buffer.get()).fill(0);
        }
        self.base_address.store(base_address, Ordering::Release);
        self.set_state(PageState::Mutable);
    }

    /// Writes `data` at byte `offset` within this page.
    ///
    /// # Safety
    /// The caller must ensure `offset..offset + data.len()` was reserved
    /// exclusively for this write by the allocator's tail CAS, and lies
    /// within the page.
    pub unsafe fn write_at(&self, offset: usize, data: &[u8]) {
        let ptr = (*self.buffer.get()).as_mut_ptr();
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
    }

    /// Copies the whole page out as an owned buffer, for a flush thread to
    /// hand to the device without holding a reference back into the ring.
    pub fn snapshot(&self) -> Box<[u8]> {
        // SAFETY: by the time a page is rolled to `ReadOnly` (a precondition
        // for flushing it), no writer is still targeting it; the allocator
        // never hands out offsets into a page once it leaves `Mutable`.
        unsafe { (*self.buffer.get()).clone() }
    }

    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        // SAFETY: callers only read ranges already durably written and
        // reported back to an earlier append, and reachable only while the
        // epoch guard protecting this page is still held.
        let buf = unsafe { &*self.buffer.get() };
        out.copy_from_slice(&buf[offset..offset + out.len()]);
    }

    pub fn len(&self) -> usize {
        // SAFETY: length is immutable for the page's lifetime.
        unsafe { (*self.buffer.get()).len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_resets_state_and_zeroes_buffer() {
        let page = Page::new(16);
        unsafe { page.write_at(0, b"junkjunk") };
        page.activate(1024);
        assert_eq!(page.state(), PageState::Mutable);
        assert_eq!(page.base_address(), 1024);
        let mut out = [0xffu8; 8];
        page.read_at(0, &mut out);
        assert_eq!(out, [0u8; 8]);
    }

    #[test]
    fn compare_and_set_state_is_exclusive() {
        let page = Page::new(16);
        assert!(page.compare_and_set_state(PageState::Uninitialized, PageState::Mutable));
        assert!(!page.compare_and_set_state(PageState::Uninitialized, PageState::ReadOnly));
        assert_eq!(page.state(), PageState::Mutable);
    }
}
