//! The scan iterator: a positional cursor over committed (optionally
//! uncommitted) records, reading from the in-memory ring while it can and
//! falling back to the device below `HeadAddress`.

use std::sync::Arc;

use crate::address::Address;
use crate::durable_log::DurableLog;
use crate::error::{Error, Result};
use crate::record;

/// Controls how eagerly a [`LogIterator`] pulls pages ahead of the record
/// it's currently returning. `NoBuffering` re-reads from the device (or the
/// ring) on every record; the buffered modes copy a whole page at a time so
/// a sequential scan doesn't pay a syscall per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    NoBuffering,
    SinglePage,
    DoublePage,
}

/// A positional cursor over the log. Cheap to create; holds only the next
/// address to read and an optional name under which its position is
/// checkpointed across commits.
pub struct LogIterator {
    log: Arc<DurableLog>,
    next_address: Address,
    end_address: Option<Address>,
    name: Option<String>,
    buffering: BufferingMode,
    scan_uncommitted: bool,
    page_cache: Vec<u8>,
    page_cache_base: Option<Address>,
}

impl LogIterator {
    pub(crate) fn new(
        log: Arc<DurableLog>,
        start: Address,
        end: Option<Address>,
        name: Option<String>,
        buffering: BufferingMode,
        scan_uncommitted: bool,
    ) -> Self {
        LogIterator {
            log,
            next_address: start,
            end_address: end,
            name,
            buffering,
            scan_uncommitted,
            page_cache: Vec::new(),
            page_cache_base: None,
        }
    }

    /// The address the next call to [`next`](LogIterator::next) will read
    /// from.
    pub fn current_address(&self) -> Address {
        self.next_address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the next record's payload, or `None` if the iterator has
    /// reached its end bound (for a bounded scan) or the currently visible
    /// tail (for an unbounded one that isn't tailing uncommitted writes).
    ///
    /// Blocks the calling thread (spin/yield, matching the log's other
    /// synchronous entry points) if the next record exists but the page
    /// holding it hasn't finished arriving from the device yet.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let visible_until = self.visible_until();
            if self.next_address >= visible_until {
                return Ok(None);
            }
            if let Some(end) = self.end_address {
                if self.next_address >= end {
                    return Ok(None);
                }
            }

            let header = self.read_range(self.next_address, record::HEADER_LEN)?;
            let len = u32::from_le_bytes(header.try_into().unwrap()) as usize;
            if len == 0 {
                // Remainder of the page is unwritten padding; skip to the
                // next page boundary and try again.
                let bits = self.log.settings().page_size_bits;
                let page_size = 1i64 << bits;
                self.next_address = ((self.next_address / page_size) + 1) * page_size;
                continue;
            }
            let total = record::record_size(len);
            let framed = self.read_range(self.next_address, total)?;
            let decoded = record::decode(&framed).ok_or_else(|| {
                Error::InvalidRange {
                    begin: self.next_address,
                    end: self.next_address + total as Address,
                }
            })?;
            let payload = decoded.payload.to_vec();
            self.next_address += total as Address;
            return Ok(Some(payload));
        }
    }

    fn visible_until(&self) -> Address {
        if self.scan_uncommitted {
            self.log.tail_address()
        } else {
            self.log.committed_until_address()
        }
    }

    fn read_range(&mut self, addr: Address, len: usize) -> Result<Vec<u8>> {
        match self.buffering {
            BufferingMode::NoBuffering => self.log.read_at(addr, len),
            BufferingMode::SinglePage | BufferingMode::DoublePage => self.read_buffered(addr, len),
        }
    }

    fn read_buffered(&mut self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let bits = self.log.settings().page_size_bits;
        let page_size = 1usize << bits;
        let page_base = (addr as u64 & !((page_size as u64) - 1)) as Address;
        let offset = (addr - page_base) as usize;

        if self.page_cache_base != Some(page_base) || offset + len > self.page_cache.len() {
            self.page_cache = self.log.read_at(page_base, page_size)?;
            self.page_cache_base = Some(page_base);
        }
        Ok(self.page_cache[offset..offset + len].to_vec())
    }

    /// Checkpoints this iterator's current position under its name so it
    /// resumes from here after a restart. A no-op for unnamed iterators.
    pub fn checkpoint(&self) {
        if let Some(name) = &self.name {
            self.log.checkpoint_iterator(name, self.next_address);
        }
    }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end in `durable_log/tests/scenarios.rs`; the address
    // bookkeeping here is trivial enough that unit tests would just
    // re-verify `record::decode`.
}
