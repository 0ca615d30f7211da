//! Log configuration, validated once up front at [`crate::DurableLog::open`]
//! the way the teacher's driver crates validate a device geometry before
//! handing it to an allocator.

use crate::error::{Error, Result};

/// Tunables for a [`crate::DurableLog`]. All sizes are in bytes unless noted
/// otherwise.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// `log2` of the page size. Every page is `1 << page_size_bits` bytes.
    pub page_size_bits: u8,
    /// `log2` of the in-memory ring's total capacity. Must be strictly
    /// greater than `page_size_bits`; the ring holds
    /// `1 << (memory_size_bits - page_size_bits)` pages.
    pub memory_size_bits: u8,
    /// `log2` of the on-device segment size, handed to the configured
    /// [`log_device::BlockDevice`] as its segment granularity.
    pub segment_size_bits: u8,
    /// Fraction of the ring, in `(0.0, 1.0]`, kept mutable (appendable)
    /// before the allocator proactively rolls pages to read-only and
    /// schedules them for flush.
    pub mutable_fraction: f64,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            page_size_bits: 22,   // 4 MiB pages
            memory_size_bits: 25, // 32 MiB resident, 8 pages
            segment_size_bits: 30,
            mutable_fraction: 0.9,
        }
    }
}

impl LogSettings {
    /// Number of pages held in the in-memory ring.
    pub fn ring_pages(&self) -> usize {
        1usize << (self.memory_size_bits - self.page_size_bits)
    }

    /// Size in bytes of one page.
    pub fn page_size(&self) -> usize {
        1usize << self.page_size_bits
    }

    /// Size in bytes of one on-device segment.
    pub fn segment_size(&self) -> u64 {
        1u64 << self.segment_size_bits
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_size_bits <= self.page_size_bits {
            return Err(Error::Config(format!(
                "memory_size_bits ({}) must be greater than page_size_bits ({})",
                self.memory_size_bits, self.page_size_bits
            )));
        }
        if self.ring_pages() < 2 {
            return Err(Error::Config(
                "the in-memory ring must hold at least 2 pages".to_string(),
            ));
        }
        if self.segment_size_bits < self.page_size_bits {
            return Err(Error::Config(format!(
                "segment_size_bits ({}) must be at least page_size_bits ({})",
                self.segment_size_bits, self.page_size_bits
            )));
        }
        if !(self.mutable_fraction > 0.0 && self.mutable_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "mutable_fraction ({}) must be in (0.0, 1.0]",
                self.mutable_fraction
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        LogSettings::default().validate().unwrap();
    }

    #[test]
    fn rejects_ring_smaller_than_one_page() {
        let settings = LogSettings {
            page_size_bits: 12,
            memory_size_bits: 12,
            ..LogSettings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_mutable_fraction() {
        let settings = LogSettings {
            mutable_fraction: 0.0,
            ..LogSettings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }
}
