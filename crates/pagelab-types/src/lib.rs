#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default page size used when the platform does not report one.
pub const FALLBACK_PAGE_SIZE: u32 = 4096;

/// Page number in a backing file: page N covers bytes `[N*P, (N+1)*P)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageNumber(pub u64);

/// Byte offset into a backing file.
///
/// This is a unit-carrying wrapper to prevent mixing bytes and pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl std::fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid page size {value}: must be a power of two in 512..=65536")]
pub struct InvalidPageSize {
    pub value: u32,
}

/// Validated page size (power of two in 512..=65536).
///
/// Fixed for the lifetime of a handle; page-aligned I/O and buffer alignment
/// both derive from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageSize(u32);

impl PageSize {
    /// Create a `PageSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, InvalidPageSize> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(InvalidPageSize { value });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Number of bits to shift to convert between bytes and pages.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset to the page number containing it (truncating).
    #[must_use]
    pub fn byte_to_page(self, byte_offset: u64) -> PageNumber {
        PageNumber(byte_offset >> u64::from(self.shift()))
    }

    /// Convert a page number to its starting byte offset.
    #[must_use]
    pub fn page_to_byte(self, page: PageNumber) -> Option<ByteOffset> {
        page.0.checked_mul(self.as_u64()).map(ByteOffset)
    }

    /// Offset of `byte_offset` within its page.
    #[must_use]
    pub fn offset_in_page(self, byte_offset: u64) -> usize {
        (byte_offset & (self.as_u64() - 1)) as usize
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self(FALLBACK_PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_rejects_non_power_of_two() {
        assert!(PageSize::new(4095).is_err());
        assert!(PageSize::new(0).is_err());
        assert!(PageSize::new(256).is_err());
        assert!(PageSize::new(131_072).is_err());
    }

    #[test]
    fn page_size_accepts_common_sizes() {
        for size in [512_u32, 4096, 16384, 65536] {
            assert_eq!(PageSize::new(size).unwrap().get(), size);
        }
    }

    #[test]
    fn byte_page_conversions() {
        let ps = PageSize::new(4096).unwrap();
        assert_eq!(ps.byte_to_page(0), PageNumber(0));
        assert_eq!(ps.byte_to_page(4095), PageNumber(0));
        assert_eq!(ps.byte_to_page(4096), PageNumber(1));
        assert_eq!(ps.page_to_byte(PageNumber(3)), Some(ByteOffset(12288)));
        assert_eq!(ps.offset_in_page(4100), 4);
        assert_eq!(ps.page_to_byte(PageNumber(u64::MAX)), None);
    }

    #[test]
    fn byte_offset_checked_add() {
        assert_eq!(ByteOffset(1).checked_add(2), Some(ByteOffset(3)));
        assert_eq!(ByteOffset(u64::MAX).checked_add(1), None);
    }
}
