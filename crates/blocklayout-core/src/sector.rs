//! Sector and page geometry.
//!
//! All extent arithmetic is done in 512-byte sectors; page buffers are
//! 4 KiB. Extents are expected to be page aligned, but nothing here
//! depends on it.

/// A 512-byte sector number or sector count.
pub type Sector = u64;

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !((PAGE_SIZE as u64) - 1);

/// Sectors per page.
pub const PAGE_SECTORS: Sector = (PAGE_SIZE >> SECTOR_SHIFT) as Sector;

#[inline]
pub const fn bytes_to_sectors(bytes: u64) -> Sector {
    bytes >> SECTOR_SHIFT
}

#[inline]
pub const fn sectors_to_bytes(sectors: Sector) -> u64 {
    sectors << SECTOR_SHIFT
}

#[inline]
pub const fn is_sector_aligned(bytes: u64) -> bool {
    bytes & (SECTOR_SIZE as u64 - 1) == 0
}

/// Round a byte offset down to its page start.
#[inline]
pub const fn page_floor(bytes: u64) -> u64 {
    bytes & PAGE_MASK
}

/// Round a byte offset up to the next page boundary.
#[inline]
pub const fn page_ceil(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE as u64 - 1) & PAGE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(SECTOR_SIZE, 512);
        assert_eq!(PAGE_SIZE, 4096);
        assert_eq!(PAGE_SECTORS, 8);
    }

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_floor(0), 0);
        assert_eq!(page_floor(4095), 0);
        assert_eq!(page_floor(4096), 4096);
        assert_eq!(page_ceil(1), 4096);
        assert_eq!(page_ceil(4096), 4096);
        assert_eq!(page_ceil(8193), 12288);
    }

    #[test]
    fn test_sector_conversion() {
        assert_eq!(bytes_to_sectors(4096), 8);
        assert_eq!(sectors_to_bytes(3), 1536);
        assert!(is_sector_aligned(1024));
        assert!(!is_sector_aligned(1000));
    }
}
