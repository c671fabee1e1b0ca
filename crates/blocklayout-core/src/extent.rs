//! Extents and the extent map.
//!
//! An extent maps a run of file sectors onto a run of sectors of one
//! device. Extents of one layout never overlap and are ordered by file
//! offset.

use crate::device::DeviceHandle;
use crate::sector::Sector;

/// Allocation state of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// Backed by written storage.
    Data,
    /// No backing storage; reads return zeroes.
    Hole,
    /// Allocated but not yet written. Treated as data when the extent's
    /// tag is non-zero, as a hole otherwise.
    TaggedInvalid,
}

/// A contiguous run of file sectors backed by one device region.
#[derive(Clone)]
pub struct Extent {
    pub file_offset: Sector,
    pub length: Sector,
    pub device_offset: Sector,
    pub state: ExtentState,
    pub tag: u32,
    pub device: DeviceHandle,
}

impl Extent {
    pub fn new(
        file_offset: Sector,
        length: Sector,
        device_offset: Sector,
        state: ExtentState,
        device: DeviceHandle,
    ) -> Self {
        Self {
            file_offset,
            length,
            device_offset,
            state,
            tag: 0,
            device,
        }
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }

    /// One past the last file sector covered.
    #[inline]
    pub fn file_end(&self) -> Sector {
        self.file_offset + self.length
    }

    #[inline]
    pub fn contains(&self, sector: Sector) -> bool {
        sector >= self.file_offset && sector < self.file_end()
    }

    /// Sectors left in this extent from `sector` on (0 if outside).
    #[inline]
    pub fn remaining_from(&self, sector: Sector) -> Sector {
        if self.contains(sector) {
            self.file_end() - sector
        } else {
            0
        }
    }

    /// Device sector backing file sector `sector`.
    #[inline]
    pub fn device_sector(&self, sector: Sector) -> Sector {
        sector - self.file_offset + self.device_offset
    }

    /// Whether reads of this extent must be served as zeroes.
    ///
    /// Two encodings mean "hole": the explicit `Hole` state, and an
    /// untagged `TaggedInvalid` extent. They are checked separately.
    pub fn is_hole(&self) -> bool {
        match self.state {
            ExtentState::Hole => true,
            ExtentState::TaggedInvalid => self.tag == 0,
            ExtentState::Data => false,
        }
    }
}

impl std::fmt::Debug for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extent")
            .field("file_offset", &self.file_offset)
            .field("length", &self.length)
            .field("device_offset", &self.device_offset)
            .field("state", &self.state)
            .field("tag", &self.tag)
            .field("device", &self.device.id())
            .finish()
    }
}

/// The client-held map from file sectors to extents.
///
/// **Contract:**
/// - `lookup` is called concurrently from many calls and must not block
///   for long.
/// - `mark_written` is called at most once per successful write call,
///   after every device operation of that call has completed.
pub trait ExtentMap: Send + Sync {
    /// Find the extent covering `sector`. `None` means not mapped.
    fn lookup(&self, sector: Sector, for_write: bool) -> Option<Extent>;

    /// Record that `[start, start + length)` now holds written data.
    fn mark_written(&self, start: Sector, length: Sector);

    /// Remember the last byte written by a completed write, for a later
    /// layout commit. Default: ignored.
    fn record_last_write_byte(&self, _lwb: u64) {}
}
