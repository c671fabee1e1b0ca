//! Descriptors and the transport that executes them.
//!
//! A `Descriptor` is the unit of work sent to one block device: a start
//! sector, a direction and an ordered list of page segments that are
//! contiguous on the device. It carries its own completion callback
//! (`EndIo`), which the transport runs exactly once.

use crate::device::DeviceHandle;
use crate::error::{BlkError, Result};
use crate::page::Page;
use crate::sector::{bytes_to_sectors, Sector};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// A byte range within one page.
#[derive(Debug, Clone)]
pub struct Segment {
    pub page: Page,
    pub offset: usize,
    pub len: usize,
}

/// Outcome of one device operation: `Err(errno)` on failure.
pub type DeviceResult = std::result::Result<(), i32>;

/// Completion callback attached to a descriptor.
pub type EndIo = Box<dyn FnOnce(DeviceResult) + Send + 'static>;

pub struct Descriptor {
    pub device: DeviceHandle,
    pub start_sector: Sector,
    pub direction: Direction,
    pub segments: Vec<Segment>,
    end_io: Option<EndIo>,
}

impl Descriptor {
    /// Create an empty descriptor with room for `capacity` segments.
    ///
    /// Fails with `BlkError::Allocation` when the segment list cannot be
    /// reserved.
    pub fn try_new(
        device: DeviceHandle,
        start_sector: Sector,
        direction: Direction,
        capacity: usize,
    ) -> Result<Self> {
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(capacity)
            .map_err(|_| BlkError::Allocation)?;
        Ok(Self {
            device,
            start_sector,
            direction,
            segments,
            end_io: None,
        })
    }

    /// Append a segment. Returns `Err(Allocation)` if the list must grow
    /// and cannot.
    pub fn push_segment(&mut self, page: Page, offset: usize, len: usize) -> Result<()> {
        if self.segments.len() == self.segments.capacity() {
            self.segments
                .try_reserve(1)
                .map_err(|_| BlkError::Allocation)?;
        }
        self.segments.push(Segment { page, offset, len });
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total bytes covered by all segments.
    pub fn bytes(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Device sector immediately after the last segment.
    pub fn end_sector(&self) -> Sector {
        self.start_sector + bytes_to_sectors(self.bytes() as u64)
    }

    /// Byte offset of the first segment on the device.
    pub fn device_byte_offset(&self) -> u64 {
        crate::sector::sectors_to_bytes(self.start_sector)
    }

    pub fn set_end_io(&mut self, end_io: EndIo) {
        self.end_io = Some(end_io);
    }

    /// Run the completion callback. Consumes the descriptor.
    pub fn complete(mut self, result: DeviceResult) {
        if let Some(end_io) = self.end_io.take() {
            end_io(result);
        }
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        // A descriptor dropped without completing still owes its callback.
        if let Some(end_io) = self.end_io.take() {
            end_io(Err(libc::ECANCELED));
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("device", &self.device.id())
            .field("start_sector", &self.start_sector)
            .field("direction", &self.direction)
            .field("segments", &self.segments.len())
            .field("bytes", &self.bytes())
            .finish()
    }
}

/// Executes descriptors against their devices.
///
/// # Implementors
///
/// - `InlineTransport`: executes in the caller. Tests only; completions
///   run on the submitting thread.
/// - `ThreadedTransport` (default): fixed pool of worker threads.
/// - `UringTransport` (Linux): one ring thread, io_uring readv/writev.
///
/// **Contract:**
/// - `submit()` must not block on device I/O.
/// - Every submitted descriptor is completed exactly once, possibly on
///   another thread, possibly before `submit()` returns.
/// - A transport that cannot take the descriptor (shut down) completes it
///   with an errno instead of dropping it.
/// - No timeout or retry happens here: a descriptor whose device never
///   answers is never completed.
pub trait BlockTransport: Send + Sync {
    /// Maximum segments a single descriptor may carry.
    fn max_segments(&self) -> usize;

    /// Hand a descriptor over for execution.
    fn submit(&self, desc: Descriptor);

    /// Descriptors submitted but not yet completed.
    fn inflight(&self) -> usize;

    /// Stop accepting work. Descriptors already accepted still complete.
    fn shutdown(&self);
}
