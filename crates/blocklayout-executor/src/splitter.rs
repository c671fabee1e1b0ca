//! Request splitter.
//!
//! Walks the page array of one call in order and yields one `WorkItem`
//! per (page range, extent) pair. The extent map is consulted only when
//! the current extent is used up; every lookup bumps a sequence number
//! so the builder can tell extents apart without comparing them.
//!
//! A page that crosses an extent boundary yields two items, one per
//! extent, so the items always tile the request exactly.

use blocklayout_core::context::{CallContext, IoArgs};
use blocklayout_core::descriptor::Direction;
use blocklayout_core::device::DeviceHandle;
use blocklayout_core::error::{BlkError, MappingError, MappingKind, Result};
use blocklayout_core::extent::{Extent, ExtentMap};
use blocklayout_core::sector::{
    is_sector_aligned, page_ceil, page_floor, Sector, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
    SECTOR_SHIFT, SECTOR_SIZE,
};
use blocklayout_core::ktrace;

use std::fmt;

/// A byte range within one page of the call's page array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub page: usize,
    pub offset: usize,
    pub len: usize,
}

#[derive(Clone)]
pub enum WorkItem {
    /// Range backed by device storage.
    Data {
        span: Span,
        file_sector: Sector,
        device: DeviceHandle,
        device_sector: Sector,
        /// Lookup sequence number of the extent this range came from.
        extent_seq: u64,
    },
    /// Range to be served as zeroes (reads only).
    Hole { span: Span },
}

impl WorkItem {
    pub fn span(&self) -> Span {
        match self {
            WorkItem::Data { span, .. } | WorkItem::Hole { span } => *span,
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Data {
                span,
                file_sector,
                device,
                device_sector,
                extent_seq,
            } => f
                .debug_struct("Data")
                .field("span", span)
                .field("file_sector", file_sector)
                .field("device", &device.id())
                .field("device_sector", device_sector)
                .field("extent_seq", extent_seq)
                .finish(),
            WorkItem::Hole { span } => f.debug_struct("Hole").field("span", span).finish(),
        }
    }
}

pub struct Splitter<'a> {
    map: &'a dyn ExtentMap,
    direction: Direction,
    direct: bool,
    /// Bytes of the request not yet covered (direct reads only).
    bytes_left: u64,
    first_page: usize,
    first_offset: usize,
    page: usize,
    end_page: usize,
    /// Current page range `[offset, end)`, `None` between pages.
    current: Option<(usize, usize)>,
    sector: Sector,
    extent: Option<Extent>,
    seq: u64,
    stopped: bool,
}

impl<'a> Splitter<'a> {
    /// Splitter for a read call.
    ///
    /// Buffered reads move whole pages starting at page `page_base /
    /// PAGE_SIZE`; direct reads start at `page_base` within the array and
    /// stop after `count` bytes. Fails with `InvalidArgument` when the
    /// request does not fit the page array or is misaligned.
    pub fn read(map: &'a dyn ExtentMap, ctx: &CallContext) -> Result<Self> {
        let args = ctx.args();
        request_end(args)?;
        if !is_sector_aligned(args.offset) {
            return Err(BlkError::InvalidArgument("read offset not sector aligned"));
        }
        let first_page = (args.page_base >> PAGE_SHIFT) as usize;
        let (first_offset, npages) = if ctx.is_direct() {
            if !is_sector_aligned(args.count) || !is_sector_aligned(args.page_base) {
                return Err(BlkError::InvalidArgument("direct read not sector aligned"));
            }
            let in_page = (args.page_base & !PAGE_MASK) as usize;
            let span = in_page as u64 + args.count;
            (in_page, span.div_ceil(PAGE_SIZE as u64) as usize)
        } else {
            if args.page_base & !PAGE_MASK != 0 {
                return Err(BlkError::InvalidArgument("buffered read page base not page aligned"));
            }
            (0, args.count.div_ceil(PAGE_SIZE as u64) as usize)
        };
        Self::build(map, ctx, Direction::Read, args.offset >> SECTOR_SHIFT, first_page, first_offset, npages)
    }

    /// Splitter for a write call. Whole pages only; the offset is floored
    /// to its page.
    pub fn write(map: &'a dyn ExtentMap, ctx: &CallContext) -> Result<Self> {
        let args = ctx.args();
        let start = page_floor(args.offset);
        let end = page_ceil(request_end(args)?);
        let npages = ((end - start) >> PAGE_SHIFT) as usize;
        let first_page = (args.page_base >> PAGE_SHIFT) as usize;
        Self::build(map, ctx, Direction::Write, start >> SECTOR_SHIFT, first_page, 0, npages)
    }

    fn build(
        map: &'a dyn ExtentMap,
        ctx: &CallContext,
        direction: Direction,
        sector: Sector,
        first_page: usize,
        first_offset: usize,
        npages: usize,
    ) -> Result<Self> {
        let end_page = first_page
            .checked_add(npages)
            .filter(|&end| end <= ctx.pages().len())
            .ok_or(BlkError::InvalidArgument("request exceeds page array"))?;
        Ok(Self {
            map,
            direction,
            direct: direction == Direction::Read && ctx.is_direct(),
            bytes_left: ctx.args().count,
            first_page,
            first_offset,
            page: first_page,
            end_page,
            current: None,
            sector,
            extent: None,
            seq: 0,
            stopped: false,
        })
    }

    /// File sector after the last range yielded.
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Pages not yet fully consumed, including the current one.
    pub fn pages_left(&self) -> usize {
        self.end_page - self.page
    }

    /// Extent lookups performed so far.
    pub fn lookups(&self) -> u64 {
        self.seq
    }

    /// Range of the next page, or `None` when the request is covered.
    fn next_page(&mut self) -> Option<(usize, usize)> {
        if self.page >= self.end_page {
            return None;
        }
        if !self.direct {
            return Some((0, PAGE_SIZE));
        }
        if self.bytes_left == 0 {
            return None;
        }
        let offset = if self.page == self.first_page { self.first_offset } else { 0 };
        let len = ((PAGE_SIZE - offset) as u64).min(self.bytes_left) as usize;
        self.bytes_left -= len as u64;
        Some((offset, offset + len))
    }

    fn fail(&mut self, kind: MappingKind) -> Option<Result<WorkItem>> {
        self.stopped = true;
        Some(Err(BlkError::Mapping(MappingError {
            sector: self.sector,
            direction: self.direction,
            kind,
        })))
    }
}

/// End byte of the request. Must leave room to round up to a page.
fn request_end(args: IoArgs) -> Result<u64> {
    args.offset
        .checked_add(args.count)
        .filter(|end| end.checked_add(PAGE_SIZE as u64 - 1).is_some())
        .ok_or(BlkError::InvalidArgument("request range overflows"))
}

impl Iterator for Splitter<'_> {
    type Item = Result<WorkItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        let (offset, end) = match self.current {
            Some(range) => range,
            None => {
                let range = self.next_page()?;
                self.current = Some(range);
                range
            }
        };

        let exhausted = self
            .extent
            .as_ref()
            .map_or(true, |e| e.remaining_from(self.sector) == 0);
        if exhausted {
            let for_write = self.direction == Direction::Write;
            let found = self.map.lookup(self.sector, for_write);
            self.seq += 1;
            match found {
                Some(e) if e.contains(self.sector) => {
                    if for_write && e.is_hole() {
                        return self.fail(MappingKind::UnbackedWrite);
                    }
                    ktrace!(
                        "split {} sector={} extent=[{}, +{}) {:?}",
                        self.direction,
                        self.sector,
                        e.file_offset,
                        e.length,
                        e.state
                    );
                    self.extent = Some(e);
                }
                _ => return self.fail(MappingKind::NotMapped),
            }
        }
        let extent = self.extent.as_ref()?;

        let avail = extent
            .remaining_from(self.sector)
            .saturating_mul(SECTOR_SIZE as u64);
        let len = ((end - offset) as u64).min(avail) as usize;
        let span = Span {
            page: self.page,
            offset,
            len,
        };
        let item = if extent.is_hole() {
            WorkItem::Hole { span }
        } else {
            WorkItem::Data {
                span,
                file_sector: self.sector,
                device: extent.device.clone(),
                device_sector: extent.device_sector(self.sector),
                extent_seq: self.seq,
            }
        };

        self.sector += (len >> SECTOR_SHIFT) as Sector;
        if offset + len == end {
            self.current = None;
            self.page += 1;
        } else {
            self.current = Some((offset + len, end));
        }
        Some(Ok(item))
    }
}
