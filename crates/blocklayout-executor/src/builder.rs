//! Descriptor builder.
//!
//! Accumulates consecutive data ranges into one open descriptor and
//! submits it when it can grow no further. The open descriptor is closed
//! when:
//!
//! - the next range comes from a different extent lookup,
//! - the next range is not device-contiguous or lives on another device,
//! - a hole is met,
//! - it holds `limit` segments.
//!
//! Each submission takes one coordinator reference and attaches the
//! call's completion handler. A descriptor is never touched after
//! `submit`.

use crate::completion::Completion;
use crate::splitter::WorkItem;
use crate::stats::DispatchStats;

use blocklayout_core::descriptor::{BlockTransport, Descriptor};
use blocklayout_core::device::DeviceHandle;
use blocklayout_core::error::{BlkError, Result};
use blocklayout_core::page::Page;
use blocklayout_core::sector::{Sector, SECTOR_SHIFT};
use blocklayout_core::ktrace;

use std::sync::Arc;

struct Open {
    desc: Descriptor,
    extent_seq: u64,
    next_sector: Sector,
}

pub(crate) struct DescriptorBuilder<'a> {
    transport: &'a dyn BlockTransport,
    completion: &'a Arc<Completion>,
    stats: &'a DispatchStats,
    limit: usize,
    /// Descriptors this builder may still allocate; `None` is unbounded.
    budget: Option<usize>,
    open: Option<Open>,
}

/// Same device, compared by address.
fn same_device(a: &DeviceHandle, b: &DeviceHandle) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl<'a> DescriptorBuilder<'a> {
    pub(crate) fn new(
        transport: &'a dyn BlockTransport,
        completion: &'a Arc<Completion>,
        stats: &'a DispatchStats,
        limit: usize,
        budget: Option<usize>,
    ) -> Self {
        Self {
            transport,
            completion,
            stats,
            limit: limit.max(1),
            budget,
            open: None,
        }
    }

    /// Add one work item. A hole closes the open descriptor; a data range
    /// joins it or starts a new one. `pages_left` sizes the segment list
    /// of a new descriptor. Fails only when that list cannot be allocated.
    pub(crate) fn push(&mut self, page: &Page, item: &WorkItem, pages_left: usize) -> Result<()> {
        let WorkItem::Data {
            span,
            device,
            device_sector,
            extent_seq,
            ..
        } = item
        else {
            self.flush();
            return Ok(());
        };

        let fits = self.open.as_ref().is_some_and(|o| {
            o.extent_seq == *extent_seq
                && o.next_sector == *device_sector
                && same_device(&o.desc.device, device)
                && o.desc.len() < self.limit
        });
        if !fits {
            self.flush();
            let capacity = pages_left.min(self.limit).max(1);
            let desc = self.allocate(device, *device_sector, capacity)?;
            self.open = Some(Open {
                desc,
                extent_seq: *extent_seq,
                next_sector: *device_sector,
            });
        }

        if let Some(open) = self.open.as_mut() {
            open.desc.push_segment(page.clone(), span.offset, span.len)?;
            open.next_sector += (span.len >> SECTOR_SHIFT) as Sector;
            if open.desc.len() >= self.limit {
                self.flush();
            }
        }
        Ok(())
    }

    fn allocate(
        &mut self,
        device: &DeviceHandle,
        sector: Sector,
        capacity: usize,
    ) -> Result<Descriptor> {
        if let Some(left) = self.budget.as_mut() {
            if *left == 0 {
                return Err(BlkError::Allocation);
            }
            *left -= 1;
        }
        Descriptor::try_new(Arc::clone(device), sector, self.completion.direction, capacity)
    }

    /// Submit the open descriptor, if any.
    pub(crate) fn flush(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        let mut desc = open.desc;
        if desc.is_empty() {
            return;
        }
        self.completion.pio.acquire();
        desc.set_end_io(self.completion.end_io());
        self.stats.descriptor(desc.len());
        ktrace!(
            "submit {} {} sector={} segments={} bytes={}",
            desc.direction,
            desc.device.id(),
            desc.start_sector,
            desc.len(),
            desc.bytes()
        );
        self.transport.submit(desc);
    }
}
