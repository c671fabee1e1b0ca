//! Completion handlers and the finalizer.
//!
//! Every descriptor of a call carries an `EndIo` built from the call's
//! `Completion`. A handler records a device error (first one wins),
//! marks the layout failed for the call's direction unless the transport
//! reported shutdown, and always releases one coordinator reference.
//!
//! The release that reaches zero does not finalize inline: it schedules
//! the finalizer on the `Deferred` executor, since completions may run in
//! contexts that must not block.

use crate::coordinator::ParallelIo;
use crate::stats::DispatchStats;
use crate::Layout;

use blocklayout_core::context::{CallContext, Stability};
use blocklayout_core::deferred::Deferred;
use blocklayout_core::descriptor::{DeviceResult, Direction, EndIo};
use blocklayout_core::error::BlkError;
use blocklayout_core::sector::{page_ceil, page_floor, SECTOR_SHIFT};
use blocklayout_core::{kdebug, kerror, kwarn};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Shared by every descriptor of one call.
pub(crate) struct Completion {
    pub(crate) ctx: Arc<CallContext>,
    pub(crate) layout: Arc<Layout>,
    pub(crate) stats: Arc<DispatchStats>,
    pub(crate) pio: Arc<ParallelIo>,
    pub(crate) direction: Direction,
}

impl Completion {
    /// Callback for one descriptor. Pair each with one `acquire`.
    pub(crate) fn end_io(self: &Arc<Self>) -> EndIo {
        let this = Arc::clone(self);
        Box::new(move |result| this.handle(result))
    }

    fn handle(&self, result: DeviceResult) {
        if let Err(errno) = result {
            let err = BlkError::from_errno(errno);
            self.stats.device_error();
            if self.ctx.record_error(err.clone()) {
                kwarn!("{} descriptor failed: {}", self.direction, err);
            }
            // A transport shutting down says nothing about the layout.
            if err.fails_layout() && self.layout.health().mark_failed(self.direction) {
                kerror!("layout marked failed for {}", self.direction);
            }
        }
        self.pio.release();
    }
}

/// On-zero callback for a call's coordinator: hand the finalizer to
/// `deferred`. If the executor refuses (shut down), the finalizer runs on
/// the releasing thread so the caller is still signalled.
pub(crate) fn finalizer(
    deferred: Arc<dyn Deferred>,
    ctx: Arc<CallContext>,
    layout: Arc<Layout>,
    stats: Arc<DispatchStats>,
    direction: Direction,
) -> impl FnOnce(Arc<ParallelIo>) + Send + 'static {
    move |pio| {
        let work = Box::new(move || finalize(&ctx, &layout, &stats, &pio, direction));
        if let Err(work) = deferred.schedule(work) {
            kwarn!("finalize executor rejected work, finalizing inline");
            work();
        }
    }
}

fn finalize(
    ctx: &CallContext,
    layout: &Layout,
    stats: &DispatchStats,
    pio: &ParallelIo,
    direction: Direction,
) {
    if direction == Direction::Write {
        ctx.set_stability(Stability::FileSync);
        // The caller is signalled even if the extent map update panics.
        if catch_unwind(AssertUnwindSafe(|| finalize_write(ctx, layout))).is_err() {
            kerror!("finalize write: extent map update panicked");
            ctx.record_error(BlkError::device_io(libc::EIO));
        }
    }
    stats.finalized();
    kdebug!(
        "finalize {}: {} descriptors, error={:?}",
        direction,
        pio.acquired(),
        ctx.error()
    );
    pio.mark_done();
    ctx.complete();
}

/// Bookkeeping for writes without an error. Writes are always reported
/// fully synced.
fn finalize_write(ctx: &CallContext, layout: &Layout) {
    if ctx.error().is_some() {
        return;
    }
    let args = ctx.args();
    let end = args.offset.saturating_add(args.count);
    let start = page_floor(args.offset);
    let length = page_ceil(end) - start;
    let extents = layout.extents();
    extents.mark_written(start >> SECTOR_SHIFT, length >> SECTOR_SHIFT);
    extents.record_last_write_byte(end);
}
