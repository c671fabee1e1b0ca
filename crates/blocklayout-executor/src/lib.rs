//! # blocklayout-executor — The dispatch path
//!
//! Turns one file-level read or write into device descriptors and joins
//! their completions back into one result:
//!
//! ```text
//! read_pages / write_pages
//!     1. Refuse if shut down or the layout is failed for this direction
//!     2. Validate arguments, claim the call context
//!     3. Splitter: walk pages, follow extents, zero-fill read holes
//!     4. Builder: pack ranges into descriptors, acquire + submit each
//!     5. Drop the splitting reference
//! completion (any thread)
//!     6. Record errors (sticky), mark the layout failed, release
//! last release
//!     7. Schedule the finalizer on the deferred executor
//! finalizer
//!     8. Writes: FileSync, mark_written, last written byte
//!     9. Signal the caller
//! ```
//!
//! The dispatcher is generic over all trait implementations: swap the
//! transport, executor or extent map and nothing here changes.
//!
//! There is no cancellation or timeout at this layer. A descriptor its
//! transport never completes keeps the call from finishing forever;
//! `CallContext::wait_timeout` only bounds how long the caller waits.

pub mod config;
pub mod coordinator;
pub mod splitter;
pub mod stats;

mod builder;
mod completion;

pub use config::DispatchConfig;
pub use coordinator::{ParallelIo, Phase};
pub use splitter::{Span, Splitter, WorkItem};
pub use stats::{DispatchStats, StatsSnapshot};

use builder::DescriptorBuilder;
use completion::Completion;

use blocklayout_core::context::{CallContext, SyncMode};
use blocklayout_core::deferred::Deferred;
use blocklayout_core::descriptor::{BlockTransport, Direction};
use blocklayout_core::error::{BlkError, Result};
use blocklayout_core::extent::ExtentMap;
use blocklayout_core::layout::LayoutHealth;
use blocklayout_core::sector::{sectors_to_bytes, SECTOR_SIZE};
use blocklayout_core::{kdebug, kinfo, kwarn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A file's layout as seen by the dispatch path: its extent map and the
/// per-direction failure state.
pub struct Layout {
    extents: Arc<dyn ExtentMap>,
    health: LayoutHealth,
}

impl Layout {
    pub fn new(extents: Arc<dyn ExtentMap>) -> Self {
        Self {
            extents,
            health: LayoutHealth::new(),
        }
    }

    pub fn extents(&self) -> &dyn ExtentMap {
        self.extents.as_ref()
    }

    pub fn health(&self) -> &LayoutHealth {
        &self.health
    }
}

pub struct Dispatcher {
    transport: Arc<dyn BlockTransport>,
    deferred: Arc<dyn Deferred>,
    config: DispatchConfig,
    stats: Arc<DispatchStats>,
    shutdown: AtomicBool,
    /// Descriptors one call may allocate before failing with `Allocation`.
    descriptor_budget: Option<usize>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn BlockTransport>,
        deferred: Arc<dyn Deferred>,
        config: DispatchConfig,
    ) -> Result<Self> {
        config.validate().map_err(BlkError::InvalidArgument)?;
        Ok(Self {
            transport,
            deferred,
            config,
            stats: Arc::new(DispatchStats::new()),
            shutdown: AtomicBool::new(false),
            descriptor_budget: None,
        })
    }

    /// Default stack: transport from `BL_TRANSPORT`, a `FinalizePool` of
    /// `BL_FINALIZE_WORKERS` threads, `DispatchConfig::from_env()`.
    pub fn from_env() -> std::io::Result<Self> {
        let config = DispatchConfig::from_env();
        config
            .validate()
            .map_err(|msg| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))?;
        let transport = blocklayout_module::transport_from_env()?;
        let deferred = Arc::new(blocklayout_module::FinalizePool::new(config.finalize_workers)?);
        kinfo!(
            "dispatcher: max_segments={} (transport {}), finalize_workers={}",
            config.max_segments,
            transport.max_segments(),
            config.finalize_workers
        );
        Ok(Self {
            transport,
            deferred,
            config,
            stats: Arc::new(DispatchStats::new()),
            shutdown: AtomicBool::new(false),
            descriptor_budget: None,
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Segments per descriptor actually used.
    pub fn segment_limit(&self) -> usize {
        self.transport
            .max_segments()
            .min(self.config.max_segments)
            .max(1)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[cfg(test)]
    fn with_descriptor_budget(mut self, n: usize) -> Self {
        self.descriptor_budget = Some(n);
        self
    }

    /// Stop the transport and the deferred executor. Calls already
    /// dispatched still finish; new calls are refused with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.transport.shutdown();
        self.deferred.shutdown();
    }

    /// Start a read of `ctx`'s range into its pages.
    ///
    /// `Ok` means the call was attempted; its result arrives through the
    /// context (`wait`, `wait_timeout` or the `on_done` callback) with
    /// `bytes_transferred`, `eof` and the sticky error.
    ///
    /// `Err` means nothing was attempted: `LayoutFailed(Read)` asks the
    /// caller to go through the metadata server instead;
    /// `InvalidArgument` and `AlreadyUsed` are caller bugs.
    ///
    /// There is no timeout: a descriptor that never completes stalls the
    /// call indefinitely.
    pub fn read_pages(&self, layout: &Arc<Layout>, ctx: &Arc<CallContext>) -> Result<()> {
        self.check_entry(layout, Direction::Read)?;
        let splitter = Splitter::read(layout.extents(), ctx).map_err(|e| self.refuse(e))?;
        ctx.begin().map_err(|e| self.refuse(e))?;
        self.stats.call(false);
        self.dispatch(layout, ctx, splitter, Direction::Read);
        Ok(())
    }

    /// Start a write of `ctx`'s pages over its range.
    ///
    /// Same contract as `read_pages`. Whatever `sync_mode` asks for, the
    /// result's stability is `FileSync`.
    pub fn write_pages(
        &self,
        layout: &Arc<Layout>,
        ctx: &Arc<CallContext>,
        sync_mode: SyncMode,
    ) -> Result<()> {
        self.check_entry(layout, Direction::Write)?;
        let splitter = Splitter::write(layout.extents(), ctx).map_err(|e| self.refuse(e))?;
        ctx.begin().map_err(|e| self.refuse(e))?;
        self.stats.call(true);
        kdebug!(
            "write offset={} count={} sync={:?}",
            ctx.args().offset,
            ctx.args().count,
            sync_mode
        );
        self.dispatch(layout, ctx, splitter, Direction::Write);
        Ok(())
    }

    fn check_entry(&self, layout: &Layout, direction: Direction) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(self.refuse(BlkError::Shutdown));
        }
        if layout.health().is_failed(direction) {
            return Err(self.refuse(BlkError::LayoutFailed(direction)));
        }
        Ok(())
    }

    fn refuse(&self, err: BlkError) -> BlkError {
        self.stats.refused();
        err
    }

    fn dispatch(
        &self,
        layout: &Arc<Layout>,
        ctx: &Arc<CallContext>,
        mut splitter: Splitter<'_>,
        direction: Direction,
    ) {
        let pio = ParallelIo::new(completion::finalizer(
            Arc::clone(&self.deferred),
            Arc::clone(ctx),
            Arc::clone(layout),
            Arc::clone(&self.stats),
            direction,
        ));
        let completion = Arc::new(Completion {
            ctx: Arc::clone(ctx),
            layout: Arc::clone(layout),
            stats: Arc::clone(&self.stats),
            pio: Arc::clone(&pio),
            direction,
        });
        let mut builder = DescriptorBuilder::new(
            self.transport.as_ref(),
            &completion,
            &self.stats,
            self.segment_limit(),
            self.descriptor_budget,
        );

        let pages = ctx.pages();
        let mut failure = None;
        while let Some(next) = splitter.next() {
            let step = next.and_then(|item| {
                let span = item.span();
                let page = &pages[span.page];
                if let WorkItem::Hole { .. } = item {
                    page.zero_range(span.offset, span.len);
                    self.stats.zeroed(span.len);
                    kdebug!("hole: zeroed page {} [{}, +{})", span.page, span.offset, span.len);
                }
                builder.push(page, &item, splitter.pages_left())
            });
            if let Err(e) = step {
                failure = Some(e);
                break;
            }
        }
        // Whatever was built before a failure still goes out and drains.
        builder.flush();

        match failure {
            Some(err) => self.abort(layout, ctx, err, direction),
            None => {
                let args = ctx.args();
                match direction {
                    Direction::Read => {
                        let end = sectors_to_bytes(splitter.sector());
                        if end >= ctx.file_size() {
                            ctx.set_transfer(ctx.file_size().saturating_sub(args.offset), true);
                        } else {
                            ctx.set_transfer(end - args.offset, false);
                        }
                    }
                    Direction::Write => ctx.set_transfer(args.count, false),
                }
            }
        }
        pio.finish_splitting();
    }

    fn abort(&self, layout: &Layout, ctx: &CallContext, err: BlkError, direction: Direction) {
        match &err {
            BlkError::Mapping(m) => {
                self.stats.mapping_error();
                kwarn!(
                    "{} mapping error at sector {} ({:?}), byte {}",
                    direction,
                    m.sector,
                    m.kind,
                    m.sector * SECTOR_SIZE as u64
                );
            }
            BlkError::Allocation => {
                self.stats.allocation_error();
                kwarn!("{}: descriptor allocation failed", direction);
            }
            other => kwarn!("{} aborted: {}", direction, other),
        }
        if err.fails_layout() && layout.health().mark_failed(direction) {
            kwarn!("layout marked failed for {}", direction);
        }
        ctx.record_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocklayout_core::context::{IoArgs, Stability};
    use blocklayout_core::descriptor::{Descriptor, DeviceResult};
    use blocklayout_core::device::{DeviceHandle, DeviceId};
    use blocklayout_core::error::{MappingError, MappingKind};
    use blocklayout_core::extent::{Extent, ExtentState};
    use blocklayout_core::page::Page;
    use blocklayout_core::sector::Sector;
    use blocklayout_module::device_io;
    use blocklayout_module::{
        ExtentTree, FinalizePool, InlineDeferred, InlineTransport, MemDevice, ThreadedTransport,
        ThreadedTransportConfig,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    const PAGE: u64 = 4096;

    /// Executes inline and records (device, start sector, segment count).
    #[derive(Default)]
    struct Recording {
        inner: InlineTransport,
        log: Mutex<Vec<(DeviceId, Sector, usize)>>,
    }

    impl Recording {
        fn log(&self) -> Vec<(DeviceId, Sector, usize)> {
            self.log.lock().unwrap().clone()
        }
    }

    impl BlockTransport for Recording {
        fn max_segments(&self) -> usize {
            self.inner.max_segments()
        }
        fn submit(&self, desc: Descriptor) {
            self.log
                .lock()
                .unwrap()
                .push((desc.device.id(), desc.start_sector, desc.len()));
            self.inner.submit(desc);
        }
        fn inflight(&self) -> usize {
            self.inner.inflight()
        }
        fn shutdown(&self) {
            self.inner.shutdown()
        }
    }

    /// Holds descriptors until the test completes them.
    struct Holding {
        max_segments: usize,
        held: Mutex<Vec<Descriptor>>,
    }

    impl Holding {
        fn new(max_segments: usize) -> Self {
            Self {
                max_segments,
                held: Mutex::new(Vec::new()),
            }
        }

        fn take(&self) -> Vec<Descriptor> {
            std::mem::take(&mut *self.held.lock().unwrap())
        }
    }

    impl BlockTransport for Holding {
        fn max_segments(&self) -> usize {
            self.max_segments
        }
        fn submit(&self, desc: Descriptor) {
            self.held.lock().unwrap().push(desc);
        }
        fn inflight(&self) -> usize {
            self.held.lock().unwrap().len()
        }
        fn shutdown(&self) {}
    }

    fn mem(id: u64) -> (Arc<MemDevice>, DeviceHandle) {
        let dev = Arc::new(MemDevice::new(DeviceId(id), 4096));
        let handle: DeviceHandle = dev.clone();
        (dev, handle)
    }

    fn layout(extents: Vec<Extent>) -> (Arc<ExtentTree>, Arc<Layout>) {
        let tree = Arc::new(ExtentTree::new());
        for e in extents {
            tree.insert(e).unwrap();
        }
        let map: Arc<dyn ExtentMap> = tree.clone();
        (tree, Arc::new(Layout::new(map)))
    }

    fn inline_dispatcher(transport: Arc<dyn BlockTransport>) -> Dispatcher {
        Dispatcher::new(transport, Arc::new(InlineDeferred::new()), DispatchConfig::default())
            .unwrap()
    }

    fn read_ctx(npages: usize, file_size: u64) -> Arc<CallContext> {
        Arc::new(CallContext::new(
            Page::array(npages),
            IoArgs::new(0, npages as u64 * PAGE),
            file_size,
        ))
    }

    #[test]
    fn test_scenario_a_one_extent_one_descriptor() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 64, 100, ExtentState::Data, d)]);
        let t = Arc::new(Recording::default());
        let disp = inline_dispatcher(t.clone());

        let ctx = read_ctx(3, 1 << 20);
        disp.read_pages(&lay, &ctx).unwrap();
        let out = ctx.wait();
        assert!(out.is_ok());
        assert_eq!(out.bytes_transferred, 3 * PAGE);
        assert!(!out.eof);
        assert_eq!(t.log(), vec![(DeviceId(1), 100, 3)]);
    }

    #[test]
    fn test_scenario_b_extent_boundary_splits() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![
            Extent::new(0, 16, 100, ExtentState::Data, d.clone()),
            Extent::new(16, 16, 500, ExtentState::Data, d),
        ]);
        let t = Arc::new(Recording::default());
        let disp = inline_dispatcher(t.clone());

        let ctx = read_ctx(4, 1 << 20);
        disp.read_pages(&lay, &ctx).unwrap();
        assert!(ctx.wait().is_ok());
        assert_eq!(t.log(), vec![(DeviceId(1), 100, 2), (DeviceId(1), 500, 2)]);
    }

    #[test]
    fn test_scenario_c_hole_zero_filled() {
        let (dev, d) = mem(1);
        dev.write_bytes(0, &vec![0xEE; 16 * 512]);
        let (_tree, lay) = layout(vec![
            Extent::new(0, 8, 0, ExtentState::Data, d.clone()),
            Extent::new(8, 8, 0, ExtentState::Hole, d.clone()),
            Extent::new(16, 8, 8, ExtentState::Data, d),
        ]);
        let t = Arc::new(Recording::default());
        let disp = inline_dispatcher(t.clone());

        let ctx = Arc::new(CallContext::new(
            vec![Page::new(), Page::filled(0x77), Page::new()],
            IoArgs::new(0, 3 * PAGE),
            1 << 20,
        ));
        disp.read_pages(&lay, &ctx).unwrap();
        assert!(ctx.wait().is_ok());

        assert_eq!(t.log(), vec![(DeviceId(1), 0, 1), (DeviceId(1), 8, 1)]);
        let pages = ctx.pages();
        assert!(pages[0].to_vec().iter().all(|&b| b == 0xEE));
        assert!(pages[1].to_vec().iter().all(|&b| b == 0));
        assert!(pages[2].to_vec().iter().all(|&b| b == 0xEE));
        assert_eq!(disp.stats().zeroed_bytes, PAGE);
    }

    #[test]
    fn test_scenario_d_write_mapping_failure_drains() {
        let (dev, d) = mem(1);
        let (tree, lay) = layout(vec![Extent::new(0, 16, 0, ExtentState::Data, d)]);
        let t = Arc::new(Holding::new(256));
        let disp = inline_dispatcher(t.clone());

        let pages: Vec<Page> = (0..4).map(|i| Page::filled(i as u8 + 1)).collect();
        let ctx = Arc::new(CallContext::new(pages, IoArgs::new(0, 4 * PAGE), 0));
        disp.write_pages(&lay, &ctx, SyncMode::Unstable).unwrap();

        // Pages 0-1 went out as one descriptor; nothing else was built.
        let held = t.take();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].len(), 2);
        assert!(!ctx.is_done());

        for desc in held {
            let r = device_io::execute(&desc);
            desc.complete(r);
        }
        let out = ctx.wait();
        assert_eq!(
            out.error,
            Some(BlkError::Mapping(MappingError {
                sector: 16,
                direction: Direction::Write,
                kind: MappingKind::NotMapped,
            }))
        );
        assert_eq!(out.error.as_ref().map(|e| e.errno()), Some(libc::EINVAL));
        assert_eq!(out.bytes_transferred, 0);
        assert_eq!(out.stability, Some(Stability::FileSync));
        assert_eq!(dev.read_bytes(PAGE, 1), vec![2]);
        assert_eq!(dev.read_bytes(2 * PAGE, 1), vec![0]);
        assert!(lay.health().is_failed(Direction::Write));
        assert!(tree.take_commit().0.is_empty());
    }

    #[test]
    fn test_finalize_waits_for_last_completion() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![
            Extent::new(0, 8, 0, ExtentState::Data, d.clone()),
            Extent::new(8, 8, 64, ExtentState::Data, d.clone()),
            Extent::new(16, 8, 128, ExtentState::Data, d),
        ]);
        let t = Arc::new(Holding::new(256));
        let disp = inline_dispatcher(t.clone());
        let ctx = read_ctx(3, 1 << 20);
        disp.read_pages(&lay, &ctx).unwrap();

        let mut held = t.take();
        assert_eq!(held.len(), 3);
        let last = held.pop().unwrap();
        for desc in held.into_iter().rev() {
            desc.complete(Ok(()));
            assert!(!ctx.is_done());
        }
        last.complete(Ok(()));
        assert!(ctx.is_done());
        assert_eq!(disp.stats().finalized, 1);
        assert_eq!(disp.stats().descriptors, 3);
    }

    #[test]
    fn test_device_error_is_sticky_and_fails_layout() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![
            Extent::new(0, 8, 0, ExtentState::Data, d.clone()),
            Extent::new(8, 8, 64, ExtentState::Data, d),
        ]);
        let t = Arc::new(Holding::new(256));
        let disp = inline_dispatcher(t.clone());
        let ctx = read_ctx(2, 1 << 20);
        disp.read_pages(&lay, &ctx).unwrap();

        let mut held = t.take().into_iter();
        let first = held.next().unwrap();
        let second = held.next().unwrap();
        first.complete(Err(libc::ENOSPC));
        second.complete(Ok(()));

        let out = ctx.wait();
        assert_eq!(out.error, Some(BlkError::device_io(libc::ENOSPC)));
        assert!(lay.health().is_failed(Direction::Read));
        assert!(!lay.health().is_failed(Direction::Write));
        assert_eq!(disp.stats().device_errors, 1);

        // The failed layout now refuses reads up front.
        let again = read_ctx(2, 1 << 20);
        assert_eq!(
            disp.read_pages(&lay, &again),
            Err(BlkError::LayoutFailed(Direction::Read))
        );
        assert!(!again.is_done());
        assert_eq!(disp.stats().refused, 1);
    }

    #[test]
    fn test_zero_errno_maps_to_eio() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 8, 0, ExtentState::Data, d)]);
        let t = Arc::new(Holding::new(256));
        let disp = inline_dispatcher(t.clone());
        let ctx = read_ctx(1, 1 << 20);
        disp.read_pages(&lay, &ctx).unwrap();
        let r: DeviceResult = Err(0);
        t.take().pop().unwrap().complete(r);
        assert_eq!(ctx.wait().error, Some(BlkError::device_io(libc::EIO)));
    }

    #[test]
    fn test_allocation_failure_drains_earlier_descriptors() {
        let (dev, d) = mem(1);
        let (tree, lay) = layout(vec![
            Extent::new(0, 8, 0, ExtentState::TaggedInvalid, d.clone()).with_tag(1),
            Extent::new(8, 8, 64, ExtentState::TaggedInvalid, d).with_tag(1),
        ]);
        let t = Arc::new(Holding::new(256));
        let disp = Dispatcher::new(
            t.clone(),
            Arc::new(InlineDeferred::new()),
            DispatchConfig::default(),
        )
        .unwrap()
        .with_descriptor_budget(1);

        let pages = vec![Page::filled(0x11), Page::filled(0x22)];
        let ctx = Arc::new(CallContext::new(pages, IoArgs::new(0, 2 * PAGE), 0));
        disp.write_pages(&lay, &ctx, SyncMode::FileSync).unwrap();

        // The first extent's descriptor went out before the second failed.
        let held = t.take();
        assert_eq!(held.len(), 1);
        assert!(!ctx.is_done());
        for desc in held {
            let r = device_io::execute(&desc);
            desc.complete(r);
        }

        let out = ctx.wait();
        assert_eq!(out.error, Some(BlkError::Allocation));
        assert_eq!(out.error.as_ref().map(|e| e.errno()), Some(libc::ENOMEM));
        assert_eq!(dev.read_bytes(0, 1), vec![0x11]);
        assert!(!lay.health().is_failed(Direction::Write));
        assert!(tree.take_commit().0.is_empty());
        assert!(tree.snapshot().iter().all(|e| e.state == ExtentState::TaggedInvalid));
        assert_eq!(disp.stats().allocation_errors, 1);
    }

    #[test]
    fn test_shutdown_refuses_new_calls() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 64, 0, ExtentState::Data, d)]);
        let disp = inline_dispatcher(Arc::new(InlineTransport::default()));
        disp.shutdown();

        let ctx = read_ctx(1, 1 << 20);
        assert_eq!(disp.read_pages(&lay, &ctx), Err(BlkError::Shutdown));
        assert!(!ctx.is_done());
        assert_eq!(disp.stats().refused, 1);
    }

    #[test]
    fn test_transport_shutdown_does_not_fail_layout() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 64, 0, ExtentState::Data, d)]);
        let transport = Arc::new(InlineTransport::default());
        let disp = inline_dispatcher(transport.clone());
        // Only the transport is stopped; the dispatcher still accepts calls.
        transport.shutdown();

        let ctx = read_ctx(2, 1 << 20);
        disp.read_pages(&lay, &ctx).unwrap();
        let out = ctx.wait();
        assert_eq!(out.error, Some(BlkError::Shutdown));
        assert!(!lay.health().is_failed(Direction::Read));
    }

    /// Extent map whose write bookkeeping panics.
    struct PanickingMap(ExtentTree);

    impl ExtentMap for PanickingMap {
        fn lookup(&self, sector: Sector, for_write: bool) -> Option<Extent> {
            self.0.lookup(sector, for_write)
        }
        fn mark_written(&self, _start: Sector, _length: Sector) {
            panic!("mark_written failed");
        }
    }

    #[test]
    fn test_panicking_map_update_still_completes_call() {
        let (_dev, d) = mem(1);
        let tree = ExtentTree::new();
        tree.insert(Extent::new(0, 64, 0, ExtentState::Data, d)).unwrap();
        let map: Arc<dyn ExtentMap> = Arc::new(PanickingMap(tree));
        let lay = Arc::new(Layout::new(map));
        let pool = Arc::new(FinalizePool::new(1).unwrap());
        let disp = Dispatcher::new(
            Arc::new(InlineTransport::default()),
            pool.clone(),
            DispatchConfig::default(),
        )
        .unwrap();

        let ctx = Arc::new(CallContext::new(Page::array(1), IoArgs::new(0, PAGE), 0));
        disp.write_pages(&lay, &ctx, SyncMode::FileSync).unwrap();
        let out = ctx.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(out.error, Some(BlkError::device_io(libc::EIO)));
        assert_eq!(out.stability, Some(Stability::FileSync));
        assert_eq!(disp.stats().finalized, 1);
        pool.join();
    }

    #[test]
    fn test_segment_limit_splits_descriptors() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 80, 0, ExtentState::Data, d)]);
        let t = Arc::new(Recording {
            inner: InlineTransport::new(4),
            log: Mutex::new(Vec::new()),
        });
        let disp = Dispatcher::new(
            t.clone(),
            Arc::new(InlineDeferred::new()),
            DispatchConfig::default().max_segments(3),
        )
        .unwrap();
        assert_eq!(disp.segment_limit(), 3);

        let ctx = read_ctx(10, 1 << 20);
        disp.read_pages(&lay, &ctx).unwrap();
        assert!(ctx.wait().is_ok());
        let counts: Vec<usize> = t.log().iter().map(|e| e.2).collect();
        assert_eq!(counts, vec![3, 3, 3, 1]);
        let starts: Vec<Sector> = t.log().iter().map(|e| e.1).collect();
        assert_eq!(starts, vec![0, 24, 48, 72]);
    }

    #[test]
    fn test_read_eof() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 64, 0, ExtentState::Data, d)]);
        let disp = inline_dispatcher(Arc::new(InlineTransport::default()));

        let ctx = read_ctx(2, 5000);
        disp.read_pages(&lay, &ctx).unwrap();
        let out = ctx.wait();
        assert!(out.eof);
        assert_eq!(out.bytes_transferred, 5000);

        let ctx = Arc::new(CallContext::new(
            Page::array(2),
            IoArgs::new(PAGE, PAGE),
            1 << 20,
        ));
        disp.read_pages(&lay, &ctx).unwrap();
        let out = ctx.wait();
        assert!(!out.eof);
        assert_eq!(out.bytes_transferred, PAGE);
    }

    #[test]
    fn test_write_marks_written_range() {
        let (dev, d) = mem(1);
        let (tree, lay) = layout(vec![
            Extent::new(0, 32, 0, ExtentState::TaggedInvalid, d).with_tag(9),
        ]);
        let disp = inline_dispatcher(Arc::new(InlineTransport::default()));

        let ctx = Arc::new(CallContext::new(
            vec![Page::filled(0xAB), Page::filled(0xCD)],
            IoArgs::new(PAGE + 100, 4000),
            0,
        ));
        disp.write_pages(&lay, &ctx, SyncMode::Unstable).unwrap();
        let out = ctx.wait();
        assert!(out.is_ok());
        assert_eq!(out.bytes_transferred, 4000);
        assert_eq!(out.stability, Some(Stability::FileSync));
        assert_eq!(dev.read_bytes(PAGE, 1), vec![0xAB]);

        let (ranges, lwb) = tree.take_commit();
        assert_eq!(ranges, vec![(8, 16)]);
        assert_eq!(lwb, Some(PAGE + 4100));
        let states: Vec<ExtentState> = tree.snapshot().iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![ExtentState::TaggedInvalid, ExtentState::Data, ExtentState::TaggedInvalid]
        );
    }

    #[test]
    fn test_refusals() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 64, 0, ExtentState::Data, d)]);
        let disp = inline_dispatcher(Arc::new(InlineTransport::default()));

        let bad = Arc::new(CallContext::new(Page::array(1), IoArgs::new(0, 2 * PAGE), 0));
        assert!(matches!(
            disp.read_pages(&lay, &bad),
            Err(BlkError::InvalidArgument(_))
        ));
        assert!(!bad.is_done());

        let ctx = read_ctx(1, 1 << 20);
        disp.read_pages(&lay, &ctx).unwrap();
        assert_eq!(disp.read_pages(&lay, &ctx), Err(BlkError::AlreadyUsed));
        assert_eq!(disp.stats().refused, 2);
        assert_eq!(disp.stats().reads, 1);

        assert!(Dispatcher::new(
            Arc::new(InlineTransport::default()),
            Arc::new(InlineDeferred::new()),
            DispatchConfig::default().max_segments(0),
        )
        .is_err());
    }

    #[test]
    fn test_all_holes_finalizes_without_descriptors() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 16, 0, ExtentState::Hole, d)]);
        let t = Arc::new(Recording::default());
        let disp = inline_dispatcher(t.clone());
        let ctx = Arc::new(CallContext::new(
            vec![Page::filled(1), Page::filled(2)],
            IoArgs::new(0, 2 * PAGE),
            2 * PAGE,
        ));
        disp.read_pages(&lay, &ctx).unwrap();
        let out = ctx.wait();
        assert!(out.is_ok() && out.eof);
        assert!(t.log().is_empty());
        assert!(ctx.pages().iter().all(|p| p.to_vec().iter().all(|&b| b == 0)));
    }

    #[test]
    fn test_finalizer_runs_on_finalize_pool() {
        let (_dev, d) = mem(1);
        let (_tree, lay) = layout(vec![Extent::new(0, 64, 0, ExtentState::Data, d)]);
        let pool = Arc::new(FinalizePool::new(1).unwrap());
        let disp = Dispatcher::new(
            Arc::new(InlineTransport::default()),
            pool.clone(),
            DispatchConfig::default(),
        )
        .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let ctx = Arc::new(
            CallContext::new(Page::array(2), IoArgs::new(0, 2 * PAGE), 1 << 20).on_done(
                move |_| {
                    *s.lock().unwrap() = thread::current().name().map(str::to_owned);
                },
            ),
        );
        disp.read_pages(&lay, &ctx).unwrap();
        assert!(ctx.wait_timeout(Duration::from_secs(5)).is_some());
        pool.join();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("bl-finalize-0"));
    }

    #[test]
    fn test_concurrent_calls_threaded() {
        let devs: Vec<(Arc<MemDevice>, DeviceHandle)> = (0..3).map(mem).collect();
        for (i, (dev, _)) in devs.iter().enumerate() {
            dev.write_bytes(0, &vec![i as u8 + 1; 64 * 512]);
            dev.set_latency(Some(Duration::from_millis(1)));
        }
        // File sectors [0,192) striped over three devices, 8 sectors each.
        let mut extents = Vec::new();
        for stripe in 0..24u64 {
            let (_, d) = &devs[(stripe % 3) as usize];
            extents.push(Extent::new(stripe * 8, 8, (stripe / 3) * 8, ExtentState::Data, d.clone()));
        }
        let (_tree, lay) = layout(extents);

        let transport = Arc::new(
            ThreadedTransport::new(ThreadedTransportConfig::default().workers(4)).unwrap(),
        );
        let pool = Arc::new(FinalizePool::new(2).unwrap());
        let disp = Arc::new(
            Dispatcher::new(transport.clone(), pool.clone(), DispatchConfig::default()).unwrap(),
        );

        let finished = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let disp = disp.clone();
                let lay = lay.clone();
                let finished = finished.clone();
                thread::spawn(move || {
                    let ctx = read_ctx(24, 1 << 20);
                    disp.read_pages(&lay, &ctx).unwrap();
                    let out = ctx.wait_timeout(Duration::from_secs(10)).unwrap();
                    assert!(out.is_ok());
                    for (i, page) in ctx.pages().iter().enumerate() {
                        assert!(page.to_vec().iter().all(|&b| b == (i % 3) as u8 + 1));
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(finished.load(Ordering::SeqCst), 8);
        let snap = disp.stats();
        assert_eq!(snap.descriptors, 8 * 24);
        assert_eq!(snap.finalized, 8);
        transport.join();
        pool.join();
    }
}
