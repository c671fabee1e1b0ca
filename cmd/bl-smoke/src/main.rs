//! Block-Layout End-to-End Smoke Test
//!
//! Tests the full dispatch stack:
//!   Part A — File devices: striped write + read back over each transport
//!   Part B — Holes and EOF: zero-fill, short final read
//!   Part C — Failures: device errors, unmapped ranges, layout fallback
//!   Part D — Concurrency: many calls in flight on the threaded transport
//!
//! Run: ./target/release/bl-smoke
//! (Part A's uring run is skipped when io_uring is unavailable)

use blocklayout_core::context::{CallContext, CallOutcome, IoArgs, Stability, SyncMode};
use blocklayout_core::deferred::Deferred;
use blocklayout_core::descriptor::{BlockTransport, Direction};
use blocklayout_core::device::{DeviceHandle, DeviceId};
use blocklayout_core::error::{BlkError, MappingKind};
use blocklayout_core::extent::{Extent, ExtentMap, ExtentState};
use blocklayout_core::page::Page;
use blocklayout_core::sector::PAGE_SIZE;

use blocklayout_executor::{DispatchConfig, Dispatcher, Layout};
use blocklayout_module::{
    ExtentTree, FileDevice, FinalizePool, InlineDeferred, InlineTransport, MemDevice,
    ThreadedTransport, ThreadedTransportConfig,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const PAGE: u64 = PAGE_SIZE as u64;
const WAIT: Duration = Duration::from_secs(10);

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("bl-smoke-{}-{}", std::process::id(), name))
}

fn layout_of(tree: &Arc<ExtentTree>) -> Arc<Layout> {
    let map: Arc<dyn ExtentMap> = tree.clone();
    Arc::new(Layout::new(map))
}

/// Pattern byte for page `i` of a test file.
fn pattern(i: usize) -> u8 {
    (i as u8).wrapping_mul(37).wrapping_add(11)
}

/// Run one call to completion. `None` if it was refused or timed out.
fn run_read(disp: &Dispatcher, layout: &Arc<Layout>, ctx: &Arc<CallContext>) -> Result<CallOutcome, String> {
    disp.read_pages(layout, ctx).map_err(|e| format!("refused: {}", e))?;
    ctx.wait_timeout(WAIT).ok_or_else(|| "timed out".to_string())
}

fn run_write(disp: &Dispatcher, layout: &Arc<Layout>, ctx: &Arc<CallContext>) -> Result<CallOutcome, String> {
    disp.write_pages(layout, ctx, SyncMode::FileSync)
        .map_err(|e| format!("refused: {}", e))?;
    ctx.wait_timeout(WAIT).ok_or_else(|| "timed out".to_string())
}

// ════════════════════════════════════════════════════════════
// Part A: File devices over each transport
// ════════════════════════════════════════════════════════════

/// Two file devices, 16 pages striped 4 pages at a time, initially
/// allocated-but-unwritten (tagged invalid).
fn striped_files(tag: &str) -> std::io::Result<(Vec<PathBuf>, Arc<ExtentTree>)> {
    let paths = vec![temp_path(&format!("{}-a", tag)), temp_path(&format!("{}-b", tag))];
    let devs: Vec<DeviceHandle> = vec![
        Arc::new(FileDevice::create(DeviceId(1), &paths[0], 256)?),
        Arc::new(FileDevice::create(DeviceId(2), &paths[1], 256)?),
    ];
    let tree = Arc::new(ExtentTree::new());
    for stripe in 0..4u64 {
        let dev = devs[(stripe % 2) as usize].clone();
        let e = Extent::new(stripe * 32, 32, (stripe / 2) * 32, ExtentState::TaggedInvalid, dev)
            .with_tag(1);
        if let Err(err) = tree.insert(e) {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()));
        }
    }
    Ok((paths, tree))
}

fn round_trip(t: &mut TestRunner, name: &str, transport: Arc<dyn BlockTransport>, deferred: Arc<dyn Deferred>) {
    let disp = match Dispatcher::new(transport, deferred, DispatchConfig::default().max_segments(3)) {
        Ok(d) => d,
        Err(e) => { t.fail(&format!("{}: dispatcher", name), &e.to_string()); return; }
    };
    let (paths, tree) = match striped_files(name) {
        Ok(v) => v,
        Err(e) => { t.fail(&format!("{}: create files", name), &e.to_string()); return; }
    };
    let layout = layout_of(&tree);

    // Write 16 pages.
    let pages: Vec<Page> = (0..16).map(|i| Page::filled(pattern(i))).collect();
    let wctx = Arc::new(CallContext::new(pages, IoArgs::new(0, 16 * PAGE), 0));
    match run_write(&disp, &layout, &wctx) {
        Ok(out) => {
            t.check(&format!("{}: write 16 pages", name), out.is_ok(), &format!("{:?}", out.error));
            t.check(&format!("{}: stability FileSync", name),
                out.stability == Some(Stability::FileSync), &format!("{:?}", out.stability));
        }
        Err(e) => t.fail(&format!("{}: write 16 pages", name), &e),
    }

    let (ranges, lwb) = tree.take_commit();
    t.check(&format!("{}: commit range [0, 128)", name),
        ranges == vec![(0, 128)] && lwb == Some(16 * PAGE),
        &format!("{:?} lwb={:?}", ranges, lwb));
    let all_data = tree.snapshot().iter().all(|e| e.state == ExtentState::Data);
    t.check(&format!("{}: extents now data", name), all_data, "tagged invalid left");

    // Read back.
    let rctx = Arc::new(CallContext::new(Page::array(16), IoArgs::new(0, 16 * PAGE), 16 * PAGE));
    match run_read(&disp, &layout, &rctx) {
        Ok(out) => {
            t.check(&format!("{}: read 16 pages", name), out.is_ok() && out.eof,
                &format!("{:?} eof={}", out.error, out.eof));
            let same = rctx.pages().iter().enumerate()
                .all(|(i, p)| p.to_vec().iter().all(|&b| b == pattern(i)));
            t.check(&format!("{}: data matches", name), same, "content mismatch");
        }
        Err(e) => t.fail(&format!("{}: read 16 pages", name), &e),
    }

    let snap = disp.stats();
    // 4 stripes of 4 pages, limit 3 → 2 descriptors per stripe per call.
    t.check(&format!("{}: 16 descriptors", name), snap.descriptors == 16,
        &format!("got {}", snap.descriptors));

    disp.shutdown();
    for p in paths {
        let _ = std::fs::remove_file(p);
    }
}

fn test_transports(t: &mut TestRunner) {
    t.section("Part A: File devices over each transport");

    round_trip(t, "inline", Arc::new(InlineTransport::default()), Arc::new(InlineDeferred::new()));

    match (
        ThreadedTransport::new(ThreadedTransportConfig::default().workers(2)),
        FinalizePool::new(1),
    ) {
        (Ok(tr), Ok(pool)) => round_trip(t, "threads", Arc::new(tr), Arc::new(pool)),
        (Err(e), _) | (_, Err(e)) => t.fail("threads: start", &e.to_string()),
    }

    #[cfg(target_os = "linux")]
    {
        use blocklayout_module::{UringTransport, UringTransportConfig};
        match UringTransport::new(UringTransportConfig::default()) {
            Ok(tr) => match FinalizePool::new(1) {
                Ok(pool) => round_trip(t, "uring", Arc::new(tr), Arc::new(pool)),
                Err(e) => t.fail("uring: finalize pool", &e.to_string()),
            },
            Err(e) => println!("       io_uring unavailable ({}), skipping uring run.", e),
        }
    }
}

// ════════════════════════════════════════════════════════════
// Part B: Holes and EOF
// ════════════════════════════════════════════════════════════

fn test_holes(t: &mut TestRunner) {
    t.section("Part B: Holes and EOF");

    let dev = Arc::new(MemDevice::new(DeviceId(7), 1024));
    dev.write_bytes(0, &vec![0xAA; 64 * 512]);
    let handle: DeviceHandle = dev.clone();
    let tree = Arc::new(ExtentTree::new());
    let _ = tree.insert(Extent::new(0, 8, 0, ExtentState::Data, handle.clone()));
    let _ = tree.insert(Extent::new(8, 8, 0, ExtentState::Hole, handle.clone()));
    let _ = tree.insert(Extent::new(16, 8, 8, ExtentState::TaggedInvalid, handle.clone()));
    let _ = tree.insert(Extent::new(24, 40, 16, ExtentState::Data, handle));
    let layout = layout_of(&tree);
    let disp = match Dispatcher::new(
        Arc::new(InlineTransport::default()),
        Arc::new(InlineDeferred::new()),
        DispatchConfig::default(),
    ) {
        Ok(d) => d,
        Err(e) => { t.fail("dispatcher", &e.to_string()); return; }
    };

    let pages: Vec<Page> = (0..4).map(|_| Page::filled(0x55)).collect();
    let ctx = Arc::new(CallContext::new(pages, IoArgs::new(0, 4 * PAGE), 1 << 20));
    match run_read(&disp, &layout, &ctx) {
        Ok(out) => {
            t.check("read across holes", out.is_ok(), &format!("{:?}", out.error));
            let p = ctx.pages();
            t.check("hole page zeroed", p[1].to_vec().iter().all(|&b| b == 0), "not zero");
            t.check("untagged invalid page zeroed", p[2].to_vec().iter().all(|&b| b == 0), "not zero");
            t.check("data pages read",
                p[0].to_vec()[0] == 0xAA && p[3].to_vec()[4095] == 0xAA, "wrong data");
        }
        Err(e) => t.fail("read across holes", &e),
    }
    t.check("2 descriptors for 4 pages", disp.stats().descriptors == 2,
        &format!("got {}", disp.stats().descriptors));

    let ctx = Arc::new(CallContext::new(Page::array(2), IoArgs::new(0, 2 * PAGE), 6000));
    match run_read(&disp, &layout, &ctx) {
        Ok(out) => t.check("short file sets eof, 6000 bytes",
            out.eof && out.bytes_transferred == 6000,
            &format!("eof={} bytes={}", out.eof, out.bytes_transferred)),
        Err(e) => t.fail("short file read", &e),
    }

    let wctx = Arc::new(CallContext::new(Page::array(1), IoArgs::new(8 * 512, PAGE), 0));
    match run_write(&disp, &layout, &wctx) {
        Ok(out) => t.check("write into hole fails",
            matches!(&out.error, Some(BlkError::Mapping(m)) if m.kind == MappingKind::UnbackedWrite),
            &format!("{:?}", out.error)),
        Err(e) => t.fail("write into hole", &e),
    }
}

// ════════════════════════════════════════════════════════════
// Part C: Failures and layout fallback
// ════════════════════════════════════════════════════════════

fn test_failures(t: &mut TestRunner) {
    t.section("Part C: Failures and layout fallback");

    let dev = Arc::new(MemDevice::new(DeviceId(3), 1024));
    dev.fail_sectors(40..48, libc::EIO);
    let handle: DeviceHandle = dev.clone();
    let tree = Arc::new(ExtentTree::new());
    let _ = tree.insert(Extent::new(0, 32, 0, ExtentState::Data, handle.clone()));
    let _ = tree.insert(Extent::new(32, 32, 40, ExtentState::Data, handle));
    let layout = layout_of(&tree);
    let disp = match Dispatcher::new(
        Arc::new(InlineTransport::default()),
        Arc::new(InlineDeferred::new()),
        DispatchConfig::default(),
    ) {
        Ok(d) => d,
        Err(e) => { t.fail("dispatcher", &e.to_string()); return; }
    };

    let ctx = Arc::new(CallContext::new(Page::array(8), IoArgs::new(0, 8 * PAGE), 1 << 20));
    match run_read(&disp, &layout, &ctx) {
        Ok(out) => t.check("device error reported",
            out.error == Some(BlkError::device_io(libc::EIO)), &format!("{:?}", out.error)),
        Err(e) => t.fail("device error read", &e),
    }
    t.check("layout failed for read", layout.health().is_failed(Direction::Read), "not marked");

    let again = Arc::new(CallContext::new(Page::array(1), IoArgs::new(0, PAGE), 1 << 20));
    t.check("next read refused (fallback)",
        disp.read_pages(&layout, &again) == Err(BlkError::LayoutFailed(Direction::Read)),
        "not refused");

    let w = Arc::new(CallContext::new(Page::array(1), IoArgs::new(0, PAGE), 0));
    match run_write(&disp, &layout, &w) {
        Ok(out) => t.check("writes unaffected", out.is_ok(), &format!("{:?}", out.error)),
        Err(e) => t.fail("writes unaffected", &e),
    }

    // Unmapped write: the first pages still reach the device.
    dev.clear_faults();
    let pages: Vec<Page> = (0..10).map(|_| Page::filled(0x99)).collect();
    let w = Arc::new(CallContext::new(pages, IoArgs::new(0, 10 * PAGE), 0));
    match run_write(&disp, &layout, &w) {
        Ok(out) => {
            let unmapped = matches!(&out.error,
                Some(BlkError::Mapping(m)) if m.kind == MappingKind::NotMapped && m.sector == 64);
            t.check("unmapped write reports sector 64", unmapped, &format!("{:?}", out.error));
            t.check("errno EINVAL", out.error.as_ref().map(|e| e.errno()) == Some(libc::EINVAL),
                "wrong errno");
        }
        Err(e) => t.fail("unmapped write", &e),
    }
    t.check("mapped prefix written", dev.read_bytes(0, 1) == vec![0x99], "prefix missing");
    t.check("layout failed for write", layout.health().is_failed(Direction::Write), "not marked");

    layout.health().clear();
    let ok = Arc::new(CallContext::new(Page::array(8), IoArgs::new(0, 8 * PAGE), 1 << 20));
    match run_read(&disp, &layout, &ok) {
        Ok(out) => t.check("read after clear", out.is_ok(), &format!("{:?}", out.error)),
        Err(e) => t.fail("read after clear", &e),
    }
}

// ════════════════════════════════════════════════════════════
// Part D: Concurrency
// ════════════════════════════════════════════════════════════

fn test_concurrency(t: &mut TestRunner) {
    t.section("Part D: Concurrency (threaded transport)");

    const DEVICES: u64 = 4;
    const CALLS: usize = 32;
    const PAGES: usize = 32;

    let mut handles: Vec<DeviceHandle> = Vec::new();
    for i in 0..DEVICES {
        let dev = MemDevice::new(DeviceId(10 + i), 1024);
        dev.write_bytes(0, &vec![i as u8 + 1; 1024 * 512]);
        dev.set_latency(Some(Duration::from_micros(200)));
        handles.push(Arc::new(dev));
    }
    let tree = Arc::new(ExtentTree::new());
    for stripe in 0..(PAGES as u64) {
        let dev = handles[(stripe % DEVICES) as usize].clone();
        let _ = tree.insert(Extent::new(stripe * 8, 8, (stripe / DEVICES) * 8, ExtentState::Data, dev));
    }
    let layout = layout_of(&tree);

    let transport = match ThreadedTransport::new(ThreadedTransportConfig::default().workers(4)) {
        Ok(tr) => Arc::new(tr),
        Err(e) => { t.fail("start transport", &e.to_string()); return; }
    };
    let pool = match FinalizePool::new(2) {
        Ok(p) => Arc::new(p),
        Err(e) => { t.fail("start finalize pool", &e.to_string()); return; }
    };
    let disp = match Dispatcher::new(transport.clone(), pool.clone(), DispatchConfig::default()) {
        Ok(d) => Arc::new(d),
        Err(e) => { t.fail("dispatcher", &e.to_string()); return; }
    };

    let start = std::time::Instant::now();
    let workers: Vec<_> = (0..CALLS)
        .map(|_| {
            let disp = disp.clone();
            let layout = layout.clone();
            std::thread::spawn(move || -> bool {
                let ctx = Arc::new(CallContext::new(
                    Page::array(PAGES),
                    IoArgs::new(0, PAGES as u64 * PAGE),
                    1 << 20,
                ));
                match run_read(&disp, &layout, &ctx) {
                    Ok(out) if out.is_ok() => ctx.pages().iter().enumerate().all(|(i, p)| {
                        let want = (i as u64 % DEVICES) as u8 + 1;
                        p.to_vec().iter().all(|&b| b == want)
                    }),
                    _ => false,
                }
            })
        })
        .collect();
    let ok = workers.into_iter().filter_map(|h| h.join().ok()).filter(|&ok| ok).count();
    let elapsed = start.elapsed();

    t.check(&format!("{} concurrent calls complete", CALLS), ok == CALLS,
        &format!("{} of {}", ok, CALLS));
    let snap = disp.stats();
    t.check("descriptors == calls * stripes",
        snap.descriptors == (CALLS * PAGES) as u64, &format!("got {}", snap.descriptors));
    t.check("one finalize per call", snap.finalized == CALLS as u64,
        &format!("got {}", snap.finalized));
    println!("       {} calls x {} pages in {:?}", CALLS, PAGES, elapsed);

    transport.join();
    pool.join();
    t.check("transport drained", transport.inflight() == 0, "descriptors left");
}

// ════════════════════════════════════════════════════════════

fn main() {
    println!("=== Block-Layout End-to-End Smoke Test ===");
    let kver = std::fs::read_to_string("/proc/version").unwrap_or_default();
    println!("    kernel: {}", kver.trim().split(' ').nth(2).unwrap_or("?"));

    let mut t = TestRunner::new();

    test_transports(&mut t);
    test_holes(&mut t);
    test_failures(&mut t);
    test_concurrency(&mut t);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
