//! `UringTransport` — io_uring `BlockTransport` (Linux).
//!
//! One ring thread owns the ring. It admits queued descriptors while the
//! SQ has room, translating each into a single READV/WRITEV at the
//! descriptor's device offset, then blocks in `submit_and_wait(1)` and
//! reaps CQEs. Completions therefore run on the ring thread.
//!
//! No SQPOLL, no fixed files, no fixed buffers. Devices without a raw fd
//! (e.g. `MemDevice`) are executed synchronously on the ring thread.
//! A short transfer is finished with positional I/O on the ring thread.

use crate::device_io;

use blocklayout_core::descriptor::{BlockTransport, Descriptor, Direction};
use blocklayout_core::env::env_get;
use blocklayout_core::{kdebug, kerror, kwarn};

use crossbeam_queue::SegQueue;
use io_uring::{opcode, types, IoUring};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Kernel limit on iovecs per readv/writev.
const IOV_MAX: usize = 1024;

/// Configuration for `UringTransport`.
#[derive(Debug, Clone)]
pub struct UringTransportConfig {
    /// Number of SQ entries. Must be a power of 2.
    pub entries: u32,
    /// Segments per descriptor. At most 1024 (one iovec each).
    pub max_segments: usize,
}

impl Default for UringTransportConfig {
    fn default() -> Self {
        Self {
            entries: 128,
            max_segments: 256,
        }
    }
}

impl UringTransportConfig {
    /// Defaults overridden by `BL_URING_ENTRIES` / `BL_TRANSPORT_MAX_SEGMENTS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            entries: env_get("BL_URING_ENTRIES", d.entries),
            max_segments: env_get("BL_TRANSPORT_MAX_SEGMENTS", d.max_segments),
        }
    }

    pub fn entries(mut self, n: u32) -> Self {
        self.entries = n;
        self
    }

    pub fn max_segments(mut self, n: usize) -> Self {
        self.max_segments = n;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.entries == 0 || !self.entries.is_power_of_two() {
            return Err("entries must be a power of 2");
        }
        if self.max_segments == 0 || self.max_segments > IOV_MAX {
            return Err("max_segments must be in 1..=1024");
        }
        Ok(())
    }
}

struct UringInner {
    queue: SegQueue<Descriptor>,
    inflight: AtomicUsize,
    shutdown: AtomicBool,
}

/// A descriptor owned by the kernel until its CQE arrives.
struct InFlight {
    desc: Descriptor,
    /// Referenced by the SQE; must live until the CQE.
    _iov: Vec<libc::iovec>,
    expected: usize,
}

pub struct UringTransport {
    inner: Arc<UringInner>,
    ring_thread: thread::Thread,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    max_segments: usize,
}

impl UringTransport {
    pub fn new(config: UringTransportConfig) -> std::io::Result<Self> {
        config
            .validate()
            .map_err(|msg| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))?;
        let ring = IoUring::new(config.entries)?;

        let inner = Arc::new(UringInner {
            queue: SegQueue::new(),
            inflight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let ring_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("bl-uring".into())
            .spawn(move || ring_loop(ring, ring_inner))?;
        kdebug!(
            "uring transport: entries={}, max_segments={}",
            config.entries,
            config.max_segments
        );

        Ok(Self {
            inner,
            ring_thread: handle.thread().clone(),
            handle: Mutex::new(Some(handle)),
            max_segments: config.max_segments,
        })
    }

    /// Shut down and wait for the ring thread to drain and exit.
    pub fn join(&self) {
        self.shutdown();
        let handle = match self.handle.lock() {
            Ok(mut h) => h.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(h) = handle {
            if h.join().is_err() {
                kwarn!("uring transport: ring thread panicked");
            }
        }
    }
}

impl BlockTransport for UringTransport {
    fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn submit(&self, desc: Descriptor) {
        self.inner.inflight.fetch_add(1, Ordering::SeqCst);
        if self.inner.shutdown.load(Ordering::SeqCst) {
            self.inner.inflight.fetch_sub(1, Ordering::SeqCst);
            desc.complete(Err(libc::ESHUTDOWN));
            return;
        }
        self.inner.queue.push(desc);
        self.ring_thread.unpark();
    }

    fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.ring_thread.unpark();
    }
}

impl Drop for UringTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn finish(inner: &UringInner, desc: Descriptor, result: Result<(), i32>) {
    desc.complete(result);
    inner.inflight.fetch_sub(1, Ordering::SeqCst);
}

fn ring_loop(mut ring: IoUring, inner: Arc<UringInner>) {
    let mut pending: HashMap<u64, InFlight> = HashMap::new();
    let mut next_id: u64 = 0;

    loop {
        // Admit while the SQ has room.
        while !ring.submission().is_full() {
            let Some(desc) = inner.queue.pop() else {
                break;
            };
            let fd = match desc.device.raw_fd() {
                Some(fd) if !desc.is_empty() && desc.end_sector() <= desc.device.sectors() => fd,
                _ => {
                    let result = device_io::execute(&desc);
                    finish(&inner, desc, result);
                    continue;
                }
            };

            let iov: Vec<libc::iovec> = desc
                .segments
                .iter()
                .map(|s| libc::iovec {
                    // Safety: the page is owned by an in-flight call and kept
                    // alive by `desc` until the CQE is reaped.
                    iov_base: unsafe { s.page.buf_ptr().add(s.offset) } as *mut libc::c_void,
                    iov_len: s.len,
                })
                .collect();
            let target = types::Fd(fd);
            let sqe = match desc.direction {
                Direction::Read => opcode::Readv::new(target, iov.as_ptr(), iov.len() as u32)
                    .offset(desc.device_byte_offset())
                    .build(),
                Direction::Write => opcode::Writev::new(target, iov.as_ptr(), iov.len() as u32)
                    .offset(desc.device_byte_offset())
                    .build(),
            }
            .user_data(next_id);

            // Safety: the iovec array and the buffers it points at stay
            // alive in `pending` until the matching CQE is reaped.
            let pushed = unsafe { ring.submission().push(&sqe) };
            if pushed.is_err() {
                let result = device_io::execute(&desc);
                finish(&inner, desc, result);
                continue;
            }
            let expected = desc.bytes();
            pending.insert(
                next_id,
                InFlight {
                    desc,
                    _iov: iov,
                    expected,
                },
            );
            next_id = next_id.wrapping_add(1);
        }

        if pending.is_empty() {
            // `inflight` also counts submitters that have not pushed yet.
            if inner.shutdown.load(Ordering::SeqCst) && inner.inflight.load(Ordering::SeqCst) == 0
            {
                break;
            }
            thread::park_timeout(Duration::from_millis(1));
            continue;
        }

        match ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            Err(e) => {
                kerror!("uring transport: submit_and_wait failed: {}", e);
                thread::park_timeout(Duration::from_millis(1));
            }
        }

        let reaped: Vec<(u64, i32)> = ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (id, res) in reaped {
            let Some(f) = pending.remove(&id) else {
                kwarn!("uring transport: unknown completion {}", id);
                continue;
            };
            let result = if res < 0 {
                Err(-res)
            } else if (res as usize) < f.expected {
                device_io::finish_from(&f.desc, res as usize)
            } else {
                Ok(())
            };
            finish(&inner, f.desc, result);
        }
    }
}
