//! `InlineTransport` / `InlineDeferred` — synchronous implementations.
//!
//! Everything runs on the calling thread: a descriptor is executed and
//! completed inside `submit()`, deferred work runs inside `schedule()`.
//! Deterministic, single-threaded; meant for tests and for debugging
//! with `BL_TRANSPORT=inline`.

use crate::device_io;

use blocklayout_core::deferred::{Deferred, Work};
use blocklayout_core::descriptor::{BlockTransport, Descriptor};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct InlineTransport {
    max_segments: usize,
    inflight: AtomicUsize,
    shutdown: AtomicBool,
}

impl InlineTransport {
    pub fn new(max_segments: usize) -> Self {
        Self {
            max_segments: max_segments.max(1),
            inflight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl Default for InlineTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BlockTransport for InlineTransport {
    fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn submit(&self, desc: Descriptor) {
        if self.shutdown.load(Ordering::Acquire) {
            desc.complete(Err(libc::ESHUTDOWN));
            return;
        }
        self.inflight.fetch_add(1, Ordering::Relaxed);
        let result = device_io::execute(&desc);
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        desc.complete(result);
    }

    fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[derive(Default)]
pub struct InlineDeferred {
    shutdown: AtomicBool,
}

impl InlineDeferred {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Deferred for InlineDeferred {
    fn schedule(&self, work: Work) -> Result<(), Work> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(work);
        }
        work();
        Ok(())
    }

    fn pending(&self) -> usize {
        0
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
