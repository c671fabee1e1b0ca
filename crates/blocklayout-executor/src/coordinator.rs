//! `ParallelIo` — the fan-out/fan-in join point of one call.
//!
//! An atomic reference count with an on-zero callback. The splitting
//! loop holds the initial reference and drops it only after the last
//! descriptor was submitted, so early completions can never finalize the
//! call while descriptors are still being built.
//!
//! ```text
//! Splitting ──acquire──▶ Submitting ──finish_splitting──▶ Draining
//!     └──────────────finish_splitting──────────────────────▲
//! Draining ──last release──▶ Finalizing ──mark_done──▶ Done
//! ```

use blocklayout_core::kerror;

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle of one call, for diagnostics.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Splitting = 0,
    Submitting = 1,
    Draining = 2,
    Finalizing = 3,
    Done = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Splitting,
            1 => Phase::Submitting,
            2 => Phase::Draining,
            3 => Phase::Finalizing,
            _ => Phase::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Splitting => "splitting",
            Phase::Submitting => "submitting",
            Phase::Draining => "draining",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

type OnZero = Box<dyn FnOnce(Arc<ParallelIo>) + Send + 'static>;

pub struct ParallelIo {
    refs: AtomicUsize,
    /// Total `acquire` calls, i.e. descriptors submitted.
    acquired: AtomicUsize,
    phase: AtomicU8,
    on_zero: Mutex<Option<OnZero>>,
}

impl ParallelIo {
    /// A coordinator holding the splitting loop's reference.
    pub fn new<F>(on_zero: F) -> Arc<Self>
    where
        F: FnOnce(Arc<ParallelIo>) + Send + 'static,
    {
        Arc::new(Self {
            refs: AtomicUsize::new(1),
            acquired: AtomicUsize::new(0),
            phase: AtomicU8::new(Phase::Splitting as u8),
            on_zero: Mutex::new(Some(Box::new(on_zero))),
        })
    }

    /// Take a reference for one descriptor about to be submitted.
    pub fn acquire(&self) {
        let prev = self.refs.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            kerror!("parallel io: acquire after the last release");
        }
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let _ = self.phase.compare_exchange(
            Phase::Splitting as u8,
            Phase::Submitting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Drop one reference. The release that reaches zero runs the on-zero
    /// callback, exactly once. A release with nothing outstanding is
    /// logged and ignored.
    pub fn release(self: &Arc<Self>) {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
        match prev {
            Ok(1) => {
                self.phase.store(Phase::Finalizing as u8, Ordering::Release);
                let on_zero = match self.on_zero.lock() {
                    Ok(mut g) => g.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                if let Some(f) = on_zero {
                    f(Arc::clone(self));
                }
            }
            Ok(_) => {}
            Err(_) => kerror!("parallel io: release without a reference"),
        }
    }

    /// Drop the splitting loop's reference after the last submission.
    pub fn finish_splitting(self: &Arc<Self>) {
        let _ = self.phase.fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
            (p < Phase::Draining as u8).then_some(Phase::Draining as u8)
        });
        self.release();
    }

    /// Called by the finalizer once the caller has been signalled.
    pub fn mark_done(&self) {
        self.phase.store(Phase::Done as u8, Ordering::Release);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Outstanding references.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Descriptors submitted so far.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ParallelIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelIo")
            .field("refs", &self.refs())
            .field("acquired", &self.acquired())
            .field("phase", &self.phase())
            .finish()
    }
}
