//! Dispatch statistics.
//!
//! Relaxed counters, bumped on the hot path and read as a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DispatchStats {
    reads: AtomicU64,
    writes: AtomicU64,
    refused: AtomicU64,
    descriptors: AtomicU64,
    segments: AtomicU64,
    zeroed_bytes: AtomicU64,
    device_errors: AtomicU64,
    mapping_errors: AtomicU64,
    allocation_errors: AtomicU64,
    finalized: AtomicU64,
}

/// Point-in-time copy of `DispatchStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    /// Calls not attempted (invalid arguments, failed layout, reused context).
    pub refused: u64,
    pub descriptors: u64,
    pub segments: u64,
    pub zeroed_bytes: u64,
    pub device_errors: u64,
    pub mapping_errors: u64,
    pub allocation_errors: u64,
    pub finalized: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn call(&self, write: bool) {
        if write {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn descriptor(&self, segments: usize) {
        self.descriptors.fetch_add(1, Ordering::Relaxed);
        self.segments.fetch_add(segments as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn zeroed(&self, bytes: usize) {
        self.zeroed_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn mapping_error(&self) {
        self.mapping_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn allocation_error(&self) {
        self.allocation_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn finalized(&self) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            descriptors: self.descriptors.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
            zeroed_bytes: self.zeroed_bytes.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            mapping_errors: self.mapping_errors.load(Ordering::Relaxed),
            allocation_errors: self.allocation_errors.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let s = DispatchStats::new();
        s.call(false);
        s.call(true);
        s.call(true);
        s.descriptor(3);
        s.descriptor(1);
        s.zeroed(4096);
        s.finalized();
        let snap = s.snapshot();
        assert_eq!((snap.reads, snap.writes), (1, 2));
        assert_eq!((snap.descriptors, snap.segments), (2, 4));
        assert_eq!(snap.zeroed_bytes, 4096);
        assert_eq!(snap.finalized, 1);
        assert_eq!(snap.device_errors, 0);
    }
}
