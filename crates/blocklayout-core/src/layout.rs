//! Layout failure state.
//!
//! When a mapping or device error happens on the fast path, the layout
//! is marked failed for that direction. Later calls see the mark at entry
//! and are refused, which tells the upper layer to route I/O through the
//! metadata server instead. Nothing here retries.

use crate::descriptor::Direction;

use std::sync::atomic::{AtomicU8, Ordering};

const READ_FAILED: u8 = 1 << 0;
const WRITE_FAILED: u8 = 1 << 1;

#[inline]
fn bit(dir: Direction) -> u8 {
    match dir {
        Direction::Read => READ_FAILED,
        Direction::Write => WRITE_FAILED,
    }
}

#[derive(Debug, Default)]
pub struct LayoutHealth {
    failed: AtomicU8,
}

impl LayoutHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the layout failed for `dir`. Returns true if this call set it.
    pub fn mark_failed(&self, dir: Direction) -> bool {
        let prev = self.failed.fetch_or(bit(dir), Ordering::AcqRel);
        prev & bit(dir) == 0
    }

    #[inline]
    pub fn is_failed(&self, dir: Direction) -> bool {
        self.failed.load(Ordering::Acquire) & bit(dir) != 0
    }

    /// Forget failures, e.g. after a fresh layout was obtained.
    pub fn clear(&self) {
        self.failed.store(0, Ordering::Release);
    }
}
