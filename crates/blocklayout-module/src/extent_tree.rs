//! `ExtentTree` — default in-memory `ExtentMap`.
//!
//! Extents are kept in a `BTreeMap` keyed by file offset behind a
//! `RwLock`: lookups from concurrent calls share the read lock, the
//! per-call `mark_written` takes the write lock.
//!
//! `mark_written` converts the written part of `TaggedInvalid` extents to
//! `Data`, splitting extents at the edges of the written range, and
//! remembers the written ranges so a later layout commit can report them.
//! The tree keeps one map for both directions; `for_write` does not
//! change the answer.

use blocklayout_core::extent::{Extent, ExtentMap, ExtentState};
use blocklayout_core::sector::Sector;
use blocklayout_core::ktrace;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentTreeError {
    ZeroLength,
    /// The new extent overlaps the existing extent starting at this sector.
    Overlap { existing: Sector },
}

impl fmt::Display for ExtentTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroLength => write!(f, "extent has zero length"),
            Self::Overlap { existing } => {
                write!(f, "extent overlaps existing extent at sector {}", existing)
            }
        }
    }
}

impl std::error::Error for ExtentTreeError {}

#[derive(Default)]
struct TreeInner {
    extents: BTreeMap<Sector, Extent>,
    /// Written ranges not yet committed, merged and ordered.
    commit: Vec<(Sector, Sector)>,
    /// Highest last-written byte reported.
    last_write_byte: Option<u64>,
}

#[derive(Default)]
pub struct ExtentTree {
    inner: RwLock<TreeInner>,
}

impl ExtentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extent. Rejects empty and overlapping extents.
    pub fn insert(&self, extent: Extent) -> Result<(), ExtentTreeError> {
        if extent.length == 0 {
            return Err(ExtentTreeError::ZeroLength);
        }
        let mut inner = self.write();
        if let Some((&start, prev)) = inner.extents.range(..extent.file_end()).next_back() {
            if prev.file_end() > extent.file_offset {
                return Err(ExtentTreeError::Overlap { existing: start });
            }
        }
        inner.extents.insert(extent.file_offset, extent);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().extents.is_empty()
    }

    /// All extents in file order.
    pub fn snapshot(&self) -> Vec<Extent> {
        self.read().extents.values().cloned().collect()
    }

    /// Take the written ranges (start, length) and last written byte
    /// recorded since the previous call.
    pub fn take_commit(&self) -> (Vec<(Sector, Sector)>, Option<u64>) {
        let mut inner = self.write();
        let ranges = std::mem::take(&mut inner.commit)
            .into_iter()
            .map(|(s, e)| (s, e - s))
            .collect();
        (ranges, inner.last_write_byte.take())
    }

    fn read(&self) -> RwLockReadGuard<'_, TreeInner> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, TreeInner> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Piece of `e` covering `[start, end)`, same state and device.
fn slice_of(e: &Extent, start: Sector, end: Sector, state: ExtentState) -> Extent {
    Extent {
        file_offset: start,
        length: end - start,
        device_offset: e.device_offset + (start - e.file_offset),
        state,
        tag: e.tag,
        device: e.device.clone(),
    }
}

/// Insert `[start, end)` into an ordered, merged range list.
fn merge_range(ranges: &mut Vec<(Sector, Sector)>, start: Sector, end: Sector) {
    ranges.push((start, end));
    ranges.sort_unstable();
    let mut merged: Vec<(Sector, Sector)> = Vec::with_capacity(ranges.len());
    for &(s, e) in ranges.iter() {
        match merged.last_mut() {
            Some(last) if s <= last.1 => last.1 = last.1.max(e),
            _ => merged.push((s, e)),
        }
    }
    *ranges = merged;
}

impl ExtentMap for ExtentTree {
    fn lookup(&self, sector: Sector, for_write: bool) -> Option<Extent> {
        let inner = self.read();
        let found = inner
            .extents
            .range(..=sector)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(sector))
            .cloned();
        ktrace!(
            "extent lookup sector={} write={} -> {:?}",
            sector,
            for_write,
            found.as_ref().map(|e| (e.file_offset, e.length, e.state))
        );
        found
    }

    fn mark_written(&self, start: Sector, length: Sector) {
        if length == 0 {
            return;
        }
        let end = start + length;
        let mut inner = self.write();

        let touched: Vec<Extent> = inner
            .extents
            .range(..end)
            .map(|(_, e)| e)
            .filter(|e| e.file_end() > start && e.state == ExtentState::TaggedInvalid)
            .cloned()
            .collect();

        for e in touched {
            inner.extents.remove(&e.file_offset);
            let lo = start.max(e.file_offset);
            let hi = end.min(e.file_end());
            if e.file_offset < lo {
                let head = slice_of(&e, e.file_offset, lo, e.state);
                inner.extents.insert(head.file_offset, head);
            }
            let body = slice_of(&e, lo, hi, ExtentState::Data);
            inner.extents.insert(body.file_offset, body);
            if hi < e.file_end() {
                let tail = slice_of(&e, hi, e.file_end(), e.state);
                inner.extents.insert(tail.file_offset, tail);
            }
        }
        merge_range(&mut inner.commit, start, end);
    }

    fn record_last_write_byte(&self, lwb: u64) {
        let mut inner = self.write();
        inner.last_write_byte = Some(inner.last_write_byte.map_or(lwb, |cur| cur.max(lwb)));
    }
}
