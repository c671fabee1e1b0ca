//! `MemDevice` — heap-backed `BlockDevice` with fault injection.
//!
//! Used by tests and the smoke binary. Faults are checked per call
//! against the byte range the call touches; latency is applied before
//! the copy so completions from several devices interleave.

use blocklayout_core::device::{BlockDevice, DeviceId};
use blocklayout_core::sector::{sectors_to_bytes, Sector};

use std::io::{IoSlice, IoSliceMut};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct Faults {
    /// Every call fails with this errno.
    all: Option<i32>,
    /// Calls touching these sectors fail with the paired errno.
    sectors: Vec<(Range<Sector>, i32)>,
    latency: Option<Duration>,
    /// Cap per call, to exercise short transfers.
    max_transfer: Option<usize>,
}

pub struct MemDevice {
    id: DeviceId,
    data: Mutex<Vec<u8>>,
    faults: Mutex<Faults>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDevice {
    /// A zeroed device of `sectors` sectors.
    pub fn new(id: DeviceId, sectors: Sector) -> Self {
        Self {
            id,
            data: Mutex::new(vec![0; sectors_to_bytes(sectors) as usize]),
            faults: Mutex::new(Faults::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn fail_all(&self, errno: i32) {
        lock(&self.faults).all = Some(errno);
    }

    pub fn fail_sectors(&self, sectors: Range<Sector>, errno: i32) {
        lock(&self.faults).sectors.push((sectors, errno));
    }

    pub fn clear_faults(&self) {
        let mut f = lock(&self.faults);
        f.all = None;
        f.sectors.clear();
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        lock(&self.faults).latency = latency;
    }

    pub fn set_max_transfer(&self, max: Option<usize>) {
        lock(&self.faults).max_transfer = max;
    }

    /// Copy `len` bytes out, bypassing faults and counters.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = lock(&self.data);
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        data[start..end].to_vec()
    }

    /// Store bytes directly, bypassing faults and counters.
    pub fn write_bytes(&self, offset: u64, bytes: &[u8]) {
        let mut data = lock(&self.data);
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(bytes.len()).min(data.len());
        data[start..end].copy_from_slice(&bytes[..end - start]);
    }

    /// (reads, writes) calls served, including failed ones.
    pub fn op_counts(&self) -> (u64, u64) {
        (self.reads.load(Ordering::Relaxed), self.writes.load(Ordering::Relaxed))
    }

    /// Apply faults for a call covering `len` bytes at `offset`.
    /// Returns the number of bytes the call may move.
    fn admit(&self, offset: u64, len: usize) -> std::io::Result<usize> {
        let (latency, errno, cap) = {
            let f = lock(&self.faults);
            let first = offset >> 9;
            let last = (offset + len as u64 + 511) >> 9;
            let hit = f
                .sectors
                .iter()
                .find(|(r, _)| r.start < last && first < r.end)
                .map(|(_, e)| *e);
            (f.latency, f.all.or(hit), f.max_transfer)
        };
        if let Some(d) = latency {
            std::thread::sleep(d);
        }
        if let Some(errno) = errno {
            return Err(std::io::Error::from_raw_os_error(errno));
        }
        Ok(cap.map_or(len, |c| c.min(len)))
    }
}

impl BlockDevice for MemDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn sectors(&self) -> Sector {
        (lock(&self.data).len() >> 9) as Sector
    }

    fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], offset: u64) -> std::io::Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut budget = self.admit(offset, total)?;

        let data = lock(&self.data);
        let mut pos = offset as usize;
        let mut moved = 0;
        for buf in bufs.iter_mut() {
            let n = buf.len().min(budget).min(data.len().saturating_sub(pos));
            if n == 0 {
                break;
            }
            buf[..n].copy_from_slice(&data[pos..pos + n]);
            pos += n;
            moved += n;
            budget -= n;
            if budget == 0 || n < buf.len() {
                break;
            }
        }
        Ok(moved)
    }

    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: u64) -> std::io::Result<usize> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut budget = self.admit(offset, total)?;

        let mut data = lock(&self.data);
        let mut pos = offset as usize;
        let mut moved = 0;
        for buf in bufs {
            let n = buf.len().min(budget).min(data.len().saturating_sub(pos));
            if n == 0 {
                break;
            }
            data[pos..pos + n].copy_from_slice(&buf[..n]);
            pos += n;
            moved += n;
            budget -= n;
            if budget == 0 || n < buf.len() {
                break;
            }
        }
        Ok(moved)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
