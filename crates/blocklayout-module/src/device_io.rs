//! Synchronous execution of one descriptor.
//!
//! Shared by every transport that runs device I/O on its own threads.
//! One vectored call covers the whole descriptor; a short transfer is
//! finished segment by segment. A device that stops making progress
//! (returns 0) fails the descriptor with `EIO`.

use blocklayout_core::descriptor::{Descriptor, DeviceResult, Direction};
use blocklayout_core::error::BlkError;

use std::io::{IoSlice, IoSliceMut};
use std::sync::MutexGuard;

pub(crate) fn os_errno(e: std::io::Error) -> i32 {
    BlkError::from(e).errno()
}

/// Run `desc` against its device. Does not complete the descriptor.
pub fn execute(desc: &Descriptor) -> DeviceResult {
    if desc.is_empty() {
        return Ok(());
    }
    if desc.end_sector() > desc.device.sectors() {
        return Err(libc::EIO);
    }

    // The same page may back two segments only if the caller aliased it;
    // locking it twice would deadlock, so go segment by segment.
    let done = if has_aliased_pages(desc) {
        0
    } else {
        vectored(desc)?
    };
    finish_from(desc, done)
}

/// Complete the transfer of `desc` after the first `done` bytes already
/// moved. Locks one page at a time.
pub fn finish_from(desc: &Descriptor, mut done: usize) -> DeviceResult {
    let base = desc.device_byte_offset();
    let mut pos = 0usize;

    for seg in &desc.segments {
        let seg_start = pos;
        pos += seg.len;
        if done >= pos {
            continue;
        }

        let mut within = done - seg_start;
        let mut guard = seg.page.lock();
        while within < seg.len {
            let range = seg.offset + within..seg.offset + seg.len;
            let at = base + (seg_start + within) as u64;
            let n = match desc.direction {
                Direction::Read => desc
                    .device
                    .read_vectored_at(&mut [IoSliceMut::new(&mut guard[range])], at),
                Direction::Write => desc
                    .device
                    .write_vectored_at(&[IoSlice::new(&guard[range])], at),
            }
            .map_err(os_errno)?;
            if n == 0 {
                return Err(libc::EIO);
            }
            within += n;
        }
        done = pos;
    }
    Ok(())
}

fn vectored(desc: &Descriptor) -> Result<usize, i32> {
    let mut guards: Vec<MutexGuard<'_, Box<[u8]>>> =
        desc.segments.iter().map(|s| s.page.lock()).collect();
    let base = desc.device_byte_offset();

    match desc.direction {
        Direction::Read => {
            let mut slices: Vec<IoSliceMut<'_>> = guards
                .iter_mut()
                .zip(&desc.segments)
                .map(|(g, s)| IoSliceMut::new(&mut g[s.offset..s.offset + s.len]))
                .collect();
            desc.device.read_vectored_at(&mut slices, base).map_err(os_errno)
        }
        Direction::Write => {
            let slices: Vec<IoSlice<'_>> = guards
                .iter()
                .zip(&desc.segments)
                .map(|(g, s)| IoSlice::new(&g[s.offset..s.offset + s.len]))
                .collect();
            desc.device.write_vectored_at(&slices, base).map_err(os_errno)
        }
    }
}

fn has_aliased_pages(desc: &Descriptor) -> bool {
    let mut ids: Vec<usize> = desc.segments.iter().map(|s| s.page.id()).collect();
    ids.sort_unstable();
    ids.windows(2).any(|w| w[0] == w[1])
}
