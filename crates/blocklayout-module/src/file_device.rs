//! `FileDevice` — a `BlockDevice` over a regular file or block device node.
//!
//! Positional vectored I/O via `preadv`/`pwritev`, so one descriptor is
//! one syscall in the common case. The fd is exposed for ring transports.

use blocklayout_core::device::{BlockDevice, DeviceId};
use blocklayout_core::sector::{bytes_to_sectors, sectors_to_bytes, Sector};

use nix::sys::uio::{preadv, pwritev};

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, IoSliceMut, Seek, SeekFrom};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

pub struct FileDevice {
    id: DeviceId,
    file: File,
    path: PathBuf,
    sectors: Sector,
}

impl FileDevice {
    /// Open an existing file or device node read-write. The capacity is
    /// taken from its current length, rounded down to whole sectors.
    pub fn open(id: DeviceId, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = device_len(&file)?;
        Ok(Self {
            id,
            file,
            path: path.to_path_buf(),
            sectors: bytes_to_sectors(len),
        })
    }

    /// Create (or truncate) a regular file of `sectors` sectors.
    pub fn create(id: DeviceId, path: impl AsRef<Path>, sectors: Sector) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sectors_to_bytes(sectors))?;
        Ok(Self {
            id,
            file,
            path: path.to_path_buf(),
            sectors,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush written data to stable storage.
    pub fn sync_data(&self) -> std::io::Result<()> {
        self.file.sync_data()
    }
}

/// Length of a regular file, or of a block device via seeking to its end.
fn device_len(file: &File) -> std::io::Result<u64> {
    let meta = file.metadata()?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut handle = file;
    handle.seek(SeekFrom::End(0))
}

impl BlockDevice for FileDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn sectors(&self) -> Sector {
        self.sectors
    }

    fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], offset: u64) -> std::io::Result<usize> {
        preadv(&self.file, bufs, offset as libc::off_t).map_err(std::io::Error::from)
    }

    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: u64) -> std::io::Result<usize> {
        pwritev(&self.file, bufs, offset as libc::off_t).map_err(std::io::Error::from)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}
