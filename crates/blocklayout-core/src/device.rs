//! Backing block device abstraction.
//!
//! A `BlockDevice` is one region of storage an extent can point into.
//! Resolving a layout's device identifiers to handles happens elsewhere;
//! by the time the dispatch path sees an extent, it already carries a
//! `DeviceHandle`.
//!
//! # Implementors
//!
//! - `FileDevice`: a regular file or block device node, positional
//!   vectored I/O. Exposes its fd so ring transports can submit directly.
//! - `MemDevice`: heap-backed, with fault injection. For tests and demos.

use crate::sector::Sector;

use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

/// Identifier of a backing device, unique within one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DeviceId(pub u64);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Shared handle stored in extents and descriptors.
pub type DeviceHandle = Arc<dyn BlockDevice>;

/// Synchronous positional I/O against one device.
///
/// **Contract:**
/// - Offsets are in bytes and always sector aligned.
/// - Methods may block; transports call them from their own threads.
/// - A short transfer is not an error at this level; transports decide.
pub trait BlockDevice: Send + Sync {
    fn id(&self) -> DeviceId;

    /// Device capacity in sectors.
    fn sectors(&self) -> Sector;

    /// Read into `bufs` starting at byte `offset`.
    fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], offset: u64) -> std::io::Result<usize>;

    /// Write `bufs` starting at byte `offset`.
    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: u64) -> std::io::Result<usize>;

    /// File descriptor for kernel-side submission, if the device has one.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        None
    }
}
