//! Block-layout error types.

use crate::descriptor::Direction;
use crate::sector::Sector;

use std::fmt;

/// Why a sector could not be resolved to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// No extent covers the sector.
    NotMapped,
    /// The write path hit a hole; resolving real storage is not done here.
    UnbackedWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingError {
    pub sector: Sector,
    pub direction: Direction,
    pub kind: MappingKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlkError {
    /// Requested range not covered by a usable extent.
    Mapping(MappingError),
    /// Descriptor construction failed.
    Allocation,
    /// A device operation failed with this errno.
    DeviceIo { errno: i32 },
    /// The layout was marked failed for this direction; use another path.
    LayoutFailed(Direction),
    /// The call could not be started.
    InvalidArgument(&'static str),
    /// The call context was already submitted once.
    AlreadyUsed,
    /// Transport or executor has been shut down.
    Shutdown,
}

impl BlkError {
    /// Positive errno equivalent.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Mapping(m) => match m.direction {
                Direction::Read => libc::EIO,
                Direction::Write => libc::EINVAL,
            },
            Self::Allocation => libc::ENOMEM,
            Self::DeviceIo { errno } => *errno,
            Self::LayoutFailed(_) => libc::EAGAIN,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::AlreadyUsed => libc::EBUSY,
            Self::Shutdown => libc::ESHUTDOWN,
        }
    }

    /// Errors that mark the layout failed for the call's direction.
    pub fn fails_layout(&self) -> bool {
        matches!(self, Self::Mapping(_) | Self::DeviceIo { .. })
    }

    pub fn device_io(errno: i32) -> Self {
        Self::DeviceIo { errno }
    }

    /// Error for a failed device operation. `ESHUTDOWN` means the transport
    /// stopped; zero or negative values become `EIO`.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ESHUTDOWN => Self::Shutdown,
            e if e > 0 => Self::DeviceIo { errno: e },
            _ => Self::DeviceIo { errno: libc::EIO },
        }
    }
}

impl fmt::Display for BlkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mapping(m) => match m.kind {
                MappingKind::NotMapped => {
                    write!(f, "{} at sector {}: not mapped", m.direction, m.sector)
                }
                MappingKind::UnbackedWrite => {
                    write!(f, "write at sector {}: hole has no backing storage", m.sector)
                }
            },
            Self::Allocation => write!(f, "descriptor allocation failed"),
            Self::DeviceIo { errno } => write!(f, "device I/O failed: errno {}", errno),
            Self::LayoutFailed(dir) => write!(f, "layout marked failed for {}", dir),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Self::AlreadyUsed => write!(f, "call context already submitted"),
            Self::Shutdown => write!(f, "shut down"),
        }
    }
}

impl std::error::Error for BlkError {}

impl From<MappingError> for BlkError {
    fn from(e: MappingError) -> Self {
        Self::Mapping(e)
    }
}

impl From<std::io::Error> for BlkError {
    fn from(e: std::io::Error) -> Self {
        Self::from_errno(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, BlkError>;
