//! # blocklayout-core — Trait definitions for the block-layout I/O path
//!
//! This crate defines the seams between the dispatch path and everything
//! it talks to. Each trait models one collaborator:
//!
//! | Trait            | Collaborator                                   |
//! |------------------|------------------------------------------------|
//! | `ExtentMap`      | file sector → device extent / hole lookup      |
//! | `BlockDevice`    | one backing block device                       |
//! | `BlockTransport` | executes descriptors, reports completions      |
//! | `Deferred`       | runs finalize work off the completion path     |
//!
//! Default implementations live in `blocklayout-module`; the dispatch
//! path itself lives in `blocklayout-executor` and only ever sees these
//! traits.
//!
//! ## Modules
//!
//! - `sector` - sector/page geometry and conversions
//! - `page` - page buffers handed to devices
//! - `extent` - extents and the `ExtentMap` trait
//! - `device` - `BlockDevice` trait and device handles
//! - `descriptor` - descriptors, segments and the `BlockTransport` trait
//! - `deferred` - the `Deferred` executor trait
//! - `context` - per-call context and completion signal
//! - `layout` - layout failure state (fallback signal)
//! - `error` - error types
//! - `kprint` - kernel-style leveled logging macros
//! - `env` - environment variable utilities

pub mod sector;
pub mod page;
pub mod extent;
pub mod device;
pub mod descriptor;
pub mod deferred;
pub mod context;
pub mod layout;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use sector::{Sector, PAGE_SIZE, SECTOR_SIZE};
pub use page::Page;
pub use extent::{Extent, ExtentMap, ExtentState};
pub use device::{BlockDevice, DeviceHandle, DeviceId};
pub use descriptor::{BlockTransport, Descriptor, DeviceResult, Direction, EndIo, Segment};
pub use deferred::{Deferred, Work};
pub use context::{CallContext, CallOutcome, IoArgs, Stability, SyncMode};
pub use layout::LayoutHealth;
pub use error::{BlkError, MappingError, MappingKind, Result};
pub use env::{env_get, env_get_bool, env_get_opt};
pub use kprint::LogLevel;
