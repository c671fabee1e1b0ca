//! # blocklayout-module — Default implementations
//!
//! This crate provides the default implementation for every block-layout
//! trait. Each impl prioritizes correctness and simplicity over
//! performance.
//!
//! ## Default stack
//!
//! | Trait            | Default Impl        | Alternatives                          |
//! |------------------|---------------------|---------------------------------------|
//! | BlockTransport   | ThreadedTransport   | UringTransport (linux), InlineTransport |
//! | Deferred         | FinalizePool        | InlineDeferred (testing)              |
//! | ExtentMap        | ExtentTree          | —                                     |
//! | BlockDevice      | FileDevice          | MemDevice (testing, fault injection)  |
//!
//! `transport_from_env()` picks the transport from `BL_TRANSPORT`
//! (`threads`, `uring`, `inline`).

pub mod device_io;
pub mod extent_tree;
pub mod file_device;
pub mod finalize_pool;
pub mod inline;
pub mod mem_device;
pub mod threaded_transport;

#[cfg(target_os = "linux")]
pub mod uring_transport;

pub use extent_tree::{ExtentTree, ExtentTreeError};
pub use file_device::FileDevice;
pub use finalize_pool::FinalizePool;
pub use inline::{InlineDeferred, InlineTransport};
pub use mem_device::MemDevice;
pub use threaded_transport::{ThreadedTransport, ThreadedTransportConfig};

#[cfg(target_os = "linux")]
pub use uring_transport::{UringTransport, UringTransportConfig};

use blocklayout_core::descriptor::BlockTransport;
use blocklayout_core::env::env_get;
use blocklayout_core::{kinfo, kwarn};

use std::sync::Arc;

/// Build the transport named by `BL_TRANSPORT` (default `threads`).
///
/// `uring` falls back to threads when io_uring cannot be set up or the
/// target is not Linux.
pub fn transport_from_env() -> std::io::Result<Arc<dyn BlockTransport>> {
    let name: String = env_get("BL_TRANSPORT", String::from("threads"));
    match name.as_str() {
        "inline" => {
            let cfg = ThreadedTransportConfig::from_env();
            Ok(Arc::new(InlineTransport::new(cfg.max_segments)))
        }
        "uring" => uring_or_threads(),
        "threads" => threaded(),
        other => {
            kwarn!("unknown BL_TRANSPORT={:?}, using threads", other);
            threaded()
        }
    }
}

fn threaded() -> std::io::Result<Arc<dyn BlockTransport>> {
    Ok(Arc::new(ThreadedTransport::new(ThreadedTransportConfig::from_env())?))
}

fn uring_or_threads() -> std::io::Result<Arc<dyn BlockTransport>> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            match UringTransport::new(UringTransportConfig::from_env()) {
                Ok(t) => Ok(Arc::new(t)),
                Err(e) => {
                    kinfo!("io_uring unavailable ({}), using threads", e);
                    threaded()
                }
            }
        } else {
            kinfo!("io_uring not supported on this target, using threads");
            threaded()
        }
    }
}
